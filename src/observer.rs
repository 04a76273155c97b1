//! Change notification for package records.
//!
//! The registry holds weak references only: dropping an observer is enough
//! to stop its notifications. Observers may unregister themselves (or
//! others) from inside a callback because the registry never holds its own
//! borrow while calling out.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::record::PackageRecord;

/// Receives a callback after every record change
pub trait PackageObserver {
    /// `pkg` is the record that changed, or None for bulk changes
    fn notify_change(&mut self, pkg: Option<&PackageRecord>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverRef = Weak<RefCell<dyn PackageObserver>>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(ObserverId, ObserverRef)>,
}

/// Shared list of observers. Clones refer to the same list.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: PackageObserver + 'static>(&self, observer: &Rc<RefCell<O>>) -> ObserverId {
        let weak: Weak<RefCell<O>> = Rc::downgrade(observer);
        let weak: ObserverRef = weak;
        let mut inner = self.inner.borrow_mut();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, weak));
        id
    }

    /// Returns false if `id` was not registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.entries.len();
        inner.entries.retain(|(entry, _)| *entry != id);
        inner.entries.len() != before
    }

    pub fn is_registered(&self, id: ObserverId) -> bool {
        self.inner.borrow().entries.iter().any(|(entry, _)| *entry == id)
    }

    /// Number of live observers
    pub fn len(&self) -> usize {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every live observer in registration order
    pub fn notify(&self, pkg: Option<&PackageRecord>) {
        let snapshot: Vec<(ObserverId, ObserverRef)> = {
            let mut inner = self.inner.borrow_mut();
            inner.entries.retain(|(_, weak)| weak.strong_count() > 0);
            inner.entries.clone()
        };

        for (id, weak) in snapshot {
            // Skip observers removed by an earlier callback in this round
            if !self.is_registered(id) {
                continue;
            }
            let Some(observer) = weak.upgrade() else {
                continue;
            };
            match observer.try_borrow_mut() {
                Ok(mut observer) => observer.notify_change(pkg),
                Err(_) => warn!(?id, "observer is busy, skipping re-entrant notification"),
            }
        }
    }
}
