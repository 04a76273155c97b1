//! Seam between the lister and the package engine.
//!
//! The engine owns dependency resolution, archive transport and the
//! installer. The lister only drives it through [`Engine`] and reads
//! snapshots of its package cache.

use std::fmt;

use tracing::warn;

use crate::progress::{AcquireStatus, InstallProgress, OpProgress};
use crate::types::{CleanMode, MarkedStatus, PackageStatus};

/// One entry of the engine's package cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Real(PackageEntry),
    /// A name with no versions of its own
    Virtual(VirtualEntry),
}

impl CacheEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Real(p) => &p.name,
            Self::Virtual(v) => &v.name,
        }
    }
}

/// Static data of a real (installable) package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub section: Option<String>,
    pub summary: String,
    pub installed_version: Option<String>,
    pub candidate_version: Option<String>,
    pub installed_size: u64,
    pub download_size: u64,
    pub essential: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualEntry {
    pub name: String,
    /// Owner of the first provides entry, if any package provides it
    pub provider: Option<String>,
}

/// Mutable state of a package inside the dependency cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageState {
    pub status: PackageStatus,
    pub marked: MarkedStatus,
    /// Version that will be on the system after a commit
    pub marked_version: Option<String>,
}

/// Counters kept by the dependency cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepCounts {
    pub broken: usize,
    pub install: usize,
    pub delete: usize,
    pub keep: usize,
    /// Disk usage change in bytes
    pub usr_size: i64,
    /// Bytes to download
    pub deb_size: u64,
}

/// Status of one item after a fetch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Done,
    /// Never started, e.g. waiting for a removable medium
    Idle,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchItem {
    pub uri: String,
    pub status: ItemStatus,
    pub complete: bool,
    pub error: String,
}

impl FetchItem {
    pub fn done(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            status: ItemStatus::Done,
            complete: true,
            error: String::new(),
        }
    }

    pub fn failed(uri: &str, error: &str) -> Self {
        Self {
            uri: uri.to_string(),
            status: ItemStatus::Failed,
            complete: false,
            error: error.to_string(),
        }
    }

    pub fn idle(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            status: ItemStatus::Idle,
            complete: false,
            error: String::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == ItemStatus::Done && self.complete
    }
}

/// Result of one run of the installer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderResult {
    Completed,
    Failed,
    /// More archives are needed (media swap); fetch again and rerun
    Incomplete,
}

/// Opaque error raised by the engine. Messages are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    messages: Vec<String>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn from_messages(messages: Vec<String>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self
            .messages
            .iter()
            .map(String::as_str)
            .filter(|m| !m.is_empty() && *m != "E:")
            .collect();

        match messages.as_slice() {
            [] => f.write_str("Package engine failed (no specific details available)"),
            [only] => f.write_str(only),
            [first, rest @ ..] => write!(f, "{first}; and {} more issue(s)", rest.len()),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Combine a fetch job's own result with its per-item results.
///
/// A job error is only tolerated when some item failed, since the failed
/// items then carry it to the caller. Otherwise it aborts the operation.
pub fn settle_fetch(
    result: EngineResult<()>,
    items: Vec<FetchItem>,
    job: &str,
) -> EngineResult<Vec<FetchItem>> {
    let Err(error) = result else {
        return Ok(items);
    };
    if items.iter().all(FetchItem::is_finished) {
        return Err(error);
    }
    warn!(error = %error, "{job} reported errors");
    Ok(items)
}

/// Operations the lister needs from a package engine.
///
/// Calls are synchronous and not re-entrant; the lister issues one at a time.
pub trait Engine {
    /// Open the cache, keeping already loaded structures when possible
    fn open(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()>;

    /// Throw away every mark and rebuild the cache from disk
    fn reset(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()>;

    /// Apply status corrections for half-installed packages
    fn apply_status(&mut self) -> EngineResult<()>;

    /// Snapshot of every cache entry, real and virtual, in engine order
    fn entries(&self) -> Vec<CacheEntry>;

    fn state(&self, name: &str) -> Option<PackageState>;

    fn counts(&self) -> DepCounts;

    fn mark_install(&mut self, name: &str) -> EngineResult<()>;

    fn mark_remove(&mut self, name: &str) -> EngineResult<()>;

    fn mark_keep(&mut self, name: &str) -> EngineResult<()>;

    /// Protect explicitly requested installs, then resolve.
    /// Ok(false) when the problem is unsatisfiable.
    fn fix_broken(&mut self) -> EngineResult<bool>;

    fn upgrade(&mut self) -> EngineResult<()>;

    fn dist_upgrade(&mut self) -> EngineResult<()>;

    /// Download package indexes from the configured sources.
    /// Err only when the fetch job itself fails to run.
    fn fetch_indexes(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>>;

    /// Remove index files no longer referenced by any source
    fn clean_lists(&mut self) -> EngineResult<()>;

    /// Build the install plan and queue the archives it needs
    fn queue_archives(&mut self) -> EngineResult<()>;

    /// Run the queued archive fetch job
    fn run_fetch(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>>;

    /// Adjust the plan around archives that could not be fetched
    fn fix_missing(&mut self) -> bool;

    fn install(&mut self, progress: &mut dyn InstallProgress) -> EngineResult<OrderResult>;

    /// Take the system package lock
    fn lock(&mut self) -> EngineResult<()>;

    /// Let the installer take the package lock; [`Engine::lock`] takes it back
    fn release_lock(&mut self);

    /// Drop every system lock taken since the commit started
    fn unlock_all(&mut self);

    fn clean_archives(&mut self, mode: CleanMode) -> EngineResult<()>;
}
