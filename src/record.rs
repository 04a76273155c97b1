//! Package records: one per real package of the open cache

use crate::engine::{PackageEntry, PackageState};
use crate::types::{MarkedStatus, PackageId, PackageStatus};

/// A real package as the lister sees it: cache data plus UI flags.
///
/// Records are rebuilt from scratch on every cache open; a [`PackageId`]
/// from a previous open must not be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    id: PackageId,
    name: String,
    section: Option<String>,
    summary: String,
    installed_version: Option<String>,
    candidate_version: Option<String>,
    marked_version: Option<String>,
    installed_size: u64,
    download_size: u64,
    status: PackageStatus,
    marked: MarkedStatus,
    essential: bool,
    pinned: bool,
    new: bool,
    orphaned: bool,
    /// Virtual packages this one provides
    provides: Vec<String>,
}

impl PackageRecord {
    pub(crate) fn new(id: PackageId, entry: PackageEntry, state: PackageState) -> Self {
        Self {
            id,
            name: entry.name,
            section: entry.section,
            summary: entry.summary,
            installed_version: entry.installed_version,
            candidate_version: entry.candidate_version,
            marked_version: state.marked_version,
            installed_size: entry.installed_size,
            download_size: entry.download_size,
            status: state.status,
            marked: state.marked,
            essential: entry.essential,
            pinned: false,
            new: false,
            orphaned: false,
            provides: Vec::new(),
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn installed_version(&self) -> Option<&str> {
        self.installed_version.as_deref()
    }

    pub fn candidate_version(&self) -> Option<&str> {
        self.candidate_version.as_deref()
    }

    pub fn marked_version(&self) -> Option<&str> {
        self.marked_version.as_deref()
    }

    pub fn installed_size(&self) -> u64 {
        self.installed_size
    }

    pub fn download_size(&self) -> u64 {
        self.download_size
    }

    pub fn status(&self) -> PackageStatus {
        self.status
    }

    pub fn marked(&self) -> MarkedStatus {
        self.marked
    }

    pub fn is_essential(&self) -> bool {
        self.essential
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    /// Status symbol, preferring the pending action over the installed state
    pub fn symbol(&self) -> &'static str {
        match self.marked {
            MarkedStatus::Keep => self.status.symbol(),
            other => other.symbol(),
        }
    }

    pub(crate) fn apply_state(&mut self, state: PackageState) {
        self.status = state.status;
        self.marked = state.marked;
        self.marked_version = state.marked_version;
    }

    pub(crate) fn add_virtual(&mut self, name: &str) {
        if !self.provides.iter().any(|p| p == name) {
            self.provides.push(name.to_string());
        }
    }

    pub(crate) fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub(crate) fn set_new(&mut self, new: bool) {
        self.new = new;
    }

    pub(crate) fn set_orphaned(&mut self, orphaned: bool) {
        self.orphaned = orphaned;
    }
}
