//! [`Engine`] backed by libapt-pkg through rust-apt.
//!
//! Fetch and install progress are bridged onto the lister's collaborator
//! traits. Per-item fetch results are collected through a shared
//! `Rc<RefCell<_>>` because rust-apt takes ownership of the progress object.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rust_apt::cache::{Cache, PackageSort, Upgrade};
use rust_apt::error::AptErrors;
use rust_apt::progress::{
    AcquireProgress, DynAcquireProgress, DynInstallProgress, InstallProgress as AptInstallProgress,
};
use rust_apt::raw::{AcqTextStatus, ItemDesc, PkgAcquire};
use rust_apt::util::{DiskSpace, apt_lock, apt_lock_inner, apt_unlock, apt_unlock_inner};
use rust_apt::{Package, PkgSelectedState};
use tracing::{debug, info, warn};

use crate::engine::{
    CacheEntry, DepCounts, Engine, EngineError, EngineResult, FetchItem, OrderResult,
    PackageEntry, PackageState, VirtualEntry, settle_fetch,
};
use crate::progress::{AcquireStatus, FetchPulse, InstallProgress, OpProgress};
use crate::types::{CleanMode, MarkedStatus, PackageStatus};

impl From<AptErrors> for EngineError {
    fn from(errors: AptErrors) -> Self {
        EngineError::from_messages(errors.iter().map(ToString::to_string).collect())
    }
}

fn new_cache() -> EngineResult<Cache> {
    Ok(Cache::new::<&str>(&[])?)
}

/// System lock held for a commit, in the order libapt expects:
/// frontend and dpkg lock for fetching, frontend only while dpkg runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Locked,
    InnerReleased,
}

pub struct AptEngine {
    cache: Cache,
    archives_dir: PathBuf,
    lock_state: LockState,
}

impl AptEngine {
    pub fn new(archives_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        Ok(Self {
            cache: new_cache()?,
            archives_dir: archives_dir.into(),
            lock_state: LockState::Unlocked,
        })
    }

    fn package(&self, name: &str) -> EngineResult<Package<'_>> {
        self.cache
            .get(name)
            .ok_or_else(|| EngineError::new(format!("Unable to locate package {name}")))
    }

    fn state_of(pkg: &Package) -> PackageState {
        let status = if !pkg.is_installed() {
            PackageStatus::NotInstalled
        } else if pkg.is_now_broken() || pkg.is_inst_broken() {
            PackageStatus::Broken
        } else if pkg.is_upgradable() {
            PackageStatus::Outdated
        } else {
            PackageStatus::Installed
        };

        let marked = if pkg.marked_delete() {
            MarkedStatus::Remove
        } else if pkg.marked_upgrade() {
            MarkedStatus::Upgrade
        } else if pkg.marked_downgrade() {
            MarkedStatus::Downgrade
        } else if pkg.marked_install() || pkg.marked_reinstall() {
            MarkedStatus::Install
        } else if pkg.selected_state() == PkgSelectedState::Hold && pkg.is_upgradable() {
            MarkedStatus::Held
        } else {
            MarkedStatus::Keep
        };

        let marked_version = match marked {
            MarkedStatus::Remove => None,
            MarkedStatus::Install | MarkedStatus::Upgrade | MarkedStatus::Downgrade => pkg
                .install_version()
                .or_else(|| pkg.candidate())
                .map(|v| v.version().to_string()),
            _ => pkg.installed().map(|v| v.version().to_string()),
        };

        PackageState {
            status,
            marked,
            marked_version,
        }
    }

    fn entry_of(pkg: &Package) -> PackageEntry {
        let candidate = pkg.candidate();
        PackageEntry {
            name: pkg.fullname(true),
            section: candidate
                .as_ref()
                .and_then(|v| v.section().ok())
                .map(ToString::to_string),
            summary: candidate
                .as_ref()
                .and_then(|v| v.summary())
                .unwrap_or_default(),
            installed_version: pkg.installed().map(|v| v.version().to_string()),
            candidate_version: candidate.as_ref().map(|v| v.version().to_string()),
            installed_size: candidate.as_ref().map_or(0, |v| v.installed_size()),
            download_size: candidate.as_ref().map_or(0, |v| v.size()),
            essential: pkg.is_essential(),
        }
    }
}

impl Engine for AptEngine {
    fn open(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()> {
        progress.update("Reading package lists", 0.0);
        self.cache = new_cache()?;
        progress.update("Reading package lists", 100.0);
        Ok(())
    }

    fn reset(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()> {
        // A fresh cache carries no marks
        self.open(progress)
    }

    fn apply_status(&mut self) -> EngineResult<()> {
        // libapt applies half-installed corrections while building the depcache
        Ok(())
    }

    fn entries(&self) -> Vec<CacheEntry> {
        let sort = PackageSort::default().include_virtual();
        self.cache
            .packages(&sort)
            .map(|pkg| {
                if pkg.has_versions() {
                    CacheEntry::Real(Self::entry_of(&pkg))
                } else {
                    CacheEntry::Virtual(VirtualEntry {
                        name: pkg.fullname(true),
                        provider: pkg
                            .provides()
                            .next()
                            .map(|p| p.version().parent().fullname(true)),
                    })
                }
            })
            .collect()
    }

    fn state(&self, name: &str) -> Option<PackageState> {
        self.cache.get(name).map(|pkg| Self::state_of(&pkg))
    }

    fn counts(&self) -> DepCounts {
        let depcache = self.cache.depcache();
        DepCounts {
            broken: depcache.broken_count() as usize,
            install: depcache.install_count() as usize,
            delete: depcache.delete_count() as usize,
            keep: depcache.keep_count() as usize,
            usr_size: match depcache.disk_size() {
                DiskSpace::Require(bytes) => bytes as i64,
                DiskSpace::Free(bytes) => -(bytes as i64),
            },
            deb_size: depcache.download_size(),
        }
    }

    fn mark_install(&mut self, name: &str) -> EngineResult<()> {
        let pkg = self.package(name)?;
        pkg.mark_install(true, true);
        pkg.protect();
        Ok(())
    }

    fn mark_remove(&mut self, name: &str) -> EngineResult<()> {
        let pkg = self.package(name)?;
        pkg.mark_delete(false);
        pkg.protect();
        Ok(())
    }

    fn mark_keep(&mut self, name: &str) -> EngineResult<()> {
        self.package(name)?.mark_keep();
        Ok(())
    }

    fn fix_broken(&mut self) -> EngineResult<bool> {
        for pkg in self.cache.get_changes(false) {
            if pkg.marked_install() {
                pkg.protect();
            }
        }
        match self.cache.resolve(true) {
            Ok(()) => Ok(true),
            Err(errors) => {
                debug!(error = %EngineError::from(errors), "resolver gave up");
                Ok(false)
            }
        }
    }

    fn upgrade(&mut self) -> EngineResult<()> {
        self.cache.upgrade(Upgrade::SafeUpgrade)?;
        Ok(())
    }

    fn dist_upgrade(&mut self) -> EngineResult<()> {
        self.cache.upgrade(Upgrade::FullUpgrade)?;
        Ok(())
    }

    fn fetch_indexes(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>> {
        let items = Rc::new(RefCell::new(Vec::new()));
        let result = {
            let mut progress = AcquireProgress::new(AcquireBridge {
                status,
                items: Rc::clone(&items),
            });
            // update() consumes the cache; the lister reopens afterwards
            let cache = std::mem::replace(&mut self.cache, new_cache()?);
            cache.update(&mut progress)
        };
        self.cache = new_cache()?;

        settle_fetch(result.map_err(EngineError::from), items.take(), "index update")
    }

    fn clean_lists(&mut self) -> EngineResult<()> {
        // libapt removes unreferenced lists at the end of update()
        Ok(())
    }

    fn queue_archives(&mut self) -> EngineResult<()> {
        if self.lock_state == LockState::Unlocked {
            self.lock()?;
        }
        let changes = self.cache.get_changes(false).count();
        debug!(changes, "install plan ready");
        Ok(())
    }

    fn run_fetch(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>> {
        let items = Rc::new(RefCell::new(Vec::new()));
        let result = {
            let mut progress = AcquireProgress::new(AcquireBridge {
                status,
                items: Rc::clone(&items),
            });
            self.cache.get_archives(&mut progress)
        };
        settle_fetch(result.map_err(EngineError::from), items.take(), "archive fetch")
    }

    fn fix_missing(&mut self) -> bool {
        // rust-apt has no handle on the package manager's FixMissing
        warn!("cannot install around missing archives with this engine");
        false
    }

    fn install(&mut self, progress: &mut dyn InstallProgress) -> EngineResult<OrderResult> {
        // dpkg takes its own lock; ours must be down by now
        if self.lock_state == LockState::Locked {
            self.release_lock();
        }
        let result = {
            let mut bridge = AptInstallProgress::new(InstallBridge { progress });
            let cache = std::mem::replace(&mut self.cache, new_cache()?);
            cache.do_install(&mut bridge)
        };

        match result {
            Ok(()) => Ok(OrderResult::Completed),
            Err(errors) => Err(errors.into()),
        }
    }

    fn lock(&mut self) -> EngineResult<()> {
        match self.lock_state {
            LockState::Unlocked => apt_lock()?,
            LockState::InnerReleased => apt_lock_inner()?,
            LockState::Locked => return Ok(()),
        }
        debug!(from = ?self.lock_state, "system lock taken");
        self.lock_state = LockState::Locked;
        Ok(())
    }

    fn release_lock(&mut self) {
        if self.lock_state == LockState::Locked {
            apt_unlock_inner();
            self.lock_state = LockState::InnerReleased;
        }
    }

    fn unlock_all(&mut self) {
        if self.lock_state != LockState::Unlocked {
            apt_unlock();
            self.lock_state = LockState::Unlocked;
            debug!("system lock released");
        }
    }

    fn clean_archives(&mut self, mode: CleanMode) -> EngineResult<()> {
        let dirs = [self.archives_dir.clone(), self.archives_dir.join("partial")];
        let mut removed = 0usize;
        for dir in &dirs {
            removed += clean_dir(dir, |file| match mode {
                CleanMode::All => true,
                CleanMode::Obsolete => !self.is_downloadable(file),
            })
            .map_err(|e| EngineError::new(format!("Unable to clean {}: {e}", dir.display())))?;
        }
        info!(removed, ?mode, "removed cached archives");
        Ok(())
    }
}

impl Drop for AptEngine {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

impl AptEngine {
    /// Archive names are `<name>_<version>_<arch>.deb` with `:` escaped as `%3a`
    fn is_downloadable(&self, file: &str) -> bool {
        let Some(stem) = file.strip_suffix(".deb") else {
            return false;
        };
        let mut parts = stem.splitn(3, '_');
        let (Some(name), Some(version)) = (parts.next(), parts.next()) else {
            return false;
        };
        let version = version.replace("%3a", ":");
        self.cache.get(name).is_some_and(|pkg| {
            pkg.versions()
                .any(|v| v.version() == version && v.is_downloadable())
        })
    }
}

fn clean_dir(dir: &Path, remove: impl Fn(&str) -> bool) -> std::io::Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == "lock" || !entry.file_type()?.is_file() {
            continue;
        }
        if remove(name) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ============================================================================
// Progress bridges
// ============================================================================

struct AcquireBridge<'a> {
    status: &'a mut dyn AcquireStatus,
    items: Rc<RefCell<Vec<FetchItem>>>,
}

impl DynAcquireProgress for AcquireBridge<'_> {
    fn pulse_interval(&self) -> usize {
        500_000
    }

    fn hit(&mut self, item: &ItemDesc) {
        self.items.borrow_mut().push(FetchItem::done(&item.uri()));
    }

    fn fetch(&mut self, item: &ItemDesc) {
        self.status.fetch(&item.description());
    }

    fn fail(&mut self, item: &ItemDesc) {
        let error = item.owner().error_text();
        self.status.fail(&item.description(), &error);
        self.items
            .borrow_mut()
            .push(FetchItem::failed(&item.uri(), &error));
    }

    fn pulse(&mut self, status: &AcqTextStatus, _owner: &PkgAcquire) {
        // rust-apt offers no way to stop the job from here
        self.status.pulse(&FetchPulse {
            percent: status.percent(),
            current_bytes: status.current_bytes(),
            total_bytes: status.total_bytes(),
            speed_bps: status.current_cps(),
        });
    }

    fn done(&mut self, item: &ItemDesc) {
        self.status.done(&item.description());
        self.items.borrow_mut().push(FetchItem::done(&item.uri()));
    }

    fn start(&mut self) {
        self.status.start();
    }

    fn stop(&mut self, _status: &AcqTextStatus) {
        self.status.stop();
    }
}

struct InstallBridge<'a> {
    progress: &'a mut dyn InstallProgress,
}

impl DynInstallProgress for InstallBridge<'_> {
    fn status_changed(&mut self, pkgname: String, steps_done: u64, total_steps: u64, action: String) {
        self.progress
            .status_changed(&pkgname, steps_done, total_steps, &action);
    }

    fn error(&mut self, pkgname: String, _steps_done: u64, _total_steps: u64, error: String) {
        self.progress.error(&pkgname, &error);
    }
}
