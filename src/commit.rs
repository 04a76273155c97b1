//! Index refresh and the download/install loop.
//!
//! Both run with the display frozen (see [`PackageLister::is_updating`]);
//! the caller reopens the cache afterwards to pick up the new state.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError, FetchItem, ItemStatus, OrderResult};
use crate::error::Result;
use crate::lister::PackageLister;
use crate::lock::FileLock;
use crate::progress::{AcquireStatus, InstallProgress, UserDialog};

const INDEX_FETCH_FAILED: &str =
    "Some index files failed to download, they have been ignored, or old ones used instead.";
const FIX_MISSING_FAILED: &str = "Unable to correct missing packages";
const INSTALL_FAILED: &str = "Package installation failed";

/// How a commit that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every change was installed
    Completed,
    /// Archives were downloaded and nothing was installed
    DownloadOnly,
    /// The user chose not to continue past a partial download
    Declined,
    /// The fetch job was cancelled
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitPhase {
    Fetching,
    Checking,
    Installing,
    AwaitingMedia,
    Completed,
}

fn enter(phase: &mut CommitPhase, next: CommitPhase) {
    debug!(from = ?*phase, to = ?next, "commit phase");
    *phase = next;
}

/// Classification of one fetch run
#[derive(Debug, Default, PartialEq, Eq)]
struct FetchCheck {
    failed: bool,
    /// Some item never started, e.g. it waits for another medium
    transient: bool,
    errors: Vec<String>,
    server_error: Option<String>,
}

impl FetchCheck {
    fn from_items(items: &[FetchItem]) -> Self {
        let mut check = Self::default();
        for item in items {
            if item.is_finished() {
                continue;
            }
            if item.status == ItemStatus::Idle {
                check.transient = true;
                continue;
            }
            let text = format!("Failed to fetch {}\n  {}", item.uri, item.error);
            warn!("{text}");
            check.errors.push(text);
            if let Some(server) = server_error_message(&item.error) {
                check.server_error = Some(server);
            }
            check.failed = true;
        }
        check
    }
}

/// Text after "server said" in a fetch error, without the separator
pub fn server_error_message(error: &str) -> Option<String> {
    const MARKER: &str = "server said";
    let pos = error.find(MARKER)?;
    let mut rest = error[pos + MARKER.len()..].chars();
    rest.next();
    let rest = rest.as_str();
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    (!rest.is_empty()).then(|| rest.to_string())
}

fn continue_prompt(server_error: Option<&str>) -> String {
    let mut message =
        String::from("Some of the packages could not be retrieved from the server(s).\n");
    if let Some(server) = server_error {
        message.push_str(&format!("({server})\n"));
    }
    message.push_str("Do you want to continue, ignoring these packages?");
    message
}

impl<E: Engine> PackageLister<E> {
    fn lock_dir(&self, dir: &Path, what: &'static str) -> Result<Option<FileLock>> {
        if self.config().no_locking {
            debug!(dir = %dir.display(), "locking disabled");
            return Ok(None);
        }
        FileLock::acquire(dir, what).map(Some)
    }

    /// Download fresh package indexes.
    ///
    /// Items that did not finish are reported together as one error after
    /// the stale lists are cleaned.
    pub fn update_cache(&mut self, status: &mut dyn AcquireStatus) -> Result<()> {
        let lists_dir = self.config().lists_dir.clone();
        let _lock = self.lock_dir(&lists_dir, "list")?;
        self.set_updating(true);
        info!("updating package indexes");

        let items = self.engine_mut().fetch_indexes(status)?;
        let failed: Vec<&FetchItem> = items
            .iter()
            .filter(|item| item.status != ItemStatus::Done)
            .collect();
        for item in &failed {
            warn!(uri = %item.uri, error = %item.error, "index fetch failed");
        }

        if self.config().list_cleanup {
            self.engine_mut().clean_lists()?;
        }
        if !failed.is_empty() {
            return Err(EngineError::new(INDEX_FETCH_FAILED).into());
        }
        info!(items = items.len(), "package indexes updated");
        Ok(())
    }

    /// Download the planned archives and run the installer, looping while
    /// the installer asks for more media.
    pub fn commit_changes(
        &mut self,
        status: &mut dyn AcquireStatus,
        progress: &mut dyn InstallProgress,
        dialog: &mut dyn UserDialog,
    ) -> Result<CommitOutcome> {
        self.set_updating(true);
        let result = self.run_commit(status, progress, dialog);
        self.engine_mut().unlock_all();
        match &result {
            Ok(outcome) => info!(?outcome, "commit finished"),
            Err(e) => warn!(error = %e, "commit aborted"),
        }
        result
    }

    fn run_commit(
        &mut self,
        status: &mut dyn AcquireStatus,
        progress: &mut dyn InstallProgress,
        dialog: &mut dyn UserDialog,
    ) -> Result<CommitOutcome> {
        let archives_dir = self.config().archives_dir.clone();
        let lock = self.lock_dir(&archives_dir, "download")?;
        self.engine_mut().queue_archives()?;

        let mut phase = CommitPhase::Fetching;
        loop {
            let items = self.engine_mut().run_fetch(status)?;
            if status.cancelled() {
                return Ok(CommitOutcome::Cancelled);
            }

            enter(&mut phase, CommitPhase::Checking);
            let check = FetchCheck::from_items(&items);

            if self.config().download_only {
                self.set_updating(false);
                if check.failed {
                    return Err(EngineError::from_messages(check.errors).into());
                }
                return Ok(CommitOutcome::DownloadOnly);
            }

            if check.failed {
                if check.transient {
                    return Err(EngineError::from_messages(check.errors).into());
                }
                let message = continue_prompt(check.server_error.as_deref());
                if !dialog.confirm("Warning", &message) {
                    return Ok(CommitOutcome::Declined);
                }
                if !self.engine_mut().fix_missing() {
                    return Err(EngineError::new(FIX_MISSING_FAILED).into());
                }
            }

            // With removable media everything is fetched before installing
            if !check.transient || !self.config().cdrom_copy {
                enter(&mut phase, CommitPhase::Installing);
                self.engine_mut().release_lock();
                match self.engine_mut().install(progress)? {
                    OrderResult::Completed => break,
                    OrderResult::Failed => return Err(EngineError::new(INSTALL_FAILED).into()),
                    OrderResult::Incomplete => self.engine_mut().lock()?,
                }
            } else {
                enter(&mut phase, CommitPhase::AwaitingMedia);
            }

            self.engine_mut().queue_archives()?;
            enter(&mut phase, CommitPhase::Fetching);
        }

        enter(&mut phase, CommitPhase::Completed);
        drop(lock);
        if let Err(e) = self.clean_package_cache() {
            warn!(error = %e, "cannot clean the archive cache");
        }
        Ok(CommitOutcome::Completed)
    }

    /// Remove downloaded archives as configured by `clean_cache` /
    /// `auto_clean_cache`
    pub fn clean_package_cache(&mut self) -> Result<()> {
        let Some(mode) = self.config().clean_mode() else {
            return Ok(());
        };
        let archives_dir = self.config().archives_dir.clone();
        let _lock = self.lock_dir(&archives_dir, "download")?;
        self.engine_mut().clean_archives(mode)?;
        info!(?mode, "archive cache cleaned");
        Ok(())
    }
}
