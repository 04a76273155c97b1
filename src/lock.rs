//! Advisory directory locks shared with other package tools

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Exclusive `flock` on `<dir>/lock`, released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock `dir` without blocking. `what` names the directory in errors
    /// ("download", "list").
    pub fn acquire(dir: &Path, what: &'static str) -> Result<Self> {
        let path = dir.join("lock");
        let lock_error = || Error::Lock {
            what,
            path: path.clone(),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                debug!(path = %path.display(), error = %e, "cannot open lock file");
                lock_error()
            })?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(lock_error());
        }

        debug!(path = %path.display(), "lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(path = %self.path.display(), "lock released");
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check if APT lock files are held by another process
pub fn check_apt_lock() -> Option<String> {
    let lock_paths = [
        "/var/lib/dpkg/lock-frontend",
        "/var/lib/dpkg/lock",
        "/var/lib/apt/lists/lock",
    ];

    for path in &lock_paths {
        if let Ok(file) = File::open(path) {
            let fd = file.as_raw_fd();
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Some(format!(
                    "Another package manager is running ({path}). Close it and try again."
                ));
            }
            unsafe { libc::flock(fd, libc::LOCK_UN) };
        }
    }
    None
}
