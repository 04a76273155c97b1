//! Lister configuration, stored as JSON in the platform config directory.
//!
//! A missing or unreadable file never stops the lister: it logs a warning
//! and continues with defaults.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::CleanMode;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListerConfig {
    /// Treat search terms as regular expressions
    pub use_regex: bool,
    /// Stop a commit after the archives are downloaded
    pub download_only: bool,
    /// Remove every downloaded archive after a successful commit
    pub clean_cache: bool,
    /// Remove archives that can no longer be downloaded after a commit
    pub auto_clean_cache: bool,
    /// Remove stale index files after an update
    pub list_cleanup: bool,
    /// Skip the advisory directory locks
    pub no_locking: bool,
    /// Fetch everything before installing when archives come from removable media
    pub cdrom_copy: bool,
    /// Longest accepted selection-file line, in bytes
    pub selection_line_limit: usize,
    pub archives_dir: PathBuf,
    pub lists_dir: PathBuf,
    pub filters_file: PathBuf,
    pub options_db: PathBuf,
}

impl Default for ListerConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            use_regex: false,
            download_only: false,
            clean_cache: false,
            auto_clean_cache: false,
            list_cleanup: true,
            no_locking: false,
            cdrom_copy: false,
            selection_line_limit: 300,
            archives_dir: PathBuf::from("/var/cache/apt/archives"),
            lists_dir: PathBuf::from("/var/lib/apt/lists"),
            filters_file: data_dir.join("filters.json"),
            options_db: data_dir.join("options.db"),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "synlister", "synlister")
}

impl ListerConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, falling back to defaults on any problem
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Cleaning to run after a commit; `clean_cache` wins over `auto_clean_cache`
    pub fn clean_mode(&self) -> Option<CleanMode> {
        if self.clean_cache {
            Some(CleanMode::All)
        } else if self.auto_clean_cache {
            Some(CleanMode::Obsolete)
        } else {
            None
        }
    }
}
