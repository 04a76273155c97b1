//! Common types used throughout the lister

use serde::{Deserialize, Serialize};

/// Stable handle for a record in the lister's package array.
/// Only valid until the next cache (re)open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(pub u32);

impl PackageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Installation status of a package, matching Synaptic's status icons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PackageStatus {
    #[default]
    NotInstalled, //   Package is not installed
    Installed,    // · Installed, candidate is the installed version
    Outdated,     // ↑ Installed, a newer candidate is available
    Broken,       // ✗ Installed with unsatisfied dependencies
}

impl PackageStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NotInstalled => " ",
            Self::Installed => "·",
            Self::Outdated => "↑",
            Self::Broken => "✗",
        }
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, Self::NotInstalled)
    }
}

/// Pending action recorded against a package before a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MarkedStatus {
    #[default]
    Keep,
    Install,
    Upgrade,
    Downgrade,
    Remove,
    /// Upgradable but held back by the resolver or a pin
    Held,
}

impl MarkedStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Keep => "",
            Self::Install => "+",
            Self::Upgrade => "↑",
            Self::Downgrade => "↓",
            Self::Remove => "-",
            Self::Held => "=",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Remove => "remove",
            Self::Held => "held",
        }
    }

    /// True for actions that bring a (new) version onto the system
    pub fn is_install(&self) -> bool {
        matches!(self, Self::Install | Self::Upgrade | Self::Downgrade)
    }
}

/// Human readable byte count
pub fn size_str(bytes: u64) -> String {
    if bytes == 0 {
        return String::from("-");
    }
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Signed variant of [`size_str`] for disk usage deltas
pub fn size_change_str(delta: i64) -> String {
    let magnitude = size_str(delta.unsigned_abs());
    if delta < 0 {
        format!("-{magnitude}")
    } else {
        magnitude
    }
}

/// Aggregate counters shown in the status bar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub installed: usize,
    pub broken: usize,
    pub to_install: usize,
    pub to_remove: usize,
    pub size_change: i64,
}

/// What a commit would download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub count: usize,
    pub bytes: u64,
}

/// Changes to be applied, classified in a single pass over all records.
/// Every list is sorted by name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub held: Vec<String>,
    /// Outdated packages that stay at their installed version
    pub kept: Vec<String>,
    /// Essential packages marked for removal (not repeated in `to_remove`)
    pub essential: Vec<String>,
    pub to_install: Vec<String>,
    pub to_upgrade: Vec<String>,
    pub to_downgrade: Vec<String>,
    pub to_remove: Vec<String>,
    pub size_change: i64,
}

impl Summary {
    /// Number of classified records across every category
    pub fn total(&self) -> usize {
        self.held.len()
            + self.kept.len()
            + self.essential.len()
            + self.to_install.len()
            + self.to_upgrade.len()
            + self.to_downgrade.len()
            + self.to_remove.len()
    }

    /// Removals including essential packages
    pub fn removals(&self) -> usize {
        self.to_remove.len() + self.essential.len()
    }

    pub fn has_changes(&self) -> bool {
        !(self.to_install.is_empty()
            && self.to_upgrade.is_empty()
            && self.to_downgrade.is_empty()
            && self.to_remove.is_empty()
            && self.essential.is_empty())
    }
}

/// How the archive cache is cleaned after a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMode {
    /// Remove every downloaded archive
    All,
    /// Remove archives that can no longer be downloaded
    Obsolete,
}
