//! Package filters and their persistence.
//!
//! A [`Filter`] combines three sub-filters with AND: status, patterns and
//! sections. A sub-filter with nothing configured lets every package through.
//! Filters are stored in a JSON tree under the `filter.<name>` namespace.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::record::PackageRecord;
use crate::types::{MarkedStatus, PackageStatus};

/// Top-level key of the filter tree
pub const FILTER_NAMESPACE: &str = "filter";

// ============================================================================
// Status filter
// ============================================================================

/// Package properties a status filter can select on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusKind {
    Installed,
    NotInstalled,
    Upgradable,
    Broken,
    MarkInstall,
    MarkRemove,
    MarkKeep,
    MarkHeld,
    New,
    Pinned,
    Orphaned,
}

impl StatusKind {
    pub fn matches(self, pkg: &PackageRecord) -> bool {
        match self {
            Self::Installed => pkg.status().is_installed(),
            Self::NotInstalled => pkg.status() == PackageStatus::NotInstalled,
            Self::Upgradable => pkg.status() == PackageStatus::Outdated,
            Self::Broken => pkg.status() == PackageStatus::Broken,
            Self::MarkInstall => pkg.marked().is_install(),
            Self::MarkRemove => pkg.marked() == MarkedStatus::Remove,
            Self::MarkKeep => pkg.marked() == MarkedStatus::Keep,
            Self::MarkHeld => pkg.marked() == MarkedStatus::Held,
            Self::New => pkg.is_new(),
            Self::Pinned => pkg.is_pinned(),
            Self::Orphaned => pkg.is_orphaned(),
        }
    }
}

/// Matches a package having any of the selected properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter {
    kinds: BTreeSet<StatusKind>,
}

impl StatusFilter {
    pub fn set(&mut self, kinds: impl IntoIterator<Item = StatusKind>) {
        self.kinds = kinds.into_iter().collect();
    }

    pub fn kinds(&self) -> impl Iterator<Item = StatusKind> + '_ {
        self.kinds.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn apply(&self, pkg: &PackageRecord) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| k.matches(pkg))
    }
}

// ============================================================================
// Pattern filter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternField {
    Name,
    Section,
    Version,
    Description,
    /// Any virtual package the record provides
    Provides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub field: PatternField,
    pub pattern: String,
    /// Select packages that do NOT match
    #[serde(default)]
    pub exclude: bool,
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    /// Lowercased needle; used when the pattern is not a valid regex
    Substring(String),
}

impl Matcher {
    fn compile(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => Self::Regex(re),
            Err(e) => {
                debug!(pattern, error = %e, "pattern is not a regex, matching as text");
                Self::Substring(pattern.to_lowercase())
            }
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Substring(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Every rule must hold (an excluding rule holds when its pattern does not match)
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    rules: Vec<(PatternRule, Matcher)>,
}

impl PatternFilter {
    pub fn add(&mut self, rule: PatternRule) {
        let matcher = Matcher::compile(&rule.pattern);
        self.rules.push((rule, matcher));
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> impl Iterator<Item = &PatternRule> {
        self.rules.iter().map(|(rule, _)| rule)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, pkg: &PackageRecord) -> bool {
        self.rules.iter().all(|(rule, matcher)| {
            let matched = match rule.field {
                PatternField::Name => matcher.is_match(pkg.name()),
                PatternField::Section => matcher.is_match(pkg.section().unwrap_or_default()),
                PatternField::Version => pkg
                    .candidate_version()
                    .or(pkg.installed_version())
                    .is_some_and(|v| matcher.is_match(v)),
                PatternField::Description => {
                    matcher.is_match(pkg.name()) || matcher.is_match(pkg.summary())
                }
                PatternField::Provides => pkg.provides().iter().any(|p| matcher.is_match(p)),
            };
            matched != rule.exclude
        })
    }
}

impl PartialEq for PatternFilter {
    fn eq(&self, other: &Self) -> bool {
        self.rules().eq(other.rules())
    }
}

// ============================================================================
// Section filter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFilter {
    sections: BTreeSet<String>,
    /// true: keep packages in the listed sections; false: drop them
    inclusive: bool,
}

impl Default for SectionFilter {
    fn default() -> Self {
        Self {
            sections: BTreeSet::new(),
            inclusive: true,
        }
    }
}

impl SectionFilter {
    pub fn set(&mut self, sections: impl IntoIterator<Item = String>, inclusive: bool) {
        self.sections = sections.into_iter().map(|s| s.to_lowercase()).collect();
        self.inclusive = inclusive;
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(String::as_str)
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn apply(&self, pkg: &PackageRecord) -> bool {
        if self.sections.is_empty() {
            return true;
        }
        let section = pkg.section().unwrap_or_default().to_lowercase();
        self.sections.contains(&section) == self.inclusive
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Serialized form of one `filter.<name>` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FilterData {
    preset: bool,
    status: Vec<StatusKind>,
    patterns: Vec<PatternRule>,
    sections: Vec<String>,
    section_inclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    name: String,
    /// Built-in filters cannot be deleted from the UI
    pub preset: bool,
    pub status: StatusFilter,
    pub pattern: PatternFilter,
    pub section: SectionFilter,
}

impl Filter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn preset(name: &str) -> Self {
        Self {
            preset: true,
            ..Self::new(name)
        }
    }

    pub fn with_status(mut self, kinds: impl IntoIterator<Item = StatusKind>) -> Self {
        self.status.set(kinds);
        self
    }

    pub fn with_pattern(mut self, field: PatternField, pattern: &str, exclude: bool) -> Self {
        self.pattern.add(PatternRule {
            field,
            pattern: pattern.to_string(),
            exclude,
        });
        self
    }

    pub fn with_sections(mut self, sections: &[&str], inclusive: bool) -> Self {
        self.section
            .set(sections.iter().map(ToString::to_string), inclusive);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// True iff the package passes every configured sub-filter
    pub fn apply(&self, pkg: &PackageRecord) -> bool {
        self.status.apply(pkg) && self.section.apply(pkg) && self.pattern.apply(pkg)
    }

    /// Key of this filter's section in the config tree
    pub fn config_key(&self) -> String {
        format!("{FILTER_NAMESPACE}.{}", self.name)
    }

    /// Load settings from the section at `key` (`filter.<name>`).
    ///
    /// Returns false when the section does not exist. Individual fields that
    /// fail to parse fall back to their defaults.
    pub fn read(&mut self, config: &Value, key: &str) -> bool {
        let Some(section) = lookup(config, key) else {
            return false;
        };
        let empty = Map::new();
        let fields = section.as_object().unwrap_or(&empty);

        let data = FilterData {
            preset: field(fields, "preset", key),
            status: field(fields, "status", key),
            patterns: field(fields, "patterns", key),
            sections: field(fields, "sections", key),
            section_inclusive: fields
                .get("section_inclusive")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };

        self.preset = data.preset;
        self.status.set(data.status);
        self.pattern.clear();
        for rule in data.patterns {
            self.pattern.add(rule);
        }
        self.section.set(data.sections, data.section_inclusive);
        true
    }

    /// Store settings under `key`, replacing any previous section
    pub fn write(&self, config: &mut Value, key: &str) -> Result<()> {
        let data = FilterData {
            preset: self.preset,
            status: self.status.kinds().collect(),
            patterns: self.pattern.rules().cloned().collect(),
            sections: self.section.sections().map(ToString::to_string).collect(),
            section_inclusive: self.section.is_inclusive(),
        };
        let value = serde_json::to_value(data)?;

        let (namespace, name) = split_key(key);
        if !config.is_object() {
            *config = Value::Object(Map::new());
        }
        if let Value::Object(root) = config {
            let tree = root
                .entry(namespace.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !tree.is_object() {
                *tree = Value::Object(Map::new());
            }
            if let Value::Object(tree) = tree {
                tree.insert(name.to_string(), value);
            }
        }
        Ok(())
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('.').unwrap_or((FILTER_NAMESPACE, key))
}

fn lookup<'a>(config: &'a Value, key: &str) -> Option<&'a Value> {
    let (namespace, name) = split_key(key);
    config.get(namespace)?.get(name)
}

fn field<T: DeserializeOwned + Default>(fields: &Map<String, Value>, name: &str, key: &str) -> T {
    match fields.get(name) {
        None => T::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!(key, field = name, error = %e, "ignoring unreadable filter field");
            T::default()
        }),
    }
}

/// The built-in filters created on first run or when the config is unusable
pub fn preset_filters() -> Vec<Filter> {
    vec![
        Filter::preset("Search Filter"),
        Filter::preset("Installed").with_status([StatusKind::Installed]),
        Filter::preset("Not Installed").with_status([StatusKind::NotInstalled]),
        Filter::preset("Upgradable").with_status([StatusKind::Upgradable]),
        Filter::preset("Broken").with_status([StatusKind::Broken]),
        Filter::preset("Programmed Changes").with_status([
            StatusKind::MarkInstall,
            StatusKind::MarkRemove,
            StatusKind::Broken,
        ]),
    ]
}

// ============================================================================
// Filter file
// ============================================================================

/// JSON file holding the filter tree
pub struct FilterStore {
    path: PathBuf,
}

impl FilterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the tree. None when the file is missing or unreadable.
    pub fn load(&self) -> Option<Value> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no filter file");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "filter file is corrupt, using presets");
                None
            }
        }
    }

    pub fn save(&self, config: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }
}
