//! The package list controller.
//!
//! [`PackageLister`] owns every record of the open cache, the filter
//! registry and the displayed subset. All mutations go through it so the
//! displayed list and the observers stay in step with the engine.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ListerConfig;
use crate::engine::{CacheEntry, Engine, EngineError, VirtualEntry};
use crate::error::{Error, Result};
use crate::filter::{FILTER_NAMESPACE, Filter, FilterStore, preset_filters};
use crate::observer::ObserverRegistry;
use crate::options::{KnownPackages, OptionsStore, PackageFlags};
use crate::progress::OpProgress;
use crate::record::PackageRecord;
use crate::search::SearchCursor;
use crate::selections::{self, Selection, SelectionAction};
use crate::types::{DownloadSummary, MarkedStatus, PackageId, PackageStatus, Stats, Summary};

const RECALC_FAILED: &str = "Internal error recalculating dependency cache.";

/// Result of rebuilding the record index, swapped in only when complete
struct Snapshot {
    packages: Vec<PackageRecord>,
    by_name: HashMap<String, PackageId>,
    sections: Vec<String>,
    installed_count: usize,
    known: KnownPackages,
    newly_seen: Vec<String>,
    newly_flagged: Vec<String>,
}

pub struct PackageLister<E: Engine> {
    engine: E,
    config: ListerConfig,
    options: OptionsStore,
    known: KnownPackages,

    packages: Vec<PackageRecord>,
    by_name: HashMap<String, PackageId>,
    sections: Vec<String>,
    installed_count: usize,
    opened: bool,

    filters: Vec<Filter>,
    /// Index into `filters`
    active: Option<usize>,
    display: Vec<PackageId>,
    search: SearchCursor,
    observers: ObserverRegistry,

    /// Set while an update or commit runs; the display is frozen until the
    /// next cache open
    updating: bool,
}

impl<E: Engine> PackageLister<E> {
    pub fn new(engine: E, config: ListerConfig, options: OptionsStore) -> Result<Self> {
        let known = options.load_known()?;
        debug!(known = known.len(), seeded = known.is_seeded(), "lister created");
        Ok(Self {
            engine,
            config,
            options,
            known,
            packages: Vec::new(),
            by_name: HashMap::new(),
            sections: Vec::new(),
            installed_count: 0,
            opened: false,
            filters: Vec::new(),
            active: None,
            display: Vec::new(),
            search: SearchCursor::new(),
            observers: ObserverRegistry::new(),
            updating: false,
        })
    }

    // ========================================================================
    // Cache lifecycle
    // ========================================================================

    /// Open (or with `reset`, rebuild) the engine cache and reload every
    /// record.
    ///
    /// On failure the previous records, filters and display are untouched.
    pub fn open_cache(&mut self, reset: bool, progress: &mut dyn OpProgress) -> Result<()> {
        let opened = if reset {
            self.engine.reset(progress)
        } else {
            self.engine.open(progress)
        };
        progress.done();
        opened?;

        self.engine.apply_status().map_err(|e| {
            warn!(error = %e, "status recalculation failed");
            let mut messages = vec![RECALC_FAILED.to_string()];
            messages.extend(e.messages().iter().cloned());
            EngineError::from_messages(messages)
        })?;

        let snapshot = self.build_snapshot();
        self.persist_snapshot(&snapshot);

        info!(
            packages = snapshot.packages.len(),
            installed = snapshot.installed_count,
            new = snapshot.newly_flagged.len(),
            reset,
            "package cache opened"
        );

        self.packages = snapshot.packages;
        self.by_name = snapshot.by_name;
        self.sections = snapshot.sections;
        self.installed_count = snapshot.installed_count;
        self.known = snapshot.known;
        self.opened = true;
        self.updating = false;

        if reset {
            self.reapply_filter();
        } else {
            self.set_filter(None);
        }
        Ok(())
    }

    fn build_snapshot(&self) -> Snapshot {
        let flags = self.options.all_flags().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read package options, ignoring them");
            HashMap::new()
        });

        let mut known = self.known.clone();
        let first_run = !known.is_seeded();
        let mut packages: Vec<PackageRecord> = Vec::new();
        let mut by_name = HashMap::new();
        let mut sections: Vec<String> = Vec::new();
        let mut installed_count = 0;
        let mut newly_seen = Vec::new();
        let mut newly_flagged = Vec::new();
        let mut virtuals: Vec<VirtualEntry> = Vec::new();

        for entry in self.engine.entries() {
            let entry = match entry {
                CacheEntry::Real(entry) => entry,
                CacheEntry::Virtual(v) => {
                    virtuals.push(v);
                    continue;
                }
            };
            if by_name.contains_key(&entry.name) {
                warn!(name = %entry.name, "duplicate package in cache, keeping the first");
                continue;
            }

            let state = self.engine.state(&entry.name).unwrap_or_default();
            let id = PackageId(packages.len() as u32);
            let mut record = PackageRecord::new(id, entry, state);
            let name = record.name().to_string();

            if record.status().is_installed() {
                installed_count += 1;
            }
            if known.insert(&name) {
                if !first_run {
                    record.set_new(true);
                    newly_flagged.push(name.clone());
                }
                newly_seen.push(name.clone());
            }
            if let Some(section) = record.section() {
                if !sections.iter().any(|s| s == section) {
                    sections.push(section.to_string());
                }
            }

            if let Some(PackageFlags { pinned, new, orphaned }) = flags.get(&name).copied() {
                record.set_pinned(pinned);
                if new {
                    record.set_new(true);
                }
                record.set_orphaned(orphaned);
            }

            by_name.insert(name, id);
            packages.push(record);
        }

        for virt in virtuals {
            let Some(owner) = virt.provider.as_deref() else {
                continue;
            };
            if let Some(id) = by_name.get(owner) {
                packages[id.index()].add_virtual(&virt.name);
            }
        }

        known.mark_seeded();
        Snapshot {
            packages,
            by_name,
            sections,
            installed_count,
            known,
            newly_seen,
            newly_flagged,
        }
    }

    /// Persistence failures only cost the "new" markers; they never fail an open
    fn persist_snapshot(&mut self, snapshot: &Snapshot) {
        for name in &snapshot.newly_flagged {
            if let Err(e) = self.options.set_new(name, true) {
                warn!(name = %name, error = %e, "cannot persist new package flag");
            }
        }
        if let Err(e) = self
            .options
            .save_known(snapshot.newly_seen.iter().map(String::as_str), true)
        {
            warn!(error = %e, "cannot persist known packages");
        }
    }

    /// Dependency cache is open and usable
    pub fn upgradable(&self) -> bool {
        self.opened
    }

    /// True when nothing is broken
    pub fn check(&self) -> bool {
        self.opened && self.engine.counts().broken == 0
    }

    // ========================================================================
    // Display
    // ========================================================================

    /// Select the filter at `index`; None or an unknown index shows everything
    pub fn set_filter(&mut self, index: Option<usize>) {
        self.active = index.filter(|&i| i < self.filters.len());
        if index.is_some() && self.active.is_none() {
            debug!(?index, "no such filter, clearing");
        }
        self.reapply_filter();
    }

    /// Select a filter by name; an unknown name shows everything
    pub fn set_filter_by_name(&mut self, name: Option<&str>) {
        let index = name.and_then(|name| self.filters.iter().position(|f| f.name() == name));
        self.set_filter(index);
    }

    pub fn active_filter(&self) -> Option<&Filter> {
        self.active.and_then(|i| self.filters.get(i))
    }

    /// Recompute the displayed list: every record passing the active filter,
    /// sorted by case-folded name
    pub fn reapply_filter(&mut self) {
        if self.updating {
            debug!("update in progress, display frozen");
            return;
        }

        let filter = self.active.and_then(|i| self.filters.get(i));
        let mut keyed: Vec<(String, &str, PackageId)> = self
            .packages
            .iter()
            .filter(|pkg| filter.is_none_or(|f| f.apply(pkg)))
            .map(|pkg| (pkg.name().to_lowercase(), pkg.name(), pkg.id()))
            .collect();
        keyed.sort_unstable();

        self.display = keyed.into_iter().map(|(_, _, id)| id).collect();
    }

    /// Reapply the filter, then tell every observer about `pkg`
    pub fn notify_change(&mut self, pkg: Option<PackageId>) {
        self.reapply_filter();
        let record = pkg.and_then(|id| self.packages.get(id.index()));
        self.observers.notify(record);
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn display_len(&self) -> usize {
        self.display.len()
    }

    /// Record at `index` in the displayed list
    pub fn displayed_at(&self, index: usize) -> Option<&PackageRecord> {
        self.display.get(index).map(|id| &self.packages[id.index()])
    }

    pub fn displayed(&self) -> impl Iterator<Item = &PackageRecord> {
        self.display.iter().map(|id| &self.packages[id.index()])
    }

    /// Position of `name` in the displayed list
    pub fn element_index(&self, name: &str) -> Option<usize> {
        let id = self.by_name.get(name)?;
        self.display.iter().position(|d| d == id)
    }

    // ========================================================================
    // Filter registry
    // ========================================================================

    /// Add `filter`; false if one with the same name exists
    pub fn register_filter(&mut self, filter: Filter) -> bool {
        if self.filters.iter().any(|f| f.name() == filter.name()) {
            warn!(name = filter.name(), "filter already registered");
            return false;
        }
        debug!(name = filter.name(), "filter registered");
        self.filters.push(filter);
        true
    }

    /// Remove the filter named `name`. Removing the active filter clears it.
    pub fn unregister_filter(&mut self, name: &str) -> Option<Filter> {
        let index = self.filters.iter().position(|f| f.name() == name)?;
        let filter = self.filters.remove(index);

        match self.active {
            Some(active) if active == index => {
                warn!(name, "active filter unregistered, showing all packages");
                self.active = None;
                self.reapply_filter();
            }
            Some(active) if active > index => self.active = Some(active - 1),
            _ => {}
        }
        debug!(name, "filter unregistered");
        Some(filter)
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(Filter::name).collect()
    }

    pub fn find_filter(&self, index: usize) -> Option<&Filter> {
        self.filters.get(index)
    }

    pub fn filter_by_name(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    /// Edit a registered filter; call [`Self::reapply_filter`] afterwards
    pub fn filter_mut(&mut self, index: usize) -> Option<&mut Filter> {
        self.filters.get_mut(index)
    }

    pub fn make_preset_filters(&mut self) {
        for filter in preset_filters() {
            self.register_filter(filter);
        }
    }

    /// Load the filter registry from `store`, falling back to the presets
    /// when the file is missing, unreadable or holds no filters
    pub fn restore_filters(&mut self, store: &FilterStore) {
        let Some(config) = store.load() else {
            self.make_preset_filters();
            return;
        };
        let Some(tree) = config.get(FILTER_NAMESPACE).and_then(Value::as_object) else {
            warn!(path = %store.path().display(), "no filter tree, using presets");
            self.make_preset_filters();
            return;
        };

        let names: Vec<String> = tree.keys().cloned().collect();
        let mut restored = 0;
        for name in names {
            let mut filter = Filter::new(&name);
            if filter.read(&config, &filter.config_key()) && self.register_filter(filter) {
                restored += 1;
            }
        }

        if restored == 0 {
            warn!(path = %store.path().display(), "filter tree is empty, using presets");
            self.make_preset_filters();
        } else {
            info!(restored, "filters restored");
        }
    }

    pub fn store_filters(&self, store: &FilterStore) -> Result<()> {
        let mut config = Value::Object(Map::new());
        for filter in &self.filters {
            filter.write(&mut config, &filter.config_key())?;
        }
        store.save(&config)?;
        debug!(path = %store.path().display(), count = self.filters.len(), "filters stored");
        Ok(())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Start a search over the displayed names; see [`SearchCursor`]
    pub fn find_package(&mut self, pattern: &str) -> Option<usize> {
        self.search.set_pattern(pattern, self.config.use_regex);
        self.find_next_package()
    }

    pub fn find_next_package(&mut self) -> Option<usize> {
        let packages = &self.packages;
        let display = &self.display;
        self.search
            .find_next(display.len(), |i| packages[display[i].index()].name())
    }

    pub fn clear_search(&mut self) {
        self.search.clear();
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub fn packages(&self) -> &[PackageRecord] {
        &self.packages
    }

    pub fn package(&self, id: PackageId) -> Option<&PackageRecord> {
        self.packages.get(id.index())
    }

    pub fn package_by_name(&self, name: &str) -> Option<&PackageRecord> {
        self.by_name.get(name).map(|id| &self.packages[id.index()])
    }

    /// Id of `name`, or [`Error::NotFound`]
    pub fn lookup(&self, name: &str) -> Result<PackageId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn installed_count(&self) -> usize {
        self.installed_count
    }

    /// Distinct sections in the order they were first seen
    pub fn sections(&self) -> &[String] {
        &self.sections
    }

    pub fn known_packages(&self) -> &KnownPackages {
        &self.known
    }

    pub fn config(&self) -> &ListerConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> &OptionsStore {
        &self.options
    }

    fn record(&self, id: PackageId) -> Result<&PackageRecord> {
        self.packages
            .get(id.index())
            .ok_or_else(|| Error::NotFound(format!("#{}", id.0)))
    }

    fn record_mut(&mut self, id: PackageId) -> Result<&mut PackageRecord> {
        self.packages
            .get_mut(id.index())
            .ok_or_else(|| Error::NotFound(format!("#{}", id.0)))
    }

    /// Pull marks back from the engine; one change can move many packages
    fn refresh_states(&mut self) {
        for record in &mut self.packages {
            if let Some(state) = self.engine.state(record.name()) {
                record.apply_state(state);
            }
        }
    }

    /// Undo whatever the resolver planned for pinned packages, including
    /// changes pulled in as dependencies of another mark
    fn keep_pinned(&mut self) -> Result<()> {
        let pinned: Vec<String> = self
            .packages
            .iter()
            .filter(|p| p.is_pinned())
            .filter(|p| {
                self.engine
                    .state(p.name())
                    .is_some_and(|s| s.marked != MarkedStatus::Keep)
            })
            .map(|p| p.name().to_string())
            .collect();
        for name in pinned {
            debug!(name = %name, "keeping pinned package");
            self.engine.mark_keep(&name)?;
        }
        Ok(())
    }

    // ========================================================================
    // Marking
    // ========================================================================

    fn mark(&mut self, id: PackageId, action: MarkedStatus) -> Result<bool> {
        let record = self.record(id)?;
        let name = record.name().to_string();
        if record.is_pinned() && action != MarkedStatus::Keep {
            info!(name = %name, "package is pinned, not changing it");
            return Ok(false);
        }
        match action {
            MarkedStatus::Remove => self.engine.mark_remove(&name)?,
            MarkedStatus::Keep => self.engine.mark_keep(&name)?,
            _ => self.engine.mark_install(&name)?,
        }
        Ok(true)
    }

    /// Mark for install or upgrade. Ok(false) for pinned packages.
    pub fn mark_install(&mut self, id: PackageId) -> Result<bool> {
        let changed = self.mark(id, MarkedStatus::Install)?;
        self.keep_pinned()?;
        self.refresh_states();
        self.notify_change(Some(id));
        Ok(changed)
    }

    /// Mark for removal. Ok(false) for pinned packages.
    pub fn mark_remove(&mut self, id: PackageId) -> Result<bool> {
        let changed = self.mark(id, MarkedStatus::Remove)?;
        self.keep_pinned()?;
        self.refresh_states();
        self.notify_change(Some(id));
        Ok(changed)
    }

    pub fn mark_keep(&mut self, id: PackageId) -> Result<()> {
        self.mark(id, MarkedStatus::Keep)?;
        self.refresh_states();
        self.notify_change(Some(id));
        Ok(())
    }

    /// Pin or unpin. Pinning drops any pending action on the package.
    pub fn set_pinned(&mut self, id: PackageId, pinned: bool) -> Result<()> {
        let name = self.record(id)?.name().to_string();
        self.options.set_pinned(&name, pinned)?;
        self.record_mut(id)?.set_pinned(pinned);
        if pinned {
            self.engine.mark_keep(&name)?;
            self.refresh_states();
        }
        info!(name = %name, pinned, "pin changed");
        self.notify_change(Some(id));
        Ok(())
    }

    pub fn set_new(&mut self, id: PackageId, new: bool) -> Result<()> {
        let name = self.record(id)?.name().to_string();
        self.options.set_new(&name, new)?;
        self.record_mut(id)?.set_new(new);
        self.notify_change(Some(id));
        Ok(())
    }

    pub fn set_orphaned(&mut self, id: PackageId, orphaned: bool) -> Result<()> {
        let name = self.record(id)?.name().to_string();
        self.options.set_orphaned(&name, orphaned)?;
        self.record_mut(id)?.set_orphaned(orphaned);
        self.notify_change(Some(id));
        Ok(())
    }

    /// Clear the "new" flag everywhere
    pub fn forget_new(&mut self) -> Result<usize> {
        let cleared = self.options.forget_new()?;
        for record in &mut self.packages {
            record.set_new(false);
        }
        info!(cleared, "forgot new packages");
        self.notify_change(None);
        Ok(cleared)
    }

    // ========================================================================
    // Resolver actions
    // ========================================================================

    /// Resolve broken dependencies. Ok(true) when nothing was broken.
    pub fn fix_broken(&mut self) -> Result<bool> {
        if !self.opened {
            return Ok(false);
        }
        if self.engine.counts().broken == 0 {
            return Ok(true);
        }
        let fixed = self.engine.fix_broken()?;
        if fixed {
            self.keep_pinned()?;
            self.refresh_states();
            self.notify_change(None);
        } else {
            warn!("broken packages could not be resolved");
        }
        Ok(fixed)
    }

    pub fn upgrade(&mut self) -> Result<()> {
        self.engine.upgrade()?;
        self.keep_pinned()?;
        self.refresh_states();
        info!("upgrade planned");
        self.notify_change(None);
        Ok(())
    }

    pub fn dist_upgrade(&mut self) -> Result<()> {
        self.engine.dist_upgrade()?;
        self.keep_pinned()?;
        self.refresh_states();
        info!("distribution upgrade planned");
        self.notify_change(None);
        Ok(())
    }

    // ========================================================================
    // Summaries
    // ========================================================================

    pub fn get_stats(&self) -> Stats {
        if !self.opened {
            return Stats::default();
        }
        let counts = self.engine.counts();
        Stats {
            installed: self.installed_count,
            broken: counts.broken,
            to_install: counts.install,
            to_remove: counts.delete,
            size_change: counts.usr_size,
        }
    }

    pub fn download_summary(&self) -> DownloadSummary {
        if !self.opened {
            return DownloadSummary::default();
        }
        DownloadSummary {
            count: self
                .packages
                .iter()
                .filter(|p| p.marked().is_install() && p.download_size() > 0)
                .count(),
            bytes: self.engine.counts().deb_size,
        }
    }

    /// Classify every record by pending action in one pass
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for pkg in &self.packages {
            let name = pkg.name().to_string();
            match pkg.marked() {
                MarkedStatus::Keep => {
                    if pkg.status() == PackageStatus::Outdated {
                        summary.kept.push(name);
                    }
                }
                MarkedStatus::Install => summary.to_install.push(name),
                MarkedStatus::Upgrade => summary.to_upgrade.push(name),
                MarkedStatus::Downgrade => summary.to_downgrade.push(name),
                MarkedStatus::Remove if pkg.is_essential() => summary.essential.push(name),
                MarkedStatus::Remove => summary.to_remove.push(name),
                MarkedStatus::Held => summary.held.push(name),
            }
        }

        for list in [
            &mut summary.held,
            &mut summary.kept,
            &mut summary.essential,
            &mut summary.to_install,
            &mut summary.to_upgrade,
            &mut summary.to_downgrade,
            &mut summary.to_remove,
        ] {
            list.sort_unstable();
        }
        if self.opened {
            summary.size_change = self.engine.counts().usr_size;
        }
        summary
    }

    // ========================================================================
    // Selection files
    // ========================================================================

    /// Read a selection file and apply it to the displayed packages.
    /// The file is parsed completely before anything is marked.
    pub fn read_selections<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let selections = selections::read_selections(reader, self.config.selection_line_limit)?;
        self.apply_selections(&selections)
    }

    /// Mark every displayed package named (case-insensitively) in
    /// `selections`, then resolve if that broke anything
    pub fn apply_selections(&mut self, selections: &[Selection]) -> Result<usize> {
        let mut marked = 0;
        for selection in selections {
            let matches: Vec<PackageId> = self
                .display
                .iter()
                .copied()
                .filter(|id| {
                    self.packages[id.index()]
                        .name()
                        .eq_ignore_ascii_case(&selection.name)
                })
                .collect();
            if matches.is_empty() {
                debug!(name = %selection.name, "selected package is not displayed");
            }
            let action = match selection.action {
                SelectionAction::Install => MarkedStatus::Install,
                SelectionAction::Uninstall => MarkedStatus::Remove,
            };
            for id in matches {
                if self.mark(id, action)? {
                    marked += 1;
                }
            }
        }

        self.keep_pinned()?;
        self.refresh_states();
        if !self.check() {
            self.fix_broken()?;
        }
        info!(marked, "selections applied");
        self.notify_change(None);
        Ok(marked)
    }

    /// Write every pending install and removal as a selection file
    pub fn write_selections<W: Write>(&self, writer: W) -> Result<usize> {
        let mut selected: Vec<(&str, SelectionAction)> = self
            .packages
            .iter()
            .filter_map(|p| match p.marked() {
                m if m.is_install() => Some((p.name(), SelectionAction::Install)),
                MarkedStatus::Remove => Some((p.name(), SelectionAction::Uninstall)),
                _ => None,
            })
            .collect();
        selected.sort_unstable_by_key(|(name, _)| *name);
        let count = selected.len();
        selections::write_selections(writer, selected)?;
        Ok(count)
    }

    // ========================================================================
    // Crate-internal access for update and commit
    // ========================================================================

    pub(crate) fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub(crate) fn set_updating(&mut self, updating: bool) {
        self.updating = updating;
    }

    pub fn is_updating(&self) -> bool {
        self.updating
    }
}
