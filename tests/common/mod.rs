//! In-memory engine for driving the lister in tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use synlister::config::ListerConfig;
use synlister::engine::{
    CacheEntry, DepCounts, Engine, EngineError, EngineResult, FetchItem, OrderResult,
    PackageEntry, PackageState, VirtualEntry,
};
use synlister::options::OptionsStore;
use synlister::progress::{AcquireStatus, InstallProgress, OpProgress};
use synlister::types::{CleanMode, MarkedStatus, PackageStatus};
use synlister::PackageLister;
use tempfile::TempDir;

/// Everything the fake engine knows, shared with the test through `Rc`
#[derive(Default)]
pub struct FakeState {
    pub entries: Vec<CacheEntry>,
    pub states: HashMap<String, PackageState>,
    /// Packages pulled in when the key is marked for install
    pub depends: HashMap<String, Vec<String>>,
    pub fail_open: bool,
    pub fail_apply_status: bool,
    pub resolvable: bool,
    /// Marks the resolver applies when it fixes broken packages
    pub resolver_marks: Vec<(String, MarkedStatus)>,
    pub index_items: Vec<FetchItem>,
    pub fetch_rounds: VecDeque<Vec<FetchItem>>,
    pub install_results: VecDeque<OrderResult>,
    pub fix_missing_ok: bool,
    pub calls: Vec<String>,
}

impl FakeState {
    pub fn add(&mut self, name: &str, section: &str, installed: Option<&str>, candidate: &str) {
        let status = match installed {
            None => PackageStatus::NotInstalled,
            Some(v) if v != candidate => PackageStatus::Outdated,
            Some(_) => PackageStatus::Installed,
        };
        self.entries.push(CacheEntry::Real(PackageEntry {
            name: name.to_string(),
            section: Some(section.to_string()),
            summary: format!("{name} package"),
            installed_version: installed.map(ToString::to_string),
            candidate_version: Some(candidate.to_string()),
            installed_size: 1000,
            download_size: 400,
            essential: false,
        }));
        self.states.insert(
            name.to_string(),
            PackageState {
                status,
                marked: MarkedStatus::Keep,
                marked_version: installed.map(ToString::to_string),
            },
        );
    }

    pub fn add_virtual(&mut self, name: &str, provider: Option<&str>) {
        self.entries.push(CacheEntry::Virtual(VirtualEntry {
            name: name.to_string(),
            provider: provider.map(ToString::to_string),
        }));
    }

    pub fn set_essential(&mut self, name: &str) {
        for entry in &mut self.entries {
            if let CacheEntry::Real(p) = entry {
                if p.name == name {
                    p.essential = true;
                }
            }
        }
    }

    pub fn set_status(&mut self, name: &str, status: PackageStatus) {
        if let Some(state) = self.states.get_mut(name) {
            state.status = status;
        }
    }

    pub fn set_marked(&mut self, name: &str, marked: MarkedStatus) {
        if let Some(state) = self.states.get_mut(name) {
            state.marked = marked;
        }
    }

    pub fn called(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    fn entry(&self, name: &str) -> Option<&PackageEntry> {
        self.entries.iter().find_map(|e| match e {
            CacheEntry::Real(p) if p.name == name => Some(p),
            _ => None,
        })
    }

    fn mark_install_one(&mut self, name: &str) -> EngineResult<()> {
        let candidate = self
            .entry(name)
            .and_then(|p| p.candidate_version.clone())
            .ok_or_else(|| EngineError::new(format!("Unable to locate package {name}")))?;
        let state = self
            .states
            .get_mut(name)
            .ok_or_else(|| EngineError::new(format!("Unable to locate package {name}")))?;
        state.marked = match state.status {
            PackageStatus::NotInstalled => MarkedStatus::Install,
            PackageStatus::Outdated => MarkedStatus::Upgrade,
            _ => MarkedStatus::Install,
        };
        state.marked_version = Some(candidate);
        Ok(())
    }
}

pub struct FakeEngine {
    state: Rc<RefCell<FakeState>>,
}

impl FakeEngine {
    pub fn new(state: &Rc<RefCell<FakeState>>) -> Self {
        Self {
            state: Rc::clone(state),
        }
    }

    fn log(&self, call: &str) {
        self.state.borrow_mut().calls.push(call.to_string());
    }
}

impl Engine for FakeEngine {
    fn open(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()> {
        self.log("open");
        progress.update("Reading package lists", 100.0);
        if self.state.borrow().fail_open {
            return Err(EngineError::new("E: Could not open lock file"));
        }
        Ok(())
    }

    fn reset(&mut self, progress: &mut dyn OpProgress) -> EngineResult<()> {
        self.log("reset");
        {
            let mut state = self.state.borrow_mut();
            let installed: HashMap<String, Option<String>> = state
                .entries
                .iter()
                .filter_map(|e| match e {
                    CacheEntry::Real(p) => Some((p.name.clone(), p.installed_version.clone())),
                    CacheEntry::Virtual(_) => None,
                })
                .collect();
            for (name, s) in &mut state.states {
                s.marked = MarkedStatus::Keep;
                s.marked_version = installed.get(name).cloned().flatten();
            }
        }
        self.open(progress)
    }

    fn apply_status(&mut self) -> EngineResult<()> {
        if self.state.borrow().fail_apply_status {
            return Err(EngineError::new("dpkg was interrupted"));
        }
        Ok(())
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.state.borrow().entries.clone()
    }

    fn state(&self, name: &str) -> Option<PackageState> {
        self.state.borrow().states.get(name).cloned()
    }

    fn counts(&self) -> DepCounts {
        let state = self.state.borrow();
        let mut counts = DepCounts::default();
        for (name, s) in &state.states {
            let sizes = state
                .entry(name)
                .map_or((0, 0), |p| (p.installed_size, p.download_size));
            if s.status == PackageStatus::Broken {
                counts.broken += 1;
            }
            if s.marked.is_install() {
                counts.install += 1;
                counts.usr_size += sizes.0 as i64;
                counts.deb_size += sizes.1;
            } else if s.marked == MarkedStatus::Remove {
                counts.delete += 1;
                counts.usr_size -= sizes.0 as i64;
            } else {
                counts.keep += 1;
            }
        }
        counts
    }

    fn mark_install(&mut self, name: &str) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        state.mark_install_one(name)?;
        let deps = state.depends.get(name).cloned().unwrap_or_default();
        for dep in deps {
            if state.states.get(&dep).is_some_and(|s| s.status == PackageStatus::NotInstalled) {
                state.mark_install_one(&dep)?;
            }
        }
        Ok(())
    }

    fn mark_remove(&mut self, name: &str) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        let s = state
            .states
            .get_mut(name)
            .ok_or_else(|| EngineError::new(format!("Unable to locate package {name}")))?;
        s.marked = MarkedStatus::Remove;
        s.marked_version = None;
        Ok(())
    }

    fn mark_keep(&mut self, name: &str) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        let installed = state.entry(name).and_then(|p| p.installed_version.clone());
        let s = state
            .states
            .get_mut(name)
            .ok_or_else(|| EngineError::new(format!("Unable to locate package {name}")))?;
        s.marked = MarkedStatus::Keep;
        s.marked_version = installed;
        Ok(())
    }

    fn fix_broken(&mut self) -> EngineResult<bool> {
        self.log("fix_broken");
        let mut state = self.state.borrow_mut();
        if !state.resolvable {
            return Ok(false);
        }
        for s in state.states.values_mut() {
            if s.status == PackageStatus::Broken {
                s.status = PackageStatus::Installed;
            }
        }
        let marks = std::mem::take(&mut state.resolver_marks);
        for (name, marked) in marks {
            state.set_marked(&name, marked);
        }
        Ok(true)
    }

    fn upgrade(&mut self) -> EngineResult<()> {
        self.log("upgrade");
        let outdated: Vec<String> = self
            .state
            .borrow()
            .states
            .iter()
            .filter(|(_, s)| s.status == PackageStatus::Outdated)
            .map(|(name, _)| name.clone())
            .collect();
        let mut state = self.state.borrow_mut();
        for name in outdated {
            state.mark_install_one(&name)?;
        }
        Ok(())
    }

    fn dist_upgrade(&mut self) -> EngineResult<()> {
        self.upgrade()
    }

    fn fetch_indexes(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>> {
        self.log("fetch_indexes");
        status.start();
        let items = self.state.borrow().index_items.clone();
        status.stop();
        Ok(items)
    }

    fn clean_lists(&mut self) -> EngineResult<()> {
        self.log("clean_lists");
        Ok(())
    }

    fn queue_archives(&mut self) -> EngineResult<()> {
        self.log("queue_archives");
        Ok(())
    }

    fn run_fetch(&mut self, status: &mut dyn AcquireStatus) -> EngineResult<Vec<FetchItem>> {
        self.log("run_fetch");
        status.start();
        let items = self.state.borrow_mut().fetch_rounds.pop_front().unwrap_or_default();
        for item in &items {
            if item.is_finished() {
                status.done(&item.uri);
            } else {
                status.fail(&item.uri, &item.error);
            }
        }
        status.stop();
        Ok(items)
    }

    fn fix_missing(&mut self) -> bool {
        self.log("fix_missing");
        self.state.borrow().fix_missing_ok
    }

    fn install(&mut self, progress: &mut dyn InstallProgress) -> EngineResult<OrderResult> {
        self.log("install");
        progress.status_changed("vim", 1, 1, "Installing");
        Ok(self
            .state
            .borrow_mut()
            .install_results
            .pop_front()
            .unwrap_or(OrderResult::Completed))
    }

    fn lock(&mut self) -> EngineResult<()> {
        self.log("lock");
        Ok(())
    }

    fn release_lock(&mut self) {
        self.log("release_lock");
    }

    fn unlock_all(&mut self) {
        self.log("unlock_all");
    }

    fn clean_archives(&mut self, mode: CleanMode) -> EngineResult<()> {
        self.log(match mode {
            CleanMode::All => "clean_all",
            CleanMode::Obsolete => "clean_obsolete",
        });
        Ok(())
    }
}

/// A small archive with installed, outdated, missing and virtual packages
pub fn sample_state() -> Rc<RefCell<FakeState>> {
    let mut state = FakeState {
        resolvable: true,
        fix_missing_ok: true,
        ..FakeState::default()
    };
    state.add("vim", "editors", None, "2:9.0-1");
    state.add("bash", "shells", Some("5.2-1"), "5.2-1");
    state.add("Zsh-Extra", "shells", None, "1.0");
    state.add("libc6", "libs", Some("2.36-8"), "2.36-9");
    state.add("libc6-dev", "libdevel", None, "2.36-9");
    state.add("nano", "editors", Some("7.2-1"), "7.2-1");
    state.add("postfix", "mail", None, "3.7-1");
    state.add_virtual("editor", Some("vim"));
    state.add_virtual("mail-transport-agent", Some("postfix"));
    state.add_virtual("orphan-virtual", None);
    state.depends.insert("vim".to_string(), vec!["libc6-dev".to_string()]);
    Rc::new(RefCell::new(state))
}

/// Config whose lock directories live in `dir`
pub fn test_config(dir: &TempDir) -> ListerConfig {
    let archives = dir.path().join("archives");
    let lists = dir.path().join("lists");
    std::fs::create_dir_all(&archives).unwrap();
    std::fs::create_dir_all(&lists).unwrap();
    ListerConfig {
        archives_dir: archives,
        lists_dir: lists,
        filters_file: dir.path().join("filters.json"),
        options_db: dir.path().join("options.db"),
        ..ListerConfig::default()
    }
}

pub fn lister_with(
    state: &Rc<RefCell<FakeState>>,
    config: ListerConfig,
    options: OptionsStore,
) -> PackageLister<FakeEngine> {
    PackageLister::new(FakeEngine::new(state), config, options).unwrap()
}

/// Opened lister over `state` with in-memory options
pub fn open_lister(state: &Rc<RefCell<FakeState>>, dir: &TempDir) -> PackageLister<FakeEngine> {
    let mut lister = lister_with(state, test_config(dir), OptionsStore::open_in_memory().unwrap());
    lister.open_cache(false, &mut synlister::progress::NoProgress).unwrap();
    lister
}

pub fn names<'a>(records: impl Iterator<Item = &'a synlister::record::PackageRecord>) -> Vec<String> {
    records.map(|p| p.name().to_string()).collect()
}
