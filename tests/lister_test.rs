// Integration tests for the package lister over the in-memory engine

mod common;

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use common::{FakeState, lister_with, names, open_lister, sample_state, test_config};
use synlister::Error;
use synlister::ParseError;
use synlister::filter::{Filter, FilterStore, PatternField, StatusKind};
use synlister::observer::{ObserverId, ObserverRegistry, PackageObserver};
use synlister::options::OptionsStore;
use synlister::progress::NoProgress;
use synlister::record::PackageRecord;
use synlister::types::{MarkedStatus, PackageStatus};

fn sorted_lower(mut names: Vec<String>) -> Vec<String> {
    names.sort_by_key(|n| n.to_lowercase());
    names
}

#[test]
fn open_builds_one_record_per_real_package() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    // Same name twice in engine order; only the first survives
    state.borrow_mut().add("bash", "shells", Some("5.2-1"), "5.2-1");
    let lister = open_lister(&state, &dir);

    assert_eq!(lister.packages().len(), 7);
    let unique: HashSet<&str> = lister.packages().iter().map(PackageRecord::name).collect();
    assert_eq!(unique.len(), lister.packages().len());

    assert_eq!(lister.installed_count(), 3);
    assert_eq!(lister.sections(), ["editors", "shells", "libs", "libdevel", "mail"]);
    assert_eq!(lister.package_by_name("vim").unwrap().provides(), ["editor"]);
    assert_eq!(
        lister.package_by_name("postfix").unwrap().provides(),
        ["mail-transport-agent"]
    );
    assert!(lister.package_by_name("editor").is_none());
    assert!(lister.upgradable());
}

#[test]
fn unfiltered_display_is_case_folded_name_order() {
    let dir = tempfile::tempdir().unwrap();
    let lister = open_lister(&sample_state(), &dir);

    assert!(lister.active_filter().is_none());
    assert_eq!(
        names(lister.displayed()),
        ["bash", "libc6", "libc6-dev", "nano", "postfix", "vim", "Zsh-Extra"]
    );
    assert_eq!(lister.element_index("vim"), Some(5));
    assert_eq!(lister.element_index("missing"), None);
}

#[test]
fn display_equals_sorted_filter_matches() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();

    for name in lister
        .filter_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
    {
        lister.set_filter_by_name(Some(&name));
        let filter = lister.active_filter().unwrap().clone();
        let expected: Vec<String> = lister
            .packages()
            .iter()
            .filter(|p| filter.apply(p))
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names(lister.displayed()), sorted_lower(expected), "filter {name}");
    }

    lister.set_filter_by_name(Some("Installed"));
    assert_eq!(names(lister.displayed()), ["bash", "libc6", "nano"]);

    lister.set_filter(Some(999));
    assert!(lister.active_filter().is_none());
    assert_eq!(lister.display_len(), 7);
}

#[test]
fn custom_filter_combines_status_section_and_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);

    let filter = Filter::new("Uninstalled editors")
        .with_status([StatusKind::NotInstalled])
        .with_sections(&["editors", "libdevel"], true)
        .with_pattern(PatternField::Name, "dev", true);
    assert!(lister.register_filter(filter));
    lister.set_filter_by_name(Some("Uninstalled editors"));

    assert_eq!(names(lister.displayed()), ["vim"]);
}

#[test]
fn duplicate_filter_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();
    let count = lister.filters().len();

    assert!(!lister.register_filter(Filter::new("Installed")));
    lister.make_preset_filters();
    assert_eq!(lister.filters().len(), count);
}

#[test]
fn unregistering_active_filter_shows_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();

    lister.set_filter_by_name(Some("Broken"));
    assert_eq!(lister.display_len(), 0);

    let removed = lister.unregister_filter("Broken").unwrap();
    assert_eq!(removed.name(), "Broken");
    assert!(lister.active_filter().is_none());
    assert_eq!(lister.display_len(), 7);
    assert!(lister.unregister_filter("Broken").is_none());
}

#[test]
fn unregistering_earlier_filter_keeps_active_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();

    lister.set_filter_by_name(Some("Upgradable"));
    lister.unregister_filter("Search Filter");
    assert_eq!(lister.active_filter().unwrap().name(), "Upgradable");
    assert_eq!(names(lister.displayed()), ["libc6"]);
}

#[test]
fn filters_survive_store_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilterStore::new(dir.path().join("filters.json"));
    let state = sample_state();

    let mut first = open_lister(&state, &dir);
    first.restore_filters(&store);
    assert_eq!(first.filters().len(), 6, "missing file gives presets");
    first.register_filter(Filter::new("Mail").with_sections(&["mail"], true));
    first.store_filters(&store).unwrap();

    let mut second = open_lister(&state, &dir);
    second.restore_filters(&store);
    assert_eq!(second.filter_names(), first.filter_names());
    assert_eq!(second.filter_by_name("Mail"), first.filter_by_name("Mail"));
    assert!(second.filter_by_name("Installed").unwrap().preset);
    assert_eq!(second.find_filter(6).unwrap().name(), "Mail");
}

#[test]
fn corrupt_filter_file_falls_back_to_presets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filters.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mut lister = open_lister(&sample_state(), &dir);
    lister.restore_filters(&FilterStore::new(&path));
    assert_eq!(lister.filters().len(), 6);
    assert_eq!(lister.find_filter(0).unwrap().name(), "Search Filter");
}

#[test]
fn find_visits_each_match_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);

    let mut hits = Vec::new();
    let mut hit = lister.find_package("LIB");
    while let Some(index) = hit {
        hits.push(lister.displayed_at(index).unwrap().name().to_string());
        hit = lister.find_next_package();
    }
    assert_eq!(hits, ["libc6", "libc6-dev"]);
    assert_eq!(lister.find_next_package(), None);
}

#[test]
fn regex_search_follows_config() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut config = test_config(&dir);
    config.use_regex = true;
    let mut lister = lister_with(&state, config, OptionsStore::open_in_memory().unwrap());
    lister.open_cache(false, &mut NoProgress).unwrap();

    assert_eq!(lister.find_package("^(nano|vim)$"), Some(3));
    assert_eq!(lister.find_next_package(), Some(5));
    assert_eq!(lister.find_next_package(), None);
}

#[test]
fn selections_mark_install_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);

    let file = "# wanted\n\"POSTFIX\" \"install\"\n\"nano\" \"uninstall\"\n\"bash\" \"purge\"\n";
    let marked = lister.read_selections(file.as_bytes()).unwrap();
    assert_eq!(marked, 2);

    assert_eq!(lister.package_by_name("postfix").unwrap().marked(), MarkedStatus::Install);
    assert_eq!(lister.package_by_name("nano").unwrap().marked(), MarkedStatus::Remove);
    for other in ["bash", "vim", "libc6", "libc6-dev", "Zsh-Extra"] {
        assert_eq!(lister.package_by_name(other).unwrap().marked(), MarkedStatus::Keep);
    }
}

#[test]
fn malformed_selection_line_marks_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);

    let err = lister
        .read_selections("\"postfix\" \"install\"\n\n\"foo\"\n".as_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::Parse(ParseError::Malformed { line: 3 })));
    assert!(lister.packages().iter().all(|p| p.marked() == MarkedStatus::Keep));
}

#[test]
fn selection_line_limit_comes_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut config = test_config(&dir);
    config.selection_line_limit = 10;
    let mut lister = lister_with(&state, config, OptionsStore::open_in_memory().unwrap());
    lister.open_cache(false, &mut NoProgress).unwrap();

    let err = lister
        .read_selections("\"postfix\" \"install\"\n".as_bytes())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Parse(ParseError::LineTooLong { line: 1, limit: 10, .. })
    ));
}

#[test]
fn selections_only_touch_displayed_packages() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();
    lister.set_filter_by_name(Some("Installed"));

    let marked = lister
        .read_selections("postfix install\nnano uninstall\n".as_bytes())
        .unwrap();
    assert_eq!(marked, 1);
    assert_eq!(lister.package_by_name("postfix").unwrap().marked(), MarkedStatus::Keep);
}

#[test]
fn broken_selection_result_is_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    state.borrow_mut().set_status("libc6", PackageStatus::Broken);
    let mut lister = open_lister(&state, &dir);
    assert!(!lister.check());

    lister.read_selections("nano uninstall\n".as_bytes()).unwrap();
    assert_eq!(state.borrow().called("fix_broken"), 1);
    assert!(lister.check());
    assert_eq!(lister.package_by_name("libc6").unwrap().status(), PackageStatus::Installed);
}

#[test]
fn exported_selections_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.mark_install(lister.lookup("postfix").unwrap()).unwrap();
    lister.mark_remove(lister.lookup("nano").unwrap()).unwrap();

    let mut out = Vec::new();
    assert_eq!(lister.write_selections(&mut out).unwrap(), 2);
    assert_eq!(
        String::from_utf8(out.clone()).unwrap(),
        "\"nano\" \"uninstall\"\n\"postfix\" \"install\"\n"
    );

    let other_dir = tempfile::tempdir().unwrap();
    let mut other = open_lister(&sample_state(), &other_dir);
    other.read_selections(out.as_slice()).unwrap();
    assert_eq!(other.summary().to_install, ["postfix"]);
    assert_eq!(other.summary().to_remove, ["nano"]);
}

#[test]
fn marking_pulls_in_dependencies_and_refreshes_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();
    lister.set_filter_by_name(Some("Programmed Changes"));
    assert_eq!(lister.display_len(), 0);

    assert!(lister.mark_install(lister.lookup("vim").unwrap()).unwrap());
    assert_eq!(names(lister.displayed()), ["libc6-dev", "vim"]);
    assert_eq!(
        lister.package_by_name("vim").unwrap().marked_version(),
        Some("2:9.0-1")
    );

    lister.mark_keep(lister.lookup("vim").unwrap()).unwrap();
    assert_eq!(names(lister.displayed()), ["libc6-dev"]);
}

#[test]
fn unknown_package_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let lister = open_lister(&sample_state(), &dir);
    assert!(matches!(lister.lookup("emacs"), Err(Error::NotFound(name)) if name == "emacs"));
}

#[test]
fn pinned_packages_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut lister = open_lister(&state, &dir);
    let libc = lister.lookup("libc6").unwrap();

    lister.set_pinned(libc, true).unwrap();
    assert!(!lister.mark_remove(libc).unwrap());
    assert_eq!(lister.package(libc).unwrap().marked(), MarkedStatus::Keep);

    lister.upgrade().unwrap();
    assert_eq!(state.borrow().called("upgrade"), 1);
    assert_eq!(lister.package(libc).unwrap().marked(), MarkedStatus::Keep);
    assert!(lister.summary().kept.contains(&"libc6".to_string()));
}

#[test]
fn pinned_dependency_is_not_pulled_in() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut lister = open_lister(&state, &dir);
    let dev = lister.lookup("libc6-dev").unwrap();
    lister.set_pinned(dev, true).unwrap();

    let vim = lister.lookup("vim").unwrap();
    assert!(lister.mark_install(vim).unwrap());
    assert_eq!(lister.package(vim).unwrap().marked(), MarkedStatus::Install);
    assert_eq!(lister.package(dev).unwrap().marked(), MarkedStatus::Keep);
    assert_eq!(state.borrow().states["libc6-dev"].marked, MarkedStatus::Keep);
}

#[test]
fn pinned_dependency_survives_selection_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    let dev = lister.lookup("libc6-dev").unwrap();
    lister.set_pinned(dev, true).unwrap();

    assert_eq!(lister.read_selections("\"vim\" \"install\"\n".as_bytes()).unwrap(), 1);
    assert_eq!(lister.package_by_name("vim").unwrap().marked(), MarkedStatus::Install);
    assert_eq!(lister.package(dev).unwrap().marked(), MarkedStatus::Keep);
}

#[test]
fn resolver_cannot_change_pinned_package() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    state.borrow_mut().set_status("bash", PackageStatus::Broken);
    let mut lister = open_lister(&state, &dir);
    let nano = lister.lookup("nano").unwrap();
    lister.set_pinned(nano, true).unwrap();
    state.borrow_mut().resolver_marks = vec![
        ("nano".to_string(), MarkedStatus::Remove),
        ("postfix".to_string(), MarkedStatus::Install),
    ];

    assert!(lister.fix_broken().unwrap());
    assert_eq!(lister.package(nano).unwrap().marked(), MarkedStatus::Keep);
    assert_eq!(lister.package_by_name("postfix").unwrap().marked(), MarkedStatus::Install);
}

#[test]
fn upgrade_marks_outdated_packages() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.dist_upgrade().unwrap();
    assert_eq!(lister.summary().to_upgrade, ["libc6"]);
}

#[test]
fn reopen_keeps_names_and_persisted_flags() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    let before = names(lister.packages().iter());

    lister.set_pinned(lister.lookup("nano").unwrap(), true).unwrap();
    lister.set_orphaned(lister.lookup("libc6-dev").unwrap(), true).unwrap();
    lister.set_new(lister.lookup("vim").unwrap(), true).unwrap();

    lister.open_cache(true, &mut NoProgress).unwrap();
    assert_eq!(names(lister.packages().iter()), before);
    assert!(lister.package_by_name("nano").unwrap().is_pinned());
    assert!(lister.package_by_name("libc6-dev").unwrap().is_orphaned());
    assert!(lister.package_by_name("vim").unwrap().is_new());
    assert!(!lister.package_by_name("bash").unwrap().is_new());
}

#[test]
fn reset_keeps_filter_while_plain_open_clears_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.make_preset_filters();
    lister.set_filter_by_name(Some("Installed"));

    lister.open_cache(true, &mut NoProgress).unwrap();
    assert_eq!(lister.active_filter().unwrap().name(), "Installed");
    assert_eq!(lister.display_len(), 3);

    lister.open_cache(false, &mut NoProgress).unwrap();
    assert!(lister.active_filter().is_none());
    assert_eq!(lister.display_len(), 7);
}

#[test]
fn packages_appearing_after_first_run_are_new() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("options.db");
    let state = sample_state();

    {
        let mut first = lister_with(&state, test_config(&dir), OptionsStore::open(&db).unwrap());
        first.open_cache(false, &mut NoProgress).unwrap();
        assert!(first.packages().iter().all(|p| !p.is_new()));
        assert!(first.known_packages().is_seeded());
    }

    state.borrow_mut().add("emacs", "editors", None, "29.1");
    let mut second = lister_with(&state, test_config(&dir), OptionsStore::open(&db).unwrap());
    second.open_cache(false, &mut NoProgress).unwrap();
    let new: Vec<&str> = second
        .packages()
        .iter()
        .filter(|p| p.is_new())
        .map(PackageRecord::name)
        .collect();
    assert_eq!(new, ["emacs"]);

    // Still new on the next run, until forgotten
    let mut third = lister_with(&state, test_config(&dir), OptionsStore::open(&db).unwrap());
    third.open_cache(false, &mut NoProgress).unwrap();
    assert!(third.package_by_name("emacs").unwrap().is_new());
    assert_eq!(third.forget_new().unwrap(), 1);
    assert!(!third.package_by_name("emacs").unwrap().is_new());
}

#[test]
fn failed_open_leaves_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut lister = open_lister(&state, &dir);
    lister.make_preset_filters();
    lister.set_filter_by_name(Some("Installed"));
    let before = names(lister.displayed());

    state.borrow_mut().fail_open = true;
    state.borrow_mut().add("emacs", "editors", None, "29.1");
    let err = lister.open_cache(true, &mut NoProgress).unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert_eq!(err.to_string(), "E: Could not open lock file");
    assert_eq!(names(lister.displayed()), before);
    assert_eq!(lister.packages().len(), 7);

    state.borrow_mut().fail_open = false;
    state.borrow_mut().fail_apply_status = true;
    let err = lister.open_cache(true, &mut NoProgress).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Internal error recalculating dependency cache.; and 1 more issue(s)"
    );
    assert_eq!(lister.packages().len(), 7);
}

#[test]
fn summary_tally_covers_every_pending_change() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    {
        let mut s = state.borrow_mut();
        s.add("sysvinit", "admin", Some("3.06"), "3.06");
        s.set_essential("sysvinit");
        s.add("old-tool", "utils", Some("1.0"), "2.0");
        s.add("held-lib", "libs", Some("1.0"), "1.1");
        s.set_marked("held-lib", MarkedStatus::Held);
        s.add("rolled-back", "utils", Some("2.0"), "1.0");
        s.set_marked("rolled-back", MarkedStatus::Downgrade);
    }
    let mut lister = open_lister(&state, &dir);
    lister.mark_install(lister.lookup("postfix").unwrap()).unwrap();
    lister.mark_remove(lister.lookup("nano").unwrap()).unwrap();
    lister.mark_remove(lister.lookup("sysvinit").unwrap()).unwrap();
    lister.mark_install(lister.lookup("libc6").unwrap()).unwrap();

    let summary = lister.summary();
    assert_eq!(summary.to_install, ["postfix"]);
    assert_eq!(summary.to_upgrade, ["libc6"]);
    assert_eq!(summary.to_remove, ["nano"]);
    assert_eq!(summary.essential, ["sysvinit"]);
    assert_eq!(summary.held, ["held-lib"]);
    assert_eq!(summary.to_downgrade, ["rolled-back"]);
    assert_eq!(summary.kept, ["old-tool"]);

    let changed = lister
        .packages()
        .iter()
        .filter(|p| p.marked() != MarkedStatus::Keep || p.status() == PackageStatus::Outdated)
        .count();
    assert_eq!(summary.total(), changed);
    assert_eq!(summary.removals(), 2);
}

#[test]
fn stats_and_download_summary_follow_marks() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);
    lister.mark_install(lister.lookup("vim").unwrap()).unwrap();
    lister.mark_remove(lister.lookup("nano").unwrap()).unwrap();

    let stats = lister.get_stats();
    assert_eq!(stats.installed, 3);
    assert_eq!(stats.broken, 0);
    assert_eq!(stats.to_install, 2);
    assert_eq!(stats.to_remove, 1);
    assert_eq!(stats.size_change, 1000);

    let download = lister.download_summary();
    assert_eq!(download.count, 2);
    assert_eq!(download.bytes, 800);
}

struct Recorder {
    seen: Vec<Option<String>>,
}

impl PackageObserver for Recorder {
    fn notify_change(&mut self, pkg: Option<&PackageRecord>) {
        self.seen.push(pkg.map(|p| p.name().to_string()));
    }
}

struct Quitter {
    registry: ObserverRegistry,
    id: Option<ObserverId>,
    calls: usize,
}

impl PackageObserver for Quitter {
    fn notify_change(&mut self, _pkg: Option<&PackageRecord>) {
        self.calls += 1;
        if let Some(id) = self.id.take() {
            self.registry.unregister(id);
        }
    }
}

#[test]
fn observers_see_changes_and_may_leave_mid_notification() {
    let dir = tempfile::tempdir().unwrap();
    let mut lister = open_lister(&sample_state(), &dir);

    let quitter = Rc::new(RefCell::new(Quitter {
        registry: lister.observers().clone(),
        id: None,
        calls: 0,
    }));
    let id = lister.observers().register(&quitter);
    quitter.borrow_mut().id = Some(id);
    let recorder = Rc::new(RefCell::new(Recorder { seen: Vec::new() }));
    lister.observers().register(&recorder);

    lister.mark_install(lister.lookup("postfix").unwrap()).unwrap();
    lister.notify_change(None);

    assert_eq!(quitter.borrow().calls, 1);
    assert_eq!(recorder.borrow().seen, [Some("postfix".to_string()), None]);
    assert!(!lister.observers().is_registered(id));

    drop(recorder);
    lister.notify_change(None);
    assert!(lister.observers().is_empty());
}

#[test]
fn fix_broken_without_breakage_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();
    let mut lister = open_lister(&state, &dir);
    assert!(lister.check());
    assert!(lister.fix_broken().unwrap());
    assert_eq!(state.borrow().called("fix_broken"), 0);
}

#[test]
fn unresolvable_breakage_reports_false() {
    let dir = tempfile::tempdir().unwrap();
    let state = Rc::new(RefCell::new(FakeState::default()));
    state.borrow_mut().add("broken-pkg", "misc", Some("1"), "1");
    state.borrow_mut().set_status("broken-pkg", PackageStatus::Broken);
    let mut lister = open_lister(&state, &dir);

    assert!(!lister.fix_broken().unwrap());
    assert!(!lister.check());
}
