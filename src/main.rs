//! synlister - command line front end for the package lister

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::info;
use tracing_subscriber::EnvFilter;

use synlister::apt::AptEngine;
use synlister::filter::FilterStore;
use synlister::lock::{check_apt_lock, is_root};
use synlister::options::OptionsStore;
use synlister::progress::{
    NoProgress, ProgressState, TermAcquireStatus, TermDialog, TermInstallProgress, TermOpProgress,
    UserDialog,
};
use synlister::types::{size_change_str, size_str};
use synlister::{CommitOutcome, ListerConfig, PackageLister};

const LOG_ENV: &str = "SYNLISTER_LOG";

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    CANCELLED.store(true, Ordering::Relaxed);
}

#[derive(Parser)]
#[command(name = "synlister")]
#[command(version, about = "Filter, search and change installed packages", long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Treat search patterns as regular expressions
    #[arg(long, global = true)]
    regex: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List packages, optionally through a named filter
    List {
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show the registered filters
    Filters {
        /// Write the filter file (creates it with the presets on first run)
        #[arg(long)]
        save: bool,
    },
    /// Find packages by name
    Find { pattern: String },
    /// Package counts and pending size change
    Stats,
    /// Pending changes by category
    Summary,
    /// Pin a package at its current state
    Pin { name: String },
    /// Remove a pin
    Unpin { name: String },
    /// Write pending changes as a selection file
    Export {
        /// Output file (default: stdout)
        file: Option<PathBuf>,
    },
    /// Download fresh package indexes
    Update,
    /// Plan changes and commit them
    Apply {
        /// Selection file to apply
        selections: Option<PathBuf>,
        /// Plan an upgrade of every installed package
        #[arg(long)]
        upgrade: bool,
        /// Plan a distribution upgrade
        #[arg(long, conflicts_with = "upgrade")]
        dist_upgrade: bool,
        /// Only download the archives
        #[arg(long)]
        download_only: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn load_config(cli: &Cli) -> ListerConfig {
    let mut config = match &cli.config {
        Some(path) => ListerConfig::load_or_default(path),
        None => ListerConfig::default_path()
            .map(|path| ListerConfig::load_or_default(&path))
            .unwrap_or_default(),
    };
    if cli.regex {
        config.use_regex = true;
    }
    if let Commands::Apply { download_only: true, .. } = cli.command {
        config.download_only = true;
    }
    config
}

fn require_root() -> Result<()> {
    if !is_root() {
        bail!("This command must be run as root");
    }
    if let Some(message) = check_apt_lock() {
        bail!(message);
    }
    Ok(())
}

fn progress(title: &str) -> Rc<RefCell<ProgressState>> {
    ProgressState::new(title).with_cancel_flag(&CANCELLED).shared()
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t);
    }

    let options = OptionsStore::open(&config.options_db)?;
    let filter_store = FilterStore::new(config.filters_file.clone());
    let engine = AptEngine::new(&config.archives_dir)?;
    let mut lister = PackageLister::new(engine, config, options)?;
    lister.restore_filters(&filter_store);

    let state = progress("Reading package lists");
    lister.open_cache(false, &mut TermOpProgress::new(Rc::clone(&state)))?;

    match cli.command {
        Commands::List { filter } => {
            if let Some(name) = filter.as_deref() {
                if lister.filter_by_name(name).is_none() {
                    bail!("No filter named '{name}'");
                }
                lister.set_filter_by_name(Some(name));
            }
            for pkg in lister.displayed() {
                println!(
                    "{:1} {:<40} {:<24} {}",
                    pkg.symbol(),
                    pkg.name(),
                    pkg.installed_version().unwrap_or("-"),
                    pkg.candidate_version().unwrap_or("-"),
                );
            }
        }
        Commands::Filters { save } => {
            for (i, filter) in lister.filters().iter().enumerate() {
                let preset = if filter.preset { " (preset)" } else { "" };
                println!("{i:>3}  {}{preset}", filter.name());
            }
            if save {
                lister.store_filters(&filter_store)?;
                println!("Saved to {}", filter_store.path().display());
            }
        }
        Commands::Find { pattern } => {
            let mut hit = lister.find_package(&pattern);
            while let Some(index) = hit {
                if let Some(pkg) = lister.displayed_at(index) {
                    println!("{:1} {}  {}", pkg.symbol(), pkg.name(), pkg.summary());
                }
                hit = lister.find_next_package();
            }
        }
        Commands::Stats => {
            let stats = lister.get_stats();
            println!("Installed:   {}", stats.installed);
            println!("Broken:      {}", stats.broken);
            println!("To install:  {}", stats.to_install);
            println!("To remove:   {}", stats.to_remove);
            println!("Size change: {}", size_change_str(stats.size_change));
        }
        Commands::Summary => print_summary(&lister),
        Commands::Pin { name } => {
            let id = lister.lookup(&name)?;
            lister.set_pinned(id, true)?;
            println!("{name} pinned");
        }
        Commands::Unpin { name } => {
            let id = lister.lookup(&name)?;
            lister.set_pinned(id, false)?;
            println!("{name} unpinned");
        }
        Commands::Export { file } => {
            let count = match file {
                Some(path) => lister.write_selections(File::create(&path)?)?,
                None => lister.write_selections(io::stdout().lock())?,
            };
            info!(count, "selections exported");
        }
        Commands::Update => {
            require_root()?;
            let state = progress("Updating");
            lister.update_cache(&mut TermAcquireStatus::new(Rc::clone(&state)))?;
            lister.open_cache(false, &mut NoProgress)?;
            println!("Package lists updated");
        }
        Commands::Apply {
            selections,
            upgrade,
            dist_upgrade,
            yes,
            ..
        } => {
            require_root()?;
            if upgrade {
                lister.upgrade()?;
            } else if dist_upgrade {
                lister.dist_upgrade()?;
            }
            if let Some(path) = selections {
                let file = File::open(&path)
                    .map_err(|e| eyre!("cannot open {}: {e}", path.display()))?;
                lister.read_selections(BufReader::new(file))?;
            }
            if !lister.check() && !lister.fix_broken()? {
                bail!("Broken packages could not be resolved");
            }

            let summary = lister.summary();
            if !summary.has_changes() {
                println!("Nothing to do");
                return Ok(());
            }
            print_summary(&lister);

            let mut dialog = TermDialog { assume_yes: yes };
            if !dialog.confirm("Apply changes", "Do you want to apply these changes?") {
                return Ok(());
            }

            let state = progress("Committing");
            let mut install = TermInstallProgress::new(Rc::clone(&state));
            let outcome = lister.commit_changes(
                &mut TermAcquireStatus::new(Rc::clone(&state)),
                &mut install,
                &mut dialog,
            )?;
            install.finish();

            match outcome {
                CommitOutcome::Completed => println!("Changes applied"),
                CommitOutcome::DownloadOnly => println!("Archives downloaded"),
                CommitOutcome::Declined => println!("Nothing was installed"),
                CommitOutcome::Cancelled => bail!("Cancelled"),
            }
            lister.open_cache(false, &mut NoProgress)?;
        }
    }

    Ok(())
}

fn print_summary(lister: &PackageLister<AptEngine>) {
    let summary = lister.summary();
    let sections = [
        ("Held back", &summary.held),
        ("Kept back", &summary.kept),
        ("ESSENTIAL packages to remove", &summary.essential),
        ("To install", &summary.to_install),
        ("To upgrade", &summary.to_upgrade),
        ("To downgrade", &summary.to_downgrade),
        ("To remove", &summary.to_remove),
    ];
    for (title, names) in sections {
        if names.is_empty() {
            continue;
        }
        println!("{title} ({}):", names.len());
        for name in names {
            println!("  {name}");
        }
    }
    let download = lister.download_summary();
    println!(
        "{} to download, {} disk space change",
        size_str(download.bytes),
        size_change_str(summary.size_change)
    );
}
