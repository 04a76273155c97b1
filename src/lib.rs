//! synlister - a synaptic-style package list controller
//!
//! The lister owns the package records of an open engine cache, filters and
//! sorts them for display, tracks search and selection state and drives
//! index updates and commits. The engine itself sits behind [`engine::Engine`];
//! the `apt` feature provides one backed by libapt-pkg.

#[cfg(feature = "apt")]
pub mod apt;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lister;
pub mod lock;
pub mod observer;
pub mod options;
pub mod progress;
pub mod record;
pub mod search;
pub mod selections;
pub mod types;

pub use commit::CommitOutcome;
pub use config::ListerConfig;
pub use error::{Error, ParseError, Result};
pub use lister::PackageLister;
