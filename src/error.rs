use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by the lister
#[derive(Error, Debug)]
pub enum Error {
    /// Reported by the package engine, passed through untouched
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// Config that exists but cannot be used
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed selection file
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No record with this name or id in the open cache
    #[error("Package not found: {0}")]
    NotFound(String),

    /// Advisory lock held by another process
    #[error("Unable to lock the {what} directory ({})", path.display())]
    Lock { what: &'static str, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Selection file errors. Line numbers start at 1.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed line {line} in selection file")]
    Malformed { line: usize },

    #[error("Line {line} too long in selection file ({len} > {limit} bytes)")]
    LineTooLong { line: usize, len: usize, limit: usize },
}

impl ParseError {
    pub fn line(&self) -> usize {
        match self {
            Self::Malformed { line } | Self::LineTooLong { line, .. } => *line,
        }
    }
}

/// Result type alias using the lister's Error type
pub type Result<T> = std::result::Result<T, Error>;
