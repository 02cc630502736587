//! Error types for impact detection and test execution

use std::path::PathBuf;
use thiserror::Error;

/// Failure to build a [`SourceIndex`](crate::test_model::SourceIndex)
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("syntax error in {} at line {line}", .path.display())]
    Syntax { path: PathBuf, line: u32 },
    #[error("failed to load python grammar: {0}")]
    Grammar(String),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to compute per-file diff snapshots
#[derive(Error, Debug)]
pub enum DiffError {
    #[error("malformed hunk header: {line:?}")]
    MalformedHunk { line: String },
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

/// Fine-grained mapping failed for one file; the caller falls back
#[derive(Error, Debug)]
#[error("could not map changes in {}: {source}", .path.display())]
pub struct MapError {
    pub path: PathBuf,
    #[source]
    pub source: IndexError,
}

/// Failure to drive the external test command
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runner {0} was not captured")]
    MissingPipe(&'static str),
    #[error("i/o error while running tests: {0}")]
    Io(#[from] std::io::Error),
}
