//! Git operations module
//!
//! Provides the diff source consumed by line-level impact detection.

pub mod diff;

pub use diff::{parse_unified_diff, DiffProvider, GitDiff};
