//! Test model definitions
//!
//! Core data structures shared by impact detection and execution: test
//! identifiers, line ranges, per-file diff snapshots, change events and
//! the outcome of a single runner invocation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Dotted qualified name of a test method, test module or app grouping
/// (e.g. `"app.tests.test_views.ViewTests.test_index"`).
pub type TestIdentifier = String;

/// Inclusive line range, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Build a range, swapping the bounds if they arrive reversed so that
    /// `start <= end` always holds.
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

/// Test identifier -> body line range for one source file
pub type SourceIndex = HashMap<TestIdentifier, LineRange>;

/// Line number -> exact diff line (marker included) for one file
pub type DiffSnapshot = BTreeMap<u32, String>;

/// What happened to a watched path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Created,
    Modified,
    Removed,
}

impl ChangeAction {
    pub fn symbol(&self) -> &'static str {
        match self {
            ChangeAction::Created => "+",
            ChangeAction::Modified => "~",
            ChangeAction::Removed => "-",
        }
    }
}

/// A single coalesced file-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    /// Absolute path of the changed file
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(action: ChangeAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
        }
    }
}

/// Kind of a reported test problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureMode {
    /// Assertion failure
    Fail,
    /// Unexpected exception
    Error,
}

impl FailureMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FAIL" => Some(FailureMode::Fail),
            "ERROR" => Some(FailureMode::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Fail => "FAIL",
            FailureMode::Error => "ERROR",
        }
    }
}

/// One failing test as reported by the runner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailureRecord {
    pub mode: FailureMode,
    pub test: TestIdentifier,
}

/// Outcome of a single runner invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub failures: Vec<FailureRecord>,
    /// Test labels the runner could not load at all
    pub disappeared: Vec<String>,
    /// Process exit code; `None` when the process died from a signal
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl RunResult {
    /// A run counts as failed on any parsed failure, any disappeared test,
    /// or a nonzero / missing exit code.
    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty() || !self.disappeared.is_empty() || self.exit_code != Some(0)
    }

    /// True when the next identifier-mode run should retry failures first
    pub fn wants_retry(&self) -> bool {
        !self.failures.is_empty() || !self.disappeared.is_empty()
    }

    pub fn count(&self, mode: FailureMode) -> usize {
        self.failures.iter().filter(|f| f.mode == mode).count()
    }

    pub fn failed_identifiers(&self) -> Vec<TestIdentifier> {
        let mut ids: Vec<TestIdentifier> = self.failures.iter().map(|f| f.test.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
