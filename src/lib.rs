//! testwatch - incremental test re-runner
//!
//! A library for watching a Python source tree and re-running only the
//! tests a change touches:
//! - Per-file test indexing with tree-sitter
//! - Line-level impact detection from working-tree diffs
//! - Coarse module/app fallback targets
//! - A single serialized execution queue with retry-first failure handling

pub mod affected;
pub mod config;
pub mod errors;
pub mod git;
pub mod indexer;
pub mod mapper;
pub mod orchestrator;
pub mod queue;
pub mod test_model;
pub mod test_runner;
pub mod watcher;

pub use config::Config;
pub use orchestrator::Orchestrator;
pub use queue::{ExecutionQueue, PendingRequest};
pub use test_model::{ChangeAction, ChangeEvent, FailureMode, FailureRecord, RunResult};
pub use test_runner::TestRunnerWorker;
