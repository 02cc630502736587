//! Change orchestration
//!
//! Turns one coalesced batch of file-change events into at most one queue
//! entry: a pinned filter pattern, or the merged set of test identifiers
//! touched by the batch.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::affected::{fallback_target, is_test_file};
use crate::config::DetectConfig;
use crate::git::DiffProvider;
use crate::mapper::map_file;
use crate::queue::ExecutionQueue;
use crate::test_model::{ChangeAction, ChangeEvent, DiffSnapshot, TestIdentifier};

pub struct Orchestrator<D: DiffProvider> {
    root: PathBuf,
    detect: DetectConfig,
    diff: D,
    queue: ExecutionQueue,
    /// Pinned for the process lifetime; disables identifier detection
    patterns: Vec<String>,
    /// Last diff snapshot seen per root-relative path, in memory only
    previous: HashMap<String, DiffSnapshot>,
}

impl<D: DiffProvider> Orchestrator<D> {
    pub fn new(root: &Path, detect: DetectConfig, diff: D, queue: ExecutionQueue) -> Self {
        Self {
            root: root.to_path_buf(),
            detect,
            diff,
            queue,
            patterns: Vec::new(),
            previous: HashMap::new(),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn pattern_mode(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Handle one batch, enqueueing whatever it calls for
    pub fn handle_batch(&mut self, batch: &[ChangeEvent]) {
        let relevant: Vec<&ChangeEvent> = batch
            .iter()
            .filter(|e| self.detect.is_source_file(&e.path))
            .collect();

        if relevant.is_empty() {
            return;
        }

        println!(
            "\n{} {} {}",
            "↻".yellow(),
            "Files changed:".bold(),
            relevant
                .iter()
                .map(|e| format!("{}{}", e.action.symbol(), self.display_path(&e.path)))
                .collect::<Vec<_>>()
                .join(", ")
                .dimmed()
        );

        if self.pattern_mode() {
            self.queue.push_pattern(self.patterns.clone());
            return;
        }

        let targets = self.resolve_batch(batch);
        if targets.is_empty() {
            println!("{}", "No affected tests found".dimmed());
            return;
        }

        let enqueued = self.queue.push_identifiers(targets);
        if enqueued.is_empty() {
            tracing::debug!("all targets already pending");
        } else {
            tracing::info!(targets = enqueued.len(), "queued test run");
        }
    }

    /// Targets for every source file in `batch`: fine-grained test methods
    /// for test files where the diff maps onto them, coarse fallbacks
    /// everywhere else.
    pub fn resolve_batch(&mut self, batch: &[ChangeEvent]) -> BTreeSet<TestIdentifier> {
        let mut targets = BTreeSet::new();

        let needs_diff = batch
            .iter()
            .any(|e| self.wants_fine_grained(e));
        let snapshots = if needs_diff {
            match self.diff.snapshots() {
                Ok(snapshots) => Some(snapshots),
                Err(e) => {
                    tracing::warn!(error = %e, "diff unavailable, using coarse targets");
                    None
                }
            }
        } else {
            None
        };

        for event in batch {
            if !self.detect.is_source_file(&event.path) {
                continue;
            }

            let fine = match &snapshots {
                Some(snapshots) if self.wants_fine_grained(event) => self.map_event(event, snapshots),
                _ => BTreeSet::new(),
            };

            if !fine.is_empty() {
                targets.extend(fine);
                continue;
            }

            match fallback_target(&self.root, &event.path, &self.detect) {
                Some(target) => {
                    tracing::debug!(path = %event.path.display(), %target, "coarse target");
                    targets.insert(target);
                }
                None => {
                    tracing::debug!(path = %event.path.display(), "no target for path");
                }
            }
        }

        targets
    }

    fn wants_fine_grained(&self, event: &ChangeEvent) -> bool {
        event.action != ChangeAction::Removed
            && self.detect.is_source_file(&event.path)
            && is_test_file(&event.path, &self.detect)
    }

    /// Map one test file's diff onto its test methods, remembering the
    /// current snapshot for the next check.
    fn map_event(
        &mut self,
        event: &ChangeEvent,
        snapshots: &HashMap<String, DiffSnapshot>,
    ) -> BTreeSet<TestIdentifier> {
        let key = self.display_path(&event.path);
        let current = snapshots.get(&key).cloned().unwrap_or_default();
        let previous = self.previous.remove(&key).unwrap_or_default();

        let result = map_file(&self.root, &event.path, &previous, &current, &self.detect);

        if !current.is_empty() {
            self.previous.insert(key, current);
        }

        match result {
            Ok(tests) => tests,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to module target");
                BTreeSet::new()
            }
        }
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
