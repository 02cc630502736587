//! File watcher for automatic test re-running
//!
//! Collects raw filesystem notifications into debounced batches of
//! source-file change events.

use anyhow::Result;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

use crate::config::{Config as AppConfig, DetectConfig};
use crate::test_model::{ChangeAction, ChangeEvent};

/// Batches change notifications under one root
pub struct ChangeWatcher {
    root: PathBuf,
    detect: DetectConfig,
    exclude: Vec<glob::Pattern>,
    debounce: Duration,
}

impl ChangeWatcher {
    pub fn new(root: &Path, config: &AppConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            detect: config.detect.clone(),
            exclude: config.exclude_patterns(),
            debounce: Duration::from_millis(config.watch.debounce_ms),
        }
    }

    /// Start watching the root recursively. The returned watcher must be
    /// kept alive for events to keep flowing.
    pub fn start(&self) -> Result<(RecommendedWatcher, UnboundedReceiver<Event>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            Config::default(),
        )?;

        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        tracing::info!(root = %self.root.display(), "watching for changes");

        Ok((watcher, rx))
    }

    /// Wait for the next non-empty batch. A batch closes once the debounce
    /// window passes without a new relevant event; ignored paths never
    /// extend it. Returns `None` when the event source is gone.
    pub async fn next_batch(&self, rx: &mut UnboundedReceiver<Event>) -> Option<Vec<ChangeEvent>> {
        let mut batch = Vec::new();
        while batch.is_empty() {
            let event = rx.recv().await?;
            self.absorb(&mut batch, &event);
        }

        let mut deadline = Instant::now() + self.debounce;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if self.absorb(&mut batch, &event) {
                            deadline = Instant::now() + self.debounce;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        tracing::debug!(events = batch.len(), "change batch ready");
        Some(batch)
    }

    /// Fold `event` into `batch`, one entry per path with the latest action.
    /// Returns whether the event carried any relevant change.
    fn absorb(&self, batch: &mut Vec<ChangeEvent>, event: &Event) -> bool {
        let changes = self.relevant_changes(event);
        let relevant = !changes.is_empty();
        for change in changes {
            match batch.iter_mut().find(|c| c.path == change.path) {
                Some(existing) => existing.action = change.action,
                None => batch.push(change),
            }
        }
        relevant
    }

    /// Source-file changes in `event` outside the excluded globs
    pub fn relevant_changes(&self, event: &Event) -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .filter(|p| self.detect.is_source_file(p) && !self.is_excluded(p))
            .filter_map(|p| action_for(&event.kind, p).map(|action| ChangeEvent::new(action, p)))
            .collect()
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        self.exclude.iter().any(|pattern| pattern.matches_path(rel))
    }
}

fn action_for(kind: &EventKind, path: &Path) -> Option<ChangeAction> {
    match kind {
        EventKind::Create(_) => Some(ChangeAction::Created),
        // Renames report both ends; whichever still exists was created
        EventKind::Modify(ModifyKind::Name(_)) => Some(if path.exists() {
            ChangeAction::Created
        } else {
            ChangeAction::Removed
        }),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) | EventKind::Any => Some(ChangeAction::Modified),
        EventKind::Remove(_) => Some(ChangeAction::Removed),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    fn watcher(root: &Path) -> ChangeWatcher {
        let mut config = AppConfig::default();
        config.watch.debounce_ms = 30;
        ChangeWatcher::new(root, &config)
    }

    fn modified(path: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.to_path_buf())
    }

    #[test]
    fn test_relevant_changes_filters_extension_and_excludes() {
        let root = Path::new("/project");
        let w = watcher(root);

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/project/app/views.py"))
            .add_path(PathBuf::from("/project/app/views.html"))
            .add_path(PathBuf::from("/project/app/__pycache__/views.py"));

        assert_eq!(
            w.relevant_changes(&event),
            vec![ChangeEvent::new(ChangeAction::Created, "/project/app/views.py")]
        );
    }

    #[test]
    fn test_access_events_are_ignored() {
        let w = watcher(Path::new("/project"));
        let event = Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/project/a.py"));
        assert!(w.relevant_changes(&event).is_empty());
    }

    #[tokio::test]
    async fn test_next_batch_coalesces_per_path() {
        let root = Path::new("/project");
        let w = watcher(root);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let a = PathBuf::from("/project/app/a.py");
        let b = PathBuf::from("/project/app/b.py");
        tx.send(modified(&a)).unwrap();
        tx.send(modified(&b)).unwrap();
        tx.send(Event::new(EventKind::Remove(RemoveKind::File)).add_path(a.clone())).unwrap();
        tx.send(modified(Path::new("/project/README.md"))).unwrap();

        let batch = w.next_batch(&mut rx).await.unwrap();
        assert_eq!(
            batch,
            vec![
                ChangeEvent::new(ChangeAction::Removed, &a),
                ChangeEvent::new(ChangeAction::Modified, &b),
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_writes_do_not_extend_debounce() {
        let w = watcher(Path::new("/project"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.send(modified(Path::new("/project/app/a.py"))).unwrap();
        let sender = tx.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if sender.send(modified(Path::new("/project/db.sqlite3"))).is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let batch = w.next_batch(&mut rx).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "batch held open for {:?}",
            started.elapsed()
        );
        assert_eq!(batch, vec![ChangeEvent::new(ChangeAction::Modified, "/project/app/a.py")]);
    }

    #[tokio::test]
    async fn test_next_batch_skips_irrelevant_bursts() {
        let w = watcher(Path::new("/project"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.send(modified(Path::new("/project/notes.txt"))).unwrap();
        let sender = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = sender.send(modified(Path::new("/project/app/c.py")));
        });

        let batch = w.next_batch(&mut rx).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, PathBuf::from("/project/app/c.py"));

        drop(tx);
        assert!(w.next_batch(&mut rx).await.is_none());
    }
}
