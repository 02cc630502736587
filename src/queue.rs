//! Execution queue
//!
//! The single admission point for test runs. Producers append requests;
//! exactly one consumer (the test runner worker) takes them in order.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::test_model::TestIdentifier;

/// A pending run request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    /// Run exactly these tests, modules or apps
    Identifiers(BTreeSet<TestIdentifier>),
    /// Run whatever matches the filter patterns
    Pattern(Vec<String>),
}

#[derive(Default)]
struct Inner {
    pending: Mutex<VecDeque<PendingRequest>>,
    available: Notify,
}

/// Cloneable handle to the shared queue
#[derive(Clone, Default)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue identifiers not already waiting in the queue.
    ///
    /// Returns the identifiers actually enqueued; nothing is queued when
    /// every identifier is already pending.
    pub fn push_identifiers(&self, ids: BTreeSet<TestIdentifier>) -> BTreeSet<TestIdentifier> {
        let mut pending = self.pending();

        let fresh: BTreeSet<TestIdentifier> = ids
            .into_iter()
            .filter(|id| {
                !pending.iter().any(|req| match req {
                    PendingRequest::Identifiers(queued) => queued.contains(id),
                    PendingRequest::Pattern(_) => false,
                })
            })
            .collect();

        if !fresh.is_empty() {
            pending.push_back(PendingRequest::Identifiers(fresh.clone()));
            drop(pending);
            self.inner.available.notify_one();
        }

        fresh
    }

    pub fn push_pattern(&self, patterns: Vec<String>) {
        self.pending().push_back(PendingRequest::Pattern(patterns));
        self.inner.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<PendingRequest> {
        self.pending().pop_front()
    }

    /// Wait until a request is available and take it
    pub async fn pop(&self) -> PendingRequest {
        loop {
            let notified = self.inner.available.notified();
            if let Some(request) = self.try_pop() {
                return request;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Every identifier currently waiting, across all pending requests
    pub fn pending_identifiers(&self) -> BTreeSet<TestIdentifier> {
        self.pending()
            .iter()
            .filter_map(|req| match req {
                PendingRequest::Identifiers(ids) => Some(ids.iter().cloned()),
                PendingRequest::Pattern(_) => None,
            })
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(names: &[&str]) -> BTreeSet<TestIdentifier> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_duplicate_identifier_is_queued_once() {
        let queue = ExecutionQueue::new();
        queue.push_identifiers(ids(&["a.b"]));
        let enqueued = queue.push_identifiers(ids(&["a.b"]));

        assert!(enqueued.is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_identifiers(), ids(&["a.b"]));
    }

    #[test]
    fn test_partial_overlap_keeps_only_new_identifiers() {
        let queue = ExecutionQueue::new();
        queue.push_identifiers(ids(&["a.b"]));
        let enqueued = queue.push_identifiers(ids(&["a.b", "c.d"]));

        assert_eq!(enqueued, ids(&["c.d"]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(PendingRequest::Identifiers(ids(&["a.b"]))));
        assert_eq!(queue.try_pop(), Some(PendingRequest::Identifiers(ids(&["c.d"]))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_patterns_are_never_deduplicated() {
        let queue = ExecutionQueue::new();
        queue.push_pattern(vec!["login".to_string()]);
        queue.push_pattern(vec!["login".to_string()]);
        assert_eq!(queue.len(), 2);
        assert!(queue.pending_identifiers().is_empty());
    }

    #[test]
    fn test_popped_identifiers_can_be_requeued() {
        let queue = ExecutionQueue::new();
        queue.push_identifiers(ids(&["a.b"]));
        queue.try_pop();
        assert_eq!(queue.push_identifiers(ids(&["a.b"])), ids(&["a.b"]));
    }

    #[tokio::test]
    async fn test_pop_waits_for_producer() {
        let queue = ExecutionQueue::new();
        let producer = queue.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push_pattern(vec!["slow".to_string()]);
        });

        let request = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .expect("pop should complete once a request arrives");
        assert_eq!(request, PendingRequest::Pattern(vec!["slow".to_string()]));
        handle.await.unwrap();
    }
}
