//! Registry of messages that have been read but not yet answered

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::protocol::RequestId;

/// A dispatched message still waiting for its output line
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// JSON-RPC id (`Null` for notifications and unrecoverable ids)
    pub id: RequestId,
    /// The line as read
    pub raw_payload: Bytes,
    /// When the line was read
    pub submitted_at: Instant,
}

impl PendingRequest {
    /// Time since the line was read
    #[must_use]
    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// Outstanding messages, keyed by an internal ticket since JSON-RPC ids
/// may repeat or be null
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<u64, PendingRequest>,
    next_ticket: AtomicU64,
    drained: Notify,
}

impl PendingRequests {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a message; returns its ticket
    pub fn register(&self, id: RequestId, raw_payload: Bytes) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            ticket,
            PendingRequest {
                id,
                raw_payload,
                submitted_at: Instant::now(),
            },
        );
        ticket
    }

    /// Stop tracking a message once its output has been written
    pub fn complete(&self, ticket: u64) -> Option<PendingRequest> {
        let removed = self.entries.remove(&ticket).map(|(_, request)| request);
        if self.entries.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Number of outstanding messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of the outstanding messages, oldest first
    #[must_use]
    pub fn outstanding(&self) -> Vec<(RequestId, Duration)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.age()))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }

    /// Wait until every registered message has completed
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a completion in between is not missed
            notified.as_mut().enable();
            if self.entries.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tickets_are_unique_for_repeated_ids() {
        let pending = PendingRequests::new();
        let a = pending.register(RequestId::Number(1.into()), Bytes::from_static(b"a"));
        let b = pending.register(RequestId::Number(1.into()), Bytes::from_static(b"b"));
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);

        let removed = pending.complete(a).unwrap();
        assert_eq!(removed.raw_payload, Bytes::from_static(b"a"));
        assert_eq!(pending.len(), 1);
        assert!(pending.complete(a).is_none());
    }

    #[tokio::test]
    async fn wait_drained_returns_immediately_when_empty() {
        PendingRequests::new().wait_drained().await;
    }

    #[tokio::test]
    async fn wait_drained_waits_for_last_completion() {
        let pending = Arc::new(PendingRequests::new());
        let tickets: Vec<_> = (0..3i64)
            .map(|i| pending.register(RequestId::Number(i.into()), Bytes::new()))
            .collect();

        let waiter = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move { pending.wait_drained().await })
        };

        for ticket in tickets {
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());
            pending.complete(ticket);
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn outstanding_lists_oldest_first() {
        let pending = PendingRequests::new();
        pending.register(RequestId::String("first".into()), Bytes::new());
        std::thread::sleep(Duration::from_millis(2));
        pending.register(RequestId::String("second".into()), Bytes::new());
        let ids: Vec<_> = pending.outstanding().into_iter().map(|(id, _)| id).collect();
        assert_eq!(
            ids,
            vec![
                RequestId::String("first".into()),
                RequestId::String("second".into())
            ]
        );
    }
}
