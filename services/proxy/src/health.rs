//! Sync health publication.
//!
//! The proxier records when a sync was last requested and when one last
//! succeeded. Readers subscribe to a `watch` channel; a health endpoint (not
//! part of this crate) calls [`SyncHealthSnapshot::is_healthy`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Point-in-time sync timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncHealthSnapshot {
    /// A sync was requested and has not completed yet.
    pub last_queued: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SyncHealthSnapshot {
    /// Unhealthy when a requested sync has been outstanding longer than
    /// `timeout`.
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(queued) = self.last_queued else {
            return true;
        };
        if self.last_updated.is_some_and(|updated| updated >= queued) {
            return true;
        }
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(queued) <= timeout
    }
}

/// Writer side of the health channel.
#[derive(Debug)]
pub struct SyncHealth {
    tx: watch::Sender<SyncHealthSnapshot>,
}

impl Default for SyncHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHealth {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncHealthSnapshot::default());
        Self { tx }
    }

    /// Record that a sync was requested. An already outstanding request
    /// keeps its original time.
    pub fn queued_update(&self) {
        self.queued_update_at(Utc::now());
    }

    pub fn queued_update_at(&self, now: DateTime<Utc>) {
        self.tx.send_modify(|s| {
            let outstanding = match (s.last_queued, s.last_updated) {
                (Some(q), Some(u)) => q > u,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !outstanding {
                s.last_queued = Some(now);
            }
        });
    }

    /// Record a successful sync.
    pub fn updated(&self) {
        self.updated_at(Utc::now());
    }

    pub fn updated_at(&self, now: DateTime<Utc>) {
        self.tx.send_modify(|s| s.last_updated = Some(now));
    }

    pub fn snapshot(&self) -> SyncHealthSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncHealthSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_is_healthy() {
        let health = SyncHealth::new();
        assert!(health.snapshot().is_healthy(at(0), Duration::from_secs(1)));
    }

    #[test]
    fn test_outstanding_request_times_out() {
        let health = SyncHealth::new();
        health.queued_update_at(at(0));
        health.queued_update_at(at(5));

        let snap = health.snapshot();
        assert_eq!(snap.last_queued, Some(at(0)));
        assert!(snap.is_healthy(at(10), Duration::from_secs(30)));
        assert!(!snap.is_healthy(at(31), Duration::from_secs(30)));
    }

    #[test]
    fn test_update_clears_outstanding_request() {
        let health = SyncHealth::new();
        let mut rx = health.subscribe();

        health.queued_update_at(at(0));
        health.updated_at(at(1));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_healthy(at(100), Duration::from_secs(30)));

        health.queued_update_at(at(50));
        assert_eq!(health.snapshot().last_queued, Some(at(50)));
    }
}
