//! Stale object tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;

/// Chains that are no longer referenced, with the time they were first seen
/// stale. A chain becomes deletable once it has been stale for longer than
/// the grace window.
#[derive(Debug, Clone)]
pub struct StaleChains {
    grace: Duration,
    chains: BTreeMap<String, Instant>,
}

impl StaleChains {
    /// Create an empty tracker.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            chains: BTreeMap::new(),
        }
    }

    /// Record a chain as stale. An already tracked chain keeps its original
    /// timestamp.
    pub fn mark(&mut self, chain: &str, now: Instant) {
        self.chains.entry(chain.to_string()).or_insert(now);
    }

    /// Stop tracking chains that are referenced again.
    pub fn forget_active(&mut self, active: &BTreeSet<String>) {
        self.chains.retain(|name, _| !active.contains(name));
    }

    /// Remove and return chains stale for longer than the grace window.
    pub fn take_expired(&mut self, now: Instant) -> Vec<String> {
        let grace = self.grace;
        let expired: Vec<String> = self
            .chains
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) > grace)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            self.chains.remove(name);
        }
        expired
    }

    /// Returns true if the chain is waiting for deletion.
    pub fn contains(&self, chain: &str) -> bool {
        self.chains.contains_key(chain)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
