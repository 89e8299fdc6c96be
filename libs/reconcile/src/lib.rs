//! Reconciliation loop primitives.
//!
//! This library provides the pieces a rule-sync loop is assembled from:
//!
//! - **Scheduler**: a bounded-frequency runner that coalesces trigger
//!   signals into rate-limited, retryable passes on a dedicated worker.
//! - **Stale tracking**: bookkeeping for objects that are no longer
//!   referenced and must be deleted after a grace window.
//!
//! # Invariants
//!
//! - Passes never overlap; one worker runs them serially
//! - Triggering never blocks the caller
//! - Without triggers a pass still runs at least once per max interval

use std::time::Duration;

use thiserror::Error;

pub mod scheduler;
pub mod stale;

pub use scheduler::{SchedulerConfig, SyncHandle, SyncRunner, TokenBucket};
pub use stale::StaleChains;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Scheduler configuration is inconsistent.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}

/// Default full resync interval.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(30);

/// Default minimum spacing between passes.
pub const DEFAULT_MIN_SYNC_PERIOD: Duration = Duration::from_secs(1);

/// Default number of passes allowed back-to-back before rate limiting.
pub const DEFAULT_BURST_SYNCS: u32 = 2;

/// Default time an unreferenced chain stays flushed before deletion.
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(1);
