//! Bounded-frequency sync scheduling.
//!
//! A [`SyncRunner`] owns the worker loop. Callers hold cloneable
//! [`SyncHandle`]s and signal intent with [`SyncHandle::run`], which returns
//! immediately. Signals arriving while a pass is pending collapse into one.
//!
//! Passes are spaced by a token bucket refilling one token per
//! `min_interval` with room for `burst` tokens. If nothing triggers a pass
//! for `max_interval`, one runs anyway.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info};

use crate::ReconcileError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name used in logs.
    pub name: String,

    /// Minimum spacing between passes once the burst is spent.
    pub min_interval: Duration,

    /// Maximum time between passes.
    pub max_interval: Duration,

    /// Passes allowed back-to-back.
    pub burst: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "sync-runner".to_string(),
            min_interval: crate::DEFAULT_MIN_SYNC_PERIOD,
            max_interval: crate::DEFAULT_SYNC_PERIOD,
            burst: crate::DEFAULT_BURST_SYNCS,
        }
    }
}

impl SchedulerConfig {
    /// Check that the intervals and burst are usable.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.max_interval.is_zero() {
            return Err(ReconcileError::InvalidConfig(
                "max interval must be positive".to_string(),
            ));
        }
        if self.min_interval > self.max_interval {
            return Err(ReconcileError::InvalidConfig(format!(
                "min interval {:?} exceeds max interval {:?}",
                self.min_interval, self.max_interval
            )));
        }
        if self.burst == 0 {
            return Err(ReconcileError::InvalidConfig(
                "burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Token bucket
// ============================================================================

/// Token bucket rate limiter.
///
/// A zero refill interval disables limiting.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_every: Duration,
    last: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, gaining one per `refill_every`.
    pub fn new(refill_every: Duration, capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_every,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.refill_every.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last);
        self.tokens = (self.tokens + elapsed.as_secs_f64() / self.refill_every.as_secs_f64())
            .min(self.capacity);
        self.last = now;
    }

    /// Take a token if one is available.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if self.refill_every.is_zero() {
            return true;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until a token becomes available.
    pub fn time_to_next(&mut self, now: Instant) -> Duration {
        if self.refill_every.is_zero() {
            return Duration::ZERO;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        self.refill_every.mul_f64(1.0 - self.tokens)
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Cloneable trigger side of a [`SyncRunner`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    run_tx: mpsc::Sender<()>,
    retry_tx: mpsc::UnboundedSender<Duration>,
}

impl SyncHandle {
    /// Request a pass as soon as the rate limit allows. Never blocks.
    pub fn run(&self) {
        // A full channel already holds a pending request.
        let _ = self.run_tx.try_send(());
    }

    /// Request a pass no later than `delay` from now. An earlier scheduled
    /// pass is left alone.
    pub fn retry_after(&self, delay: Duration) {
        let _ = self.retry_tx.send(delay);
    }
}

/// The worker side of the scheduler.
#[derive(Debug)]
pub struct SyncRunner {
    config: SchedulerConfig,
    limiter: TokenBucket,
    run_rx: mpsc::Receiver<()>,
    retry_rx: mpsc::UnboundedReceiver<Duration>,
}

impl SyncRunner {
    /// Create a runner and its trigger handle.
    pub fn new(config: SchedulerConfig) -> Result<(Self, SyncHandle), ReconcileError> {
        config.validate()?;

        let (run_tx, run_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let limiter = TokenBucket::new(config.min_interval, config.burst, Instant::now());

        Ok((
            Self {
                config,
                limiter,
                run_rx,
                retry_rx,
            },
            SyncHandle { run_tx, retry_tx },
        ))
    }

    /// Run passes until shutdown is signalled.
    ///
    /// `pass` is awaited to completion before the next signal is looked at.
    pub async fn run<F, Fut>(mut self, mut pass: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            name = %self.config.name,
            min_interval = ?self.config.min_interval,
            max_interval = ?self.config.max_interval,
            burst = self.config.burst,
            "Starting sync runner"
        );

        let timer = tokio::time::sleep(self.config.max_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(name = %self.config.name, "Sync runner shutting down");
                        break;
                    }
                }
                _ = &mut timer => {
                    self.try_run(&mut pass, timer.as_mut()).await;
                }
                Some(()) = self.run_rx.recv() => {
                    self.try_run(&mut pass, timer.as_mut()).await;
                }
                Some(delay) = self.retry_rx.recv() => {
                    let at = Instant::now() + delay;
                    if at < timer.deadline() {
                        debug!(name = %self.config.name, delay = ?delay, "Retry scheduled");
                        timer.as_mut().reset(at);
                    }
                }
            }
        }
    }

    async fn try_run<F, Fut>(&mut self, pass: &mut F, mut timer: Pin<&mut Sleep>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let now = Instant::now();
        if self.limiter.try_accept(now) {
            pass().await;
            timer.as_mut().reset(Instant::now() + self.config.max_interval);
            return;
        }

        // Rate limited: make sure a pass happens as soon as a token is back.
        let next_possible = now + self.limiter.time_to_next(now);
        if timer.is_elapsed() || next_possible < timer.deadline() {
            debug!(
                name = %self.config.name,
                wait = ?(next_possible - now),
                "Sync rate limited"
            );
            timer.as_mut().reset(next_possible);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn spawn_runner(
        config: SchedulerConfig,
    ) -> (
        SyncHandle,
        Arc<Mutex<Vec<Instant>>>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let (runner, handle) = SyncRunner::new(config).unwrap();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let recorded = Arc::clone(&runs);
        let task = tokio::spawn(runner.run(
            move || {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                }
            },
            shutdown_rx,
        ));

        (handle, runs, shutdown_tx, task)
    }

    fn config(min_ms: u64, max_ms: u64, burst: u32) -> SchedulerConfig {
        SchedulerConfig {
            name: "test".to_string(),
            min_interval: Duration::from_millis(min_ms),
            max_interval: Duration::from_millis(max_ms),
            burst,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(config(2000, 1000, 2).validate().is_err());
        assert!(config(0, 0, 2).validate().is_err());
        assert!(config(0, 1000, 0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(Duration::from_secs(1), 2, start);

        assert!(bucket.try_accept(start));
        assert!(bucket.try_accept(start));
        assert!(!bucket.try_accept(start));
        assert_eq!(bucket.time_to_next(start), Duration::from_secs(1));

        let later = start + Duration::from_millis(500);
        assert!(!bucket.try_accept(later));
        assert_eq!(bucket.time_to_next(later), Duration::from_millis(500));

        assert!(bucket.try_accept(start + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_bucket() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Duration::ZERO, 1, now);
        for _ in 0..100 {
            assert!(bucket.try_accept(now));
        }
        assert_eq!(bucket.time_to_next(now), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_coalesce() {
        let (handle, runs, shutdown, task) = spawn_runner(config(1000, 60_000, 2));

        for _ in 0..10 {
            handle.run();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(runs.lock().unwrap().len(), 1);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_min_interval() {
        let start = Instant::now();
        let (handle, runs, shutdown, task) = spawn_runner(config(1000, 60_000, 2));

        for _ in 0..3 {
            handle.run();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Two passes back-to-back, the third waits for a token.
        assert_eq!(runs.lock().unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let runs = runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 3);
        assert!(runs[2] - start >= Duration::from_millis(990));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_interval_forces_pass() {
        let (_handle, runs, shutdown, task) = spawn_runner(config(1000, 30_000, 2));

        tokio::time::sleep(Duration::from_millis(29_000)).await;
        assert_eq!(runs.lock().unwrap().len(), 0);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(runs.lock().unwrap().len(), 1);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_brings_pass_forward() {
        let start = Instant::now();
        let (handle, runs, shutdown, task) = spawn_runner(config(1000, 60_000, 2));

        handle.retry_after(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let runs = runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 1);
        assert!(runs[0] - start >= Duration::from_secs(5));
        assert!(runs[0] - start < Duration::from_secs(6));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_never_delays_scheduled_pass() {
        let (handle, runs, shutdown, task) = spawn_runner(config(1000, 10_000, 2));

        handle.retry_after(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        assert_eq!(runs.lock().unwrap().len(), 1);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_stops_when_shutdown_dropped() {
        let (_handle, _runs, shutdown, task) = spawn_runner(config(1000, 60_000, 2));
        drop(shutdown);
        task.await.unwrap();
    }
}
