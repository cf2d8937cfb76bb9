//! Worker pool draining the work queue.
//!
//! Each worker pulls keys and runs one reconcile pass at a time. The pass
//! itself executes on a spawned task so a panic inside reconciliation
//! surfaces as a `JoinError` and is retried with backoff instead of
//! tearing down the worker. Retry delays are tracked per key and reset as
//! soon as a pass completes cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::BackoffConfig;
use crate::domain::VolumeKey;
use crate::error::{ErrorAction, Result};
use crate::metrics::Metrics;
use crate::reconcile::{Outcome, Reconciler};
use crate::scheduler::queue::WorkQueue;

// ===== Pass Driver =====

/// A single reconcile pass, abstracted so the pool can be exercised with
/// scripted passes in tests.
#[async_trait]
pub trait PassDriver: Send + Sync + 'static {
    async fn run_pass(&self, key: &VolumeKey) -> Result<Outcome>;
}

#[async_trait]
impl PassDriver for Reconciler {
    async fn run_pass(&self, key: &VolumeKey) -> Result<Outcome> {
        self.reconcile(key).await
    }
}

// ===== Worker Pool =====

/// Fixed-size pool of reconcile workers sharing one queue.
pub struct WorkerPool {
    workers: usize,
    shared: Arc<Shared>,
}

struct Shared {
    queue: Arc<WorkQueue>,
    driver: Arc<dyn PassDriver>,
    metrics: Arc<Metrics>,
    backoff: BackoffConfig,
    /// Live retry state per failing key; absent means the key is healthy.
    retries: DashMap<VolumeKey, ExponentialBackoff>,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        queue: Arc<WorkQueue>,
        driver: Arc<dyn PassDriver>,
        metrics: Arc<Metrics>,
        backoff: BackoffConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            workers,
            shared: Arc::new(Shared {
                queue,
                driver,
                metrics,
                backoff,
                retries: DashMap::new(),
                token,
            }),
        }
    }

    /// Start the workers. Each handle resolves once the pool is cancelled
    /// or the queue is closed and drained.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|index| {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(Self::worker_loop(index, shared))
            })
            .collect()
    }

    async fn worker_loop(index: usize, shared: Arc<Shared>) {
        debug!(worker = index, "reconcile worker started");
        loop {
            tokio::select! {
                _ = shared.token.cancelled() => break,
                next = shared.queue.next() => {
                    let Some(key) = next else { break };
                    Self::run_one(&shared, key).await;
                }
            }
        }
        debug!(worker = index, "reconcile worker stopped");
    }

    /// Run one pass for `key` and translate its result into a requeue
    /// decision. The key is released back to the queue before any delayed
    /// requeue is armed, so triggers that arrived mid-pass win the race.
    async fn run_one(shared: &Arc<Shared>, key: VolumeKey) {
        let started = Instant::now();
        let pass = {
            let driver = Arc::clone(&shared.driver);
            let key = key.clone();
            tokio::spawn(async move { driver.run_pass(&key).await })
        };
        let result = pass.await;
        let elapsed = started.elapsed().as_secs_f64();

        let delay = match result {
            Ok(Ok(Outcome::Done)) => {
                shared.metrics.record_pass("done", elapsed);
                shared.retries.remove(&key);
                None
            }
            Ok(Ok(Outcome::RequeueAfter(after))) => {
                shared.metrics.record_pass("requeue", elapsed);
                shared.retries.remove(&key);
                Some(after)
            }
            Ok(Err(err)) => {
                shared.metrics.record_pass("error", elapsed);
                match err.action() {
                    ErrorAction::RequeueWithBackoff => {
                        let delay = Self::next_retry_delay(shared, &key);
                        warn!(
                            %key,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "reconcile failed, backing off"
                        );
                        Some(delay)
                    }
                    ErrorAction::RequeueAfter(after) => {
                        warn!(
                            %key,
                            error = %err,
                            retry_secs = after.as_secs(),
                            "reconcile failed, fixed retry"
                        );
                        Some(after)
                    }
                    ErrorAction::NoRequeue => {
                        error!(
                            %key,
                            error = %err,
                            "reconcile failed permanently, waiting for spec change"
                        );
                        shared.retries.remove(&key);
                        None
                    }
                }
            }
            Err(join_err) => {
                shared.metrics.record_pass("panic", elapsed);
                if join_err.is_panic() {
                    error!(%key, "reconcile pass panicked, backing off");
                } else {
                    warn!(%key, "reconcile pass cancelled, backing off");
                }
                Some(Self::next_retry_delay(shared, &key))
            }
        };

        shared.queue.done(&key);
        if let Some(delay) = delay {
            Self::requeue_later(shared, key, delay);
        }
    }

    fn next_retry_delay(shared: &Shared, key: &VolumeKey) -> Duration {
        let mut state = shared
            .retries
            .entry(key.clone())
            .or_insert_with(|| new_backoff(&shared.backoff));
        state.next_backoff().unwrap_or(shared.backoff.max)
    }

    fn requeue_later(shared: &Arc<Shared>, key: VolumeKey, delay: Duration) {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.queue.enqueue(key),
            }
        });
    }
}

fn new_backoff(config: &BackoffConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial)
        .with_max_interval(config.max)
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(None)
        .build()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::timeout;

    fn key(name: &str) -> VolumeKey {
        VolumeKey::new("openebs", name)
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(40),
            multiplier: 2.0,
        }
    }

    struct Rig {
        queue: Arc<WorkQueue>,
        token: CancellationToken,
        handles: Vec<JoinHandle<()>>,
    }

    fn start(workers: usize, driver: Arc<dyn PassDriver>) -> Rig {
        let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
        let queue = Arc::new(WorkQueue::new(64, Arc::clone(&metrics)));
        let token = CancellationToken::new();
        let pool = WorkerPool::new(
            workers,
            Arc::clone(&queue),
            driver,
            metrics,
            fast_backoff(),
            token.clone(),
        );
        let handles = pool.spawn();
        Rig {
            queue,
            token,
            handles,
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Counts passes and fails the first `failures` of them.
    struct FlakyDriver {
        passes: AtomicUsize,
        failures: usize,
        error: fn() -> Error,
    }

    impl FlakyDriver {
        fn new(failures: usize, error: fn() -> Error) -> Self {
            Self {
                passes: AtomicUsize::new(0),
                failures,
                error,
            }
        }

        fn passes(&self) -> usize {
            self.passes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PassDriver for FlakyDriver {
        async fn run_pass(&self, _key: &VolumeKey) -> Result<Outcome> {
            let n = self.passes.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(Outcome::Done)
            }
        }
    }

    /// Panics exactly once, then succeeds.
    struct PanicOnceDriver {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl PassDriver for PanicOnceDriver {
        async fn run_pass(&self, _key: &VolumeKey) -> Result<Outcome> {
            if self.passes.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("scripted pass failure");
            }
            Ok(Outcome::Done)
        }
    }

    /// Blocks each pass on a semaphore and tracks concurrent entries.
    struct GatedDriver {
        started: mpsc::UnboundedSender<VolumeKey>,
        gate: Arc<Semaphore>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        passes: AtomicUsize,
    }

    #[async_trait]
    impl PassDriver for GatedDriver {
        async fn run_pass(&self, key: &VolumeKey) -> Result<Outcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.passes.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(key.clone());
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::Done)
        }
    }

    #[tokio::test]
    async fn test_retryable_error_retries_until_success() {
        let driver = Arc::new(FlakyDriver::new(2, || Error::Timeout {
            operation: "volume fetch",
        }));
        let rig = start(1, Arc::clone(&driver) as Arc<dyn PassDriver>);

        rig.queue.enqueue(key("vol"));
        wait_until("three passes", || driver.passes() == 3).await;

        rig.token.cancel();
        for handle in rig.handles {
            let _ = timeout(Duration::from_secs(1), handle).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let driver = Arc::new(FlakyDriver::new(usize::MAX, || Error::InvalidSpec {
            volume: "vol".into(),
            reason: "replication factor out of range".into(),
        }));
        let rig = start(1, Arc::clone(&driver) as Arc<dyn PassDriver>);

        rig.queue.enqueue(key("vol"));
        wait_until("first pass", || driver.passes() == 1).await;

        // Far longer than the max backoff; a retry would have landed by now.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(driver.passes(), 1);

        rig.token.cancel();
    }

    #[tokio::test]
    async fn test_panicking_pass_is_retried_and_worker_survives() {
        let driver = Arc::new(PanicOnceDriver {
            passes: AtomicUsize::new(0),
        });
        let rig = start(1, Arc::clone(&driver) as Arc<dyn PassDriver>);

        rig.queue.enqueue(key("vol"));
        wait_until("retry after panic", || {
            driver.passes.load(Ordering::SeqCst) >= 2
        })
        .await;

        // The same worker must still be able to serve other keys.
        rig.queue.enqueue(key("other"));
        wait_until("other key served", || {
            driver.passes.load(Ordering::SeqCst) >= 3
        })
        .await;

        rig.token.cancel();
    }

    #[tokio::test]
    async fn test_same_key_never_runs_concurrently() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let driver = Arc::new(GatedDriver {
            started: started_tx,
            gate: Arc::clone(&gate),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            passes: AtomicUsize::new(0),
        });
        let rig = start(4, Arc::clone(&driver) as Arc<dyn PassDriver>);

        rig.queue.enqueue(key("vol"));
        timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Triggers landing mid-pass coalesce into exactly one follow-up.
        rig.queue.enqueue(key("vol"));
        rig.queue.enqueue(key("vol"));
        rig.queue.enqueue(key("vol"));
        gate.add_permits(1);

        timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        gate.add_permits(1);

        wait_until("follow-up pass done", || {
            driver.passes.load(Ordering::SeqCst) == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(driver.passes.load(Ordering::SeqCst), 2);
        assert_eq!(driver.max_active.load(Ordering::SeqCst), 1);

        rig.token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let driver = Arc::new(FlakyDriver::new(0, || Error::Internal("unused".into())));
        let rig = start(3, driver as Arc<dyn PassDriver>);

        rig.token.cancel();
        for handle in rig.handles {
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop")
                .expect("worker task failed");
        }
    }
}
