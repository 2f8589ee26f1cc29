//! Pressure-adaptive worker pool.
//!
//! Units of work are spawned onto the tokio runtime but only start once the
//! gate grants a slot. The number of slots tracks a target derived from host
//! pressure: it grows by at most one per recomputation and shrinks to the
//! target at once. A shrink never interrupts a running unit; it only withholds
//! new slots until enough units have finished.
//!
//! Units that have been submitted but not yet granted a slot form the backlog.
//! Once the backlog is full, [`AdaptiveScheduler::submit`] waits for a unit to
//! start before accepting another.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{StrataError, StrataResult};
use crate::pressure::{PressureSample, PressureSampler};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency under zero pressure.
    pub base_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// How strongly pressure reduces concurrency, `0.0..=1.0`.
    pub pressure_weight: f64,
    /// Maximum submitted units waiting for a slot.
    pub backlog_bound: usize,
    /// Recompute the limit after this many completions.
    pub recompute_every_tasks: usize,
    /// Recompute the limit on this interval while a rebalancer runs.
    pub recompute_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_concurrency: 4,
            min_concurrency: 1,
            max_concurrency: 8,
            pressure_weight: 0.8,
            backlog_bound: 32,
            recompute_every_tasks: 8,
            recompute_interval_ms: 500,
        }
    }
}

impl SchedulerConfig {
    /// Fixed concurrency, for tests and constrained hosts.
    pub fn fixed(concurrency: usize) -> Self {
        Self {
            base_concurrency: concurrency,
            min_concurrency: concurrency,
            max_concurrency: concurrency,
            ..Default::default()
        }
    }
}

/// `clamp(base * (1 - weight * max_utilization), min, max)`, rounded to the
/// nearest worker. Never below one.
pub fn target_concurrency(sample: &PressureSample, config: &SchedulerConfig) -> usize {
    let min = config.min_concurrency.max(1);
    let max = config.max_concurrency.max(min);
    let factor = 1.0 - config.pressure_weight.clamp(0.0, 1.0) * sample.max_utilization();
    let raw = (config.base_concurrency as f64 * factor).round();
    let raw = if raw.is_finite() && raw > 0.0 {
        raw as usize
    } else {
        0
    };
    raw.clamp(min, max)
}

/// Grow by at most one, shrink straight to the target.
pub fn next_limit(current: usize, target: usize) -> usize {
    if target > current {
        current + 1
    } else {
        target
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub limit: usize,
    pub target: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub last_sample: PressureSample,
}

#[derive(Debug)]
struct GateState {
    limit: usize,
    target: usize,
    running: usize,
    completed: usize,
    since_recompute: usize,
    last_sample: PressureSample,
}

struct Inner {
    config: SchedulerConfig,
    sampler: PressureSampler,
    gate: Mutex<GateState>,
    slot_freed: Notify,
    backlog: Arc<Semaphore>,
    queued: AtomicUsize,
    cancel: CancellationToken,
}

impl Inner {
    fn gate(&self) -> MutexGuard<'_, GateState> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recompute(&self, gate: &mut GateState) -> bool {
        let sample = self.sampler.sample();
        let target = target_concurrency(&sample, &self.config);
        let limit = next_limit(gate.limit, target);
        let grew = limit > gate.limit;
        if limit != gate.limit {
            tracing::debug!(
                from = gate.limit,
                to = limit,
                target,
                cpu = sample.cpu_utilization,
                memory = sample.memory_utilization,
                stale = sample.stale,
                "Scheduler limit changed"
            );
        }
        gate.limit = limit;
        gate.target = target;
        gate.since_recompute = 0;
        gate.last_sample = sample;
        grew
    }

    /// Wait for a slot. `None` once the run is cancelled.
    async fn acquire_slot(self: &Arc<Self>) -> Option<SlotGuard> {
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return None;
            }
            {
                let mut gate = self.gate();
                if gate.running < gate.limit {
                    gate.running += 1;
                    return Some(SlotGuard {
                        inner: Arc::clone(self),
                    });
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }
}

struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut gate = self.inner.gate();
            gate.running = gate.running.saturating_sub(1);
            gate.completed += 1;
            gate.since_recompute += 1;
            if gate.since_recompute >= self.inner.config.recompute_every_tasks.max(1) {
                self.inner.recompute(&mut gate);
            }
        }
        self.inner.slot_freed.notify_waiters();
    }
}

/// Handle to a submitted unit of work.
///
/// Resolves to the unit's output, or to [`StrataError::Cancelled`] when the run
/// was cancelled before the unit started.
pub struct TaskHandle<T> {
    join: JoinHandle<StrataResult<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = StrataResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(StrataError::Internal(format!(
                "scheduled task failed: {}",
                e
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded, pressure-adaptive worker pool scoped to one run.
#[derive(Clone)]
pub struct AdaptiveScheduler {
    inner: Arc<Inner>,
}

impl AdaptiveScheduler {
    /// Create a scheduler. The initial limit is the target for the sampler's
    /// current reading.
    pub fn new(config: SchedulerConfig, sampler: PressureSampler, cancel: CancellationToken) -> Self {
        let sample = sampler.sample();
        let target = target_concurrency(&sample, &config);
        let backlog = Arc::new(Semaphore::new(config.backlog_bound.max(1)));
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(GateState {
                    limit: target,
                    target,
                    running: 0,
                    completed: 0,
                    since_recompute: 0,
                    last_sample: sample,
                }),
                config,
                sampler,
                slot_freed: Notify::new(),
                backlog,
                queued: AtomicUsize::new(0),
                cancel,
            }),
        }
    }

    /// Submit a unit of work.
    ///
    /// Suspends while the backlog is full. Fails with
    /// [`StrataError::Cancelled`] once the run is cancelled.
    pub async fn submit<F, T>(&self, work: F) -> StrataResult<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(StrataError::Cancelled("run cancelled".to_string()));
        }

        let permit: OwnedSemaphorePermit = tokio::select! {
            permit = Arc::clone(&self.inner.backlog).acquire_owned() => permit
                .map_err(|_| StrataError::Internal("scheduler backlog closed".to_string()))?,
            _ = self.inner.cancel.cancelled() => {
                return Err(StrataError::Cancelled("run cancelled".to_string()));
            }
        };

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move {
            let slot = inner.acquire_slot().await;
            inner.queued.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            match slot {
                Some(_slot) => Ok(work.await),
                None => Err(StrataError::Cancelled(
                    "unit skipped after cancellation".to_string(),
                )),
            }
        });

        Ok(TaskHandle { join })
    }

    /// Recompute the limit from the current pressure sample.
    pub fn rebalance(&self) -> usize {
        let (limit, grew) = {
            let mut gate = self.inner.gate();
            let grew = self.inner.recompute(&mut gate);
            (gate.limit, grew)
        };
        if grew {
            self.inner.slot_freed.notify_waiters();
        }
        limit
    }

    /// Rebalance on the configured interval until `cancel` fires.
    pub fn spawn_rebalancer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = Duration::from_millis(self.inner.config.recompute_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.rebalance();
                    }
                }
            }
        })
    }

    /// Current limit, load, and last pressure reading.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let gate = self.inner.gate();
        SchedulerSnapshot {
            limit: gate.limit,
            target: gate.target,
            running: gate.running,
            queued: self.inner.queued.load(Ordering::SeqCst),
            completed: gate.completed,
            last_sample: gate.last_sample,
        }
    }

    /// The run's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    fn sample(cpu: f64, memory: f64) -> PressureSample {
        PressureSample::new(cpu, memory)
    }

    fn config(base: usize, min: usize, max: usize) -> SchedulerConfig {
        SchedulerConfig {
            base_concurrency: base,
            min_concurrency: min,
            max_concurrency: max,
            pressure_weight: 1.0,
            backlog_bound: 4,
            recompute_every_tasks: 1,
            recompute_interval_ms: 10,
        }
    }

    #[test]
    fn test_target_concurrency_formula() {
        let cfg = config(8, 1, 8);
        assert_eq!(target_concurrency(&sample(0.0, 0.0), &cfg), 8);
        assert_eq!(target_concurrency(&sample(0.5, 0.25), &cfg), 4);
        assert_eq!(target_concurrency(&sample(0.1, 0.75), &cfg), 2);
        assert_eq!(target_concurrency(&sample(1.0, 1.0), &cfg), 1);
    }

    #[test]
    fn test_target_concurrency_respects_bounds() {
        let cfg = config(16, 2, 6);
        assert_eq!(target_concurrency(&sample(0.0, 0.0), &cfg), 6);
        assert_eq!(target_concurrency(&sample(0.95, 0.0), &cfg), 2);

        let weak = SchedulerConfig {
            pressure_weight: 0.5,
            ..config(8, 1, 8)
        };
        assert_eq!(target_concurrency(&sample(1.0, 0.0), &weak), 4);
    }

    #[test]
    fn test_next_limit_grows_by_one_and_shrinks_at_once() {
        assert_eq!(next_limit(2, 8), 3);
        assert_eq!(next_limit(8, 2), 2);
        assert_eq!(next_limit(4, 4), 4);
    }

    #[tokio::test]
    async fn test_running_units_never_exceed_limit() {
        let scheduler = AdaptiveScheduler::new(
            SchedulerConfig::fixed(2),
            PressureSampler::fixed(0.0, 0.0),
            CancellationToken::new(),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let handle = scheduler
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i * 2
                })
                .await
                .unwrap();
            handles.push(handle);
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.snapshot().completed, 10);
    }

    #[tokio::test]
    async fn test_full_backlog_suspends_submit() {
        let scheduler = AdaptiveScheduler::new(
            SchedulerConfig {
                backlog_bound: 1,
                ..SchedulerConfig::fixed(1)
            },
            PressureSampler::fixed(0.0, 0.0),
            CancellationToken::new(),
        );

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = scheduler
            .submit(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();
        // Let the first unit take the only slot.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = scheduler.submit(async {}).await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(30), scheduler.submit(async {})).await;
        assert!(third.is_err(), "submit should wait while the backlog is full");

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        let third = scheduler.submit(async {}).await.unwrap();
        third.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_run_refuses_and_skips_units() {
        let cancel = CancellationToken::new();
        let scheduler = AdaptiveScheduler::new(
            SchedulerConfig::fixed(1),
            PressureSampler::fixed(0.0, 0.0),
            cancel.clone(),
        );

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = scheduler
            .submit(async move {
                let _ = release_rx.await;
                "finished"
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let queued = scheduler
            .submit(async move {
                ran_clone.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        cancel.cancel();
        assert!(matches!(
            queued.await,
            Err(StrataError::Cancelled(_))
        ));
        assert!(!ran.load(Ordering::SeqCst));

        // The in-flight unit is allowed to finish.
        release_tx.send(()).unwrap();
        assert_eq!(blocker.await.unwrap(), "finished");

        assert!(matches!(
            scheduler.submit(async {}).await,
            Err(StrataError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_rebalance_follows_pressure() {
        let sampler = PressureSampler::fixed(0.0, 0.0);
        let scheduler =
            AdaptiveScheduler::new(config(8, 1, 8), sampler.clone(), CancellationToken::new());
        assert_eq!(scheduler.snapshot().limit, 8);

        sampler.observe(0.9, 0.1);
        assert_eq!(scheduler.rebalance(), 1);

        sampler.observe(0.0, 0.0);
        assert_eq!(scheduler.rebalance(), 2);
        assert_eq!(scheduler.rebalance(), 3);
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.target, 8);
        assert_eq!(snapshot.limit, 3);
    }

    #[tokio::test]
    async fn test_shrink_does_not_interrupt_running_units() {
        let sampler = PressureSampler::fixed(0.0, 0.0);
        let scheduler = AdaptiveScheduler::new(
            SchedulerConfig {
                recompute_every_tasks: 100,
                ..config(2, 1, 2)
            },
            sampler.clone(),
            CancellationToken::new(),
        );

        let (tx_a, rx_a) = oneshot::channel::<()>();
        let (tx_b, rx_b) = oneshot::channel::<()>();
        let a = scheduler.submit(async move { rx_a.await.is_ok() }).await.unwrap();
        let b = scheduler.submit(async move { rx_b.await.is_ok() }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.snapshot().running, 2);

        sampler.observe(1.0, 1.0);
        assert_eq!(scheduler.rebalance(), 1);
        assert_eq!(scheduler.snapshot().running, 2);

        tx_a.send(()).unwrap();
        tx_b.send(()).unwrap();
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert_eq!(scheduler.snapshot().running, 0);
    }
}
