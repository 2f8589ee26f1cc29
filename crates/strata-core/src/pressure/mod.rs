//! Host pressure sampling.
//!
//! [`PressureSampler::sample`] never touches the OS: it returns the last
//! reading taken by [`PressureSampler::refresh`], which runs the actual read on
//! the blocking pool. A failed read keeps the previous good reading and marks
//! it stale.

mod proc;

pub use proc::{parse_meminfo_utilization, parse_proc_stat, CpuTimes, ProcPressureSource};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{StrataError, StrataResult};

/// One utilization reading, both values in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PressureSample {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    /// The reading is not current (last refresh failed, or it is too old).
    pub stale: bool,
}

impl PressureSample {
    /// Build a fresh sample, clamping both values into range.
    pub fn new(cpu_utilization: f64, memory_utilization: f64) -> Self {
        Self {
            cpu_utilization: normalize_utilization(cpu_utilization),
            memory_utilization: normalize_utilization(memory_utilization),
            stale: false,
        }
    }

    /// The larger of the two utilizations.
    pub fn max_utilization(&self) -> f64 {
        self.cpu_utilization.max(self.memory_utilization)
    }
}

/// Unclamped reading from a [`PressureSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPressure {
    pub cpu: f64,
    pub memory: f64,
}

/// A blocking, fallible OS read.
pub trait PressureSource: Send {
    fn read(&mut self) -> StrataResult<RawPressure>;

    fn name(&self) -> &str;
}

/// Fixed or scripted readings.
///
/// A scripted source plays its readings in order (`None` is a failed read)
/// and then repeats the last one.
#[derive(Debug, Clone)]
pub struct StaticPressureSource {
    script: VecDeque<Option<RawPressure>>,
    last: Option<RawPressure>,
}

impl StaticPressureSource {
    pub fn fixed(cpu: f64, memory: f64) -> Self {
        Self::scripted(vec![Some((cpu, memory))])
    }

    pub fn scripted(readings: Vec<Option<(f64, f64)>>) -> Self {
        Self {
            script: readings
                .into_iter()
                .map(|r| r.map(|(cpu, memory)| RawPressure { cpu, memory }))
                .collect(),
            last: None,
        }
    }
}

impl PressureSource for StaticPressureSource {
    fn read(&mut self) -> StrataResult<RawPressure> {
        let next = match self.script.pop_front() {
            Some(reading) => {
                if self.script.is_empty() {
                    self.script.push_back(reading);
                }
                reading
            }
            None => self.last,
        };
        self.last = next;
        next.ok_or_else(|| StrataError::Internal("scripted pressure read failure".to_string()))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Sampler timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// How often the background refresher reads the host.
    pub refresh_interval_ms: u64,
    /// Readings older than this are reported stale.
    pub stale_after_ms: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
            stale_after_ms: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct SamplerState {
    last_good: Option<(PressureSample, Instant)>,
    last_read_failed: bool,
}

/// Cached, non-blocking pressure sampler.
///
/// Cloning shares the cache and the source.
#[derive(Clone)]
pub struct PressureSampler {
    source: Arc<Mutex<Box<dyn PressureSource>>>,
    state: Arc<RwLock<SamplerState>>,
    stale_after: Duration,
}

impl std::fmt::Debug for PressureSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureSampler")
            .field("stale_after", &self.stale_after)
            .field("sample", &self.sample())
            .finish()
    }
}

impl PressureSampler {
    /// Create a sampler over `source`. Nothing is read until the first refresh.
    pub fn new(source: impl PressureSource + 'static, config: &PressureConfig) -> Self {
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            state: Arc::new(RwLock::new(SamplerState::default())),
            stale_after: Duration::from_millis(config.stale_after_ms),
        }
    }

    /// Sampler over the host's `/proc` files.
    pub fn host(config: &PressureConfig) -> Self {
        Self::new(ProcPressureSource::default(), config)
    }

    /// Sampler pinned to one reading, which never goes stale.
    pub fn fixed(cpu: f64, memory: f64) -> Self {
        let sampler = Self {
            source: Arc::new(Mutex::new(Box::new(StaticPressureSource::fixed(cpu, memory)))),
            state: Arc::new(RwLock::new(SamplerState::default())),
            stale_after: Duration::MAX,
        };
        sampler.observe(cpu, memory);
        sampler
    }

    /// The last known reading. Never blocks on the OS.
    ///
    /// Before the first successful read this is zero utilization, stale.
    pub fn sample(&self) -> PressureSample {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match state.last_good {
            Some((sample, at)) => PressureSample {
                stale: state.last_read_failed || at.elapsed() > self.stale_after,
                ..sample
            },
            None => PressureSample {
                stale: true,
                ..PressureSample::default()
            },
        }
    }

    /// Record a reading taken elsewhere.
    pub fn observe(&self, cpu: f64, memory: f64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.last_good = Some((PressureSample::new(cpu, memory), Instant::now()));
        state.last_read_failed = false;
    }

    /// Read the source on the blocking pool and update the cache.
    pub async fn refresh(&self) -> PressureSample {
        let source = Arc::clone(&self.source);
        let result = tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
            source.read()
        })
        .await
        .map_err(|e| StrataError::Internal(format!("pressure read task failed: {}", e)))
        .and_then(|r| r);

        match result {
            Ok(raw) => self.observe(raw.cpu, raw.memory),
            Err(err) => {
                tracing::warn!(error = %err, "Pressure read failed, keeping last sample");
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                state.last_read_failed = true;
            }
        }
        self.sample()
    }

    /// Keep the cache warm until `cancel` fires.
    pub fn spawn_refresher(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = sampler.refresh().await;
                        tracing::trace!(
                            cpu = sample.cpu_utilization,
                            memory = sample.memory_utilization,
                            stale = sample.stale,
                            "Pressure refreshed"
                        );
                    }
                }
            }
        })
    }
}

fn normalize_utilization(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    value.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_before_first_read_is_stale_zero() {
        let sampler = PressureSampler::new(
            StaticPressureSource::fixed(0.5, 0.5),
            &PressureConfig::default(),
        );
        let sample = sampler.sample();
        assert!(sample.stale);
        assert_eq!(sample.max_utilization(), 0.0);
    }

    #[tokio::test]
    async fn test_refresh_updates_cache() {
        let sampler = PressureSampler::new(
            StaticPressureSource::fixed(0.3, 0.6),
            &PressureConfig::default(),
        );
        let sample = sampler.refresh().await;
        assert!(!sample.stale);
        assert!((sample.cpu_utilization - 0.3).abs() < 1e-9);
        assert!((sample.max_utilization() - 0.6).abs() < 1e-9);
        assert_eq!(sampler.sample(), sample);
    }

    #[tokio::test]
    async fn test_failed_read_returns_last_good_marked_stale() {
        let sampler = PressureSampler::new(
            StaticPressureSource::scripted(vec![Some((0.4, 0.2)), None, Some((0.1, 0.1))]),
            &PressureConfig::default(),
        );
        let first = sampler.refresh().await;
        assert!(!first.stale);

        let degraded = sampler.refresh().await;
        assert!(degraded.stale);
        assert!((degraded.cpu_utilization - 0.4).abs() < 1e-9);

        let recovered = sampler.refresh().await;
        assert!(!recovered.stale);
        assert!((recovered.cpu_utilization - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_values_are_clamped() {
        let sample = PressureSample::new(1.7, f64::NAN);
        assert_eq!(sample.cpu_utilization, 1.0);
        assert_eq!(sample.memory_utilization, 0.0);
    }

    #[test]
    fn test_old_samples_go_stale() {
        let sampler = PressureSampler::new(
            StaticPressureSource::fixed(0.1, 0.1),
            &PressureConfig {
                refresh_interval_ms: 1,
                stale_after_ms: 0,
            },
        );
        sampler.observe(0.1, 0.1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(sampler.sample().stale);
    }

    #[tokio::test]
    async fn test_refresher_stops_on_cancel() {
        let sampler = PressureSampler::new(
            StaticPressureSource::fixed(0.2, 0.2),
            &PressureConfig::default(),
        );
        let cancel = CancellationToken::new();
        let handle = sampler.spawn_refresher(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(!sampler.sample().stale);
    }
}
