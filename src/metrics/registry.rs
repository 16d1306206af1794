use crate::metrics::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Thread-safe counters, gauges and rolling timers
///
/// Everything lives behind one mutex. Producers hold it for a map update;
/// `snapshot` holds it only long enough to clone the maps and computes the
/// timer statistics after releasing it.
#[derive(Debug)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
    window: usize,
    started: Instant,
}

#[derive(Debug, Default, Clone)]
struct Inner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    timers: BTreeMap<String, VecDeque<Duration>>,
    errors: BTreeMap<String, u64>,
}

/// Statistics over the retained samples of one timer, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// A consistent copy of every metric at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub timers: BTreeMap<String, TimerStats>,
    pub errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Times a scope; the sample is recorded on `stop` or drop
#[derive(Debug)]
pub struct TimerGuard<'a> {
    registry: &'a MetricsRegistry,
    name: String,
    started: Instant,
    recorded: bool,
}

impl TimerGuard<'_> {
    /// Records the sample now and returns it
    pub fn stop(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.recorded {
            self.registry.record_time(&self.name, elapsed);
            self.recorded = true;
        }
        elapsed
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

impl MetricsRegistry {
    /// Creates an empty registry keeping `window` samples per timer
    pub fn new(window: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            window: window.max(1),
            started: Instant::now(),
        }
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, delta: u64) {
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_default() += delta;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    /// Adds one to `errors.<kind>` and to the total error count
    pub fn record_error(&self, kind: &str) {
        let mut inner = self.lock();
        *inner.errors.entry(kind.to_string()).or_default() += 1;
        *inner.counters.entry("errors.total".to_string()).or_default() += 1;
    }

    /// Starts timing `name`
    pub fn start_timer(&self, name: &str) -> TimerGuard<'_> {
        TimerGuard {
            registry: self,
            name: name.to_string(),
            started: Instant::now(),
            recorded: false,
        }
    }

    /// Adds a sample, evicting the oldest once the window is full
    pub fn record_time(&self, name: &str, elapsed: Duration) {
        let mut inner = self.lock();
        let samples = inner.timers.entry(name.to_string()).or_default();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// Publishes the `resource.*` gauges from a fresh process sample
    ///
    /// Leaves the gauges untouched where the platform offers no sample.
    pub fn record_resource_usage(&self) -> Option<ResourceUsage> {
        let usage = ResourceUsage::sample()?;
        self.record_usage(&usage);
        Some(usage)
    }

    fn record_usage(&self, usage: &ResourceUsage) {
        let mut inner = self.lock();
        for (name, value) in usage.gauges() {
            inner.gauges.insert(name.to_string(), value);
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.lock().gauges.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let copy = self.lock().clone();

        let timers = copy
            .timers
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| (name.clone(), timer_stats(samples)))
            .collect();

        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            counters: copy.counters,
            gauges: copy.gauges,
            timers,
            errors: copy.errors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Map updates cannot leave the registry half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

fn timer_stats(samples: &VecDeque<Duration>) -> TimerStats {
    let millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let count = millis.len();
    TimerStats {
        count,
        mean_ms: millis.iter().sum::<f64>() / count as f64,
        min_ms: millis.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: millis.iter().copied().fold(0.0, f64::max),
    }
}
