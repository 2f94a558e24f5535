//! Performance telemetry: rolling sample windows, aggregate statistics and periodic reports.

use chrono::{DateTime, Utc};
use fieldx::fxstruct;
use garde::Validate;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::observer::{ListenerHandle, Listeners};
use crate::types::MetricCategory;

#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct TelemetryConfig {
    /// Samples kept per `(category, name)`; older ones are dropped first.
    #[fieldx(default(100))]
    #[garde(range(min = 1))]
    window: usize,

    /// How often registered observers receive a report.
    #[fieldx(default(Duration::from_secs(30)))]
    #[garde(skip)]
    report_interval: Duration,

    #[fieldx(default(1000.0))]
    #[garde(range(min = 0.0))]
    api_threshold_ms: f64,

    #[fieldx(default(100.0))]
    #[garde(range(min = 0.0))]
    render_threshold_ms: f64,

    #[fieldx(default(50.0))]
    #[garde(range(min = 0.0))]
    memory_threshold: f64,
}

impl TelemetryConfig {
    fn threshold_for(&self, category: MetricCategory) -> Option<f64> {
        match category {
            MetricCategory::Api => Some(self.api_threshold_ms),
            MetricCategory::Render => Some(self.render_threshold_ms),
            MetricCategory::Memory => Some(self.memory_threshold),
            MetricCategory::Cache | MetricCategory::Realtime => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub name:      String,
    pub category:  MetricCategory,
    pub value:     f64,
    /// Clock milliseconds.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata:  Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub average:    f64,
    pub min:        f64,
    pub max:        f64,
    pub count:      usize,
    pub last_value: f64,
}

impl MetricStats {
    fn from_window(window: &VecDeque<PerformanceSample>) -> Option<Self> {
        let last_value = window.back()?.value;
        let (sum, min, max) = window
            .iter()
            .fold((0.0, f64::INFINITY, f64::NEG_INFINITY), |(sum, min, max), s| {
                (sum + s.value, min.min(s.value), max.max(s.value))
            });
        Some(Self {
            average: sum / window.len() as f64,
            min,
            max,
            count: window.len(),
            last_value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    /// Mean of every API sample currently held, across all API metric names.
    pub average_api_latency_ms: Option<f64>,
    /// `hits / (hits + misses)`; zero when nothing was looked up yet.
    pub cache_hit_rate:         f64,
    pub cache_hits:             u64,
    pub cache_misses:           u64,
    /// Most recent memory sample, whatever its name.
    pub memory_usage:           Option<f64>,
    pub active_subscriptions:   u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub metrics:      BTreeMap<MetricCategory, BTreeMap<String, MetricStats>>,
    pub summary:      ReportSummary,
}

struct TelemetryInner {
    config:       TelemetryConfig,
    clock:        Clock,
    windows:      Mutex<HashMap<(MetricCategory, String), VecDeque<PerformanceSample>>>,
    cache_hits:   AtomicU64,
    cache_misses: AtomicU64,
    connected:    AtomicU64,
    observers:    Listeners<PerformanceReport>,
    emitter:      Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TelemetryInner {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.get_mut().take() {
            emitter.abort();
        }
    }
}

/// Shared telemetry service. Clones refer to the same sample store.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: TelemetryConfig) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                config,
                clock: Clock::new(),
                windows: Mutex::new(HashMap::new()),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                connected: AtomicU64::new(0),
                observers: Listeners::new(),
                emitter: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    /// Append a sample. Values over the category threshold are logged; nothing here ever fails.
    pub fn track_metric(
        &self,
        name: &str,
        value: f64,
        category: MetricCategory,
        metadata: Option<serde_json::Value>,
    ) {
        let sample = PerformanceSample {
            name: name.to_string(),
            category,
            value,
            timestamp: self.inner.clock.now_ms(),
            metadata,
        };

        {
            let mut windows = self.inner.windows.lock();
            let window = windows.entry((category, name.to_string())).or_default();
            window.push_back(sample);
            while window.len() > self.inner.config.window {
                window.pop_front();
            }
        }

        if let Some(threshold) = self.inner.config.threshold_for(category) {
            if value > threshold {
                warn!(%category, metric = name, value, threshold, "performance threshold exceeded");
            }
        }
    }

    /// Time `fut` and record its duration in milliseconds.
    pub async fn measure<F>(&self, name: &str, category: MetricCategory, fut: F) -> F::Output
    where
        F: Future,
    {
        let started = Instant::now();
        let output = fut.await;
        self.track_metric(name, started.elapsed().as_secs_f64() * 1000.0, category, None);
        output
    }

    pub fn get_stats(&self, category: MetricCategory, name: &str) -> Option<MetricStats> {
        let windows = self.inner.windows.lock();
        windows
            .get(&(category, name.to_string()))
            .and_then(MetricStats::from_window)
    }

    /// Samples currently held for `(category, name)`, oldest first.
    pub fn samples(&self, category: MetricCategory, name: &str) -> Vec<PerformanceSample> {
        let windows = self.inner.windows.lock();
        windows
            .get(&(category, name.to_string()))
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_connected(&self) {
        self.inner.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_disconnected(&self) {
        let _ = self
            .inner
            .connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn active_subscriptions(&self) -> u64 {
        self.inner.connected.load(Ordering::Relaxed)
    }

    pub fn generate_report(&self) -> PerformanceReport {
        let mut metrics: BTreeMap<MetricCategory, BTreeMap<String, MetricStats>> = BTreeMap::new();
        let mut api_sum = 0.0;
        let mut api_count = 0usize;
        let mut memory_last: Option<&PerformanceSample> = None;

        let windows = self.inner.windows.lock();
        for ((category, name), window) in windows.iter() {
            let Some(stats) = MetricStats::from_window(window)
            else {
                continue;
            };
            metrics.entry(*category).or_default().insert(name.clone(), stats);

            match category {
                MetricCategory::Api => {
                    api_sum += stats.average * stats.count as f64;
                    api_count += stats.count;
                }
                MetricCategory::Memory => {
                    if let Some(last) = window.back() {
                        if memory_last.is_none_or(|m| last.timestamp >= m.timestamp) {
                            memory_last = Some(last);
                        }
                    }
                }
                _ => (),
            }
        }

        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let summary = ReportSummary {
            average_api_latency_ms: (api_count > 0).then(|| api_sum / api_count as f64),
            cache_hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            }
            else {
                0.0
            },
            cache_hits: hits,
            cache_misses: misses,
            memory_usage: memory_last.map(|s| s.value),
            active_subscriptions: self.active_subscriptions(),
        };
        drop(windows);

        PerformanceReport {
            generated_at: Utc::now(),
            metrics,
            summary,
        }
    }

    /// Receive a report every `report_interval`. Emission runs while at least one observer is registered.
    pub fn subscribe<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PerformanceReport) + Send + Sync + 'static,
    {
        let handle = self.inner.observers.add(callback);
        self.ensure_emitter();
        handle
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Drop all samples and counters.
    pub fn clear(&self) {
        self.inner.windows.lock().clear();
        self.inner.cache_hits.store(0, Ordering::Relaxed);
        self.inner.cache_misses.store(0, Ordering::Relaxed);
    }

    /// Stop report emission and forget every observer.
    pub fn close(&self) {
        self.inner.observers.clear();
        if let Some(emitter) = self.inner.emitter.lock().take() {
            emitter.abort();
        }
    }

    fn ensure_emitter(&self) {
        let mut emitter = self.inner.emitter.lock();
        if emitter.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current()
        else {
            warn!("no async runtime available; periodic performance reports are disabled");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        *emitter = Some(runtime.spawn(Self::emit_reports(weak, self.inner.config.report_interval)));
    }

    async fn emit_reports(weak: Weak<TelemetryInner>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let Some(inner) = weak.upgrade()
            else {
                break;
            };

            {
                let mut emitter = inner.emitter.lock();
                if inner.observers.is_empty() {
                    debug!("no report observers left, stopping emission");
                    emitter.take();
                    break;
                }
            }

            let telemetry = Telemetry { inner };
            let report = telemetry.generate_report();
            telemetry.inner.observers.emit(&report);
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::with_config(TelemetryConfig::default())
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("series", &self.inner.windows.lock().len())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}
