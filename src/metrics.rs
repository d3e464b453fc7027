//! Observability sink. The core publishes named, labeled readings and never
//! owns the transport.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::logging::log_metric;

pub const ENGINE_UP: &str = "entropy_engine_up";
pub const LAST_PRICE: &str = "entropy_last_price";
pub const BROKER_CASH: &str = "entropy_broker_cash";
pub const OPEN_POSITION: &str = "entropy_open_position";
pub const CAPSULES_TOTAL: &str = "entropy_capsules_total";

pub trait MetricsSink: Send + Sync {
    /// Set a gauge to `value`.
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
    /// Add `by` to a counter.
    fn incr(&self, name: &str, labels: &[(&str, &str)], by: f64);
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let mut labels: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.sort();
    (name.to_string(), labels)
}

/// Keeps the latest value of every series in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<BTreeMap<SeriesKey, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let series = self.series.lock().ok()?;
        let value = series.get(&series_key(name, labels)).copied();
        value
    }

    /// Sum of a metric across all label sets.
    pub fn total(&self, name: &str) -> f64 {
        self.series
            .lock()
            .map(|s| s.iter().filter(|((n, _), _)| n == name).map(|(_, v)| *v).sum())
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> Vec<(String, Vec<(String, String)>, f64)> {
        self.series
            .lock()
            .map(|s| s.iter().map(|((n, l), v)| (n.clone(), l.clone(), *v)).collect())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if let Ok(mut series) = self.series.lock() {
            series.insert(series_key(name, labels), value);
        }
    }

    fn incr(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        if let Ok(mut series) = self.series.lock() {
            *series.entry(series_key(name, labels)).or_insert(0.0) += by;
        }
    }
}

/// Forwards readings to the metrics log domain (`metrics.jsonl`) and keeps
/// counters so increments are logged as running totals.
#[derive(Debug, Default)]
pub struct JsonLogMetrics {
    inner: InMemoryMetrics,
}

impl JsonLogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readings(&self) -> &InMemoryMetrics {
        &self.inner
    }
}

impl MetricsSink for JsonLogMetrics {
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.inner.gauge(name, labels, value);
        log_metric(name, labels, value);
    }

    fn incr(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        self.inner.incr(name, labels, by);
        let total = self.inner.get(name, labels).unwrap_or(by);
        log_metric(name, labels, total);
    }
}
