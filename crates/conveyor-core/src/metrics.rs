//! Metrics client seam.
//!
//! Queue behaviors emit counters, gauges, and timers through this trait.
//! [`InMemoryMetricsClient`] aggregates them for tests and diagnostics; a
//! production exporter implements the same trait.

use dashmap::DashMap;
use std::time::Duration;

/// Sink for queue metrics. Names are dotted, e.g. `queue.order.enqueued`.
pub trait MetricsClient: Send + Sync {
    fn counter(&self, name: &str, value: u64);
    fn gauge(&self, name: &str, value: f64);
    fn timer(&self, name: &str, duration: Duration);
}

/// Aggregated view of a timer series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingSummary {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// In-memory aggregating metrics client.
#[derive(Default)]
pub struct InMemoryMetricsClient {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    timings: DashMap<String, TimingSummary>,
}

impl InMemoryMetricsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never written.
    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Last written gauge value.
    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    /// Aggregated timings for a timer series.
    pub fn get_timing(&self, name: &str) -> Option<TimingSummary> {
        self.timings.get(name).map(|v| *v)
    }

    /// All counter names currently tracked.
    pub fn counter_names(&self) -> Vec<String> {
        self.counters.iter().map(|e| e.key().clone()).collect()
    }
}

impl MetricsClient for InMemoryMetricsClient {
    fn counter(&self, name: &str, value: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn timer(&self, name: &str, duration: Duration) {
        let mut entry = self
            .timings
            .entry(name.to_string())
            .or_insert_with(|| TimingSummary {
                count: 0,
                total: Duration::ZERO,
                min: Duration::MAX,
                max: Duration::ZERO,
            });
        entry.count += 1;
        entry.total += duration;
        entry.min = entry.min.min(duration);
        entry.max = entry.max.max(duration);
    }
}

/// Metrics client that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsClient;

impl MetricsClient for NullMetricsClient {
    fn counter(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn timer(&self, _name: &str, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = InMemoryMetricsClient::new();
        metrics.counter("q.order.enqueued", 1);
        metrics.counter("q.order.enqueued", 2);
        assert_eq!(metrics.get_counter("q.order.enqueued"), 3);
        assert_eq!(metrics.get_counter("q.order.dequeued"), 0);
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let metrics = InMemoryMetricsClient::new();
        metrics.gauge("q.order.count", 5.0);
        metrics.gauge("q.order.count", 2.0);
        assert_eq!(metrics.get_gauge("q.order.count"), Some(2.0));
    }

    #[test]
    fn test_timer_aggregates() {
        let metrics = InMemoryMetricsClient::new();
        metrics.timer("q.order.processtime", Duration::from_millis(10));
        metrics.timer("q.order.processtime", Duration::from_millis(30));

        let summary = metrics.get_timing("q.order.processtime").unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.total, Duration::from_millis(40));
        assert_eq!(summary.min, Duration::from_millis(10));
        assert_eq!(summary.max, Duration::from_millis(30));
    }
}
