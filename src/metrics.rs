//! Built-in [`MetricsSink`] implementations.
//!
//! The core never depends on a concrete metrics backend — Prometheus
//! exposition lives in the external CLI layer — so this module only
//! supplies the nil-safe default and a `tracing`-backed sink useful for
//! local runs and tests where wiring a real collector is overkill.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::external::MetricsSink;

/// The default sink: every call is a no-op. Handed in when the embedding
/// application has no metrics collector wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn observe_histogram(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}

/// Emits every metric as a `trace`-level log line. Useful for local runs
/// and integration tests that want to assert on emitted metrics without a
/// Prometheus registry.
#[derive(Default)]
pub struct TracingMetrics {
    counters: Mutex<Vec<(&'static str, String)>>,
    observations: AtomicU64,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of histogram observations recorded, for tests that
    /// want to assert activity without parsing log lines.
    pub fn observation_count(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    fn format_labels(labels: &[(&'static str, &str)]) -> String {
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl MetricsSink for TracingMetrics {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let rendered = Self::format_labels(labels);
        trace!(counter = name, labels = %rendered, "metric");
        self.counters.lock().push((name, rendered));
    }

    fn observe_histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        let rendered = Self::format_labels(labels);
        trace!(histogram = name, labels = %rendered, value, "metric");
        self.observations.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_any_call_without_panicking() {
        let sink = NoopMetrics;
        sink.incr_counter("x", &[("a", "b")]);
        sink.observe_histogram("y", &[], 1.0);
    }

    #[test]
    fn tracing_sink_counts_observations() {
        let sink = TracingMetrics::new();
        sink.observe_histogram("dial_duration_ms", &[("path", "direct")], 12.0);
        sink.observe_histogram("dial_duration_ms", &[("path", "relayed")], 34.0);
        assert_eq!(sink.observation_count(), 2);
    }
}
