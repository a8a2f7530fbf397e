//! Metrics sink
//!
//! Narrow seam between the profiler and whatever metrics backend is
//! configured. The default sink drops everything; the Prometheus sink
//! forwards to the global `metrics` recorder installed at startup.

use metrics::Label;

/// Counter: slow queries recorded, labeled by collection and operation.
pub const SLOW_QUERIES_RECORDED: &str = "profiler_slow_queries_recorded_total";
/// Counter: explain commands issued, labeled by outcome.
pub const EXPLAINS_TOTAL: &str = "profiler_explains_total";
/// Counter: recommendations produced, labeled by severity.
pub const RECOMMENDATIONS_TOTAL: &str = "profiler_recommendations_total";
/// Histogram: recorded slow-query execution time in milliseconds.
pub const SLOW_QUERY_DURATION_MS: &str = "profiler_slow_query_duration_ms";
/// Gauge: current number of records in the ring buffer.
pub const BUFFER_SIZE: &str = "profiler_buffer_size";

/// Destination for profiler telemetry. Emission is always best-effort;
/// implementations must not fail or block the caller.
pub trait MetricsSink: Send + Sync {
    fn counter_inc(&self, name: &'static str, labels: &[(&'static str, String)]);
    fn histogram_observe(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]);
    fn gauge_set(&self, name: &'static str, value: f64);
}

/// Discards all telemetry. Used when metrics are disabled.
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn counter_inc(&self, _name: &'static str, _labels: &[(&'static str, String)]) {}
    fn histogram_observe(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, String)]) {}
    fn gauge_set(&self, _name: &'static str, _value: f64) {}
}

/// Forwards to the global `metrics` recorder. Pair with the Prometheus
/// exporter installed in `main`.
pub struct PrometheusSink;

fn to_labels(labels: &[(&'static str, String)]) -> Vec<Label> {
    labels.iter().map(|(key, value)| Label::new(*key, value.clone())).collect()
}

impl MetricsSink for PrometheusSink {
    fn counter_inc(&self, name: &'static str, labels: &[(&'static str, String)]) {
        metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn histogram_observe(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        metrics::histogram!(name, to_labels(labels)).record(value);
    }

    fn gauge_set(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoopSink;
        sink.counter_inc(SLOW_QUERIES_RECORDED, &[("collection", "users".to_string())]);
        sink.histogram_observe(SLOW_QUERY_DURATION_MS, 120.0, &[]);
        sink.gauge_set(BUFFER_SIZE, 3.0);
    }

    #[test]
    fn test_label_conversion() {
        let labels = to_labels(&[("a", "1".to_string()), ("b", "2".to_string())]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].key(), "a");
        assert_eq!(labels[0].value(), "1");
    }
}
