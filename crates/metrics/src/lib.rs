//! Thin wrapper over `prometheus` used by every crate in the workspace.
//!
//! Metrics are declared with the `register_sync_*` macros, which register
//! against the process-global [`SYNC_METRICS_REGISTRY`] and store the handle
//! in a `LazyLock` static. The reported metric name is the lower_snake_case
//! version of the declared static's name.

use std::{
    collections::HashMap,
    sync::LazyLock,
};

use prometheus::{
    Gauge,
    GaugeVec,
    Histogram,
    HistogramOpts,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    Opts,
    Registry,
};

mod labels;
mod macros;
mod timer;

pub use paste::paste;
pub use prometheus;

pub use crate::{
    labels::{
        MetricLabel,
        STATUS_LABEL,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};

/// The single registry all workspace metrics register against. Exposed for
/// the `/metrics` endpoint's text encoder.
pub static SYNC_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub fn register_histogram(name: &str, help: &str) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help))
        .expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("Metric registration failed");
    histogram
}

pub fn register_histogram_vec(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help), labels)
        .expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("Metric registration failed");
    histogram
}

pub fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .expect("Metric registration failed");
    counter
}

pub fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .expect("Metric registration failed");
    counter
}

pub fn register_gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::with_opts(Opts::new(name, help)).expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("Metric registration failed");
    gauge
}

pub fn register_gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let gauge = GaugeVec::new(Opts::new(name, help), labels).expect("Metric initialization failed");
    SYNC_METRICS_REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("Metric registration failed");
    gauge
}

pub fn log_counter(counter: &'static IntCounter, increment: u64) {
    counter.inc_by(increment);
}

pub fn log_counter_with_labels(
    counter: &'static IntCounterVec,
    increment: u64,
    labels: Vec<MetricLabel>,
) {
    let by_name: HashMap<&str, &str> = labels.iter().map(|l| l.as_pair()).collect();
    match counter.get_metric_with(&by_name) {
        Ok(c) => c.inc_by(increment),
        Err(e) => tracing::error!("Failed to log counter: {e}"),
    }
}

pub fn log_distribution(histogram: &'static Histogram, value: f64) {
    histogram.observe(value);
}

pub fn log_distribution_with_labels(
    histogram: &'static HistogramVec,
    value: f64,
    labels: Vec<MetricLabel>,
) {
    let by_name: HashMap<&str, &str> = labels.iter().map(|l| l.as_pair()).collect();
    match histogram.get_metric_with(&by_name) {
        Ok(h) => h.observe(value),
        Err(e) => tracing::error!("Failed to log distribution: {e}"),
    }
}

pub fn log_gauge(gauge: &'static Gauge, value: f64) {
    gauge.set(value);
}

pub fn log_gauge_delta(gauge: &'static Gauge, delta: f64) {
    gauge.add(delta);
}

#[cfg(test)]
mod tests {
    use crate::{
        log_counter_with_labels,
        log_distribution_with_labels,
        register_sync_counter,
        register_sync_histogram,
        MetricLabel,
        StatusTimer,
        STATUS_LABEL,
    };

    register_sync_counter!(TEST_EVENTS_TOTAL, "Test events", &["kind"]);
    register_sync_histogram!(TEST_LATENCY_SECONDS, "Test latency", &STATUS_LABEL);

    #[test]
    fn test_counter_labels() {
        log_counter_with_labels(&TEST_EVENTS_TOTAL, 2, vec![MetricLabel::new("kind", "a")]);
        log_counter_with_labels(&TEST_EVENTS_TOTAL, 1, vec![MetricLabel::new("kind", "a")]);
        assert_eq!(TEST_EVENTS_TOTAL.with_label_values(&["a"]).get(), 3);
    }

    #[test]
    fn test_status_timer_finish_marks_success() {
        let timer = StatusTimer::new(&TEST_LATENCY_SECONDS);
        timer.finish();
        let success = TEST_LATENCY_SECONDS.with_label_values(&["success"]);
        assert_eq!(success.get_sample_count(), 1);
    }

    #[test]
    fn test_status_timer_drop_marks_error() {
        {
            let _timer = StatusTimer::new(&TEST_LATENCY_SECONDS);
        }
        let error = TEST_LATENCY_SECONDS.with_label_values(&["error"]);
        assert_eq!(error.get_sample_count(), 1);
    }

    #[test]
    fn test_distribution_labels() {
        log_distribution_with_labels(
            &TEST_LATENCY_SECONDS,
            0.25,
            vec![MetricLabel::new("status", "canceled")],
        );
        let canceled = TEST_LATENCY_SECONDS.with_label_values(&["canceled"]);
        assert_eq!(canceled.get_sample_count(), 1);
    }
}
