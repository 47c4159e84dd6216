use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    labels::MetricLabel,
    log_distribution,
    log_distribution_with_labels,
};

/// Observes its elapsed time into a plain histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        log_distribution(self.histogram, self.start.elapsed().as_secs_f64());
    }
}

/// Status timer that reports `status=error` unless `.finish()` is explicitly
/// called upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: BTreeSet<MetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(MetricLabel::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn add_label(&mut self, label: MetricLabel) {
        self.labels.insert(label);
    }

    fn replace_status(&mut self, label: MetricLabel) {
        self.labels.retain(|l| l.key != "status");
        self.labels.insert(label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success.
    pub fn finish(mut self) -> Duration {
        self.replace_status(MetricLabel::STATUS_SUCCESS);
        self.start.elapsed()
    }

    /// Finish the timer with the given status. Commonly used as
    /// `.finish_with(e.metric_status_label_value())`.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.replace_status(MetricLabel::new("status", status));
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        tracing::debug!("{elapsed:?} for timer {:?}", self.labels);
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(
            self.histogram,
            elapsed.as_secs_f64(),
            labels.into_iter().collect(),
        );
    }
}
