//! In-memory store for per-query server metrics. This data structure is
//! optimized for many sparse series with coarse retention: one series per
//! `(metric, series key)`, where the series key is a query's transformation
//! hash. Queries sharing a transformation share a series, so their reported
//! sample sets are identical by construction.
//!
//! Two well-known metrics are maintained: the time to materialize a query's
//! initial result set and the time to push an update batch through its
//! pipeline. Each series keeps an HDR histogram at millisecond resolution
//! plus a bounded ring of raw samples for the inspector's digest output.

use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    time::Duration,
};

use anyhow::Context;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// Histogram bounds: 1ms to 15 minutes at millisecond resolution.
const MIN_DURATION_MS: u64 = 1;
const MAX_DURATION_MS: u64 = 15 * 60 * 1000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Raw samples retained per series for the inspector.
const MAX_RAW_SAMPLES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryMetric {
    /// Time to hydrate a query's initial result set.
    MaterializationServer,
    /// Time to push one advancement batch through a query's pipeline.
    UpdateServer,
}

impl QueryMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMetric::MaterializationServer => "query-materialization-server",
            QueryMetric::UpdateServer => "query-update-server",
        }
    }
}

struct Series {
    histogram: Histogram<u64>,
    raw_samples: VecDeque<u64>,
}

impl Series {
    fn new() -> anyhow::Result<Self> {
        let histogram = Histogram::new_with_bounds(MIN_DURATION_MS, MAX_DURATION_MS, SIGNIFICANT_FIGURES)
            .context("Invalid histogram bounds")?;
        Ok(Self {
            histogram,
            raw_samples: VecDeque::new(),
        })
    }

    fn record(&mut self, sample_ms: u64) {
        let clamped = sample_ms.clamp(MIN_DURATION_MS, MAX_DURATION_MS);
        self.histogram.saturating_record(clamped);
        if self.raw_samples.len() == MAX_RAW_SAMPLES {
            self.raw_samples.pop_front();
        }
        self.raw_samples.push_back(sample_ms);
    }
}

/// A point-in-time summary of a series, serialized into inspector responses.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDigest {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    /// The raw sample ring, oldest first.
    pub samples_ms: Vec<u64>,
}

impl MetricDigest {
    fn empty() -> Self {
        Self {
            count: 0,
            min_ms: 0,
            max_ms: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            samples_ms: vec![],
        }
    }

    fn from_series(series: &Series) -> Self {
        let h = &series.histogram;
        if h.is_empty() {
            return Self {
                samples_ms: series.raw_samples.iter().copied().collect(),
                ..Self::empty()
            };
        }
        Self {
            count: h.len(),
            min_ms: h.min(),
            max_ms: h.max(),
            p50_ms: h.value_at_quantile(0.5),
            p95_ms: h.value_at_quantile(0.95),
            p99_ms: h.value_at_quantile(0.99),
            samples_ms: series.raw_samples.iter().copied().collect(),
        }
    }
}

struct Inner {
    series: BTreeMap<(QueryMetric, String), Series>,
}

/// Process-global style store, though each view syncer owns its own instance
/// so teardown follows the coordinator's lifetime.
pub struct QueryMetricStore {
    inner: Mutex<Inner>,
}

impl QueryMetricStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                series: BTreeMap::new(),
            }),
        }
    }

    pub fn record(&self, metric: QueryMetric, series_key: &str, duration: Duration) {
        let mut inner = self.inner.lock();
        let key = (metric, series_key.to_owned());
        if !inner.series.contains_key(&key) {
            let Ok(series) = Series::new() else {
                return;
            };
            inner.series.insert(key.clone(), series);
        }
        if let Some(series) = inner.series.get_mut(&key) {
            series.record(duration.as_millis() as u64);
        }
    }

    /// Digest for one series, or an empty digest if nothing was recorded.
    pub fn series_digest(&self, metric: QueryMetric, series_key: &str) -> MetricDigest {
        let inner = self.inner.lock();
        inner
            .series
            .get(&(metric, series_key.to_owned()))
            .map(MetricDigest::from_series)
            .unwrap_or_else(MetricDigest::empty)
    }

    /// Digest merged across every series of the given metric.
    pub fn global_digest(&self, metric: QueryMetric) -> anyhow::Result<MetricDigest> {
        let inner = self.inner.lock();
        let mut merged = Series::new()?;
        for ((m, _), series) in inner.series.iter() {
            if *m != metric {
                continue;
            }
            merged
                .histogram
                .add(&series.histogram)
                .context("Histogram merge failed")?;
            for sample in series.raw_samples.iter() {
                if merged.raw_samples.len() == MAX_RAW_SAMPLES {
                    merged.raw_samples.pop_front();
                }
                merged.raw_samples.push_back(*sample);
            }
        }
        Ok(MetricDigest::from_series(&merged))
    }

    /// Drop every series attributed to the given key. Called when a query's
    /// pipeline is torn down.
    pub fn remove_series(&self, series_key: &str) {
        let mut inner = self.inner.lock();
        inner.series.retain(|(_, key), _| key != series_key);
    }

    pub fn num_series(&self) -> usize {
        self.inner.lock().series.len()
    }
}

impl Default for QueryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}
