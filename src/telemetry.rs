//! In-process metrics for the set-aside process.
//!
//! Every name is stored under the registry's namespace, so `requests.write` in a registry
//! named `flexpar.sap` is reported as `flexpar.sap.requests.write`.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("histogram {0} was never registered")]
    UnknownHistogram(String),
}

#[derive(Debug)]
pub struct MetricsRegistry {
    prefix: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
    histograms: BTreeMap<String, HistogramSnapshot>,
}

/// Power-of-two bucket bounds; the last bucket also absorbs anything larger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
}

/// Point-in-time copy of a registry, suitable for JSON output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl MetricsRegistry {
    pub fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("{}.", namespace.trim_end_matches('.')),
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
            histograms: BTreeMap::new(),
        }
    }

    /// Adds `delta` to a counter, creating it at zero, and returns the new total.
    pub fn inc_counter(&mut self, name: impl AsRef<str>, delta: u64) -> u64 {
        let key = self.full_name(name.as_ref());
        let total = self.counters.entry(key).or_default();
        *total = total.saturating_add(delta);
        *total
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(&self.full_name(name))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.full_name(name);
        self.gauges.insert(key, value);
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(&self.full_name(name)).copied()
    }

    /// Registers a histogram whose buckets cover `1..=max_value`. Re-registering is a no-op.
    pub fn register_histogram(&mut self, name: &str, max_value: u64) {
        let key = self.full_name(name);
        self.histograms
            .entry(key)
            .or_insert_with(|| HistogramSnapshot::with_max(max_value));
    }

    pub fn observe_histogram(&mut self, name: &str, value: u64) -> Result<(), TelemetryError> {
        let key = self.full_name(name);
        match self.histograms.get_mut(&key) {
            Some(histogram) => {
                histogram.record(value);
                Ok(())
            }
            None => Err(TelemetryError::UnknownHistogram(key)),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            histograms: self.histograms.clone(),
        }
    }

    fn full_name(&self, name: &str) -> String {
        if name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }
}

impl HistogramSnapshot {
    fn with_max(max_value: u64) -> Self {
        let top = max_value.max(1);
        let mut buckets: Vec<u64> = std::iter::successors(Some(1u64), |bound| bound.checked_mul(2))
            .take_while(|bound| *bound < top)
            .collect();
        buckets.push(top);
        Self {
            counts: vec![0; buckets.len()],
            buckets,
        }
    }

    fn record(&mut self, value: u64) {
        let slot = self
            .buckets
            .partition_point(|bound| *bound < value)
            .min(self.counts.len() - 1);
        self.counts[slot] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}
