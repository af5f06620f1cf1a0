//! Bounded Metric Store
//!
//! Metric names are dotted; the first segment is the category
//! (`cache.hit_rate` -> `cache`).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::health::Trend;

/// Category of a dotted metric name
pub fn category_of(metric: &str) -> &str {
    metric.split('.').next().unwrap_or(metric)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-metric ring buffers
#[derive(Debug)]
pub struct MetricStore {
    max_samples: usize,
    series: RwLock<BTreeMap<String, VecDeque<MetricSample>>>,
}

impl MetricStore {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            series: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, metric: &str, value: f64) {
        self.record_at(metric, value, Utc::now());
    }

    pub fn record_at(&self, metric: &str, value: f64, timestamp: DateTime<Utc>) {
        let mut series = self.series.write();
        let samples = series.entry(metric.to_string()).or_default();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(MetricSample { value, timestamp });
    }

    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.series.read().get(metric)?.back().map(|s| s.value)
    }

    /// Mean of the newest `window` samples (fewer if not yet recorded)
    pub fn rolling_mean(&self, metric: &str, window: usize) -> Option<f64> {
        let series = self.series.read();
        let samples = series.get(metric)?;
        let take = window.max(1).min(samples.len());
        if take == 0 {
            return None;
        }
        let sum: f64 = samples.iter().rev().take(take).map(|s| s.value).sum();
        Some(sum / take as f64)
    }

    /// Newest `limit` samples, oldest first
    pub fn recent(&self, metric: &str, limit: usize) -> Vec<MetricSample> {
        let series = self.series.read();
        let Some(samples) = series.get(metric) else {
            return Vec::new();
        };
        let skip = samples.len().saturating_sub(limit);
        samples.iter().skip(skip).copied().collect()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.series.read().keys().cloned().collect()
    }

    pub fn categories(&self) -> BTreeSet<String> {
        self.series
            .read()
            .keys()
            .map(|k| category_of(k).to_string())
            .collect()
    }

    /// Latest value of every metric in `category`
    pub fn latest_in(&self, category: &str) -> BTreeMap<String, f64> {
        self.series
            .read()
            .iter()
            .filter(|(name, _)| category_of(name) == category)
            .filter_map(|(name, samples)| samples.back().map(|s| (name.clone(), s.value)))
            .collect()
    }

    /// Relative change between the newest `window` samples and the `window`
    /// before them; `None` until both windows have data
    pub fn relative_change(&self, metric: &str, window: usize) -> Option<f64> {
        let series = self.series.read();
        let samples = series.get(metric)?;
        let window = window.max(1);
        if samples.len() < 2 {
            return None;
        }

        let recent_len = window.min(samples.len() / 2).max(1);
        let prior_len = window.min(samples.len() - recent_len);
        let recent = mean_of(samples.iter().rev(), recent_len);
        let prior = mean_of(samples.iter().rev().skip(recent_len), prior_len);

        if prior.abs() < f64::EPSILON {
            return Some(if recent.abs() < f64::EPSILON {
                0.0
            } else {
                recent.signum()
            });
        }
        Some((recent - prior) / prior.abs())
    }

    /// Trend of a category: mean relative change across its metrics
    pub fn category_trend(&self, category: &str, window: usize, tolerance: f64) -> Trend {
        let names: Vec<String> = self
            .metric_names()
            .into_iter()
            .filter(|n| category_of(n) == category)
            .collect();
        let changes: Vec<f64> = names
            .iter()
            .filter_map(|n| self.relative_change(n, window))
            .collect();
        if changes.is_empty() {
            return Trend::Stable;
        }
        Trend::from_change(changes.iter().sum::<f64>() / changes.len() as f64, tolerance)
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.series.read().values().map(VecDeque::len).sum()
    }
}

fn mean_of<'a>(samples: impl Iterator<Item = &'a MetricSample>, n: usize) -> f64 {
    samples.take(n).map(|s| s.value).sum::<f64>() / n as f64
}
