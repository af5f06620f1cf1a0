//! Scalability Monitor
//!
//! ```text
//!   MetricsSource ──sample──▶ MetricStore ──▶ thresholds ──▶ AlertBook
//!        │                                         │
//!        └──snapshot/readiness──▶ Dashboard        └──▶ Remediator / events
//! ```

mod alert;
mod dashboard;
mod health;
mod metrics;
mod scalability;
mod threshold;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{Error, Result};

pub use alert::{Alert, AlertBook, RemediationRecord, SeverityCounts};
pub use dashboard::{CategorySummary, ComponentSnapshot, Dashboard, Overview};
pub use health::{ComponentCheck, HealthReport, OverallHealth, Trend};
pub use metrics::{category_of, MetricSample, MetricStore};
pub use scalability::{MetricsSource, MonitorStats, Remediator, ScalabilityMonitor};
pub use threshold::{default_thresholds, AutoFix, Operator, Remediation, Severity, Threshold};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub thresholds: Vec<Threshold>,
    pub max_samples_per_metric: usize,
    pub max_alerts: usize,
    /// Alerts shown on the dashboard
    pub top_alerts: usize,
    pub trend_window: usize,
    /// Relative change below which a trend is stable
    pub trend_tolerance: f64,
    /// Samples per metric on the dashboard
    pub recent_samples: usize,
    #[serde(with = "duration_ms")]
    pub collection_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            max_samples_per_metric: 500,
            max_alerts: 1000,
            top_alerts: 10,
            trend_window: 5,
            trend_tolerance: 0.05,
            recent_samples: 20,
            collection_interval: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_samples_per_metric == 0 || self.max_alerts == 0 {
            return Err(Error::Config(
                "monitor retention bounds must be positive".to_string(),
            ));
        }
        if self.trend_window == 0 || self.trend_tolerance < 0.0 {
            return Err(Error::Config("invalid monitor trend settings".to_string()));
        }
        if self.collection_interval.is_zero() {
            return Err(Error::Config(
                "monitor collection_interval must be positive".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for threshold in &self.thresholds {
            if !ids.insert(threshold.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate threshold id '{}'",
                    threshold.id
                )));
            }
            if threshold.metric.is_empty() || !threshold.value.is_finite() {
                return Err(Error::Config(format!(
                    "threshold '{}' needs a metric and a finite value",
                    threshold.id
                )));
            }
            if threshold.window == Some(0) {
                return Err(Error::Config(format!(
                    "threshold '{}' window must be positive",
                    threshold.id
                )));
            }
        }
        Ok(())
    }
}
