//! Dashboard Snapshot

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::alert::{Alert, SeverityCounts};
use super::health::{OverallHealth, Trend};
use super::metrics::MetricSample;
use crate::archive::ArchiverStats;
use crate::autoscale::AutoscaleStats;
use crate::balancer::{BalancerStats, InstanceSnapshot};
use crate::cache::CacheStats;
use crate::pool::PoolStats;
use crate::subscription::BatcherStats;

/// Component state the monitor does not own
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentSnapshot {
    pub instances: Vec<InstanceSnapshot>,
    pub pools: Vec<PoolStats>,
    pub cache: Option<CacheStats>,
    pub balancer: Option<BalancerStats>,
    pub autoscale: Option<AutoscaleStats>,
    pub subscriptions: Option<BatcherStats>,
    pub archive: Option<ArchiverStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub health: OverallHealth,
    pub open_alerts: SeverityCounts,
    pub total_alerts: usize,
    pub metrics_tracked: usize,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub trend: Trend,
    pub open_alerts: usize,
    pub latest: BTreeMap<String, f64>,
}

/// Read-only view handed to the dashboard layer
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub generated_at: DateTime<Utc>,
    pub overview: Overview,
    pub categories: Vec<CategorySummary>,
    pub top_alerts: Vec<Alert>,
    pub recent_metrics: BTreeMap<String, Vec<MetricSample>>,
    #[serde(flatten)]
    pub components: ComponentSnapshot,
}
