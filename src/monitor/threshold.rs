//! Alert Thresholds

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metrics::category_of;
use crate::config::duration_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Operator {
    pub fn breached(&self, actual: f64, limit: f64) -> bool {
        match self {
            Operator::Gt => actual > limit,
            Operator::Gte => actual >= limit,
            Operator::Lt => actual < limit,
            Operator::Lte => actual <= limit,
            Operator::Eq => (actual - limit).abs() < f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Eq => "==",
        }
    }
}

/// Bounded repairs the monitor may trigger on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFix {
    /// Purge expired entries, compress, trim full layers
    OptimizeCache,
    /// Purge sessions, reap idle connections, drain write-back
    ReclaimResources,
    /// Drop idle subscription streams
    ReevaluateSubscriptions,
}

impl std::fmt::Display for AutoFix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AutoFix::OptimizeCache => "optimize_cache",
            AutoFix::ReclaimResources => "reclaim_resources",
            AutoFix::ReevaluateSubscriptions => "reevaluate_subscriptions",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Remediation {
    AutoFix { fix: AutoFix },
    Notification,
    Escalation,
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remediation::AutoFix { fix } => write!(f, "auto_fix:{fix}"),
            Remediation::Notification => write!(f, "notification"),
            Remediation::Escalation => write!(f, "escalation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub id: String,
    pub metric: String,
    pub operator: Operator,
    pub value: f64,
    pub severity: Severity,
    /// Repeated breaches inside one period collapse into one alert
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    /// Compare the rolling mean of this many samples instead of the latest
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default)]
    pub remediation: Vec<Remediation>,
}

impl Threshold {
    pub fn new(id: &str, metric: &str, operator: Operator, value: f64, severity: Severity) -> Self {
        Self {
            id: id.to_string(),
            metric: metric.to_string(),
            operator,
            value,
            severity,
            cooldown: Duration::from_secs(300),
            window: None,
            remediation: Vec::new(),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn remediate(mut self, action: Remediation) -> Self {
        self.remediation.push(action);
        self
    }

    pub fn category(&self) -> &str {
        category_of(&self.metric)
    }

    /// Alert identity within one cooldown period
    pub fn dedupe_key(&self, now_ms: i64) -> String {
        let period = (self.cooldown.as_millis() as i64).max(1);
        format!("{}:{}", self.id, now_ms.div_euclid(period))
    }

    pub fn describe(&self, actual: f64) -> String {
        format!(
            "{} = {:.3} ({} {})",
            self.metric,
            actual,
            self.operator.symbol(),
            self.value
        )
    }
}

/// Thresholds shipped with the default configuration
pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        Threshold::new("cache-hit-rate-low", "cache.hit_rate", Operator::Lt, 0.5, Severity::Warning)
            .with_window(3)
            .remediate(Remediation::AutoFix {
                fix: AutoFix::OptimizeCache,
            }),
        Threshold::new("cache-utilization-high", "cache.utilization", Operator::Gt, 0.9, Severity::Warning)
            .remediate(Remediation::AutoFix {
                fix: AutoFix::OptimizeCache,
            }),
        Threshold::new("pool-utilization-high", "pool.utilization", Operator::Gt, 0.9, Severity::Error)
            .with_window(3)
            .remediate(Remediation::Notification)
            .remediate(Remediation::AutoFix {
                fix: AutoFix::ReclaimResources,
            }),
        Threshold::new("pool-waiters", "pool.waiting", Operator::Gt, 10.0, Severity::Warning)
            .remediate(Remediation::Notification),
        Threshold::new("balancer-healthy-low", "balancer.healthy_ratio", Operator::Lt, 0.5, Severity::Critical)
            .with_cooldown(Duration::from_secs(60))
            .remediate(Remediation::Escalation),
        Threshold::new("balancer-error-rate", "balancer.error_rate", Operator::Gt, 0.1, Severity::Error)
            .remediate(Remediation::Notification),
        Threshold::new("autoscale-cpu-high", "autoscale.cpu", Operator::Gt, 90.0, Severity::Warning)
            .with_window(3),
        Threshold::new("subscription-backlog", "subscription.buffered", Operator::Gt, 5000.0, Severity::Warning)
            .remediate(Remediation::AutoFix {
                fix: AutoFix::ReevaluateSubscriptions,
            }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators() {
        assert!(Operator::Gt.breached(2.0, 1.0));
        assert!(!Operator::Gt.breached(1.0, 1.0));
        assert!(Operator::Gte.breached(1.0, 1.0));
        assert!(Operator::Lt.breached(0.4, 0.5));
        assert!(Operator::Lte.breached(0.5, 0.5));
        assert!(Operator::Eq.breached(3.0, 3.0));
    }

    #[test]
    fn test_dedupe_key_changes_per_period() {
        let t = Threshold::new("t", "cache.hit_rate", Operator::Lt, 0.5, Severity::Warning)
            .with_cooldown(Duration::from_secs(60));
        assert_eq!(t.dedupe_key(0), t.dedupe_key(59_999));
        assert_ne!(t.dedupe_key(59_999), t.dedupe_key(60_000));
        assert_eq!(t.dedupe_key(60_000), "t:1");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_threshold_yaml() {
        let yaml = r#"
id: waiters
metric: pool.waiting
operator: gt
value: 5
severity: error
cooldown: 60000
remediation:
  - type: auto_fix
    fix: reclaim_resources
  - type: escalation
"#;
        let t: Threshold = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(t.category(), "pool");
        assert_eq!(t.cooldown, Duration::from_secs(60));
        assert_eq!(
            t.remediation,
            vec![
                Remediation::AutoFix {
                    fix: AutoFix::ReclaimResources
                },
                Remediation::Escalation
            ]
        );
        assert_eq!(t.window, None);
    }

    #[test]
    fn test_default_thresholds_have_unique_ids() {
        let thresholds = default_thresholds();
        let mut ids: Vec<_> = thresholds.iter().map(|t| t.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), thresholds.len());
    }
}
