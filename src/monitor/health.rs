//! Health Grades and Trends

use serde::{Deserialize, Serialize};

use super::alert::SeverityCounts;

/// Overall grade from open alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl OverallHealth {
    /// Any critical -> critical, any error -> poor, 3+ warnings -> fair,
    /// 1-2 warnings -> good, otherwise excellent
    pub fn from_open_alerts(open: &SeverityCounts) -> Self {
        if open.critical > 0 {
            OverallHealth::Critical
        } else if open.error > 0 {
            OverallHealth::Poor
        } else if open.warning >= 3 {
            OverallHealth::Fair
        } else if open.warning > 0 {
            OverallHealth::Good
        } else {
            OverallHealth::Excellent
        }
    }
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverallHealth::Critical => "critical",
            OverallHealth::Poor => "poor",
            OverallHealth::Fair => "fair",
            OverallHealth::Good => "good",
            OverallHealth::Excellent => "excellent",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn from_change(relative_change: f64, tolerance: f64) -> Self {
        if relative_change > tolerance {
            Trend::Up
        } else if relative_change < -tolerance {
            Trend::Down
        } else {
            Trend::Stable
        }
    }
}

/// One component's readiness line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub component: String,
    pub ready: bool,
    pub detail: String,
}

impl ComponentCheck {
    pub fn new(component: &str, ready: bool, detail: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            ready,
            detail: detail.into(),
        }
    }
}

/// Liveness / readiness report served on `/healthz` and `/readyz`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub status: OverallHealth,
    pub checks: Vec<ComponentCheck>,
}

impl HealthReport {
    pub fn new(live: bool, status: OverallHealth, checks: Vec<ComponentCheck>) -> Self {
        let ready = live && checks.iter().all(|c| c.ready);
        Self {
            live,
            ready,
            status,
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(critical: usize, error: usize, warning: usize) -> SeverityCounts {
        SeverityCounts {
            critical,
            error,
            warning,
            info: 0,
        }
    }

    #[test]
    fn test_health_grades() {
        assert_eq!(OverallHealth::from_open_alerts(&counts(1, 5, 5)), OverallHealth::Critical);
        assert_eq!(OverallHealth::from_open_alerts(&counts(0, 1, 0)), OverallHealth::Poor);
        assert_eq!(OverallHealth::from_open_alerts(&counts(0, 0, 3)), OverallHealth::Fair);
        assert_eq!(OverallHealth::from_open_alerts(&counts(0, 0, 2)), OverallHealth::Good);
        assert_eq!(OverallHealth::from_open_alerts(&counts(0, 0, 0)), OverallHealth::Excellent);
    }

    #[test]
    fn test_trend_tolerance() {
        assert_eq!(Trend::from_change(0.06, 0.05), Trend::Up);
        assert_eq!(Trend::from_change(-0.06, 0.05), Trend::Down);
        assert_eq!(Trend::from_change(0.05, 0.05), Trend::Stable);
    }

    #[test]
    fn test_readiness_requires_every_check() {
        let report = HealthReport::new(
            true,
            OverallHealth::Good,
            vec![
                ComponentCheck::new("pools", true, "2 pools open"),
                ComponentCheck::new("balancer", false, "no healthy instance"),
            ],
        );
        assert!(report.live);
        assert!(!report.ready);
    }
}
