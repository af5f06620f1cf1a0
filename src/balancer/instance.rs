//! Backend Instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::circuit::{CircuitBreaker, CircuitState};

/// Lifecycle / health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Provisioned but not yet serving
    Offline,
    Healthy,
    Unhealthy,
    /// Finishing in-flight work before removal
    Draining,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Offline => "offline",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

/// Utilization and request accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    /// Percent, 0-100
    pub cpu: f64,
    /// Percent, 0-100
    pub memory: f64,
    pub active_connections: u32,
    /// Failed over completed requests
    pub error_rate: f64,
    /// Requests routed to the instance
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
}

impl InstanceMetrics {
    /// Fold one completed request into the running figures
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.completed_requests += 1;
        if !success {
            self.failed_requests += 1;
        }
        let n = self.completed_requests as f64;
        self.avg_response_time_ms += (latency_ms - self.avg_response_time_ms) / n;
        self.error_rate = self.failed_requests as f64 / n;
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub status: InstanceStatus,
    pub metrics: InstanceMetrics,
    pub breaker: CircuitBreaker,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, breaker: CircuitBreaker) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: 1,
            status: InstanceStatus::Offline,
            metrics: InstanceMetrics::default(),
            breaker,
            created_at: Utc::now(),
            last_health_check: None,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Eligible for new work at `now` given a per-instance connection cap
    pub fn accepts_work(&self, now: Instant, connection_cap: u32) -> bool {
        self.status == InstanceStatus::Healthy
            && self.breaker.allows(now)
            && self.metrics.active_connections < connection_cap
    }

    /// cpu + memory + connection share; lower is less busy
    pub fn load_score(&self, connection_cap: u32) -> f64 {
        let conn = if connection_cap == 0 {
            0.0
        } else {
            100.0 * self.metrics.active_connections as f64 / connection_cap as f64
        };
        self.metrics.cpu + self.metrics.memory + conn
    }

    pub fn snapshot(&self, now: Instant) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            address: self.address(),
            weight: self.weight,
            status: self.status,
            circuit: self.breaker.effective_state(now),
            consecutive_failures: self.breaker.consecutive_failures(),
            metrics: self.metrics.clone(),
            created_at: self.created_at,
            last_health_check: self.last_health_check,
        }
    }
}

/// Serializable instance row for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub status: InstanceStatus,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub metrics: InstanceMetrics,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_running_averages() {
        let mut m = InstanceMetrics::default();
        m.record(true, 10.0);
        m.record(false, 30.0);
        assert_eq!(m.completed_requests, 2);
        assert!((m.avg_response_time_ms - 20.0).abs() < 1e-9);
        assert!((m.error_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_only_healthy_closed_and_under_cap_accept_work() {
        let now = Instant::now();
        let base = Instance::new("i-1", "10.0.0.1", 8080, CircuitBreaker::new(1, Duration::from_secs(5)));
        assert!(!base.accepts_work(now, 10));

        let mut healthy = base.with_status(InstanceStatus::Healthy);
        assert!(healthy.accepts_work(now, 10));

        healthy.metrics.active_connections = 10;
        assert!(!healthy.accepts_work(now, 10));
        healthy.metrics.active_connections = 0;

        healthy.breaker.record_failure(now);
        assert!(!healthy.accepts_work(now, 10));
    }
}
