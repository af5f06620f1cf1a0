//! Scaling Decisions
//!
//! Pure threshold rules. Cooldown is applied by the controller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{Error, Result};

/// Autoscaling controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    /// CPU / memory percent above which capacity is added
    pub target_utilization: f64,
    /// Percent at or above which two instances are added at once
    pub critical_utilization: f64,
    /// Active connections one healthy instance is expected to carry
    pub connections_per_instance: u32,
    /// Minimum time between two scale actions
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub evaluation_interval: Duration,
    /// Offline -> healthy delay for new instances
    #[serde(with = "duration_ms")]
    pub startup_delay: Duration,
    /// Draining -> removed delay for retired instances
    #[serde(with = "duration_ms")]
    pub drain_delay: Duration,
    /// Decisions kept in history
    pub history_limit: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_instances: 2,
            max_instances: 10,
            target_utilization: 70.0,
            critical_utilization: 90.0,
            connections_per_instance: 100,
            cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(30),
            drain_delay: Duration::from_secs(60),
            history_limit: 100,
        }
    }
}

impl AutoscaleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(Error::Config("autoscale max_instances must be at least 1".into()));
        }
        if self.min_instances > self.max_instances {
            return Err(Error::Config(format!(
                "autoscale min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if !(self.target_utilization > 0.0
            && self.target_utilization < self.critical_utilization
            && self.critical_utilization <= 100.0)
        {
            return Err(Error::Config(
                "autoscale requires 0 < target_utilization < critical_utilization <= 100".into(),
            ));
        }
        if self.connections_per_instance == 0 || self.history_limit == 0 {
            return Err(Error::Config(
                "autoscale connections_per_instance and history_limit must be positive".into(),
            ));
        }
        if self.evaluation_interval.is_zero() {
            return Err(Error::Config("autoscale evaluation_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoAction => "no_action",
        };
        write!(f, "{s}")
    }
}

/// Cluster-wide sample the rules are evaluated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    /// Mean CPU percent over healthy instances
    pub cpu: f64,
    /// Mean memory percent over healthy instances
    pub memory: f64,
    pub active_connections: u64,
    pub healthy_instances: u32,
    /// Every instance that is not draining
    pub current_instances: u32,
    /// Requests per second since the previous sample
    pub request_rate: f64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub collected_at: DateTime<Utc>,
}

impl ScalingMetrics {
    /// Sample with only the rule inputs set
    pub fn new(cpu: f64, memory: f64, active_connections: u64, healthy: u32, current: u32) -> Self {
        Self {
            cpu,
            memory,
            active_connections,
            healthy_instances: healthy,
            current_instances: current,
            request_rate: 0.0,
            error_rate: 0.0,
            avg_response_time_ms: 0.0,
            collected_at: Utc::now(),
        }
    }

    /// The hotter of CPU and memory
    pub fn peak_utilization(&self) -> f64 {
        self.cpu.max(self.memory)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub reason: String,
    pub current_instances: u32,
    pub recommended_instances: u32,
    pub confidence: f64,
    /// A scale action was wanted but the cooldown held it back
    pub cooldown_blocked: bool,
    pub metrics: ScalingMetrics,
    pub timestamp: DateTime<Utc>,
}

impl ScalingDecision {
    fn new(action: ScalingAction, reason: String, recommended: u32, confidence: f64, metrics: &ScalingMetrics) -> Self {
        Self {
            action,
            reason,
            current_instances: metrics.current_instances,
            recommended_instances: recommended,
            confidence,
            cooldown_blocked: false,
            metrics: metrics.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Instances to add (positive) or retire (negative)
    pub fn delta(&self) -> i64 {
        self.recommended_instances as i64 - self.current_instances as i64
    }

    /// Turn a wanted action into a held one
    pub(crate) fn blocked_by_cooldown(mut self, remaining: Duration) -> Self {
        self.reason = format!(
            "{} wanted but cooldown active ({}s remaining): {}",
            self.action,
            remaining.as_secs(),
            self.reason
        );
        self.action = ScalingAction::NoAction;
        self.recommended_instances = self.current_instances;
        self.confidence = 0.5;
        self.cooldown_blocked = true;
        self
    }
}

/// Evaluate the threshold rules, ignoring cooldown.
///
/// Scale up when CPU or memory exceeds the target or connections exceed what
/// the healthy instances should carry; `critical_utilization` or more adds
/// two instances. Scale down by one when everything sits under half the
/// target and one fewer healthy instance could absorb the connections.
pub fn evaluate_rules(config: &AutoscaleConfig, metrics: &ScalingMetrics) -> ScalingDecision {
    let current = metrics.current_instances;
    let target = config.target_utilization;
    let capacity = metrics.healthy_instances as u64 * config.connections_per_instance as u64;
    let peak = metrics.peak_utilization();

    let hot = metrics.cpu > target || metrics.memory > target;
    let crowded = metrics.active_connections > capacity;

    if hot || crowded {
        if current >= config.max_instances {
            return ScalingDecision::new(
                ScalingAction::NoAction,
                format!("load above threshold but already at maximum ({})", config.max_instances),
                current,
                1.0,
                metrics,
            );
        }

        let step = if peak >= config.critical_utilization { 2 } else { 1 };
        let recommended = (current + step).min(config.max_instances);
        let reason = if hot {
            format!(
                "utilization cpu {:.1}% / memory {:.1}% above target {:.0}%",
                metrics.cpu, metrics.memory, target
            )
        } else {
            format!(
                "{} active connections exceed capacity {} of {} healthy instances",
                metrics.active_connections, capacity, metrics.healthy_instances
            )
        };
        return ScalingDecision::new(ScalingAction::ScaleUp, reason, recommended, scale_up_confidence(target, peak), metrics);
    }

    let half_target = target / 2.0;
    let reduced_capacity = metrics.healthy_instances.saturating_sub(1) as u64
        * (config.connections_per_instance as u64 / 2);
    let idle = metrics.cpu < half_target
        && metrics.memory < half_target
        && metrics.active_connections < reduced_capacity;

    if idle && current > config.min_instances {
        return ScalingDecision::new(
            ScalingAction::ScaleDown,
            format!(
                "utilization cpu {:.1}% / memory {:.1}% below {:.0}% with spare connection capacity",
                metrics.cpu, metrics.memory, half_target
            ),
            current - 1,
            0.7,
            metrics,
        );
    }

    let reason = if idle {
        format!("load low but already at minimum ({})", config.min_instances)
    } else {
        "utilization within target range".to_string()
    };
    ScalingDecision::new(ScalingAction::NoAction, reason, current, 1.0, metrics)
}

/// 0.5 at the target, 1.0 at full saturation
fn scale_up_confidence(target: f64, peak: f64) -> f64 {
    let headroom = (100.0 - target).max(f64::EPSILON);
    let overshoot = ((peak - target) / headroom).clamp(0.0, 1.0);
    (0.5 + 0.5 * overshoot).clamp(0.5, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoscaleConfig {
        AutoscaleConfig::default()
    }

    #[test]
    fn test_critical_cpu_adds_two() {
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(95.0, 40.0, 10, 2, 2));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.recommended_instances, 4);
        assert_eq!(decision.delta(), 2);
        assert!((decision.confidence - (0.5 + 0.5 * 25.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_moderate_load_adds_one() {
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(40.0, 75.0, 10, 3, 3));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.recommended_instances, 4);
    }

    #[test]
    fn test_scale_up_capped_at_max() {
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(99.0, 99.0, 0, 9, 9));
        assert_eq!(decision.recommended_instances, 10);

        let at_max = evaluate_rules(&config(), &ScalingMetrics::new(99.0, 99.0, 0, 10, 10));
        assert_eq!(at_max.action, ScalingAction::NoAction);
        assert_eq!(at_max.recommended_instances, 10);
    }

    #[test]
    fn test_connection_pressure_alone_scales_up() {
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(20.0, 20.0, 250, 2, 2));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.recommended_instances, 3);
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn test_scale_down_one_never_below_min() {
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(10.0, 10.0, 20, 4, 4));
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.recommended_instances, 3);
        assert_eq!(decision.confidence, 0.7);

        let at_min = evaluate_rules(&config(), &ScalingMetrics::new(10.0, 10.0, 0, 2, 2));
        assert_eq!(at_min.action, ScalingAction::NoAction);
    }

    #[test]
    fn test_connections_block_scale_down() {
        // 3 healthy -> (3-1) * 50 = 100 spare; 120 connections is too many
        let decision = evaluate_rules(&config(), &ScalingMetrics::new(10.0, 10.0, 120, 3, 3));
        assert_eq!(decision.action, ScalingAction::NoAction);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn test_cooldown_block_rewrites_decision() {
        let wanted = evaluate_rules(&config(), &ScalingMetrics::new(95.0, 40.0, 10, 2, 2));
        let held = wanted.blocked_by_cooldown(Duration::from_secs(120));
        assert_eq!(held.action, ScalingAction::NoAction);
        assert_eq!(held.recommended_instances, 2);
        assert_eq!(held.confidence, 0.5);
        assert!(held.cooldown_blocked);
        assert!(held.reason.contains("cooldown"));
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let inverted = AutoscaleConfig {
            target_utilization: 95.0,
            ..config()
        };
        assert!(inverted.validate().is_err());
    }
}
