//! Autoscaling Controller
//!
//! Collect, evaluate, record, execute. Owns the write side of the instance
//! lifecycle: new instances go offline -> healthy after the startup delay,
//! retired ones go healthy -> draining -> removed after the drain delay.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::decision::{evaluate_rules, AutoscaleConfig, ScalingAction, ScalingDecision, ScalingMetrics};
use crate::balancer::{InstanceRegistry, InstanceStatus};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, InstanceProvisioner};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct ControllerState {
    history: VecDeque<ScalingDecision>,
    last_action_at: Option<Instant>,
    /// (taken at, cumulative requests) of the previous sample
    last_sample: Option<(Instant, u64)>,
    cycles: u64,
    scale_ups: u64,
    scale_downs: u64,
    failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoscaleStats {
    pub enabled: bool,
    pub current_instances: usize,
    pub healthy_instances: usize,
    pub offline_instances: usize,
    pub draining_instances: usize,
    pub min_instances: u32,
    pub max_instances: u32,
    pub cycles: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub failures: u64,
    pub cooldown_remaining_ms: u64,
    pub last_decision: Option<ScalingDecision>,
}

pub struct AutoscaleController {
    config: AutoscaleConfig,
    registry: Arc<InstanceRegistry>,
    provisioner: Arc<dyn InstanceProvisioner>,
    events: Option<Arc<dyn EventPublisher>>,
    state: Mutex<ControllerState>,
    /// Draining instance id -> removal deadline
    draining: Arc<Mutex<HashMap<String, Instant>>>,
    token: CancellationToken,
}

impl AutoscaleController {
    pub fn new(
        config: AutoscaleConfig,
        registry: Arc<InstanceRegistry>,
        provisioner: Arc<dyn InstanceProvisioner>,
    ) -> Self {
        Self {
            config,
            registry,
            provisioner,
            events: None,
            state: Mutex::new(ControllerState::default()),
            draining: Arc::new(Mutex::new(HashMap::new())),
            token: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Lifecycle timers stop when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Sample the registry
    pub fn collect(&self) -> ScalingMetrics {
        let now = Instant::now();
        let instances = self.registry.list();

        let mut metrics = ScalingMetrics::new(0.0, 0.0, 0, 0, 0);
        let (mut cpu, mut memory) = (0.0, 0.0);
        let (mut completed, mut failed, mut total) = (0u64, 0u64, 0u64);
        let mut weighted_latency = 0.0;

        for instance in &instances {
            let m = &instance.metrics;
            if instance.status == InstanceStatus::Healthy {
                metrics.healthy_instances += 1;
                cpu += m.cpu;
                memory += m.memory;
            }
            if instance.status != InstanceStatus::Draining {
                metrics.current_instances += 1;
            }
            if instance.status != InstanceStatus::Offline {
                metrics.active_connections += m.active_connections as u64;
            }
            completed += m.completed_requests;
            failed += m.failed_requests;
            total += m.total_requests;
            weighted_latency += m.avg_response_time_ms * m.completed_requests as f64;
        }

        if metrics.healthy_instances > 0 {
            metrics.cpu = cpu / metrics.healthy_instances as f64;
            metrics.memory = memory / metrics.healthy_instances as f64;
        }
        if completed > 0 {
            metrics.error_rate = failed as f64 / completed as f64;
            metrics.avg_response_time_ms = weighted_latency / completed as f64;
        }

        let mut state = self.state.lock();
        if let Some((at, previous)) = state.last_sample {
            let elapsed = now.saturating_duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                metrics.request_rate = total.saturating_sub(previous) as f64 / elapsed;
            }
        }
        state.last_sample = Some((now, total));
        metrics
    }

    /// Threshold rules plus the global cooldown
    pub fn evaluate(&self, metrics: &ScalingMetrics) -> ScalingDecision {
        let decision = evaluate_rules(&self.config, metrics);
        if decision.action == ScalingAction::NoAction {
            return decision;
        }
        match self.cooldown_remaining() {
            Some(remaining) => decision.blocked_by_cooldown(remaining),
            None => decision,
        }
    }

    /// One full collect / evaluate / record / execute pass.
    ///
    /// A failed scale step is returned as `ScalingActionFailure` and does not
    /// arm the cooldown, so the next cycle retries it.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<ScalingDecision> {
        self.retry_overdue_drains().await;

        let metrics = self.collect();
        let decision = self.evaluate(&metrics);
        self.record(&decision).await;

        if decision.action == ScalingAction::NoAction {
            debug!(reason = %decision.reason, "no scaling action");
            return Ok(decision);
        }

        match self.execute(&decision).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.last_action_at = Some(Instant::now());
                match decision.action {
                    ScalingAction::ScaleUp => state.scale_ups += 1,
                    ScalingAction::ScaleDown => state.scale_downs += 1,
                    ScalingAction::NoAction => {}
                }
                drop(state);
                info!(
                    action = %decision.action,
                    from = decision.current_instances,
                    to = decision.recommended_instances,
                    confidence = decision.confidence,
                    "scaling action executed"
                );
                Ok(decision)
            }
            Err(e) => {
                self.state.lock().failures += 1;
                error!(action = %decision.action, error = %e, "scaling action failed");
                self.publish(DomainEvent::ScalingActionFailed {
                    action: decision.action.to_string(),
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
                Err(match e {
                    Error::ScalingActionFailure(_) => e,
                    other => Error::ScalingActionFailure(other.to_string()),
                })
            }
        }
    }

    /// Recorded decisions, newest first
    pub fn history(&self, limit: usize) -> Vec<ScalingDecision> {
        self.state.lock().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> AutoscaleStats {
        let instances = self.registry.list();
        let count = |s: InstanceStatus| instances.iter().filter(|i| i.status == s).count();
        let cooldown_remaining_ms = self
            .cooldown_remaining()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let state = self.state.lock();
        AutoscaleStats {
            enabled: self.config.enabled,
            current_instances: instances.len() - count(InstanceStatus::Draining),
            healthy_instances: count(InstanceStatus::Healthy),
            offline_instances: count(InstanceStatus::Offline),
            draining_instances: count(InstanceStatus::Draining),
            min_instances: self.config.min_instances,
            max_instances: self.config.max_instances,
            cycles: state.cycles,
            scale_ups: state.scale_ups,
            scale_downs: state.scale_downs,
            failures: state.failures,
            cooldown_remaining_ms,
            last_decision: state.history.back().cloned(),
        }
    }

    /// Stop pending lifecycle timers
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let last = self.state.lock().last_action_at?;
        let elapsed = Instant::now().saturating_duration_since(last);
        (elapsed < self.config.cooldown).then(|| self.config.cooldown - elapsed)
    }

    async fn record(&self, decision: &ScalingDecision) {
        {
            let mut state = self.state.lock();
            state.cycles += 1;
            state.history.push_back(decision.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
        }
        self.publish(DomainEvent::ScalingDecisionMade {
            action: decision.action.to_string(),
            current_instances: decision.current_instances,
            recommended_instances: decision.recommended_instances,
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            timestamp: decision.timestamp,
        })
        .await;
    }

    async fn execute(&self, decision: &ScalingDecision) -> Result<()> {
        let delta = decision.delta();
        if delta > 0 {
            for _ in 0..delta {
                let id = self.provisioner.launch(&self.registry).await?;
                info!(instance = %id, "instance launched");
                self.schedule_startup(id);
            }
        } else {
            for _ in 0..delta.unsigned_abs() {
                let id = self.begin_drain()?;
                self.publish(DomainEvent::InstanceStatusChanged {
                    instance_id: id.clone(),
                    from: InstanceStatus::Healthy.to_string(),
                    to: InstanceStatus::Draining.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
                self.schedule_drain(id);
            }
        }
        Ok(())
    }

    /// Mark the least busy healthy instance draining
    fn begin_drain(&self) -> Result<String> {
        let cap = self.config.connections_per_instance;
        self.registry
            .with_all(|instances| {
                let victim = instances
                    .values_mut()
                    .filter(|i| i.status == InstanceStatus::Healthy)
                    .min_by(|a, b| a.load_score(cap).total_cmp(&b.load_score(cap)))?;
                victim.status = InstanceStatus::Draining;
                Some(victim.id.clone())
            })
            .ok_or_else(|| Error::ScalingActionFailure("no healthy instance to drain".into()))
    }

    fn schedule_startup(&self, id: String) {
        let registry = self.registry.clone();
        let events = self.events.clone();
        let token = self.token.clone();
        let delay = self.config.startup_delay;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let started = registry
                        .update(&id, |i| {
                            let offline = i.status == InstanceStatus::Offline;
                            if offline {
                                i.status = InstanceStatus::Healthy;
                            }
                            offline
                        })
                        .unwrap_or(false);
                    if started {
                        info!(instance = %id, "instance started");
                        publish_to(&events, DomainEvent::InstanceStatusChanged {
                            instance_id: id,
                            from: InstanceStatus::Offline.to_string(),
                            to: InstanceStatus::Healthy.to_string(),
                            timestamp: Utc::now(),
                        })
                        .await;
                    }
                }
            }
        });
    }

    fn schedule_drain(&self, id: String) {
        let deadline = Instant::now() + self.config.drain_delay;
        self.draining.lock().insert(id.clone(), deadline);

        let registry = self.registry.clone();
        let provisioner = self.provisioner.clone();
        let draining = self.draining.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    terminate(&registry, provisioner.as_ref(), &draining, &id).await;
                }
            }
        });
    }

    /// Retry terminations whose timer fired but failed
    async fn retry_overdue_drains(&self) {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .draining
            .lock()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in overdue {
            terminate(&self.registry, self.provisioner.as_ref(), &self.draining, &id).await;
        }
    }

    async fn publish(&self, event: DomainEvent) {
        publish_to(&self.events, event).await;
    }
}

async fn terminate(
    registry: &InstanceRegistry,
    provisioner: &dyn InstanceProvisioner,
    draining: &Mutex<HashMap<String, Instant>>,
    id: &str,
) {
    match provisioner.terminate(registry, id).await {
        Ok(()) | Err(Error::InstanceNotFound(_)) => {
            draining.lock().remove(id);
            info!(instance = id, "drained instance removed");
        }
        Err(e) => warn!(instance = id, error = %e, "instance termination failed, will retry"),
    }
}

async fn publish_to(events: &Option<Arc<dyn EventPublisher>>, event: DomainEvent) {
    if let Some(events) = events {
        if let Err(e) = events.publish(event).await {
            debug!(error = %e, "failed to publish scaling event");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::simulated::SimulatedProvisioner;

    struct Fixture {
        controller: AutoscaleController,
        registry: Arc<InstanceRegistry>,
        provisioner: Arc<SimulatedProvisioner>,
        events: Arc<InMemoryEventCollector>,
    }

    fn fixture(config: AutoscaleConfig, healthy: usize) -> Fixture {
        let registry = Arc::new(InstanceRegistry::new(5, Duration::from_secs(30)));
        for _ in 0..healthy {
            registry.provision(InstanceStatus::Healthy);
        }
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let controller = AutoscaleController::new(config, registry.clone(), provisioner.clone())
            .with_events(events.clone());
        Fixture {
            controller,
            registry,
            provisioner,
            events,
        }
    }

    fn set_cpu(registry: &InstanceRegistry, cpu: f64) {
        registry.with_all(|instances| {
            for i in instances.values_mut() {
                i.metrics.cpu = cpu;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_cluster_scales_up_and_instances_start() {
        let f = fixture(AutoscaleConfig::default(), 2);
        set_cpu(&f.registry, 95.0);

        let decision = f.controller.run_cycle().await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.current_instances, 2);
        assert_eq!(decision.recommended_instances, 4);
        assert_eq!(f.registry.len(), 4);
        assert_eq!(f.registry.count(InstanceStatus::Offline), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.registry.count(InstanceStatus::Healthy), 4);
        assert_eq!(f.events.events_of_type("ScalingDecisionMade").len(), 1);
        assert_eq!(f.events.events_of_type("InstanceStatusChanged").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_until_window_passes() {
        let f = fixture(AutoscaleConfig::default(), 2);
        set_cpu(&f.registry, 95.0);
        f.controller.run_cycle().await.unwrap();

        let held = f.controller.run_cycle().await.unwrap();
        assert_eq!(held.action, ScalingAction::NoAction);
        assert!(held.cooldown_blocked);
        assert!(f.controller.stats().cooldown_remaining_ms > 0);

        tokio::time::sleep(Duration::from_secs(301)).await;
        set_cpu(&f.registry, 95.0);
        let again = f.controller.run_cycle().await.unwrap();
        assert_eq!(again.action, ScalingAction::ScaleUp);
        assert_eq!(again.recommended_instances, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scale_up_is_retried_next_cycle() {
        let f = fixture(AutoscaleConfig::default(), 2);
        set_cpu(&f.registry, 80.0);
        f.provisioner.set_fail_launch(true);

        let failed = f.controller.run_cycle().await;
        assert_matches!(failed, Err(Error::ScalingActionFailure(_)));
        assert_eq!(f.controller.stats().failures, 1);
        assert_eq!(f.controller.stats().cooldown_remaining_ms, 0);
        assert_eq!(f.events.events_of_type("ScalingActionFailed").len(), 1);

        f.provisioner.set_fail_launch(false);
        let retried = f.controller.run_cycle().await.unwrap();
        assert_eq!(retried.action, ScalingAction::ScaleUp);
        assert_eq!(f.registry.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_drains_least_busy_then_removes() {
        let f = fixture(AutoscaleConfig::default(), 4);
        set_cpu(&f.registry, 10.0);
        f.registry
            .update("instance-003", |i| i.metrics.cpu = 5.0)
            .unwrap();

        let decision = f.controller.run_cycle().await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.recommended_instances, 3);
        assert_eq!(
            f.registry.get("instance-003").unwrap().status,
            InstanceStatus::Draining
        );
        assert_eq!(f.controller.stats().current_instances, 3);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!f.registry.contains("instance-003"));
        assert_eq!(f.provisioner.terminated(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_termination_retried_by_next_cycle() {
        let f = fixture(AutoscaleConfig::default(), 3);
        set_cpu(&f.registry, 10.0);
        f.provisioner.set_fail_terminate(true);
        f.controller.run_cycle().await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.registry.count(InstanceStatus::Draining), 1);

        f.provisioner.set_fail_terminate(false);
        f.controller.run_cycle().await.unwrap();
        assert_eq!(f.registry.count(InstanceStatus::Draining), 0);
        assert_eq!(f.registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded_and_newest_first() {
        let config = AutoscaleConfig {
            history_limit: 3,
            ..Default::default()
        };
        let f = fixture(config, 2);
        set_cpu(&f.registry, 50.0);
        for _ in 0..5 {
            f.controller.run_cycle().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let history = f.controller.history(10);
        assert_eq!(history.len(), 3);
        assert!(history[0].timestamp >= history[2].timestamp);
        assert!(history.iter().all(|d| d.action == ScalingAction::NoAction));
        assert_eq!(f.controller.stats().cycles, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_rate_from_consecutive_samples() {
        let f = fixture(AutoscaleConfig::default(), 2);
        f.controller.collect();
        f.registry
            .update("instance-001", |i| i.metrics.total_requests = 100)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let metrics = f.controller.collect();
        assert!((metrics.request_rate - 10.0).abs() < 1e-9);
        assert_eq!(metrics.healthy_instances, 2);
        assert_eq!(metrics.current_instances, 2);
    }
}
