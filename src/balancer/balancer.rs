//! Load Balancer
//!
//! Selection is synchronous and lock-scoped; probing, event publishing and
//! caller operations happen outside every registry lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::algorithm::{self, Algorithm};
use super::circuit::{CircuitState, Transition};
use super::instance::{Instance, InstanceSnapshot, InstanceStatus};
use super::registry::InstanceRegistry;
use super::session::{SessionStats, SessionStore};
use crate::config::duration_ms;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, InstanceProbe, ProbeResult};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: Algorithm,
    /// Consecutive failures that open a breaker
    pub failure_threshold: u32,
    /// Time since the last failure before an open breaker half-opens
    #[serde(with = "duration_ms")]
    pub breaker_cooldown: Duration,
    /// Instances at this many active connections are skipped
    pub max_connections_per_instance: u32,
    pub session_affinity: bool,
    #[serde(with = "duration_ms")]
    pub session_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub session_purge_interval: Duration,
    /// A probe that does not answer in time counts as unhealthy
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            max_connections_per_instance: 100,
            session_affinity: true,
            session_ttl: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(10),
            session_purge_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("balancer failure_threshold must be at least 1".into()));
        }
        if self.max_connections_per_instance == 0 {
            return Err(Error::Config(
                "balancer max_connections_per_instance must be at least 1".into(),
            ));
        }
        if self.session_affinity && self.session_ttl.is_zero() {
            return Err(Error::Config("balancer session_ttl must be positive".into()));
        }
        if self.health_check_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::Config(
                "balancer health_check_interval and probe_timeout must be positive".into(),
            ));
        }
        if self.session_purge_interval.is_zero() {
            return Err(Error::Config("balancer session_purge_interval must be positive".into()));
        }
        Ok(())
    }

    /// Empty registry whose instances carry breakers with these settings
    pub fn new_registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(self.failure_threshold, self.breaker_cooldown)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Outcome of one probe sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSweep {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Instances whose status flipped
    pub changed: usize,
    /// Breakers moved from open to half-open
    pub half_opened: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancerStats {
    pub algorithm: Algorithm,
    pub instances: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub offline: usize,
    pub draining: usize,
    pub circuits_closed: usize,
    pub circuits_open: usize,
    pub circuits_half_open: usize,
    pub active_connections: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    /// Failed over completed, across all instances
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    /// Calls refused because the breaker was open
    pub rejected_requests: u64,
    pub sessions: SessionStats,
}

impl BalancerStats {
    /// Healthy instances over registered (0 when empty)
    pub fn healthy_ratio(&self) -> f64 {
        if self.instances == 0 {
            0.0
        } else {
            self.healthy as f64 / self.instances as f64
        }
    }
}

// =============================================================================
// In-Flight Calls
// =============================================================================

/// Admitted call whose result is not recorded yet. Dropping it armed
/// (the caller gave up on the call) gives back the active connection
/// without touching the breaker.
struct InFlight<'a> {
    registry: &'a InstanceRegistry,
    instance_id: &'a str,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let released = self.registry.update(self.instance_id, |i| {
            i.metrics.active_connections = i.metrics.active_connections.saturating_sub(1);
        });
        debug!(instance = self.instance_id, recorded = released.is_ok(), "call abandoned in flight");
    }
}

// =============================================================================
// Load Balancer
// =============================================================================

/// Routes work to registry instances
pub struct LoadBalancer {
    config: BalancerConfig,
    registry: Arc<InstanceRegistry>,
    sessions: SessionStore,
    probe: Arc<dyn InstanceProbe>,
    events: Option<Arc<dyn EventPublisher>>,
    rng: Mutex<StdRng>,
    rejected: AtomicU64,
}

impl LoadBalancer {
    pub fn new(
        config: BalancerConfig,
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn InstanceProbe>,
    ) -> Self {
        let sessions = SessionStore::new(config.session_ttl);
        Self {
            config,
            registry,
            sessions,
            probe,
            events: None,
            rng: Mutex::new(StdRng::from_entropy()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Publish breaker and status transitions to `events`
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Pick an instance for one unit of work.
    ///
    /// A live session whose instance is still eligible wins; otherwise the
    /// configured algorithm chooses among eligible instances and, with
    /// affinity on, the client is bound to the result.
    pub fn select_instance(&self, client: Option<&str>) -> Result<String> {
        let now = Instant::now();
        let cap = self.config.max_connections_per_instance;
        let affinity = self.config.session_affinity;

        if let (true, Some(client)) = (affinity, client) {
            if let Some(session) = self.sessions.get(client, now) {
                let reused = self
                    .registry
                    .update(&session.instance_id, |i| {
                        let eligible = i.accepts_work(now, cap);
                        if eligible {
                            i.metrics.total_requests += 1;
                        }
                        eligible
                    })
                    .unwrap_or(false);
                if reused {
                    self.sessions.touch(client, now);
                    debug!(client, instance = %session.instance_id, "session affinity hit");
                    return Ok(session.instance_id);
                }
            }
        }

        let picked = self.registry.with_all(|instances| {
            let id = {
                let candidates: Vec<&Instance> = instances
                    .values()
                    .filter(|i| i.accepts_work(now, cap))
                    .collect();
                let mut rng = self.rng.lock();
                algorithm::select(self.config.algorithm, &candidates, client, &mut *rng)?
                    .id
                    .clone()
            };
            if let Some(instance) = instances.get_mut(&id) {
                instance.metrics.total_requests += 1;
            }
            Some(id)
        });

        let id = picked.ok_or(Error::NoHealthyInstance)?;
        if let (true, Some(client)) = (affinity, client) {
            self.sessions.bind(client, &id, now);
        }
        Ok(id)
    }

    /// Run `op` against one specific instance.
    ///
    /// An open breaker rejects with `CircuitOpen` and `op` is never invoked.
    pub async fn call<F, Fut, T>(&self, instance_id: &str, op: F) -> Result<T>
    where
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let now = Instant::now();
        let admitted = self.registry.update(instance_id, |i| {
            if !i.breaker.allows(now) {
                return None;
            }
            i.metrics.active_connections += 1;
            Some(i.clone())
        })?;

        let Some(instance) = admitted else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(instance = instance_id, "rejected by open circuit");
            return Err(Error::CircuitOpen {
                instance_id: instance_id.to_string(),
            });
        };

        let mut in_flight = InFlight {
            registry: &self.registry,
            instance_id,
            armed: true,
        };
        let started = Instant::now();
        let result = op(instance).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        in_flight.armed = false;
        if let Err(e) = self.record_result(instance_id, result.is_ok(), latency_ms).await {
            // Removed by a scale-down while the call was in flight
            debug!(instance = instance_id, error = %e, "result not recorded");
        }
        result
    }

    /// Select an instance for `client` and run `op` against it
    pub async fn route<F, Fut, T>(&self, client: Option<&str>, op: F) -> Result<T>
    where
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = self.select_instance(client)?;
        self.call(&id, op).await
    }

    /// Close out one request: breaker, active connections and latency.
    pub async fn record_result(&self, instance_id: &str, success: bool, latency_ms: f64) -> Result<()> {
        let now = Instant::now();
        let transition = self.registry.update(instance_id, |i| {
            i.metrics.active_connections = i.metrics.active_connections.saturating_sub(1);
            i.metrics.record(success, latency_ms);
            if success {
                i.breaker.record_success(now)
            } else {
                i.breaker.record_failure(now)
            }
        })?;

        if let Some(t) = transition {
            self.circuit_changed(instance_id, t).await;
        }
        Ok(())
    }

    /// Probe every healthy/unhealthy instance and flip status on change.
    ///
    /// Offline and draining instances are left alone. A probe that times out
    /// counts as unhealthy. Breakers past their cooldown are half-opened.
    pub async fn health_check(&self) -> ProbeSweep {
        let targets: Vec<Instance> = self
            .registry
            .list()
            .into_iter()
            .filter(|i| matches!(i.status, InstanceStatus::Healthy | InstanceStatus::Unhealthy))
            .collect();

        let probe_timeout = self.config.probe_timeout;
        let results = join_all(targets.iter().map(|instance| async move {
            let outcome = timeout(probe_timeout, self.probe.probe(instance))
                .await
                .unwrap_or_else(|_| {
                    warn!(instance = %instance.id, "health probe timed out");
                    ProbeResult::Unhealthy
                });
            (instance.id.clone(), outcome)
        }))
        .await;

        let mut sweep = ProbeSweep {
            probed: results.len(),
            ..Default::default()
        };
        let mut changes = Vec::new();
        let checked_at = Utc::now();

        for (id, outcome) in results {
            let target = match outcome {
                ProbeResult::Healthy => {
                    sweep.healthy += 1;
                    InstanceStatus::Healthy
                }
                ProbeResult::Unhealthy => {
                    sweep.unhealthy += 1;
                    InstanceStatus::Unhealthy
                }
            };

            let changed = self
                .registry
                .update(&id, |i| {
                    i.last_health_check = Some(checked_at);
                    // Status may have moved to draining while probing
                    let probeable = matches!(i.status, InstanceStatus::Healthy | InstanceStatus::Unhealthy);
                    if probeable && i.status != target {
                        let previous = i.status;
                        i.status = target;
                        Some(previous)
                    } else {
                        None
                    }
                })
                .ok()
                .flatten();

            if let Some(previous) = changed {
                changes.push((id, previous, target));
            }
        }
        sweep.changed = changes.len();

        let now = Instant::now();
        let half_opened: Vec<(String, Transition)> = self.registry.with_all(|instances| {
            instances
                .values_mut()
                .filter_map(|i| i.breaker.refresh(now).map(|t| (i.id.clone(), t)))
                .collect()
        });
        sweep.half_opened = half_opened.len();

        for (id, from, to) in changes {
            info!(instance = %id, %from, %to, "instance health changed");
            self.publish(DomainEvent::InstanceStatusChanged {
                instance_id: id,
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }
        for (id, t) in half_opened {
            self.circuit_changed(&id, t).await;
        }

        sweep
    }

    /// Drop expired sessions
    pub fn purge_expired_sessions(&self) -> usize {
        let purged = self.sessions.purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, "expired sessions purged");
        }
        purged
    }

    /// Drop every session bound to `instance_id`
    pub fn unbind_instance(&self, instance_id: &str) -> usize {
        self.sessions.unbind_instance(instance_id)
    }

    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        let now = Instant::now();
        self.registry.list().iter().map(|i| i.snapshot(now)).collect()
    }

    pub fn stats(&self) -> BalancerStats {
        let now = Instant::now();
        let mut stats = BalancerStats {
            algorithm: self.config.algorithm,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            sessions: self.sessions.stats(now),
            ..Default::default()
        };

        let mut weighted_latency = 0.0;
        for instance in self.registry.list() {
            stats.instances += 1;
            match instance.status {
                InstanceStatus::Healthy => stats.healthy += 1,
                InstanceStatus::Unhealthy => stats.unhealthy += 1,
                InstanceStatus::Offline => stats.offline += 1,
                InstanceStatus::Draining => stats.draining += 1,
            }
            match instance.breaker.effective_state(now) {
                CircuitState::Closed => stats.circuits_closed += 1,
                CircuitState::Open => stats.circuits_open += 1,
                CircuitState::HalfOpen => stats.circuits_half_open += 1,
            }
            let m = &instance.metrics;
            stats.active_connections += m.active_connections as u64;
            stats.total_requests += m.total_requests;
            stats.completed_requests += m.completed_requests;
            stats.failed_requests += m.failed_requests;
            weighted_latency += m.avg_response_time_ms * m.completed_requests as f64;
        }

        if stats.completed_requests > 0 {
            stats.error_rate = stats.failed_requests as f64 / stats.completed_requests as f64;
            stats.avg_response_time_ms = weighted_latency / stats.completed_requests as f64;
        }
        stats
    }

    async fn circuit_changed(&self, instance_id: &str, t: Transition) {
        if t.to == CircuitState::Open {
            warn!(instance = instance_id, from = %t.from, "circuit opened");
        } else {
            info!(instance = instance_id, from = %t.from, to = %t.to, "circuit state changed");
        }
        self.publish(DomainEvent::CircuitStateChanged {
            instance_id: instance_id.to_string(),
            from: t.from.to_string(),
            to: t.to.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.publish(event).await {
                debug!(error = %e, "failed to publish balancer event");
            }
        }
    }
}
