//! Simulated Backends
//!
//! Process-local stand-ins for the things a production deployment would
//! reach over the network: a backend that hands out client sessions, a
//! health probe driven by utilization limits, an instance provisioner, and a
//! load generator that spreads synthetic demand across the instance registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::balancer::{Instance, InstanceRegistry, InstanceStatus};
use crate::domain::ports::{
    BackendHandle, Connector, InstanceProbe, InstanceProvisioner, ProbeResult,
};
use crate::error::{Error, Result};

// =============================================================================
// Connector
// =============================================================================

/// Backend that opens sessions after an optional delay.
///
/// Connects and probes can be failed globally, probes also per session.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    latency: Duration,
    fail_connect: AtomicBool,
    fail_probe: AtomicBool,
    failing_sessions: Mutex<HashSet<Uuid>>,
    connects: AtomicU64,
    closes: AtomicU64,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose connects and probes take `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Make probes of one session fail from now on
    pub fn fail_session(&self, session_id: Uuid) {
        self.failing_sessions.lock().insert(session_id);
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, pool: &str) -> Result<BackendHandle> {
        self.delay().await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::DataStore(format!("backend for '{pool}' unreachable")));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(BackendHandle::new(pool))
    }

    async fn probe(&self, handle: &BackendHandle) -> Result<()> {
        self.delay().await;
        if self.fail_probe.load(Ordering::SeqCst)
            || self.failing_sessions.lock().contains(&handle.session_id)
        {
            return Err(Error::DataStore(format!(
                "session {} did not answer",
                handle.session_id
            )));
        }
        Ok(())
    }

    async fn close(&self, handle: &BackendHandle) {
        self.failing_sessions.lock().remove(&handle.session_id);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Instance Probe
// =============================================================================

/// Probe that fails instances over utilization limits or marked failing.
#[derive(Debug)]
pub struct SyntheticProbe {
    pub cpu_limit: f64,
    pub memory_limit: f64,
    pub error_rate_limit: f64,
    failing: Mutex<HashSet<String>>,
}

impl SyntheticProbe {
    pub fn new() -> Self {
        Self {
            cpu_limit: 95.0,
            memory_limit: 95.0,
            error_rate_limit: 0.5,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Force probes of `instance_id` to fail (or stop forcing it)
    pub fn set_failing(&self, instance_id: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(instance_id.to_string());
        } else {
            set.remove(instance_id);
        }
    }
}

impl Default for SyntheticProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceProbe for SyntheticProbe {
    async fn probe(&self, instance: &Instance) -> ProbeResult {
        if self.failing.lock().contains(&instance.id) {
            return ProbeResult::Unhealthy;
        }
        let m = &instance.metrics;
        if m.cpu > self.cpu_limit || m.memory > self.memory_limit || m.error_rate > self.error_rate_limit {
            return ProbeResult::Unhealthy;
        }
        ProbeResult::Healthy
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Registers instances in-process; launches can be failed on demand.
#[derive(Debug, Default)]
pub struct SimulatedProvisioner {
    fail_launch: AtomicBool,
    fail_terminate: AtomicBool,
    launched: AtomicU64,
    terminated: AtomicU64,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> u64 {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceProvisioner for SimulatedProvisioner {
    async fn launch(&self, registry: &InstanceRegistry) -> Result<String> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::ScalingActionFailure("instance launch rejected".into()));
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(registry.provision(InstanceStatus::Offline))
    }

    async fn terminate(&self, registry: &InstanceRegistry, instance_id: &str) -> Result<()> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(Error::ScalingActionFailure(format!(
                "terminating {instance_id} rejected"
            )));
        }
        registry
            .remove(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Load Generator
// =============================================================================

/// Cluster-wide demand, in units of one instance's capacity.
///
/// `cpu: 150.0` means one and a half instances' worth of CPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadProfile {
    pub cpu: f64,
    pub memory: f64,
    pub connections: u32,
    /// +/- percentage points of noise per instance per tick
    pub jitter: f64,
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 90.0,
            connections: 60,
            jitter: 5.0,
        }
    }
}

/// Spreads a `LoadProfile` over the healthy instances on every tick.
///
/// Overwrites cpu, memory and active connections of healthy instances;
/// the others read zero.
pub struct SimulatedLoadGenerator {
    registry: Arc<InstanceRegistry>,
    profile: Mutex<LoadProfile>,
    rng: Mutex<StdRng>,
}

impl SimulatedLoadGenerator {
    pub fn new(registry: Arc<InstanceRegistry>, profile: LoadProfile) -> Self {
        Self {
            registry,
            profile: Mutex::new(profile),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic noise for tests
    pub fn seeded(registry: Arc<InstanceRegistry>, profile: LoadProfile, seed: u64) -> Self {
        Self {
            registry,
            profile: Mutex::new(profile),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn profile(&self) -> LoadProfile {
        *self.profile.lock()
    }

    pub fn set_profile(&self, profile: LoadProfile) {
        *self.profile.lock() = profile;
    }

    /// Apply the current profile once
    pub fn tick(&self) {
        let profile = *self.profile.lock();
        let mut rng = self.rng.lock();

        self.registry.with_all(|instances| {
            let healthy = instances
                .values()
                .filter(|i| i.status == InstanceStatus::Healthy)
                .count();
            let share = |total: f64| if healthy == 0 { 0.0 } else { total / healthy as f64 };
            let conns = if healthy == 0 {
                0
            } else {
                profile.connections / healthy as u32
            };

            for instance in instances.values_mut() {
                if instance.status != InstanceStatus::Healthy {
                    instance.metrics.cpu = 0.0;
                    instance.metrics.memory = 0.0;
                    instance.metrics.active_connections = 0;
                    continue;
                }
                let noise = |rng: &mut StdRng| {
                    if profile.jitter > 0.0 {
                        rng.gen_range(-profile.jitter..=profile.jitter)
                    } else {
                        0.0
                    }
                };
                instance.metrics.cpu = (share(profile.cpu) + noise(&mut *rng)).clamp(0.0, 100.0);
                instance.metrics.memory = (share(profile.memory) + noise(&mut *rng)).clamp(0.0, 100.0);
                instance.metrics.active_connections = conns;
            }
            debug!(healthy, cpu = profile.cpu, "simulated load applied");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_failure_injection() {
        let connector = SimulatedConnector::new();
        let handle = connector.connect("admin").await.unwrap();
        assert!(connector.probe(&handle).await.is_ok());

        connector.fail_session(handle.session_id);
        assert!(connector.probe(&handle).await.is_err());

        connector.set_fail_connect(true);
        assert!(connector.connect("admin").await.is_err());
        assert_eq!(connector.connect_count(), 1);

        connector.close(&handle).await;
        assert_eq!(connector.close_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_limits() {
        let probe = SyntheticProbe::new();
        let registry = InstanceRegistry::new(3, Duration::from_secs(1));
        let id = registry.provision(InstanceStatus::Healthy);

        let mut instance = registry.get(&id).unwrap();
        assert_eq!(probe.probe(&instance).await, ProbeResult::Healthy);

        instance.metrics.cpu = 99.0;
        assert_eq!(probe.probe(&instance).await, ProbeResult::Unhealthy);

        instance.metrics.cpu = 10.0;
        probe.set_failing(&id, true);
        assert_eq!(probe.probe(&instance).await, ProbeResult::Unhealthy);
        probe.set_failing(&id, false);
        assert_eq!(probe.probe(&instance).await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn test_provisioner_registers_offline_and_removes() {
        let registry = InstanceRegistry::new(3, Duration::from_secs(1));
        let provisioner = SimulatedProvisioner::new();

        let id = provisioner.launch(&registry).await.unwrap();
        assert_eq!(registry.get(&id).unwrap().status, InstanceStatus::Offline);

        provisioner.terminate(&registry, &id).await.unwrap();
        assert!(registry.is_empty());
        assert!(provisioner.terminate(&registry, &id).await.is_err());

        provisioner.set_fail_launch(true);
        assert!(provisioner.launch(&registry).await.is_err());
        assert_eq!(provisioner.launched(), 1);
    }

    #[test]
    fn test_load_spread_over_healthy_instances() {
        let registry = Arc::new(InstanceRegistry::new(3, Duration::from_secs(1)));
        let a = registry.provision(InstanceStatus::Healthy);
        let b = registry.provision(InstanceStatus::Healthy);
        let offline = registry.provision(InstanceStatus::Offline);

        let generator = SimulatedLoadGenerator::seeded(
            registry.clone(),
            LoadProfile {
                cpu: 120.0,
                memory: 80.0,
                connections: 50,
                jitter: 0.0,
            },
            7,
        );
        generator.tick();

        for id in [&a, &b] {
            let m = registry.get(id).unwrap().metrics;
            assert_eq!(m.cpu, 60.0);
            assert_eq!(m.memory, 40.0);
            assert_eq!(m.active_connections, 25);
        }
        assert_eq!(registry.get(&offline).unwrap().metrics.cpu, 0.0);
    }
}
