//! Control Plane Configuration
//!
//! One serde document covers every component. Durations are written in
//! milliseconds in YAML files.
//!
//! ```yaml
//! autoscale:
//!   min_instances: 2
//!   max_instances: 10
//!   cooldown: 300000
//! pools:
//!   - name: admin
//!     max_connections: 2
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::LoadProfile;
use crate::archive::ArchiveConfig;
use crate::autoscale::AutoscaleConfig;
use crate::balancer::BalancerConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::monitor::MonitorConfig;
use crate::pool::{PoolConfig, PoolMaintenanceConfig};
use crate::subscription::BatchingConfig;

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Top-level configuration for the whole control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Cache layers and write-back settings
    pub cache: CacheConfig,
    /// Named connection pools
    pub pools: Vec<PoolConfig>,
    /// Health sweep / idle reap cadence shared by all pools
    pub pool_maintenance: PoolMaintenanceConfig,
    /// Load balancer settings
    pub balancer: BalancerConfig,
    /// Autoscaling controller settings
    pub autoscale: AutoscaleConfig,
    /// Monitor thresholds and retention
    pub monitor: MonitorConfig,
    /// Subscription batching defaults
    pub batching: BatchingConfig,
    /// Archive policies
    pub archive: ArchiveConfig,
    /// Simulated instance fleet used when no real backends are wired in
    pub simulation: SimulationConfig,
}

/// Seed instances and synthetic load for the simulated backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    /// Healthy instances registered at startup
    pub initial_instances: u32,
    pub load: LoadProfile,
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Fixed RNG seed for reproducible load noise
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_instances: 2,
            load: LoadProfile::default(),
            tick_interval: Duration::from_secs(5),
            seed: None,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            pools: vec![PoolConfig::named("admin"), PoolConfig::named("reporting")],
            pool_maintenance: PoolMaintenanceConfig::default(),
            balancer: BalancerConfig::default(),
            autoscale: AutoscaleConfig::default(),
            monitor: MonitorConfig::default(),
            batching: BatchingConfig::default(),
            archive: ArchiveConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;

        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::Config(format!("duplicate pool name '{}'", pool.name)));
            }
        }
        self.pool_maintenance.validate()?;

        self.balancer.validate()?;
        self.autoscale.validate()?;
        self.monitor.validate()?;
        self.batching.validate()?;
        self.archive.validate()?;

        if self.simulation.enabled {
            if self.simulation.tick_interval.is_zero() {
                return Err(Error::Config("simulation.tick_interval must be positive".into()));
            }
            if self.simulation.initial_instances > self.autoscale.max_instances {
                return Err(Error::Config(format!(
                    "simulation.initial_instances {} exceeds autoscale.max_instances {}",
                    self.simulation.initial_instances, self.autoscale.max_instances
                )));
            }
        }
        Ok(())
    }
}
