//! Control Plane Assembly
//!
//! Builds every component from one [`ControlPlaneConfig`], shares a single
//! event sink between them, and registers their periodic sweeps with the
//! [`Scheduler`]. The monitor reads the other components through
//! [`Components`], which also carries out its automatic repairs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::{
    FanoutEventPublisher, InMemoryDataStore, InMemoryEventCollector, LoggingEventPublisher,
    PrometheusExporter, SimulatedConnector, SimulatedLoadGenerator, SimulatedProvisioner,
    SyntheticProbe,
};
use crate::archive::Archiver;
use crate::autoscale::AutoscaleController;
use crate::balancer::{InstanceRegistry, InstanceStatus, LoadBalancer};
use crate::cache::CacheManager;
use crate::config::ControlPlaneConfig;
use crate::domain::ports::{
    Connector, DataStore, EventPublisher, InstanceProbe, InstanceProvisioner, SideStore,
};
use crate::error::{Error, Result};
use crate::monitor::{
    AutoFix, ComponentCheck, ComponentSnapshot, Dashboard, HealthReport, MetricsSource,
    Remediator, ScalabilityMonitor,
};
use crate::pool::PoolManager;
use crate::scheduler::Scheduler;
use crate::subscription::{Batch, BatchConsumer, ChangeEvent, SubscriptionBatcher};

// =============================================================================
// Backends
// =============================================================================

/// External systems the control plane talks to
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DataStore>,
    pub side_store: Arc<dyn SideStore>,
    pub connector: Arc<dyn Connector>,
    pub probe: Arc<dyn InstanceProbe>,
    pub provisioner: Arc<dyn InstanceProvisioner>,
    pub events: Arc<dyn EventPublisher>,
    pub consumer: Arc<dyn BatchConsumer>,
}

impl Backends {
    /// In-process stand-ins for every backend.
    ///
    /// Events go to the log and to a bounded in-memory audit trail; batches
    /// are logged and dropped.
    pub fn simulated() -> Self {
        let store = Arc::new(InMemoryDataStore::new());
        let events = FanoutEventPublisher::new()
            .with_sink(Arc::new(LoggingEventPublisher::new()))
            .with_sink(Arc::new(InMemoryEventCollector::with_capacity(1000)));
        let consumer = |batch: Batch| -> Result<()> {
            debug!(
                stream = %batch.stream,
                sequence = batch.sequence,
                events = batch.len(),
                reason = %batch.reason,
                "batch delivered"
            );
            Ok(())
        };

        Self {
            store: store.clone(),
            side_store: store,
            connector: Arc::new(SimulatedConnector::new()),
            probe: Arc::new(SyntheticProbe::new()),
            provisioner: Arc::new(SimulatedProvisioner::new()),
            events: Arc::new(events),
            consumer: Arc::new(consumer),
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

// =============================================================================
// Components
// =============================================================================

/// Every managed component, shared with the monitor
pub struct Components {
    pub cache: Arc<CacheManager>,
    pub pools: Arc<PoolManager>,
    pub registry: Arc<InstanceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub autoscaler: Arc<AutoscaleController>,
    pub batcher: SubscriptionBatcher,
    pub archiver: Arc<Archiver>,
}

impl Components {
    /// Mean CPU over healthy instances, read without touching the
    /// autoscaler's request-rate window
    fn healthy_cpu(&self) -> f64 {
        let (sum, n) = self
            .registry
            .list()
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .fold((0.0, 0usize), |(sum, n), i| (sum + i.metrics.cpu, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

impl MetricsSource for Components {
    fn sample(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        let mut push = |name: &str, value: f64| out.push((name.to_string(), value));

        let cache = self.cache.stats();
        let lookups: u64 = cache
            .layers
            .iter()
            .map(|l| l.counters.hits + l.counters.misses)
            .sum();
        // An idle cache has no meaningful hit rate
        if lookups > 0 {
            push("cache.hit_rate", cache.hit_rate);
        }
        push("cache.utilization", cache.utilization);
        push("cache.entries", cache.total_entries as f64);
        push("cache.write_back_pending", cache.write_back.pending as f64);

        let pools = self.pools.stats();
        if !pools.is_empty() {
            let worst = pools.iter().map(|p| p.utilization).fold(0.0, f64::max);
            push("pool.utilization", worst);
            push("pool.waiting", pools.iter().map(|p| p.waiting).sum::<usize>() as f64);
            push("pool.active", pools.iter().map(|p| p.active).sum::<usize>() as f64);
            push("pool.timeouts", pools.iter().map(|p| p.timeouts).sum::<u64>() as f64);
        }

        let balancer = self.balancer.stats();
        push("balancer.healthy_ratio", balancer.healthy_ratio());
        push("balancer.error_rate", balancer.error_rate);
        push("balancer.avg_response_time_ms", balancer.avg_response_time_ms);
        push("balancer.active_connections", balancer.active_connections as f64);
        push("balancer.open_circuits", balancer.circuits_open as f64);

        let autoscale = self.autoscaler.stats();
        push("autoscale.cpu", self.healthy_cpu());
        push("autoscale.instances", autoscale.current_instances as f64);

        let subscriptions = self.batcher.stats();
        push("subscription.buffered", subscriptions.buffered as f64);
        push("subscription.streams", subscriptions.streams as f64);

        let archive = self.archiver.stats();
        push("archive.running", archive.running as f64);
        push("archive.failed", archive.failed as f64);
        out
    }

    fn snapshot(&self) -> ComponentSnapshot {
        ComponentSnapshot {
            instances: self.balancer.instances(),
            pools: self.pools.stats(),
            cache: Some(self.cache.stats()),
            balancer: Some(self.balancer.stats()),
            autoscale: Some(self.autoscaler.stats()),
            subscriptions: Some(self.batcher.stats()),
            archive: Some(self.archiver.stats()),
        }
    }

    fn readiness(&self) -> Vec<ComponentCheck> {
        let cache = self.cache.stats();
        let pools = self.pools.stats();
        let closed = pools.iter().filter(|p| p.closed).count();
        let balancer = self.balancer.stats();

        vec![
            ComponentCheck::new(
                "cache",
                !cache.layers.is_empty(),
                format!("{} layers, {} entries", cache.layers.len(), cache.total_entries),
            ),
            ComponentCheck::new(
                "pools",
                closed == 0,
                format!("{} pools, {} closed", pools.len(), closed),
            ),
            ComponentCheck::new(
                "balancer",
                balancer.healthy > 0,
                format!("{}/{} instances healthy", balancer.healthy, balancer.instances),
            ),
            ComponentCheck::new(
                "subscriptions",
                !self.batcher.is_shutdown(),
                format!("{} streams", self.batcher.stream_names().len()),
            ),
        ]
    }
}

#[async_trait]
impl Remediator for Components {
    async fn apply(&self, fix: AutoFix) -> Result<String> {
        match fix {
            AutoFix::OptimizeCache => {
                let report = self.cache.optimize();
                Ok(format!(
                    "removed {} entries, compressed {}, freed {} bytes",
                    report.removed_entries, report.compressed_entries, report.freed_bytes
                ))
            }
            AutoFix::ReclaimResources => {
                let sessions = self.balancer.purge_expired_sessions();
                let reaped = self.pools.reap_all().await;
                let flushed = self.cache.drain_write_back().await?;
                Ok(format!(
                    "purged {sessions} sessions, reaped {reaped} connections, flushed {flushed} writes"
                ))
            }
            AutoFix::ReevaluateSubscriptions => {
                let dropped = self.batcher.reevaluate().await;
                Ok(format!("dropped {} idle streams", dropped.len()))
            }
        }
    }
}

// =============================================================================
// Control Plane
// =============================================================================

/// The assembled control plane
pub struct ControlPlane {
    config: ControlPlaneConfig,
    components: Arc<Components>,
    monitor: Arc<ScalabilityMonitor>,
    exporter: PrometheusExporter,
    load: Option<Arc<SimulatedLoadGenerator>>,
    changes: mpsc::Sender<ChangeEvent>,
    pending_changes: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    ingest: Mutex<Option<JoinHandle<u64>>>,
    scheduler: Scheduler,
    started: AtomicBool,
}

impl ControlPlane {
    /// Validate `config` and build every component on the simulated backends
    pub fn simulated(config: ControlPlaneConfig) -> Result<Self> {
        Self::new(config, Backends::simulated())
    }

    /// Validate `config` and build every component on `backends`.
    ///
    /// Nothing runs until [`start`](Self::start).
    pub fn new(config: ControlPlaneConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let events = backends.events.clone();
        let scheduler = Scheduler::new();

        let cache = Arc::new(
            CacheManager::new(config.cache.clone()).with_side_store(backends.side_store.clone()),
        );

        let pools = Arc::new(PoolManager::new(backends.connector.clone()).with_events(events.clone()));
        for pool in &config.pools {
            pools.register(pool.clone())?;
        }

        let registry = Arc::new(config.balancer.new_registry());
        let balancer = Arc::new(
            LoadBalancer::new(config.balancer.clone(), registry.clone(), backends.probe.clone())
                .with_events(events.clone()),
        );
        let autoscaler = Arc::new(
            AutoscaleController::new(
                config.autoscale.clone(),
                registry.clone(),
                backends.provisioner.clone(),
            )
            .with_events(events.clone())
            .with_cancellation(scheduler.token()),
        );

        let batcher = SubscriptionBatcher::from_config(&config.batching, backends.consumer.clone())?;
        let archiver = Arc::new(
            Archiver::new(config.archive.clone(), backends.store.clone()).with_events(events.clone()),
        );

        let load = if config.simulation.enabled {
            for _ in 0..config.simulation.initial_instances {
                registry.provision(InstanceStatus::Healthy);
            }
            let generator = match config.simulation.seed {
                Some(seed) => {
                    SimulatedLoadGenerator::seeded(registry.clone(), config.simulation.load, seed)
                }
                None => SimulatedLoadGenerator::new(registry.clone(), config.simulation.load),
            };
            Some(Arc::new(generator))
        } else {
            None
        };

        let components = Arc::new(Components {
            cache,
            pools,
            registry,
            balancer,
            autoscaler,
            batcher,
            archiver,
        });
        let monitor = Arc::new(
            ScalabilityMonitor::new(config.monitor.clone())
                .with_source(components.clone())
                .with_remediator(components.clone())
                .with_events(events),
        );

        let (changes, rx) = mpsc::channel(config.batching.channel_capacity);

        Ok(Self {
            config,
            components,
            monitor,
            exporter: PrometheusExporter::new()?,
            load,
            changes,
            pending_changes: Mutex::new(Some(rx)),
            ingest: Mutex::new(None),
            scheduler,
            started: AtomicBool::new(false),
        })
    }

    /// Warm pools, start change-event ingest and register periodic sweeps
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("control plane already started".into()));
        }
        if self.scheduler.is_shutdown() {
            return Err(Error::Internal("control plane is shut down".into()));
        }

        let warmed = self.components.pools.warm_up_all().await;
        debug!(connections = warmed, "pools warmed");

        if let Some(rx) = self.pending_changes.lock().take() {
            *self.ingest.lock() = Some(self.components.batcher.spawn_ingest(rx));
        }

        self.schedule_pools()?;
        self.schedule_balancer()?;
        self.schedule_autoscale()?;
        self.schedule_maintenance()?;

        info!(
            tasks = self.scheduler.task_count(),
            pools = self.config.pools.len(),
            instances = self.components.registry.len(),
            "control plane started"
        );
        Ok(())
    }

    fn schedule_pools(&self) -> Result<()> {
        let maintenance = &self.config.pool_maintenance;

        let pools = self.components.pools.clone();
        self.scheduler.every("pool-health", maintenance.health_check_interval, move || {
            let pools = pools.clone();
            async move {
                for (pool, sweep) in pools.health_check_all().await {
                    if sweep.failed > 0 {
                        debug!(pool = %pool, failed = sweep.failed, replaced = sweep.replaced, "pool health sweep");
                    }
                }
                Ok(())
            }
        })?;

        let pools = self.components.pools.clone();
        self.scheduler.every("pool-reap", maintenance.reap_interval, move || {
            let pools = pools.clone();
            async move {
                pools.reap_all().await;
                Ok(())
            }
        })?;
        Ok(())
    }

    fn schedule_balancer(&self) -> Result<()> {
        let balancer = self.components.balancer.clone();
        self.scheduler.every(
            "balancer-health",
            self.config.balancer.health_check_interval,
            move || {
                let balancer = balancer.clone();
                async move {
                    balancer.health_check().await;
                    Ok(())
                }
            },
        )?;

        let balancer = self.components.balancer.clone();
        self.scheduler.every(
            "session-purge",
            self.config.balancer.session_purge_interval,
            move || {
                let balancer = balancer.clone();
                async move {
                    balancer.purge_expired_sessions();
                    Ok(())
                }
            },
        )?;
        Ok(())
    }

    fn schedule_autoscale(&self) -> Result<()> {
        if let Some(load) = &self.load {
            let load = load.clone();
            self.scheduler
                .every("load-tick", self.config.simulation.tick_interval, move || {
                    let load = load.clone();
                    async move {
                        load.tick();
                        Ok(())
                    }
                })?;
        }

        if !self.config.autoscale.enabled {
            info!("autoscaling disabled");
            return Ok(());
        }
        let autoscaler = self.components.autoscaler.clone();
        self.scheduler.every(
            "autoscale",
            self.config.autoscale.evaluation_interval,
            move || {
                let autoscaler = autoscaler.clone();
                async move { autoscaler.run_cycle().await.map(|_| ()) }
            },
        )?;
        Ok(())
    }

    fn schedule_maintenance(&self) -> Result<()> {
        let monitor = self.monitor.clone();
        self.scheduler.every(
            "monitor",
            self.config.monitor.collection_interval,
            move || {
                let monitor = monitor.clone();
                async move {
                    let raised = monitor.collect().await;
                    if !raised.is_empty() {
                        debug!(alerts = raised.len(), "monitor raised alerts");
                    }
                    Ok(())
                }
            },
        )?;

        let cache = self.components.cache.clone();
        self.scheduler.every(
            "write-back",
            self.config.cache.write_back.flush_interval,
            move || {
                let cache = cache.clone();
                async move { cache.process_write_back().await.map(|_| ()) }
            },
        )?;

        let archiver = self.components.archiver.clone();
        self.scheduler.every(
            "archive",
            self.config.archive.schedule_interval,
            move || {
                let archiver = archiver.clone();
                async move {
                    let failed = archiver
                        .run_due()
                        .await
                        .into_iter()
                        .filter(|r| r.is_err())
                        .count();
                    if failed > 0 {
                        warn!(failed, "archive jobs failed");
                    }
                    Ok(())
                }
            },
        )?;

        let batcher = self.components.batcher.clone();
        self.scheduler.every(
            "subscriptions",
            self.config.batching.reevaluate_interval,
            move || {
                let batcher = batcher.clone();
                async move {
                    batcher.reevaluate().await;
                    Ok(())
                }
            },
        )?;
        Ok(())
    }

    /// Stop every sweep, flush buffered batches and pending writes, close
    /// every pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.components.autoscaler.shutdown();

        let flushed = self.components.batcher.shutdown().await;
        let ingest = self.ingest.lock().take();
        if let Some(handle) = ingest {
            match handle.await {
                Ok(consumed) => debug!(consumed, "change-event ingest joined"),
                Err(e) => warn!(error = %e, "change-event ingest panicked"),
            }
        }

        match self.components.cache.drain_write_back().await {
            Ok(n) => debug!(persisted = n, "write-back drained"),
            Err(e) => warn!(error = %e, "write-back drain failed"),
        }
        self.components.pools.close_all().await;
        info!(flushed_batches = flushed, "control plane stopped");
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn components(&self) -> &Arc<Components> {
        &self.components
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.components.cache
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.components.pools
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.components.balancer
    }

    pub fn autoscaler(&self) -> &Arc<AutoscaleController> {
        &self.components.autoscaler
    }

    pub fn batcher(&self) -> &SubscriptionBatcher {
        &self.components.batcher
    }

    pub fn archiver(&self) -> &Arc<Archiver> {
        &self.components.archiver
    }

    pub fn monitor(&self) -> &Arc<ScalabilityMonitor> {
        &self.monitor
    }

    /// Simulated load, when enabled
    pub fn load_generator(&self) -> Option<&Arc<SimulatedLoadGenerator>> {
        self.load.as_ref()
    }

    /// Sender feeding the subscription batcher once started
    pub fn changes(&self) -> mpsc::Sender<ChangeEvent> {
        self.changes.clone()
    }

    pub fn dashboard(&self) -> Dashboard {
        self.monitor.dashboard()
    }

    pub fn health(&self) -> HealthReport {
        let mut report = self.monitor.health();
        if self.scheduler.is_shutdown() {
            report.live = false;
            report.ready = false;
        }
        report
    }

    /// Refresh the exporter from current state and render it
    pub fn metrics_text(&self) -> Result<String> {
        self.exporter
            .update(&self.components.snapshot(), &self.monitor.stats());
        self.exporter.render()
    }

    pub fn metrics_content_type(&self) -> &'static str {
        self.exporter.content_type()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::monitor::OverallHealth;
    use crate::subscription::StreamConfig;

    fn quiet_config() -> ControlPlaneConfig {
        let mut config = ControlPlaneConfig::default();
        config.simulation.seed = Some(1);
        config.simulation.load.jitter = 0.0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_plane_starts_ready() {
        let plane = ControlPlane::simulated(quiet_config()).unwrap();
        plane.start().await.unwrap();

        let health = plane.health();
        assert!(health.live);
        assert!(health.ready, "checks: {:?}", health.checks);
        assert_eq!(plane.components().registry.len(), 2);

        assert!(plane.start().await.is_err());
        plane.shutdown().await;
        assert!(!plane.health().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let mut config = quiet_config();
        config.autoscale.min_instances = 0;
        config.autoscale.max_instances = 0;
        assert!(ControlPlane::simulated(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_covers_default_thresholds() {
        let plane = ControlPlane::simulated(quiet_config()).unwrap();
        let sampled: Vec<String> = plane
            .components()
            .sample()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        for metric in [
            "cache.utilization",
            "pool.utilization",
            "pool.waiting",
            "balancer.healthy_ratio",
            "balancer.error_rate",
            "autoscale.cpu",
            "subscription.buffered",
        ] {
            assert!(sampled.iter().any(|m| m == metric), "missing {metric}");
        }
        // No lookups yet
        assert!(!sampled.iter().any(|m| m == "cache.hit_rate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_events_reach_streams() {
        let mut config = quiet_config();
        config.batching.streams = vec![StreamConfig::new("orders", "orders").batch_size(2)];
        let plane = ControlPlane::simulated(config).unwrap();
        plane.start().await.unwrap();

        let tx = plane.changes();
        tx.send(ChangeEvent::insert("orders", "1", serde_json::json!({})))
            .await
            .unwrap();
        tx.send(ChangeEvent::insert("orders", "2", serde_json::json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = plane.batcher().stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.batches_delivered, 1);
        plane.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remediation_runs_against_components() {
        let plane = ControlPlane::simulated(quiet_config()).unwrap();
        let outcome = plane
            .components()
            .apply(AutoFix::ReevaluateSubscriptions)
            .await
            .unwrap();
        assert_eq!(outcome, "dropped 0 idle streams");
        let outcome = plane.components().apply(AutoFix::OptimizeCache).await.unwrap();
        assert!(outcome.starts_with("removed 0 entries"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_text_and_dashboard() {
        let plane = ControlPlane::simulated(quiet_config()).unwrap();
        plane.monitor().collect().await;

        let text = plane.metrics_text().unwrap();
        assert!(text.contains("scaleplane_instances"));
        assert!(text.contains(r#"scaleplane_pool_connections{pool="admin",state="idle"}"#));

        let dashboard = plane.dashboard();
        assert_eq!(dashboard.overview.health, OverallHealth::Excellent);
    }
}
