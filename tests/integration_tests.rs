//! Scaleplane Integration Tests
//!
//! End-to-end behaviour through an assembled `ControlPlane`:
//! - Connection pools
//! - Layered cache
//! - Load balancing and circuit breakers
//! - Autoscaling
//! - Monitoring and alerting
//! - Subscription batching and archiving

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use scaleplane::adapters::{
    InMemoryDataStore, InMemoryEventCollector, SimulatedConnector, SimulatedProvisioner,
    SyntheticProbe,
};
use scaleplane::subscription::Batch;
use scaleplane::{Backends, ControlPlane, ControlPlaneConfig, Error};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    plane: ControlPlane,
    store: Arc<InMemoryDataStore>,
    connector: Arc<SimulatedConnector>,
    probe: Arc<SyntheticProbe>,
    provisioner: Arc<SimulatedProvisioner>,
    events: Arc<InMemoryEventCollector>,
    batches: Arc<Mutex<Vec<Batch>>>,
}

impl Harness {
    fn new(config: ControlPlaneConfig) -> Self {
        let store = Arc::new(InMemoryDataStore::new());
        let connector = Arc::new(SimulatedConnector::new());
        let probe = Arc::new(SyntheticProbe::new());
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let batches = Arc::new(Mutex::new(Vec::new()));

        let sink = batches.clone();
        let consumer = move |batch: Batch| -> scaleplane::Result<()> {
            sink.lock().push(batch);
            Ok(())
        };

        let backends = Backends {
            store: store.clone(),
            side_store: store.clone(),
            connector: connector.clone(),
            probe: probe.clone(),
            provisioner: provisioner.clone(),
            events: events.clone(),
            consumer: Arc::new(consumer),
        };

        Self {
            plane: ControlPlane::new(config, backends).unwrap(),
            store,
            connector,
            probe,
            provisioner,
            events,
            batches,
        }
    }

    fn instance_ids(&self) -> Vec<String> {
        self.plane
            .components()
            .registry
            .list()
            .into_iter()
            .map(|i| i.id)
            .collect()
    }
}

fn base_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.simulation.seed = Some(7);
    config.simulation.load.jitter = 0.0;
    config
}

// =============================================================================
// Connection Pools
// =============================================================================

mod pool_tests {
    use super::*;
    use scaleplane::pool::{PoolConfig, Priority};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_times_out_when_exhausted() {
        let mut config = base_config();
        config.pools = vec![PoolConfig::named("admin")
            .with_size(0, 2)
            .with_acquire_timeout(Duration::from_millis(500))];
        let h = Harness::new(config);
        let pools = h.plane.pools();

        let (a, b) = tokio::join!(
            pools.acquire("admin", Some("u1"), Priority::Normal),
            pools.acquire("admin", Some("u2"), Priority::Normal)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(h.connector.connect_count(), 2);

        let started = Instant::now();
        let third = pools.acquire("admin", Some("u3"), Priority::Normal).await;
        assert!(matches!(third, Err(Error::AcquireTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(500));

        let stats = &pools.stats()[0];
        assert_eq!(stats.active + stats.idle, stats.total);
        assert!(stats.total <= stats.max);

        pools.release("admin", a).await.unwrap();
        pools.release("admin", b).await.unwrap();
        assert_eq!(pools.stats()[0].idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pool() {
        let h = Harness::new(base_config());
        let result = h.plane.pools().acquire("missing", None, Priority::Normal).await;
        assert!(result.is_err());
    }
}

// =============================================================================
// Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use scaleplane::cache::{CacheLayerConfig, SetOptions};

    fn cache_config() -> ControlPlaneConfig {
        let mut config = base_config();
        config.cache.layers = vec![CacheLayerConfig::new("query", Duration::from_secs(60), 2)];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_read_entry_survives_eviction() {
        let h = Harness::new(cache_config());
        let cache = h.plane.cache();

        assert!(cache.set("query", "a", &1, SetOptions::default()));
        assert!(cache.set("query", "b", &2, SetOptions::default()));
        assert_eq!(cache.get::<i32>("query", "a"), Some(1));
        assert!(cache.set("query", "c", &3, SetOptions::default()));

        assert_eq!(cache.get::<i32>("query", "b"), None);
        assert_eq!(cache.get::<i32>("query", "a"), Some(1));
        assert_eq!(cache.get::<i32>("query", "c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_gone_at_its_ttl() {
        let h = Harness::new(cache_config());
        let cache = h.plane.cache();

        cache.set("query", "k", &"v", SetOptions::ttl(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cache.get::<String>("query", "k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("query", "k"), None);
    }
}

// =============================================================================
// Load Balancer
// =============================================================================

mod balancer_tests {
    use super::*;
    use scaleplane::balancer::{Algorithm, CircuitState};

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_excludes_instance() {
        let mut config = base_config();
        config.balancer.failure_threshold = 3;
        let h = Harness::new(config);
        let ids = h.instance_ids();
        let failing = ids[0].clone();
        let balancer = h.plane.balancer();

        for _ in 0..3 {
            let result = balancer
                .call(&failing, |_| async { Err::<(), _>(Error::Internal("boom".into())) })
                .await;
            assert!(result.is_err());
        }

        let snapshot = balancer
            .instances()
            .into_iter()
            .find(|i| i.id == failing)
            .unwrap();
        assert_eq!(snapshot.circuit, CircuitState::Open);

        for _ in 0..5 {
            assert_ne!(balancer.select_instance(None).unwrap(), failing);
        }
        let rejected = balancer.call(&failing, |_| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
        assert_eq!(h.events.events_of_type("CircuitStateChanged").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_connections_picks_minimum() {
        let mut config = base_config();
        config.simulation.initial_instances = 3;
        config.balancer.algorithm = Algorithm::LeastConnections;
        let h = Harness::new(config);
        let ids = h.instance_ids();
        let registry = &h.plane.components().registry;

        for (id, active) in ids.iter().zip([5u32, 1, 3]) {
            registry
                .update(id, |i| i.metrics.active_connections = active)
                .unwrap();
        }
        assert_eq!(h.plane.balancer().select_instance(None).unwrap(), ids[1]);

        // Ties go to the lowest id
        for (id, active) in ids.iter().zip([2u32, 2, 4]) {
            registry
                .update(id, |i| i.metrics.active_connections = active)
                .unwrap();
        }
        assert_eq!(h.plane.balancer().select_instance(None).unwrap(), ids[0]);
    }
}

// =============================================================================
// Autoscaling
// =============================================================================

mod autoscale_tests {
    use super::*;
    use scaleplane::adapters::LoadProfile;
    use scaleplane::autoscale::ScalingAction;

    #[tokio::test(start_paused = true)]
    async fn test_critical_cpu_scales_up_by_two() {
        let mut config = base_config();
        config.autoscale.min_instances = 2;
        config.autoscale.max_instances = 10;
        let h = Harness::new(config);

        let load = h.plane.load_generator().unwrap();
        load.set_profile(LoadProfile {
            cpu: 190.0,
            memory: 50.0,
            connections: 0,
            jitter: 0.0,
        });
        load.tick();

        let decision = h.plane.autoscaler().run_cycle().await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.current_instances, 2);
        assert_eq!(decision.recommended_instances, 4);
        assert_eq!(h.provisioner.launched(), 2);
        assert_eq!(h.plane.components().registry.len(), 4);

        // Cooldown holds the next cycle
        let next = h.plane.autoscaler().run_cycle().await.unwrap();
        assert_eq!(next.action, ScalingAction::NoAction);
    }
}

// =============================================================================
// Monitoring
// =============================================================================

mod monitor_tests {
    use super::*;
    use scaleplane::monitor::{OverallHealth, Severity};

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_fleet_raises_critical_alert() {
        let h = Harness::new(base_config());
        for id in h.instance_ids() {
            h.probe.set_failing(&id, true);
        }
        let sweep = h.plane.balancer().health_check().await;
        assert_eq!(sweep.unhealthy, 2);

        let raised = h.plane.monitor().collect().await;
        let critical: Vec<_> = raised
            .iter()
            .filter(|a| a.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].metric, "balancer.healthy_ratio");

        let health = h.plane.health();
        assert_eq!(health.status, OverallHealth::Critical);
        assert!(!health.ready);

        assert!(!h.events.events_of_type("AlertRaised").is_empty());
        assert!(!h.events.events_of_type("AlertNotification").is_empty());

        // Same breach inside the cooldown does not re-alert
        assert!(h.plane.monitor().collect().await.is_empty());

        let id = critical[0].id.clone();
        assert!(h.plane.monitor().resolve_alert(&id).await);
        assert!(!h.plane.monitor().resolve_alert(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_endpoint_text() {
        let h = Harness::new(base_config());
        h.plane.start().await.unwrap();

        let text = h.plane.metrics_text().unwrap();
        assert!(text.contains(r#"scaleplane_instances{status="healthy"} 2"#));
        assert!(text.contains("scaleplane_cache_entries"));
        h.plane.shutdown().await;
    }
}

// =============================================================================
// Subscriptions and Archiving
// =============================================================================

mod pipeline_tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use scaleplane::archive::{ArchivePolicy, JobStatus};
    use scaleplane::domain::{DataStore, Row};
    use scaleplane::subscription::{ChangeEvent, FlushReason, StreamConfig};

    #[tokio::test(start_paused = true)]
    async fn test_change_events_batched_per_stream() {
        let mut config = base_config();
        config.batching.streams = vec![
            StreamConfig::new("orders", "orders").batch_size(3),
            StreamConfig::new("users", "users").timeout(Duration::from_millis(200)),
        ];
        let h = Harness::new(config);
        h.plane.start().await.unwrap();

        let tx = h.plane.changes();
        for id in 1..=3 {
            tx.send(ChangeEvent::insert("orders", &id.to_string(), json!({"id": id})))
                .await
                .unwrap();
        }
        tx.send(ChangeEvent::update("users", "u1", json!({"name": "a"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        {
            let batches = h.batches.lock();
            assert_eq!(batches.len(), 2);
            let orders = batches.iter().find(|b| b.stream == "orders").unwrap();
            assert_eq!(orders.reason, FlushReason::Size);
            let ids: Vec<&str> = orders.events.iter().map(|e| e.record_id()).collect();
            assert_eq!(ids, vec!["1", "2", "3"]);
            let users = batches.iter().find(|b| b.stream == "users").unwrap();
            assert_eq!(users.reason, FlushReason::Timeout);
        }
        h.plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_archive_and_restore_round() {
        let mut config = base_config();
        config.archive.policies = vec![ArchivePolicy::new("audit_log", 30).batch_size(2)];
        let h = Harness::new(config);

        let now = Utc::now();
        let mut rows: Vec<Row> = (0..5)
            .map(|i| {
                Row::new("audit_log", format!("old-{i}"), json!({"i": i}))
                    .created_at(now - ChronoDuration::days(60 + i))
            })
            .collect();
        rows.push(Row::new("audit_log", "fresh", json!({})).created_at(now));
        h.store.insert(rows).await.unwrap();

        let job = h.plane.archiver().run("audit_log").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 5);
        assert_eq!(job.rows_deleted, 5);
        assert_eq!(h.store.table_len("audit_log"), 1);
        assert_eq!(h.events.events_of_type("ArchiveCompleted").len(), 1);

        let record_id = job.record_id.unwrap();
        assert_eq!(h.plane.archiver().restore(&record_id).await.unwrap(), 5);
        assert_eq!(h.store.table_len("audit_log"), 6);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_source_rows() {
        let mut config = base_config();
        config.archive.policies = vec![ArchivePolicy::new("audit_log", 1)];
        let h = Harness::new(config);

        let old = Utc::now() - ChronoDuration::days(10);
        h.store
            .insert(vec![Row::new("audit_log", "a", json!({})).created_at(old)])
            .await
            .unwrap();
        h.store.set_fail_delete(true);

        let result = h.plane.archiver().run("audit_log").await;
        assert!(result.is_err());
        assert_eq!(h.store.table_len("audit_log"), 1);
        assert!(h.plane.archiver().records().is_empty());
    }
}
