//! Prometheus Exporter
//!
//! Gauges refreshed from component statistics and rendered in the text
//! exposition format for `/metrics`. The exporter owns its registry so
//! several control planes can coexist in one process.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::monitor::{ComponentSnapshot, MonitorStats};

const NAMESPACE: &str = "scaleplane";

pub struct PrometheusExporter {
    registry: Registry,
    cache_entries: IntGaugeVec,
    cache_hit_rate: GaugeVec,
    cache_evictions: IntGaugeVec,
    pool_connections: IntGaugeVec,
    pool_waiting: IntGaugeVec,
    pool_timeouts: IntGaugeVec,
    instances: IntGaugeVec,
    circuits: IntGaugeVec,
    balancer_requests: IntGauge,
    balancer_error_rate: Gauge,
    balancer_rejected: IntGauge,
    autoscale_actions: IntGaugeVec,
    subscription_buffered: IntGauge,
    archive_rows: IntGauge,
    alerts_open: IntGaugeVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cache_entries = IntGaugeVec::new(opts("cache_entries", "Live entries per cache layer"), &["layer"])?;
        let cache_hit_rate = GaugeVec::new(opts("cache_hit_rate", "Hit rate per cache layer"), &["layer"])?;
        let cache_evictions = IntGaugeVec::new(
            opts("cache_evictions", "LRU evictions per cache layer since start"),
            &["layer"],
        )?;
        let pool_connections = IntGaugeVec::new(
            opts("pool_connections", "Pooled connections by state"),
            &["pool", "state"],
        )?;
        let pool_waiting = IntGaugeVec::new(opts("pool_waiting", "Queued acquire calls"), &["pool"])?;
        let pool_timeouts = IntGaugeVec::new(
            opts("pool_acquire_timeouts", "Acquire calls that timed out since start"),
            &["pool"],
        )?;
        let instances = IntGaugeVec::new(opts("instances", "Registered instances by status"), &["status"])?;
        let circuits = IntGaugeVec::new(opts("circuits", "Circuit breakers by state"), &["state"])?;
        let balancer_requests = IntGauge::with_opts(opts("balancer_requests", "Requests routed since start"))?;
        let balancer_error_rate = Gauge::with_opts(opts("balancer_error_rate", "Failed over completed requests"))?;
        let balancer_rejected = IntGauge::with_opts(opts(
            "balancer_rejected_requests",
            "Calls refused by an open circuit since start",
        ))?;
        let autoscale_actions = IntGaugeVec::new(
            opts("autoscale_actions", "Scaling actions executed since start"),
            &["action"],
        )?;
        let subscription_buffered = IntGauge::with_opts(opts(
            "subscription_buffered_events",
            "Change events waiting in stream buffers",
        ))?;
        let archive_rows = IntGauge::with_opts(opts("archive_rows_archived", "Rows archived since start"))?;
        let alerts_open = IntGaugeVec::new(opts("alerts_open", "Open alerts by severity"), &["severity"])?;

        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;
        registry.register(Box::new(pool_waiting.clone()))?;
        registry.register(Box::new(pool_timeouts.clone()))?;
        registry.register(Box::new(instances.clone()))?;
        registry.register(Box::new(circuits.clone()))?;
        registry.register(Box::new(balancer_requests.clone()))?;
        registry.register(Box::new(balancer_error_rate.clone()))?;
        registry.register(Box::new(balancer_rejected.clone()))?;
        registry.register(Box::new(autoscale_actions.clone()))?;
        registry.register(Box::new(subscription_buffered.clone()))?;
        registry.register(Box::new(archive_rows.clone()))?;
        registry.register(Box::new(alerts_open.clone()))?;

        Ok(Self {
            registry,
            cache_entries,
            cache_hit_rate,
            cache_evictions,
            pool_connections,
            pool_waiting,
            pool_timeouts,
            instances,
            circuits,
            balancer_requests,
            balancer_error_rate,
            balancer_rejected,
            autoscale_actions,
            subscription_buffered,
            archive_rows,
            alerts_open,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Overwrite every gauge from a fresh snapshot
    pub fn update(&self, snapshot: &ComponentSnapshot, monitor: &MonitorStats) {
        self.cache_entries.reset();
        self.cache_hit_rate.reset();
        self.cache_evictions.reset();
        if let Some(cache) = &snapshot.cache {
            for layer in &cache.layers {
                let label = [layer.name.as_str()];
                self.cache_entries.with_label_values(&label).set(layer.entries as i64);
                self.cache_hit_rate.with_label_values(&label).set(layer.counters.hit_rate);
                self.cache_evictions
                    .with_label_values(&label)
                    .set(layer.counters.evictions as i64);
            }
        }

        self.pool_connections.reset();
        self.pool_waiting.reset();
        self.pool_timeouts.reset();
        for pool in &snapshot.pools {
            let name = pool.name.as_str();
            self.pool_connections
                .with_label_values(&[name, "active"])
                .set(pool.active as i64);
            self.pool_connections
                .with_label_values(&[name, "idle"])
                .set(pool.idle as i64);
            self.pool_waiting.with_label_values(&[name]).set(pool.waiting as i64);
            self.pool_timeouts.with_label_values(&[name]).set(pool.timeouts as i64);
        }

        if let Some(balancer) = &snapshot.balancer {
            for (status, n) in [
                ("healthy", balancer.healthy),
                ("unhealthy", balancer.unhealthy),
                ("offline", balancer.offline),
                ("draining", balancer.draining),
            ] {
                self.instances.with_label_values(&[status]).set(n as i64);
            }
            for (state, n) in [
                ("closed", balancer.circuits_closed),
                ("open", balancer.circuits_open),
                ("half_open", balancer.circuits_half_open),
            ] {
                self.circuits.with_label_values(&[state]).set(n as i64);
            }
            self.balancer_requests.set(balancer.total_requests as i64);
            self.balancer_error_rate.set(balancer.error_rate);
            self.balancer_rejected.set(balancer.rejected_requests as i64);
        }

        if let Some(autoscale) = &snapshot.autoscale {
            for (action, n) in [
                ("scale_up", autoscale.scale_ups),
                ("scale_down", autoscale.scale_downs),
                ("failed", autoscale.failures),
            ] {
                self.autoscale_actions.with_label_values(&[action]).set(n as i64);
            }
        }

        if let Some(subscriptions) = &snapshot.subscriptions {
            self.subscription_buffered.set(subscriptions.buffered as i64);
        }
        if let Some(archive) = &snapshot.archive {
            self.archive_rows.set(archive.rows_archived as i64);
        }

        let open = &monitor.open_alerts;
        for (severity, n) in [
            ("critical", open.critical),
            ("error", open.error),
            ("warning", open.warning),
            ("info", open.info),
        ] {
            self.alerts_open.with_label_values(&[severity]).set(n as i64);
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics output not utf-8: {e}")))
    }

    pub fn content_type(&self) -> &'static str {
        "text/plain; version=0.0.4"
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SeverityCounts;
    use crate::pool::PoolStats;

    fn monitor_stats(warning: usize) -> MonitorStats {
        MonitorStats {
            metrics_tracked: 0,
            samples: 0,
            alerts: warning,
            open_alerts: SeverityCounts {
                warning,
                ..Default::default()
            },
            collections: 0,
            remediations: 0,
        }
    }

    fn pool(name: &str, active: usize, idle: usize) -> PoolStats {
        PoolStats {
            name: name.to_string(),
            total: active + idle,
            active,
            idle,
            pending_creates: 0,
            waiting: 3,
            min: 0,
            max: 10,
            utilization: active as f64 / 10.0,
            acquired: 0,
            created: 0,
            destroyed: 0,
            errors: 0,
            timeouts: 1,
            health_failures: 0,
            avg_wait_ms: 0.0,
            closed: false,
        }
    }

    #[test]
    fn test_render_contains_component_gauges() {
        let exporter = PrometheusExporter::new().unwrap();
        let snapshot = ComponentSnapshot {
            pools: vec![pool("admin", 2, 1)],
            ..Default::default()
        };
        exporter.update(&snapshot, &monitor_stats(2));

        let text = exporter.render().unwrap();
        assert!(text.contains(r#"scaleplane_pool_connections{pool="admin",state="active"} 2"#));
        assert!(text.contains(r#"scaleplane_pool_waiting{pool="admin"} 3"#));
        assert!(text.contains(r#"scaleplane_alerts_open{severity="warning"} 2"#));
    }

    #[test]
    fn test_stale_labels_are_dropped() {
        let exporter = PrometheusExporter::new().unwrap();
        exporter.update(
            &ComponentSnapshot {
                pools: vec![pool("reporting", 1, 0)],
                ..Default::default()
            },
            &monitor_stats(0),
        );
        exporter.update(&ComponentSnapshot::default(), &monitor_stats(0));
        assert!(!exporter.render().unwrap().contains("reporting"));
    }

    #[test]
    fn test_independent_registries() {
        assert!(PrometheusExporter::new().is_ok());
        assert!(PrometheusExporter::new().is_ok());
    }
}
