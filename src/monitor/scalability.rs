//! Scalability Monitor
//!
//! Samples every component into the metric store, raises alerts against the
//! configured thresholds, runs their remediation once and renders the
//! dashboard. The alert book is mutated only here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::alert::{Alert, AlertBook, RemediationRecord, SeverityCounts};
use super::dashboard::{CategorySummary, ComponentSnapshot, Dashboard, Overview};
use super::health::{ComponentCheck, HealthReport, OverallHealth};
use super::metrics::MetricStore;
use super::threshold::{AutoFix, Remediation, Threshold};
use super::MonitorConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Where the monitor reads component state from
pub trait MetricsSource: Send + Sync {
    /// Current value of every tracked metric, dotted names
    fn sample(&self) -> Vec<(String, f64)>;

    fn snapshot(&self) -> ComponentSnapshot;

    fn readiness(&self) -> Vec<ComponentCheck>;
}

/// Executes `auto_fix` remediation
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Run one bounded repair, returning a short outcome description
    async fn apply(&self, fix: AutoFix) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub metrics_tracked: usize,
    pub samples: usize,
    pub alerts: usize,
    pub open_alerts: SeverityCounts,
    pub collections: u64,
    pub remediations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    collections: u64,
    remediations: u64,
}

pub struct ScalabilityMonitor {
    config: MonitorConfig,
    store: MetricStore,
    alerts: Mutex<AlertBook>,
    source: Option<Arc<dyn MetricsSource>>,
    remediator: Option<Arc<dyn Remediator>>,
    events: Option<Arc<dyn EventPublisher>>,
    counters: Mutex<Counters>,
}

impl ScalabilityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            store: MetricStore::new(config.max_samples_per_metric),
            alerts: Mutex::new(AlertBook::new(config.max_alerts)),
            config,
            source: None,
            remediator: None,
            events: None,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.remediator = Some(remediator);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn record_metric(&self, metric: &str, value: f64) {
        self.store.record(metric, value);
    }

    /// Sample the source and check thresholds; returns newly raised alerts
    #[instrument(skip(self))]
    pub async fn collect(&self) -> Vec<Alert> {
        let Some(source) = &self.source else {
            return Vec::new();
        };
        let sample = source.sample();
        self.counters.lock().collections += 1;
        debug!(metrics = sample.len(), "metrics collected");
        self.check_thresholds(&sample).await
    }

    /// Record `metrics` and evaluate every threshold watching one of them.
    ///
    /// A breach opens an alert unless the same threshold already has an
    /// open alert in the current cooldown period. Remediation runs once, on
    /// the alert that was opened.
    pub async fn check_thresholds(&self, metrics: &[(String, f64)]) -> Vec<Alert> {
        for (name, value) in metrics {
            self.store.record(name, *value);
        }

        let now = Utc::now();
        let mut raised = Vec::new();
        for threshold in &self.config.thresholds {
            if !metrics.iter().any(|(name, _)| name == &threshold.metric) {
                continue;
            }
            let Some(actual) = self.observed(threshold) else {
                continue;
            };
            if !threshold.operator.breached(actual, threshold.value) {
                continue;
            }
            if let Some(alert) = self.alerts.lock().raise(threshold, actual, now) {
                raised.push((alert, threshold.remediation.clone()));
            }
        }

        let mut opened = Vec::with_capacity(raised.len());
        for (alert, actions) in raised {
            warn!(
                alert = %alert.id,
                threshold = %alert.threshold_id,
                severity = %alert.severity,
                message = %alert.message,
                "alert raised"
            );
            self.publish(DomainEvent::AlertRaised {
                alert_id: alert.id.clone(),
                threshold_id: alert.threshold_id.clone(),
                category: alert.category.clone(),
                severity: alert.severity.to_string(),
                metric: alert.metric.clone(),
                threshold: alert.threshold,
                actual: alert.actual,
                timestamp: alert.created_at,
            })
            .await;

            let records = self.remediate(&alert, &actions).await;
            let mut book = self.alerts.lock();
            book.attach_remediation(&alert.id, records);
            opened.push(book.get(&alert.id).cloned().unwrap_or(alert));
        }
        opened
    }

    /// False when unknown or already resolved
    pub async fn resolve_alert(&self, id: &str) -> bool {
        let resolved = self.alerts.lock().resolve(id, Utc::now());
        if resolved {
            info!(alert = id, "alert resolved");
            self.publish(DomainEvent::AlertResolved {
                alert_id: id.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }
        resolved
    }

    pub fn alert(&self, id: &str) -> Option<Alert> {
        self.alerts.lock().get(id).cloned()
    }

    /// Newest first
    pub fn alerts(&self, include_resolved: bool) -> Vec<Alert> {
        self.alerts.lock().list(include_resolved)
    }

    pub fn overall_health(&self) -> OverallHealth {
        OverallHealth::from_open_alerts(&self.alerts.lock().open_counts())
    }

    pub fn dashboard(&self) -> Dashboard {
        let (open, total, top, per_category) = {
            let book = self.alerts.lock();
            let per_category: BTreeMap<String, usize> = self
                .store
                .categories()
                .into_iter()
                .map(|c| {
                    let n = book.open_in(&c);
                    (c, n)
                })
                .collect();
            (book.open_counts(), book.len(), book.top(self.config.top_alerts), per_category)
        };

        let categories = per_category
            .into_iter()
            .map(|(category, open_alerts)| CategorySummary {
                trend: self.store.category_trend(
                    &category,
                    self.config.trend_window,
                    self.config.trend_tolerance,
                ),
                latest: self.store.latest_in(&category),
                open_alerts,
                category,
            })
            .collect();

        let recent_metrics = self
            .store
            .metric_names()
            .into_iter()
            .map(|name| {
                let samples = self.store.recent(&name, self.config.recent_samples);
                (name, samples)
            })
            .collect();

        Dashboard {
            generated_at: Utc::now(),
            overview: Overview {
                health: OverallHealth::from_open_alerts(&open),
                open_alerts: open,
                total_alerts: total,
                metrics_tracked: self.store.len(),
                samples: self.store.sample_count(),
            },
            categories,
            top_alerts: top,
            recent_metrics,
            components: self
                .source
                .as_ref()
                .map(|s| s.snapshot())
                .unwrap_or_default(),
        }
    }

    /// Liveness is unconditional; readiness needs every component check
    pub fn health(&self) -> HealthReport {
        let checks = self
            .source
            .as_ref()
            .map(|s| s.readiness())
            .unwrap_or_default();
        HealthReport::new(true, self.overall_health(), checks)
    }

    pub fn stats(&self) -> MonitorStats {
        let (alerts, open_alerts) = {
            let book = self.alerts.lock();
            (book.len(), book.open_counts())
        };
        let counters = self.counters.lock();
        MonitorStats {
            metrics_tracked: self.store.len(),
            samples: self.store.sample_count(),
            alerts,
            open_alerts,
            collections: counters.collections,
            remediations: counters.remediations,
        }
    }

    fn observed(&self, threshold: &Threshold) -> Option<f64> {
        match threshold.window {
            Some(window) if window > 1 => self.store.rolling_mean(&threshold.metric, window),
            _ => self.store.latest(&threshold.metric),
        }
    }

    async fn remediate(&self, alert: &Alert, actions: &[Remediation]) -> Vec<RemediationRecord> {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            let (succeeded, outcome) = match action {
                Remediation::AutoFix { fix } => match &self.remediator {
                    Some(remediator) => match remediator.apply(*fix).await {
                        Ok(outcome) => (true, outcome),
                        Err(e) => {
                            warn!(alert = %alert.id, %fix, error = %e, "auto fix failed");
                            (false, e.to_string())
                        }
                    },
                    None => (false, "no remediator configured".to_string()),
                },
                Remediation::Notification | Remediation::Escalation => {
                    let escalated = matches!(action, Remediation::Escalation);
                    self.publish(DomainEvent::AlertNotification {
                        alert_id: alert.id.clone(),
                        severity: alert.severity.to_string(),
                        message: alert.message.clone(),
                        escalated,
                        timestamp: Utc::now(),
                    })
                    .await;
                    (true, if escalated { "escalated" } else { "notified" }.to_string())
                }
            };

            self.publish(DomainEvent::RemediationExecuted {
                alert_id: alert.id.clone(),
                action: action.to_string(),
                outcome: outcome.clone(),
                timestamp: Utc::now(),
            })
            .await;
            self.counters.lock().remediations += 1;
            records.push(RemediationRecord {
                action: *action,
                succeeded,
                outcome,
                executed_at: Utc::now(),
            });
        }
        records
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.publish(event).await {
                debug!(error = %e, "failed to publish monitor event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::monitor::health::Trend;
    use crate::monitor::threshold::{Operator, Severity};

    #[derive(Default)]
    struct CountingRemediator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Remediator for CountingRemediator {
        async fn apply(&self, fix: AutoFix) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{fix} done"))
        }
    }

    struct FixedSource(Mutex<Vec<(String, f64)>>);

    impl MetricsSource for FixedSource {
        fn sample(&self) -> Vec<(String, f64)> {
            self.0.lock().clone()
        }

        fn snapshot(&self) -> ComponentSnapshot {
            ComponentSnapshot::default()
        }

        fn readiness(&self) -> Vec<ComponentCheck> {
            vec![ComponentCheck::new("fixed", true, "ok")]
        }
    }

    fn config(thresholds: Vec<Threshold>) -> MonitorConfig {
        MonitorConfig {
            thresholds,
            ..Default::default()
        }
    }

    fn low_hit_rate() -> Threshold {
        Threshold::new("low-hit", "cache.hit_rate", Operator::Lt, 0.5, Severity::Warning)
            .with_cooldown(Duration::from_secs(3600))
            .remediate(Remediation::AutoFix {
                fix: AutoFix::OptimizeCache,
            })
    }

    fn metric(name: &str, value: f64) -> Vec<(String, f64)> {
        vec![(name.to_string(), value)]
    }

    #[tokio::test]
    async fn test_breach_raises_once_and_remediates_once() {
        let remediator = Arc::new(CountingRemediator::default());
        let events = Arc::new(InMemoryEventCollector::new());
        let monitor = ScalabilityMonitor::new(config(vec![low_hit_rate()]))
            .with_remediator(remediator.clone())
            .with_events(events.clone());

        let raised = monitor.check_thresholds(&metric("cache.hit_rate", 0.2)).await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].remediation.len(), 1);
        assert!(raised[0].remediation[0].succeeded);

        let again = monitor.check_thresholds(&metric("cache.hit_rate", 0.1)).await;
        assert!(again.is_empty());
        assert_eq!(remediator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.events_of_type("AlertRaised").len(), 1);
        assert_eq!(events.events_of_type("RemediationExecuted").len(), 1);
    }

    #[tokio::test]
    async fn test_no_breach_no_alert() {
        let monitor = ScalabilityMonitor::new(config(vec![low_hit_rate()]));
        assert!(monitor.check_thresholds(&metric("cache.hit_rate", 0.9)).await.is_empty());
        assert!(monitor.check_thresholds(&metric("pool.waiting", 0.0)).await.is_empty());
        assert_eq!(monitor.overall_health(), OverallHealth::Excellent);
    }

    #[tokio::test]
    async fn test_rolling_window_smooths_spikes() {
        let threshold = Threshold::new("busy", "pool.utilization", Operator::Gt, 0.9, Severity::Error)
            .with_window(3);
        let monitor = ScalabilityMonitor::new(config(vec![threshold]));

        monitor.record_metric("pool.utilization", 0.5);
        monitor.record_metric("pool.utilization", 0.5);
        assert!(monitor.check_thresholds(&metric("pool.utilization", 1.0)).await.is_empty());

        monitor.check_thresholds(&metric("pool.utilization", 1.0)).await;
        let raised = monitor.check_thresholds(&metric("pool.utilization", 1.0)).await;
        assert_eq!(raised.len(), 1);
        assert_eq!(monitor.overall_health(), OverallHealth::Poor);
    }

    #[tokio::test]
    async fn test_resolve_alert_idempotent() {
        let events = Arc::new(InMemoryEventCollector::new());
        let monitor = ScalabilityMonitor::new(config(vec![low_hit_rate()])).with_events(events.clone());
        let alert = monitor
            .check_thresholds(&metric("cache.hit_rate", 0.2))
            .await
            .remove(0);
        assert_eq!(alert.remediation[0].outcome, "no remediator configured");

        assert!(monitor.resolve_alert(&alert.id).await);
        assert!(!monitor.resolve_alert(&alert.id).await);
        assert_eq!(events.events_of_type("AlertResolved").len(), 1);
        assert!(monitor.alerts(false).is_empty());
        assert_eq!(monitor.alerts(true).len(), 1);
    }

    #[tokio::test]
    async fn test_notification_and_escalation_publish() {
        let events = Arc::new(InMemoryEventCollector::new());
        let threshold = Threshold::new("down", "balancer.healthy_ratio", Operator::Lt, 0.5, Severity::Critical)
            .remediate(Remediation::Notification)
            .remediate(Remediation::Escalation);
        let monitor = ScalabilityMonitor::new(config(vec![threshold])).with_events(events.clone());

        monitor.check_thresholds(&metric("balancer.healthy_ratio", 0.0)).await;
        let notifications = events.events_of_type("AlertNotification");
        assert_eq!(notifications.len(), 2);
        assert!(notifications
            .iter()
            .any(|e| matches!(e, DomainEvent::AlertNotification { escalated: true, .. })));
        assert_eq!(monitor.overall_health(), OverallHealth::Critical);
    }

    #[tokio::test]
    async fn test_collect_and_dashboard() {
        let source = Arc::new(FixedSource(Mutex::new(vec![
            ("cache.hit_rate".to_string(), 0.2),
            ("pool.utilization".to_string(), 0.4),
        ])));
        let monitor = ScalabilityMonitor::new(config(vec![low_hit_rate()])).with_source(source.clone());

        for _ in 0..5 {
            monitor.collect().await;
        }
        *source.0.lock() = vec![
            ("cache.hit_rate".to_string(), 0.2),
            ("pool.utilization".to_string(), 0.8),
        ];
        for _ in 0..5 {
            monitor.collect().await;
        }

        let dashboard = monitor.dashboard();
        assert_eq!(dashboard.overview.health, OverallHealth::Good);
        assert_eq!(dashboard.overview.open_alerts.warning, 1);
        assert_eq!(dashboard.top_alerts.len(), 1);

        let pool = dashboard.categories.iter().find(|c| c.category == "pool").unwrap();
        assert_eq!(pool.trend, Trend::Up);
        assert_eq!(pool.latest["pool.utilization"], 0.8);
        let cache = dashboard.categories.iter().find(|c| c.category == "cache").unwrap();
        assert_eq!(cache.trend, Trend::Stable);
        assert_eq!(cache.open_alerts, 1);

        assert_eq!(dashboard.recent_metrics["cache.hit_rate"].len(), 10);
        assert_eq!(monitor.stats().collections, 10);
        assert!(monitor.health().ready);
    }
}
