//! Alerts
//!
//! The book owns every alert, keyed by id, plus the dedupe index that
//! collapses repeated breaches of one threshold inside its cooldown period.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::threshold::{Remediation, Severity, Threshold};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub action: Remediation,
    pub succeeded: bool,
    pub outcome: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub threshold_id: String,
    pub dedupe_key: String,
    pub category: String,
    pub severity: Severity,
    pub metric: String,
    pub threshold: f64,
    pub actual: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub remediation: Vec<RemediationRecord>,
}

impl Alert {
    fn raise(threshold: &Threshold, actual: f64, dedupe_key: String, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("alert-{}", Uuid::new_v4()),
            threshold_id: threshold.id.clone(),
            dedupe_key,
            category: threshold.category().to_string(),
            severity: threshold.severity,
            metric: threshold.metric.clone(),
            threshold: threshold.value,
            actual,
            message: threshold.describe(actual),
            created_at: now,
            resolved: false,
            resolved_at: None,
            remediation: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.error + self.warning + self.info
    }
}

#[derive(Debug)]
pub struct AlertBook {
    max_alerts: usize,
    alerts: HashMap<String, Alert>,
    by_key: HashMap<String, String>,
}

impl AlertBook {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            max_alerts: max_alerts.max(1),
            alerts: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Open an alert unless one with the same dedupe key is still open
    pub fn raise(&mut self, threshold: &Threshold, actual: f64, now: DateTime<Utc>) -> Option<Alert> {
        let key = threshold.dedupe_key(now.timestamp_millis());
        if let Some(existing) = self.by_key.get(&key).and_then(|id| self.alerts.get(id)) {
            if !existing.resolved {
                return None;
            }
        }

        let alert = Alert::raise(threshold, actual, key.clone(), now);
        self.by_key.insert(key, alert.id.clone());
        self.alerts.insert(alert.id.clone(), alert.clone());
        self.prune();
        Some(alert)
    }

    /// False if unknown or already resolved
    pub fn resolve(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.alerts.get_mut(id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                alert.resolved_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn attach_remediation(&mut self, id: &str, records: Vec<RemediationRecord>) {
        if let Some(alert) = self.alerts.get_mut(id) {
            alert.remediation.extend(records);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.get(id)
    }

    /// Newest first
    pub fn list(&self, include_resolved: bool) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .values()
            .filter(|a| include_resolved || !a.resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Open alerts ranked by severity, then recency
    pub fn top(&self, n: usize) -> Vec<Alert> {
        let mut open: Vec<&Alert> = self.alerts.values().filter(|a| !a.resolved).collect();
        open.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        open.into_iter().take(n).cloned().collect()
    }

    pub fn open_counts(&self) -> SeverityCounts {
        let mut counts = SeverityCounts::default();
        for alert in self.alerts.values().filter(|a| !a.resolved) {
            counts.add(alert.severity);
        }
        counts
    }

    pub fn open_in(&self, category: &str) -> usize {
        self.alerts
            .values()
            .filter(|a| !a.resolved && a.category == category)
            .count()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Drop alerts beyond the bound: oldest resolved first, then oldest open
    pub fn prune(&mut self) -> usize {
        let excess = self.alerts.len().saturating_sub(self.max_alerts);
        if excess == 0 {
            return 0;
        }

        let mut victims: Vec<(bool, DateTime<Utc>, String)> = self
            .alerts
            .values()
            .map(|a| (!a.resolved, a.created_at, a.id.clone()))
            .collect();
        // resolved (false) sorts before open (true), then oldest first
        victims.sort();

        for (_, _, id) in victims.into_iter().take(excess) {
            if let Some(alert) = self.alerts.remove(&id) {
                if self.by_key.get(&alert.dedupe_key) == Some(&alert.id) {
                    self.by_key.remove(&alert.dedupe_key);
                }
            }
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::monitor::threshold::Operator;

    fn threshold(id: &str, severity: Severity) -> Threshold {
        Threshold::new(id, "cache.hit_rate", Operator::Lt, 0.5, severity)
            .with_cooldown(Duration::from_secs(60))
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_breaches_collapse_within_period() {
        let mut book = AlertBook::new(100);
        let t = threshold("low-hit", Severity::Warning);

        assert!(book.raise(&t, 0.3, at(0)).is_some());
        assert!(book.raise(&t, 0.2, at(30_000)).is_none());
        assert!(book.raise(&t, 0.2, at(60_000)).is_some());
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut book = AlertBook::new(100);
        let alert = book.raise(&threshold("t", Severity::Error), 0.1, at(0)).unwrap();

        assert!(book.resolve(&alert.id, at(1)));
        assert!(!book.resolve(&alert.id, at(2)));
        assert!(!book.resolve("missing", at(2)));
        assert!(book.get(&alert.id).unwrap().resolved);
        assert_eq!(book.open_counts().total(), 0);
    }

    #[test]
    fn test_resolved_alert_allows_new_one_in_same_period() {
        let mut book = AlertBook::new(100);
        let t = threshold("t", Severity::Warning);
        let first = book.raise(&t, 0.1, at(0)).unwrap();
        book.resolve(&first.id, at(1));
        assert!(book.raise(&t, 0.1, at(2)).is_some());
    }

    #[test]
    fn test_top_ranks_severity_then_recency() {
        let mut book = AlertBook::new(100);
        let base = Utc::now();
        book.raise(&threshold("w-old", Severity::Warning), 0.1, base);
        book.raise(&threshold("c", Severity::Critical), 0.1, base);
        book.raise(&threshold("w-new", Severity::Warning), 0.1, base + ChronoDuration::seconds(5));
        book.raise(&threshold("i", Severity::Info), 0.1, base + ChronoDuration::seconds(9));

        let ranked: Vec<String> = book.top(3).into_iter().map(|a| a.threshold_id).collect();
        assert_eq!(ranked, vec!["c", "w-new", "w-old"]);
    }

    #[test]
    fn test_prune_drops_resolved_first() {
        let mut book = AlertBook::new(2);
        let a = book.raise(&threshold("a", Severity::Warning), 0.1, at(0)).unwrap();
        let b = book.raise(&threshold("b", Severity::Warning), 0.1, at(1)).unwrap();
        book.resolve(&b.id, at(2));

        let c = book.raise(&threshold("c", Severity::Warning), 0.1, at(3)).unwrap();
        assert_eq!(book.len(), 2);
        assert!(book.get(&a.id).is_some());
        assert!(book.get(&b.id).is_none());
        assert!(book.get(&c.id).is_some());
    }
}
