//! Archiver
//!
//! Runs retention jobs against the backing data store:
//!
//! 1. Count rows matching the policy condition
//! 2. Page through them in `batch_size` chunks (cancellation is checked
//!    between pages)
//! 3. Serialize, optionally compress, and keep the archive record
//! 4. Delete the source rows matching the same condition
//!
//! Source rows are only deleted after steps 1-3 succeed. A job that fails
//! or is cancelled leaves them untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::job::{ArchiveJob, ArchivePolicy, ArchiveRecord, JobStatus};
use crate::compression::{Codec, CompressionAlgorithm};
use crate::config::duration_ms;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{DataStore, EventPublisher, Row, RowFilter, RowQuery};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub policies: Vec<ArchivePolicy>,
    /// How often due policies are run
    #[serde(with = "duration_ms")]
    pub schedule_interval: Duration,
    /// Terminal jobs kept for inspection
    pub job_history_limit: usize,
    /// Payloads smaller than this are stored uncompressed
    pub compression_min_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            schedule_interval: Duration::from_secs(3600),
            job_history_limit: 100,
            compression_min_size: 256,
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schedule_interval.is_zero() || self.job_history_limit == 0 {
            return Err(Error::Config(
                "archive schedule_interval and job_history_limit must be positive".to_string(),
            ));
        }
        let mut tables = std::collections::HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !tables.insert(policy.table.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate archive policy for table '{}'",
                    policy.table
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiverStats {
    pub policies: usize,
    pub jobs: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub records: usize,
    pub rows_archived: u64,
    pub bytes_original: u64,
    pub bytes_stored: u64,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Totals {
    completed: u64,
    failed: u64,
    cancelled: u64,
    rows_archived: u64,
    last_run: Option<DateTime<Utc>>,
}

// =============================================================================
// Archiver
// =============================================================================

pub struct Archiver {
    config: ArchiveConfig,
    store: Arc<dyn DataStore>,
    codec: Codec,
    jobs: DashMap<String, ArchiveJob>,
    /// Job ids in creation order
    order: Mutex<VecDeque<String>>,
    cancel_requested: DashSet<String>,
    records: DashMap<String, ArchiveRecord>,
    events: Option<Arc<dyn EventPublisher>>,
    totals: Mutex<Totals>,
}

impl Archiver {
    pub fn new(config: ArchiveConfig, store: Arc<dyn DataStore>) -> Self {
        Self {
            codec: Codec::new(config.compression_min_size),
            config,
            store,
            jobs: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            cancel_requested: DashSet::new(),
            records: DashMap::new(),
            events: None,
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn policy(&self, table: &str) -> Result<&ArchivePolicy> {
        self.config
            .policies
            .iter()
            .find(|p| p.table == table)
            .ok_or_else(|| Error::ArchivePolicyNotFound(table.to_string()))
    }

    /// Create a pending job for `table` without running it
    pub fn submit(&self, table: &str) -> Result<String> {
        let policy = self.policy(table)?;
        let job = ArchiveJob::new(table, policy.condition(Utc::now()));
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        self.order.lock().push_back(id.clone());
        debug!(job = %id, table, "archive job submitted");
        Ok(id)
    }

    /// Create and run a job for `table`
    pub async fn run(&self, table: &str) -> Result<ArchiveJob> {
        let id = self.submit(table)?;
        self.execute(&id).await
    }

    /// Run a pending job to a terminal state.
    ///
    /// Returns the final job on completion or cancellation;
    /// `ArchiveJobFailure` if any step failed.
    #[instrument(skip(self), fields(table = tracing::field::Empty))]
    pub async fn execute(&self, job_id: &str) -> Result<ArchiveJob> {
        let (table, condition) = self.update_job(job_id, |job| {
            job.transition(JobStatus::Running, "job started")?;
            Ok((job.table.clone(), job.condition.clone()))
        })?;
        tracing::Span::current().record("table", table.as_str());
        let policy = self.policy(&table)?.clone();
        info!(job = job_id, %table, "archive job started");

        let outcome = self.archive_rows(job_id, &policy, &condition).await;
        self.cancel_requested.remove(job_id);

        let job = match outcome {
            Ok(Some(produced)) => {
                let record_id = produced.map(|r| r.id);
                let job = self.update_job(job_id, |job| {
                    job.record_id = record_id;
                    job.transition(JobStatus::Completed, "source rows archived and deleted")?;
                    Ok(job.clone())
                })?;
                {
                    let mut totals = self.totals.lock();
                    totals.completed += 1;
                    totals.rows_archived += job.rows_processed;
                    totals.last_run = Some(Utc::now());
                }
                info!(
                    job = job_id,
                    table = %job.table,
                    rows = job.rows_processed,
                    record = ?job.record_id,
                    "archive job completed"
                );
                self.publish(DomainEvent::ArchiveCompleted {
                    job_id: job.id.clone(),
                    table: job.table.clone(),
                    rows_archived: job.rows_processed,
                    record_id: job.record_id.clone(),
                    duration_ms: job.duration_ms(),
                    timestamp: Utc::now(),
                })
                .await;
                job
            }
            Ok(None) => {
                let job = self.update_job(job_id, |job| {
                    if job.status == JobStatus::Running {
                        job.transition(JobStatus::Cancelled, "cancelled between batches")?;
                    }
                    Ok(job.clone())
                })?;
                self.totals.lock().cancelled += 1;
                info!(job = job_id, table = %job.table, "archive job cancelled");
                job
            }
            Err(e) => {
                let reason = e.to_string();
                self.update_job(job_id, |job| job.fail(&reason))?;
                {
                    let mut totals = self.totals.lock();
                    totals.failed += 1;
                    totals.last_run = Some(Utc::now());
                }
                warn!(job = job_id, %table, error = %reason, "archive job failed, source rows untouched");
                self.publish(DomainEvent::ArchiveFailed {
                    job_id: job_id.to_string(),
                    table: table.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                })
                .await;
                self.prune_history();
                return Err(Error::ArchiveJobFailure {
                    job_id: job_id.to_string(),
                    reason,
                });
            }
        };

        self.prune_history();
        Ok(job)
    }

    /// `Ok(None)` when cancelled; `Ok(Some(None))` when nothing matched
    async fn archive_rows(
        &self,
        job_id: &str,
        policy: &ArchivePolicy,
        condition: &RowFilter,
    ) -> Result<Option<Option<ArchiveRecord>>> {
        let table = policy.table.as_str();
        let matched = self.store.count(table, condition).await?;
        self.update_job(job_id, |job| {
            job.rows_matched = matched;
            Ok(())
        })?;
        if matched == 0 {
            return Ok(Some(None));
        }

        let mut rows: Vec<Row> = Vec::with_capacity(matched as usize);
        let mut seen: HashSet<String> = HashSet::with_capacity(matched as usize);
        let mut offset = 0;
        loop {
            if self.cancel_requested.contains(job_id) {
                return Ok(None);
            }
            let page = RowQuery::page(condition.clone(), offset, policy.batch_size);
            let batch = self.store.fetch(table, &page).await?;
            let fetched = batch.len();
            offset += fetched;
            // Rows inserted mid-job shift the pages; keep one copy of each
            rows.extend(batch.into_iter().filter(|r| seen.insert(r.id.clone())));
            self.update_job(job_id, |job| {
                job.batches += 1;
                job.rows_processed = rows.len() as u64;
                Ok(())
            })?;
            debug!(job = job_id, fetched, total = rows.len(), "archive batch fetched");

            if fetched < policy.batch_size || rows.len() as u64 >= matched {
                break;
            }
        }
        if self.cancel_requested.contains(job_id) {
            return Ok(None);
        }

        let raw = serde_json::to_vec(&rows)?;
        let (payload, compression) = if policy.compress {
            self.codec.compress(&raw)
        } else {
            (bytes::Bytes::from(raw.clone()), CompressionAlgorithm::None)
        };
        let record = {
            let job = self
                .jobs
                .get(job_id)
                .ok_or_else(|| Error::ArchiveJobNotFound(job_id.to_string()))?;
            ArchiveRecord::new(&job, rows.len() as u64, raw.len(), payload, compression)
        };
        self.records.insert(record.id.clone(), record.clone());

        // Only what was archived; rows that started matching later stay
        let archived = condition.clone().only_ids(rows.iter().map(|r| r.id.clone()));
        match self.store.delete(table, &archived).await {
            Ok(deleted) => {
                if deleted != rows.len() as u64 {
                    warn!(job = job_id, archived = rows.len(), deleted, "archived and deleted row counts differ");
                }
                self.update_job(job_id, |job| {
                    job.rows_deleted = deleted;
                    Ok(())
                })?;
                Ok(Some(Some(record)))
            }
            Err(e) => {
                // rows are still at the source; the record would duplicate them
                self.records.remove(&record.id);
                Err(e)
            }
        }
    }

    /// Cancel a pending or running job.
    ///
    /// A running job stops before its next batch.
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::ArchiveJobNotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Pending => {
                job.transition(JobStatus::Cancelled, "cancelled before start")?;
                self.totals.lock().cancelled += 1;
                info!(job = job_id, "archive job cancelled");
                Ok(())
            }
            JobStatus::Running => {
                self.cancel_requested.insert(job_id.to_string());
                info!(job = job_id, "archive job cancellation requested");
                Ok(())
            }
            status => Err(Error::InvalidJobTransition {
                from: status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            }),
        }
    }

    /// Reinsert archived rows and drop the record; returns rows restored
    #[instrument(skip(self))]
    pub async fn restore(&self, record_id: &str) -> Result<u64> {
        let record = self
            .records
            .get(record_id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::ArchiveRecordNotFound(record_id.to_string()))?;

        let raw = self.codec.decompress(&record.payload, record.compression)?;
        let rows: Vec<Row> = serde_json::from_slice(&raw)?;
        let inserted = self.store.insert(rows).await?;
        self.records.remove(record_id);
        info!(record = record_id, table = %record.table, rows = inserted, "archive restored");
        Ok(inserted)
    }

    /// Run every enabled policy that has no job in flight
    pub async fn run_due(&self) -> Vec<Result<ArchiveJob>> {
        let mut results = Vec::new();
        for policy in self.config.policies.iter().filter(|p| p.enabled) {
            if self.is_running(&policy.table) {
                debug!(table = %policy.table, "archive job already running, skipping");
                continue;
            }
            results.push(self.run(&policy.table).await);
        }
        results
    }

    pub fn is_running(&self, table: &str) -> bool {
        self.jobs
            .iter()
            .any(|j| j.table == table && !j.is_terminal())
    }

    pub fn job(&self, id: &str) -> Option<ArchiveJob> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Newest first
    pub fn jobs(&self) -> Vec<ArchiveJob> {
        self.order
            .lock()
            .iter()
            .rev()
            .filter_map(|id| self.job(id))
            .collect()
    }

    pub fn record(&self, id: &str) -> Option<ArchiveRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<ArchiveRecord> {
        let mut records: Vec<ArchiveRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn stats(&self) -> ArchiverStats {
        let (bytes_original, bytes_stored) = self.records.iter().fold((0u64, 0u64), |acc, r| {
            (acc.0 + r.original_bytes as u64, acc.1 + r.stored_bytes as u64)
        });
        let totals = self.totals.lock();
        ArchiverStats {
            policies: self.config.policies.len(),
            jobs: self.jobs.len(),
            running: self
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Running)
                .count(),
            completed: totals.completed,
            failed: totals.failed,
            cancelled: totals.cancelled,
            records: self.records.len(),
            rows_archived: totals.rows_archived,
            bytes_original,
            bytes_stored,
            last_run: totals.last_run,
        }
    }

    fn update_job<T>(&self, job_id: &str, f: impl FnOnce(&mut ArchiveJob) -> Result<T>) -> Result<T> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::ArchiveJobNotFound(job_id.to_string()))?;
        f(&mut job)
    }

    /// Drop the oldest terminal jobs beyond the history limit
    fn prune_history(&self) {
        let mut order = self.order.lock();
        let mut excess = order.len().saturating_sub(self.config.job_history_limit);
        if excess == 0 {
            return;
        }
        order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let terminal = self.jobs.get(id).map(|j| j.is_terminal()).unwrap_or(true);
            if terminal {
                self.jobs.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.publish(event).await {
                debug!(error = %e, "failed to publish archive event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory_store::InMemoryDataStore;

    fn config(policies: Vec<ArchivePolicy>) -> ArchiveConfig {
        ArchiveConfig {
            policies,
            ..Default::default()
        }
    }

    async fn seeded(old: usize, fresh: usize) -> Arc<InMemoryDataStore> {
        let store = Arc::new(InMemoryDataStore::new());
        let past = Utc::now() - ChronoDuration::days(60);
        let mut rows = Vec::new();
        for i in 0..old {
            rows.push(
                Row::new("audit_log", format!("old-{i}"), json!({"action": "login", "n": i}))
                    .created_at(past),
            );
        }
        for i in 0..fresh {
            rows.push(Row::new("audit_log", format!("new-{i}"), json!({"action": "login"})));
        }
        store.insert(rows).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_job_archives_then_deletes() {
        let store = seeded(25, 5).await;
        let events = Arc::new(InMemoryEventCollector::new());
        let archiver = Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30).batch_size(10)]),
            store.clone(),
        )
        .with_events(events.clone());

        let job = archiver.run("audit_log").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_matched, 25);
        assert_eq!(job.rows_processed, 25);
        assert_eq!(job.batches, 3);
        assert_eq!(job.rows_deleted, 25);
        assert_eq!(store.table_len("audit_log"), 5);

        let record = archiver.record(job.record_id.as_deref().unwrap()).unwrap();
        assert_eq!(record.row_count, 25);
        assert_eq!(record.compression, CompressionAlgorithm::Lz4);
        assert!(record.stored_bytes < record.original_bytes);
        assert_eq!(events.events_of_type("ArchiveCompleted").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_arriving_mid_job_are_not_deleted() {
        let store = Arc::new(InMemoryDataStore::new().with_latency(Duration::from_millis(10)));
        let past = Utc::now() - ChronoDuration::days(60);
        let rows = (0..4)
            .map(|i| Row::new("audit_log", format!("old-{i}"), json!({"n": i})).created_at(past))
            .collect();
        store.insert(rows).await.unwrap();

        let archiver = Arc::new(Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30).batch_size(2)]),
            store.clone(),
        ));
        let job = {
            let archiver = archiver.clone();
            tokio::spawn(async move { archiver.run("audit_log").await })
        };

        // Lands between the first and second page, older than every row
        tokio::time::sleep(Duration::from_millis(15)).await;
        let late = Row::new("audit_log", "late", json!({"n": -1}))
            .created_at(past - ChronoDuration::days(1));
        store.insert(vec![late]).await.unwrap();

        let job = job.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 4);
        assert_eq!(job.rows_deleted, 4);

        let remaining: Vec<String> = store.rows("audit_log").into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec!["late".to_string()]);

        let record = archiver.record(job.record_id.as_deref().unwrap()).unwrap();
        assert_eq!(record.row_count, 4);
        assert_eq!(archiver.restore(&record.id).await.unwrap(), 4);
        assert_eq!(store.table_len("audit_log"), 5);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_source_untouched() {
        let store = seeded(25, 0).await;
        store.fail_fetch_after(2);
        let events = Arc::new(InMemoryEventCollector::new());
        let archiver = Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30).batch_size(10)]),
            store.clone(),
        )
        .with_events(events.clone());

        let err = archiver.run("audit_log").await.unwrap_err();
        assert!(matches!(err, Error::ArchiveJobFailure { .. }));
        assert_eq!(store.table_len("audit_log"), 25);
        assert!(archiver.records().is_empty());

        let job = archiver.jobs().remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
        assert_eq!(events.events_of_type("ArchiveFailed").len(), 1);
        assert_eq!(archiver.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_discards_record() {
        let store = seeded(5, 0).await;
        store.set_fail_delete(true);
        let archiver = Archiver::new(config(vec![ArchivePolicy::new("audit_log", 30)]), store.clone());

        assert!(archiver.run("audit_log").await.is_err());
        assert_eq!(store.table_len("audit_log"), 5);
        assert!(archiver.records().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_archive() {
        let store = seeded(0, 3).await;
        let archiver = Archiver::new(config(vec![ArchivePolicy::new("audit_log", 30)]), store);
        let job = archiver.run("audit_log").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_matched, 0);
        assert!(job.record_id.is_none());
    }

    #[tokio::test]
    async fn test_restore_reinserts_rows() {
        let store = seeded(12, 0).await;
        let archiver = Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30).compress(false)]),
            store.clone(),
        );
        let job = archiver.run("audit_log").await.unwrap();
        let record_id = job.record_id.unwrap();
        assert_eq!(archiver.record(&record_id).unwrap().compression, CompressionAlgorithm::None);
        assert_eq!(store.table_len("audit_log"), 0);

        assert_eq!(archiver.restore(&record_id).await.unwrap(), 12);
        assert_eq!(store.table_len("audit_log"), 12);
        assert!(matches!(
            archiver.restore(&record_id).await,
            Err(Error::ArchiveRecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let store = seeded(5, 0).await;
        let archiver = Archiver::new(config(vec![ArchivePolicy::new("audit_log", 30)]), store.clone());

        let id = archiver.submit("audit_log").unwrap();
        archiver.cancel_job(&id).unwrap();
        assert!(matches!(
            archiver.execute(&id).await,
            Err(Error::InvalidJobTransition { .. })
        ));
        assert!(matches!(archiver.cancel_job(&id), Err(Error::InvalidJobTransition { .. })));
        assert!(matches!(archiver.cancel_job("nope"), Err(Error::ArchiveJobNotFound(_))));
        assert_eq!(store.table_len("audit_log"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job_between_batches() {
        let store = Arc::new(InMemoryDataStore::new().with_latency(Duration::from_millis(100)));
        let past = Utc::now() - ChronoDuration::days(60);
        let rows = (0..30)
            .map(|i| Row::new("audit_log", format!("r{i}"), json!({})).created_at(past))
            .collect();
        store.insert(rows).await.unwrap();

        let archiver = Arc::new(Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30).batch_size(10)]),
            store.clone(),
        ));
        let id = archiver.submit("audit_log").unwrap();
        let runner = {
            let archiver = archiver.clone();
            let id = id.clone();
            tokio::spawn(async move { archiver.execute(&id).await })
        };

        // count + first fetch
        tokio::time::sleep(Duration::from_millis(150)).await;
        archiver.cancel_job(&id).unwrap();

        let job = runner.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.rows_processed < 30);
        assert_eq!(store.table_len("audit_log"), 30);
        assert!(archiver.records().is_empty());
    }

    #[tokio::test]
    async fn test_run_due_skips_disabled_and_unknown_policy() {
        let store = seeded(3, 0).await;
        let mut disabled = ArchivePolicy::new("sessions", 7);
        disabled.enabled = false;
        let archiver = Archiver::new(
            config(vec![ArchivePolicy::new("audit_log", 30), disabled]),
            store,
        );

        let results = archiver.run_due().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert!(matches!(
            archiver.run("orders").await,
            Err(Error::ArchivePolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_history_is_bounded() {
        let store = seeded(0, 0).await;
        let archiver = Archiver::new(
            ArchiveConfig {
                policies: vec![ArchivePolicy::new("audit_log", 30)],
                job_history_limit: 3,
                ..Default::default()
            },
            store,
        );
        for _ in 0..5 {
            archiver.run("audit_log").await.unwrap();
        }
        assert_eq!(archiver.jobs().len(), 3);
        assert_eq!(archiver.stats().completed, 5);
    }

    #[test]
    fn test_duplicate_policy_rejected() {
        let config = config(vec![
            ArchivePolicy::new("audit_log", 30),
            ArchivePolicy::new("audit_log", 60),
        ]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
