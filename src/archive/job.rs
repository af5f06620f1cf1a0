//! Archive Jobs, Policies and Records

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compression::CompressionAlgorithm;
use crate::domain::ports::RowFilter;
use crate::error::{Error, Result};

// =============================================================================
// Policy
// =============================================================================

fn default_batch_size() -> usize {
    500
}

fn enabled() -> bool {
    true
}

/// Retention rule for one table; rows are aged by `created_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub table: String,
    pub retention_days: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "enabled")]
    pub compress: bool,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl ArchivePolicy {
    pub fn new(table: &str, retention_days: u32) -> Self {
        Self {
            table: table.to_string(),
            retention_days,
            batch_size: default_batch_size(),
            compress: true,
            enabled: true,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days))
    }

    /// Rows past retention at `now`
    pub fn condition(&self, now: DateTime<Utc>) -> RowFilter {
        RowFilter::older_than(self.cutoff(now))
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::Config("archive policy needs a table".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(format!(
                "archive policy '{}' batch_size must be positive",
                self.table
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Job State Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// pending -> running -> completed | failed | cancelled; pending may
    /// also be cancelled directly
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One recorded transition
#[derive(Debug, Clone, Serialize)]
pub struct JobStep {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveJob {
    pub id: String,
    pub table: String,
    pub condition: RowFilter,
    pub status: JobStatus,
    pub rows_matched: u64,
    pub rows_processed: u64,
    pub batches: u64,
    pub rows_deleted: u64,
    /// Archive record produced on completion
    pub record_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<JobStep>,
}

impl ArchiveJob {
    pub fn new(table: &str, condition: RowFilter) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job-{}", Uuid::new_v4()),
            table: table.to_string(),
            condition,
            status: JobStatus::Pending,
            rows_matched: 0,
            rows_processed: 0,
            batches: 0,
            rows_deleted: 0,
            record_id: None,
            error: None,
            created_at: now,
            finished_at: None,
            steps: vec![JobStep {
                status: JobStatus::Pending,
                timestamp: now,
                message: "job created".to_string(),
                duration_ms: 0,
            }],
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(&mut self, next: JobStatus, message: &str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidJobTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        let last = self.steps.last().map(|s| s.timestamp).unwrap_or(self.created_at);
        self.status = next;
        self.steps.push(JobStep {
            status: next,
            timestamp: now,
            message: message.to_string(),
            duration_ms: (now - last).num_milliseconds().max(0) as u64,
        });
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.transition(JobStatus::Failed, reason)?;
        self.error = Some(reason.to_string());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}

// =============================================================================
// Archive Record
// =============================================================================

/// Serialized rows of one completed job
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub id: String,
    pub table: String,
    pub job_id: String,
    pub row_count: u64,
    pub original_bytes: usize,
    pub stored_bytes: usize,
    pub compression: CompressionAlgorithm,
    #[serde(skip)]
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(
        job: &ArchiveJob,
        row_count: u64,
        original_bytes: usize,
        payload: Bytes,
        compression: CompressionAlgorithm,
    ) -> Self {
        Self {
            id: format!("archive-{}", Uuid::new_v4()),
            table: job.table.clone(),
            job_id: job.id.clone(),
            row_count,
            original_bytes,
            stored_bytes: payload.len(),
            compression,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = ArchiveJob::new("logs", RowFilter::default());
        assert_eq!(job.status, JobStatus::Pending);

        job.transition(JobStatus::Running, "started").unwrap();
        job.transition(JobStatus::Completed, "done").unwrap();
        assert!(job.is_terminal());
        assert!(job.finished_at.is_some());
        assert_eq!(job.steps.len(), 3);
    }

    #[test]
    fn test_terminal_jobs_are_immutable() {
        let mut job = ArchiveJob::new("logs", RowFilter::default());
        job.transition(JobStatus::Running, "started").unwrap();
        job.fail("store offline").unwrap();
        assert_eq!(job.error.as_deref(), Some("store offline"));

        let err = job.transition(JobStatus::Running, "again").unwrap_err();
        assert!(matches!(err, Error::InvalidJobTransition { .. }));
        assert!(job.fail("twice").is_err());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_completed() {
        let mut job = ArchiveJob::new("logs", RowFilter::default());
        assert!(job.transition(JobStatus::Completed, "skip").is_err());
        job.transition(JobStatus::Cancelled, "cancelled").unwrap();
        assert!(job.is_terminal());
    }

    #[test]
    fn test_policy_condition() {
        let now = Utc::now();
        let policy = ArchivePolicy::new("logs", 30);
        let condition = policy.condition(now);
        assert_eq!(condition.created_before, Some(now - ChronoDuration::days(30)));
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: ArchivePolicy =
            serde_yaml::from_str("table: audit_log\nretention_days: 90\n").unwrap();
        assert_eq!(policy.batch_size, 500);
        assert!(policy.compress);
        assert!(policy.enabled);
    }
}
