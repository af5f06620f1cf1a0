//! Write-Back Queue
//!
//! Bounded FIFO of recent writes to `sync` layers, drained in small batches
//! to the side store. When full, the oldest record is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::domain::ports::WriteBackRecord;
use crate::error::{Error, Result};

/// Write-back settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    /// Queue bound
    pub max_pending: usize,
    /// Records handed to the side store per flush
    pub batch_size: usize,
    /// Attempts before a record is dropped
    pub max_attempts: u32,
    /// Period of the background flush
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            batch_size: 50,
            max_attempts: 3,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl WriteBackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_pending == 0 {
            return Err(Error::Config("write-back batch_size and max_pending must be positive".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("write-back flush_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct WriteBackQueue {
    config: WriteBackConfig,
    pending: Mutex<VecDeque<WriteBackRecord>>,
    persisted: AtomicU64,
    dropped: AtomicU64,
}

impl WriteBackQueue {
    pub fn new(config: WriteBackConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(VecDeque::new()),
            persisted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WriteBackConfig {
        &self.config
    }

    pub fn enqueue(&self, record: WriteBackRecord) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.max_pending {
            pending.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        pending.push_back(record);
    }

    /// Take up to `batch_size` records from the front
    pub fn take_batch(&self) -> Vec<WriteBackRecord> {
        let mut pending = self.pending.lock();
        let n = self.config.batch_size.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Put a failed batch back at the front, dropping records out of attempts
    pub fn requeue(&self, batch: Vec<WriteBackRecord>) -> usize {
        let mut pending = self.pending.lock();
        let mut dropped = 0;
        for mut record in batch.into_iter().rev() {
            record.attempts += 1;
            if record.attempts >= self.config.max_attempts {
                dropped += 1;
                continue;
            }
            pending.push_front(record);
        }
        while pending.len() > self.config.max_pending {
            pending.pop_back();
            dropped += 1;
        }
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn mark_persisted(&self, n: usize) {
        self.persisted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> WriteBackStats {
        WriteBackStats {
            pending: self.len(),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteBackStats {
    pub pending: usize,
    pub persisted: u64,
    pub dropped: u64,
}
