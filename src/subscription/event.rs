//! Change Events and Batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// One row change from the change-event channel.
///
/// Decoded once at the boundary with [`ChangeEvent::from_json`]; everything
/// downstream works with the typed variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        table: String,
        record_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Update {
        table: String,
        record_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Delete {
        table: String,
        record_id: String,
        /// Last known column values, if the source provides them
        #[serde(default)]
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn insert(table: &str, record_id: &str, payload: serde_json::Value) -> Self {
        ChangeEvent::Insert {
            table: table.to_string(),
            record_id: record_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn update(table: &str, record_id: &str, payload: serde_json::Value) -> Self {
        ChangeEvent::Update {
            table: table.to_string(),
            record_id: record_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn delete(table: &str, record_id: &str) -> Self {
        ChangeEvent::Delete {
            table: table.to_string(),
            record_id: record_id.to_string(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Decode a raw channel message
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Update { table, .. }
            | ChangeEvent::Delete { table, .. } => table,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            ChangeEvent::Insert { record_id, .. }
            | ChangeEvent::Update { record_id, .. }
            | ChangeEvent::Delete { record_id, .. } => record_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChangeEvent::Insert { timestamp, .. }
            | ChangeEvent::Update { timestamp, .. }
            | ChangeEvent::Delete { timestamp, .. } => *timestamp,
        }
    }
}

/// Why a batch left its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Size,
    Timeout,
    Manual,
    /// Stream removed by unsubscribe or idle reevaluation
    Removed,
    Shutdown,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Manual => "manual",
            FlushReason::Removed => "removed",
            FlushReason::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Grouped payload handed to the consumer; events keep arrival order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub stream: String,
    pub sequence: u64,
    pub reason: FlushReason,
    pub events: Vec<ChangeEvent>,
    pub flushed_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
