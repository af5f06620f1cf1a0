//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions for everything outside the control plane: the backing data
//! store, the backend that connections are opened against, instance probes,
//! the durable side-store for cache write-back and the audit sink.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Control Plane                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  DataStore │ Connector │ InstanceProbe │ SideStore   │    │
//! │  │                  EventPublisher                      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Adapters                               │
//! │  InMemoryDataStore │ SimulatedConnector │ SyntheticProbe    │
//! │  LoggingEventPublisher │ InMemoryEventCollector             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::DomainEvent;
use crate::balancer::{Instance, InstanceRegistry};
use crate::error::Result;

// =============================================================================
// Backing Data Store
// =============================================================================

/// A row of an operational table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key
    pub id: String,
    /// Owning table
    pub table: String,
    /// Creation timestamp; retention is measured against it
    pub created_at: DateTime<Utc>,
    /// Column values
    pub data: serde_json::Value,
}

impl Row {
    /// Create a row stamped now
    pub fn new(table: impl Into<String>, id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            created_at: Utc::now(),
            data,
        }
    }

    /// Override the creation timestamp
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// Row predicate understood by every data store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Only rows created strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Column equality constraints (all must match)
    pub equals: Vec<(String, serde_json::Value)>,
    /// Restrict to these primary keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

impl RowFilter {
    /// Rows created before `cutoff`
    pub fn older_than(cutoff: DateTime<Utc>) -> Self {
        Self {
            created_before: Some(cutoff),
            ..Default::default()
        }
    }

    /// Add a column equality constraint
    pub fn with_eq(mut self, column: impl Into<String>, value: serde_json::Value) -> Self {
        self.equals.push((column.into(), value));
        self
    }

    /// Narrow the predicate to rows with one of `ids`
    pub fn only_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Evaluate the predicate against a row
    pub fn matches(&self, row: &Row) -> bool {
        if let Some(cutoff) = self.created_before {
            if row.created_at >= cutoff {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&row.id) {
                return false;
            }
        }
        self.equals
            .iter()
            .all(|(column, value)| row.data.get(column) == Some(value))
    }
}

/// Sort direction on `created_at`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Oldest first
    #[default]
    Ascending,
    /// Newest first
    Descending,
}

/// Filter + order + range
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub filter: RowFilter,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: usize,
}

impl RowQuery {
    /// Page `[offset, offset + limit)` of rows matching `filter`, oldest first
    pub fn page(filter: RowFilter, offset: usize, limit: usize) -> Self {
        Self {
            filter,
            order: SortOrder::Ascending,
            offset,
            limit,
        }
    }
}

/// Port for the row-oriented backing store.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Count rows matching `filter`
    async fn count(&self, table: &str, filter: &RowFilter) -> Result<u64>;

    /// Fetch one ordered page of rows
    async fn fetch(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>>;

    /// Insert rows, returning how many were written
    async fn insert(&self, rows: Vec<Row>) -> Result<u64>;

    /// Delete rows matching `filter`, returning how many were removed
    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<u64>;

    /// Cheap liveness query
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Backend Connections
// =============================================================================

/// Opaque handle to one backend client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    /// Backend-assigned session id
    pub session_id: Uuid,
    /// Target the session is bound to
    pub target: String,
}

impl BackendHandle {
    /// New handle with a fresh session id
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            target: target.into(),
        }
    }
}

/// Port for opening, probing and closing backend client handles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new handle for `pool`
    async fn connect(&self, pool: &str) -> Result<BackendHandle>;

    /// Verify a handle is still usable
    async fn probe(&self, handle: &BackendHandle) -> Result<()>;

    /// Release backend resources held by the handle
    async fn close(&self, handle: &BackendHandle);
}

// =============================================================================
// Instance Probes
// =============================================================================

/// Outcome of one instance health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
}

/// Port for instance health checks.
#[async_trait]
pub trait InstanceProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> ProbeResult;
}

// =============================================================================
// Instance Provisioning
// =============================================================================

/// Port for starting and tearing down instances on behalf of the autoscaler.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Start one instance and register it `offline`, returning its id
    async fn launch(&self, registry: &InstanceRegistry) -> Result<String>;

    /// Tear down a drained instance and remove it from the registry
    async fn terminate(&self, registry: &InstanceRegistry, instance_id: &str) -> Result<()>;
}

// =============================================================================
// Cache Side Store
// =============================================================================

/// One cache write queued for propagation to the side store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBackRecord {
    pub layer: String,
    pub key: String,
    /// Logical (uncompressed, unencrypted) serialized value
    pub value: Vec<u8>,
    pub written_at: DateTime<Utc>,
    /// Delivery attempts so far
    pub attempts: u32,
}

/// Port for the durable store behind write-back cache layers.
#[async_trait]
pub trait SideStore: Send + Sync {
    async fn persist(&self, batch: &[WriteBackRecord]) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for the notification / audit sink. Best effort.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish several events in order
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_filter_older_than() {
        let now = Utc::now();
        let old = Row::new("logs", "1", json!({})).created_at(now - ChronoDuration::days(40));
        let fresh = Row::new("logs", "2", json!({}));

        let filter = RowFilter::older_than(now - ChronoDuration::days(30));
        assert!(filter.matches(&old));
        assert!(!filter.matches(&fresh));
    }

    #[test]
    fn test_filter_equality() {
        let row = Row::new("orders", "1", json!({"status": "closed", "total": 10}));
        assert!(RowFilter::default()
            .with_eq("status", json!("closed"))
            .matches(&row));
        assert!(!RowFilter::default()
            .with_eq("status", json!("open"))
            .matches(&row));
        assert!(!RowFilter::default()
            .with_eq("missing", json!(1))
            .matches(&row));
    }

    #[test]
    fn test_backend_handles_are_unique() {
        let a = BackendHandle::new("db");
        let b = BackendHandle::new("db");
        assert_ne!(a, b);
        assert_eq!(a.target, "db");
    }
}
