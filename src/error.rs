//! Error types for the Scaleplane control plane

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Connection Pool Errors
    // =========================================================================
    /// Pool exhausted past the caller's deadline
    #[error("Timed out after {waited_ms}ms waiting for a connection from pool '{pool}'")]
    AcquireTimeout { pool: String, waited_ms: u64 },

    /// Backend unreachable while creating a connection
    #[error("Failed to create connection for pool '{pool}': {reason}")]
    ConnectionCreateFailure { pool: String, reason: String },

    /// No pool registered under this name
    #[error("Connection pool not found: {0}")]
    PoolNotFound(String),

    /// Pool has been closed and accepts no new work
    #[error("Connection pool is closed: {0}")]
    PoolClosed(String),

    /// Connection handed back to a pool that does not own it
    #[error("Connection {connection_id} does not belong to pool '{pool}'")]
    ForeignConnection { pool: String, connection_id: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Stored checksum does not match the decoded value
    #[error("Cache integrity check failed for {layer}/{key}")]
    CacheIntegrityFailure { layer: String, key: String },

    /// No cache layer with this name
    #[error("Cache layer not found: {0}")]
    CacheLayerNotFound(String),

    /// Invalid invalidation pattern
    #[error("Invalid cache key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Load Balancer Errors
    // =========================================================================
    /// Instance bypassed because its breaker is open
    #[error("Circuit open for instance {instance_id}")]
    CircuitOpen { instance_id: String },

    /// Every instance is filtered out
    #[error("No healthy instance available")]
    NoHealthyInstance,

    /// Unknown instance id
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Operation against an instance failed
    #[error("Instance {instance_id} request failed: {reason}")]
    InstanceRequestFailed { instance_id: String, reason: String },

    // =========================================================================
    // Autoscaling Errors
    // =========================================================================
    /// A scale up/down step failed
    #[error("Scaling action failed: {0}")]
    ScalingActionFailure(String),

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// Job failed partway; source rows were left untouched
    #[error("Archive job {job_id} failed: {reason}")]
    ArchiveJobFailure { job_id: String, reason: String },

    /// Unknown archive job
    #[error("Archive job not found: {0}")]
    ArchiveJobNotFound(String),

    /// Unknown archive record
    #[error("Archive record not found: {0}")]
    ArchiveRecordNotFound(String),

    /// No retention policy for table
    #[error("No archive policy for table: {0}")]
    ArchivePolicyNotFound(String),

    /// Illegal job lifecycle transition
    #[error("Invalid archive job transition from {from} to {to}")]
    InvalidJobTransition { from: String, to: String },

    // =========================================================================
    // Subscription Errors
    // =========================================================================
    /// Unknown subscription stream
    #[error("Subscription stream not found: {0}")]
    StreamNotFound(String),

    /// Stream name already registered
    #[error("Subscription stream already exists: {0}")]
    StreamExists(String),

    /// Batcher no longer accepts events or subscriptions
    #[error("Subscription batcher is shut down")]
    BatcherShutdown,

    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    /// Backing data store failure
    #[error("Data store error: {0}")]
    DataStore(String),

    /// Side-store (write-back target) failure
    #[error("Side store error: {0}")]
    SideStore(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller can reasonably retry (possibly elsewhere).
    ///
    /// `NoHealthyInstance` is a hard failure; archive and config errors need
    /// operator attention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AcquireTimeout { .. }
                | Error::ConnectionCreateFailure { .. }
                | Error::CacheIntegrityFailure { .. }
                | Error::CircuitOpen { .. }
                | Error::InstanceRequestFailed { .. }
                | Error::ScalingActionFailure(_)
                | Error::DataStore(_)
                | Error::SideStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::AcquireTimeout {
            pool: "admin".into(),
            waited_ms: 500
        }
        .is_recoverable());
        assert!(Error::CircuitOpen {
            instance_id: "i-1".into()
        }
        .is_recoverable());
        assert!(!Error::NoHealthyInstance.is_recoverable());
        assert!(!Error::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::AcquireTimeout {
            pool: "admin".into(),
            waited_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 500ms waiting for a connection from pool 'admin'"
        );
        assert_eq!(
            Error::NoHealthyInstance.to_string(),
            "No healthy instance available"
        );
    }
}
