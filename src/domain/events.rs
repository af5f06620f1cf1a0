//! Domain Events
//!
//! Immutable records of things that happened in the control plane. They are
//! written to the notification/audit sink and never read back by the
//! components themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Alert Events
    // =========================================================================
    /// A threshold breach opened an alert.
    AlertRaised {
        alert_id: String,
        threshold_id: String,
        category: String,
        severity: String,
        metric: String,
        threshold: f64,
        actual: f64,
        timestamp: DateTime<Utc>,
    },

    /// Notification or escalation remediation for an alert.
    AlertNotification {
        alert_id: String,
        severity: String,
        message: String,
        escalated: bool,
        timestamp: DateTime<Utc>,
    },

    /// An alert was resolved.
    AlertResolved {
        alert_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An automatic repair ran for an alert.
    RemediationExecuted {
        alert_id: String,
        action: String,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Scaling Events
    // =========================================================================
    /// The autoscaler recorded a decision.
    ScalingDecisionMade {
        action: String,
        current_instances: u32,
        recommended_instances: u32,
        reason: String,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A scale step failed; it will be retried next cycle.
    ScalingActionFailed {
        action: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Instance Events
    // =========================================================================
    /// Instance lifecycle/health status changed.
    InstanceStatusChanged {
        instance_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// Circuit breaker changed state.
    CircuitStateChanged {
        instance_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Archive Events
    // =========================================================================
    /// An archive job completed and source rows were removed.
    ArchiveCompleted {
        job_id: String,
        table: String,
        rows_archived: u64,
        record_id: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An archive job failed; source rows untouched.
    ArchiveFailed {
        job_id: String,
        table: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Pool Events
    // =========================================================================
    /// A pooled connection failed its health probe and was destroyed.
    ConnectionDestroyed {
        pool: String,
        connection_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::AlertRaised { .. } => "AlertRaised",
            DomainEvent::AlertNotification { .. } => "AlertNotification",
            DomainEvent::AlertResolved { .. } => "AlertResolved",
            DomainEvent::RemediationExecuted { .. } => "RemediationExecuted",
            DomainEvent::ScalingDecisionMade { .. } => "ScalingDecisionMade",
            DomainEvent::ScalingActionFailed { .. } => "ScalingActionFailed",
            DomainEvent::InstanceStatusChanged { .. } => "InstanceStatusChanged",
            DomainEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            DomainEvent::ArchiveCompleted { .. } => "ArchiveCompleted",
            DomainEvent::ArchiveFailed { .. } => "ArchiveFailed",
            DomainEvent::ConnectionDestroyed { .. } => "ConnectionDestroyed",
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::AlertRaised { timestamp, .. }
            | DomainEvent::AlertNotification { timestamp, .. }
            | DomainEvent::AlertResolved { timestamp, .. }
            | DomainEvent::RemediationExecuted { timestamp, .. }
            | DomainEvent::ScalingDecisionMade { timestamp, .. }
            | DomainEvent::ScalingActionFailed { timestamp, .. }
            | DomainEvent::InstanceStatusChanged { timestamp, .. }
            | DomainEvent::CircuitStateChanged { timestamp, .. }
            | DomainEvent::ArchiveCompleted { timestamp, .. }
            | DomainEvent::ArchiveFailed { timestamp, .. }
            | DomainEvent::ConnectionDestroyed { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the event signals a failure an operator should look at
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DomainEvent::ScalingActionFailed { .. }
                | DomainEvent::ArchiveFailed { .. }
                | DomainEvent::ConnectionDestroyed { .. }
        )
    }
}
