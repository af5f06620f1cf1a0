//! Event Publisher Adapters
//!
//! `EventPublisher` implementations: structured log lines, a bounded
//! in-memory audit buffer, and a best-effort fan-out over several sinks.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes every event to the tracing pipeline.
///
/// Failure events are logged at `warn`, everything else at `info` (or
/// `debug` when quiet).
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    quiet: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log non-failure events at debug level
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if event.is_failure() {
            warn!(event_type, event = %json, "audit event");
        } else if self.quiet {
            debug!(event_type, event = %json, "audit event");
        } else {
            info!(event_type, event = %json, "audit event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps the most recent events in memory.
///
/// Used by tests and by the dashboard's recent-activity feed.
#[derive(Debug)]
pub struct InMemoryEventCollector {
    capacity: usize,
    events: RwLock<VecDeque<DomainEvent>>,
}

impl InMemoryEventCollector {
    /// Effectively unbounded collector
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Collector that keeps only the newest `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().iter().cloned().collect()
    }

    /// Newest `n` events, newest first
    pub fn recent(&self, n: usize) -> Vec<DomainEvent> {
        self.events.read().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    fn push(&self, event: DomainEvent) {
        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl Default for InMemoryEventCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.push(event);
        }
        Ok(())
    }
}

/// Publishes to every sink; a failing sink does not stop the others.
#[derive(Default)]
pub struct FanoutEventPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for FanoutEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                warn!(event_type = event.event_type(), error = %e, "event sink rejected event");
            }
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.publish_all(events.clone()).await {
                warn!(count = events.len(), error = %e, "event sink rejected batch");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::error::Error;

    fn resolved(id: &str) -> DomainEvent {
        DomainEvent::AlertResolved {
            alert_id: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    struct Broken;

    #[async_trait]
    impl EventPublisher for Broken {
        async fn publish(&self, _event: DomainEvent) -> Result<()> {
            Err(Error::Internal("sink down".into()))
        }

        async fn publish_all(&self, _events: Vec<DomainEvent>) -> Result<()> {
            Err(Error::Internal("sink down".into()))
        }
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_everything() {
        let publisher = LoggingEventPublisher::quiet();
        publisher.publish(resolved("a")).await.unwrap();
        publisher
            .publish(DomainEvent::ArchiveFailed {
                job_id: "j".into(),
                table: "logs".into(),
                reason: "boom".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_is_bounded() {
        let collector = InMemoryEventCollector::with_capacity(2);
        collector
            .publish_all(vec![resolved("a"), resolved("b"), resolved("c")])
            .await
            .unwrap();
        assert_eq!(collector.len(), 2);

        let ids: Vec<String> = collector
            .recent(5)
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::AlertResolved { alert_id, .. } => Some(alert_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(collector.events_of_type("AlertResolved").len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_survives_broken_sink() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let fanout = FanoutEventPublisher::new()
            .with_sink(Arc::new(Broken))
            .with_sink(collector.clone());

        fanout.publish(resolved("a")).await.unwrap();
        assert_eq!(collector.len(), 1);
    }
}
