//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  DataStore │ SideStore │ Connector │ InstanceProbe         │ │
//! │  │  InstanceProvisioner │ EventPublisher                      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryDataStore │ SimulatedConnector │ SyntheticProbe   │ │
//! │  │ SimulatedProvisioner │ SimulatedLoadGenerator             │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector            │ │
//! │  │ FanoutEventPublisher │ PrometheusExporter                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use scaleplane::adapters::InMemoryDataStore;
//! use scaleplane::archive::{ArchiveConfig, ArchivePolicy, Archiver};
//!
//! let store = Arc::new(InMemoryDataStore::new());
//! let config = ArchiveConfig {
//!     policies: vec![ArchivePolicy::new("audit_log", 90)],
//!     ..Default::default()
//! };
//! let archiver = Archiver::new(config, store);
//! assert_eq!(archiver.stats().policies, 1);
//! ```

pub mod event_publisher;
pub mod memory_store;
pub mod prometheus;
pub mod simulated;

pub use event_publisher::{FanoutEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use memory_store::InMemoryDataStore;
pub use prometheus::PrometheusExporter;
pub use simulated::{
    LoadProfile, SimulatedConnector, SimulatedLoadGenerator, SimulatedProvisioner, SyntheticProbe,
};
