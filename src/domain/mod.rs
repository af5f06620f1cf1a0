//! Domain Layer
//!
//! Ports (traits for external collaborators) and the events the control plane
//! emits to its audit sink.
//!
//! # Usage
//!
//! ```ignore
//! use scaleplane::domain::ports::{DataStore, EventPublisher};
//! use scaleplane::domain::events::DomainEvent;
//!
//! async fn archive<S: DataStore, P: EventPublisher>(store: &S, sink: &P) -> Result<()> {
//!     // ...
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    BackendHandle, Connector, DataStore, EventPublisher, InstanceProbe, InstanceProvisioner,
    ProbeResult, Row, RowFilter, RowQuery, SideStore, SortOrder, WriteBackRecord,
};
