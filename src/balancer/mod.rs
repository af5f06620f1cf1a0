//! Load Balancing
//!
//! Instance registry, per-instance circuit breakers, selection algorithms and
//! client session affinity.
//!
//! ```text
//!   select_instance(client)
//!        │
//!        ├─ live session + eligible instance? ──► reuse, slide expiry
//!        │
//!        ▼
//!   registry (id order) ─► filter: healthy, breaker allows, under cap
//!        │
//!        ▼
//!   algorithm ─► instance id (bind session when affinity is on)
//! ```

pub mod algorithm;
#[allow(clippy::module_inception)]
mod balancer;
pub mod circuit;
mod instance;
mod proptest;
mod registry;
mod session;

pub use algorithm::Algorithm;
pub use balancer::{BalancerConfig, BalancerStats, LoadBalancer, ProbeSweep};
pub use circuit::{CircuitBreaker, CircuitState, Transition};
pub use instance::{Instance, InstanceMetrics, InstanceSnapshot, InstanceStatus};
pub use registry::InstanceRegistry;
pub use session::{Session, SessionStats, SessionStore};
