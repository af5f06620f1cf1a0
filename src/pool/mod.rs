//! Connection Pooling
//!
//! Bounded pools of backend handles with a priority wait queue, periodic
//! health sweeps and idle reaping.
//!
//! ```text
//!   acquire ──► idle healthy? ──yes──► lease
//!                  │ no
//!                  ▼
//!             under max? ──yes──► reserve slot ─► Connector::connect ─► lease
//!                  │ no
//!                  ▼
//!             wait queue (priority desc, FIFO) ──deadline──► AcquireTimeout
//!                  ▲
//!   release ───────┘ (head waiter first, else idle)
//! ```

mod connection;
mod manager;
#[allow(clippy::module_inception)]
mod pool;
mod proptest;
mod wait_queue;

pub use connection::{ConnectionInfo, ConnectionSummary, PooledConnection};
pub use manager::PoolManager;
pub use pool::{
    ConnectionPool, HealthSweep, PoolConfig, PoolMaintenanceConfig, PoolStats,
};
pub use wait_queue::{Priority, WaitQueue};
