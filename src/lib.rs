//! Scaleplane - Scalability Control Plane
//!
//! Keeps a data-backed application responsive under growing load. One
//! process owns the layered cache, the connection pools, the load balancer
//! with its circuit breakers, the autoscaling loop, change-event batching,
//! data archiving and the monitor that watches all of them.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────────┐
//!   change events ───▶ │ SubscriptionBatcher  │ ───▶ BatchConsumer
//!                      └──────────────────────┘
//!   ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐
//!   │ CacheManager │   │ PoolManager  │   │ LoadBalancer        │
//!   └──────────────┘   └──────────────┘   │  + InstanceRegistry │
//!          ▲                  ▲           └─────────────────────┘
//!          │                  │                     ▲
//!   ┌──────┴──────────────────┴─────────────────────┴──────────┐
//!   │ ScalabilityMonitor (thresholds, alerts, remediation)      │
//!   └───────────────────────────────────────────────────────────┘
//!   AutoscaleController ──▶ InstanceProvisioner
//!   Archiver            ──▶ DataStore
//! ```
//!
//! [`ControlPlane`] assembles everything from a [`config::ControlPlaneConfig`]
//! and drives the periodic sweeps through the [`scheduler::Scheduler`].
//!
//! # Modules
//!
//! - [`adapters`] - Port implementations: in-memory store, simulated fleet, Prometheus
//! - [`archive`] - Retention policies and archive jobs
//! - [`autoscale`] - Threshold-driven scale decisions
//! - [`balancer`] - Instance registry, selection algorithms, circuit breakers
//! - [`cache`] - Named TTL/LRU layers with write-back
//! - [`domain`] - Ports and domain events
//! - [`monitor`] - Metric history, thresholds, alerts, dashboard
//! - [`pool`] - Bounded connection pools with priority waiters
//! - [`subscription`] - Change-event batching per stream

pub mod adapters;
pub mod archive;
pub mod autoscale;
pub mod balancer;
pub mod cache;
pub mod compression;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod scheduler;
pub mod subscription;

pub use config::ControlPlaneConfig;
pub use context::{Backends, Components, ControlPlane};
pub use error::{Error, Result};
