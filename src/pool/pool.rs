//! Connection Pool
//!
//! Bounded set of reusable backend handles. Acquires are served from idle
//! handles, then by creating a new handle while under `max_connections`,
//! then by queueing with a deadline. In-flight creates reserve their slot so
//! `total + pending <= max` holds across every await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionInfo, ConnectionSummary, PooledConnection};
use super::wait_queue::{Priority, WaitKey, WaitQueue, Waiter};
use crate::config::duration_ms;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{BackendHandle, Connector, EventPublisher};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Pool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Deadline for an acquire, including any create or queueing
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Idle handles older than this are reaped (down to the minimum)
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Deadline for one health probe
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
}

impl PoolConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("pool name must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config(format!(
                "pool {}: max_connections must be positive",
                self.name
            )));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "pool {}: min_connections ({}) exceeds max_connections ({})",
                self.name, self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() || self.health_check_timeout.is_zero() {
            return Err(Error::Config(format!(
                "pool {}: timeouts must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            health_check_timeout: Duration::from_secs(2),
        }
    }
}

/// Cadence of the shared maintenance sweeps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolMaintenanceConfig {
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,
}

impl PoolMaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval.is_zero() || self.reap_interval.is_zero() {
            return Err(Error::Config(
                "pool_maintenance health_check_interval and reap_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolMaintenanceConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Pool State
// =============================================================================

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    health_failures: AtomicU64,
    acquired: AtomicU64,
    wait_us: AtomicU64,
}

impl PoolCounters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record_acquire(&self, waited: Duration) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct PoolState {
    connections: HashMap<Uuid, ConnectionInfo>,
    /// Most recently released at the back
    idle: VecDeque<Uuid>,
    pending_creates: usize,
    waiters: WaitQueue,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.connections.len()
    }

    fn has_capacity(&self, max: usize) -> bool {
        self.connections.len() + self.pending_creates < max
    }

    /// Most recently used healthy idle handle
    fn take_idle(&mut self) -> Option<Uuid> {
        let connections = &self.connections;
        let pos = self
            .idle
            .iter()
            .rposition(|id| connections.get(id).is_some_and(|c| c.healthy))?;
        self.idle.remove(pos)
    }

    fn destroy(&mut self, id: &Uuid) -> Option<ConnectionInfo> {
        self.idle.retain(|i| i != id);
        self.connections.remove(id)
    }
}

enum Step {
    Ready(PooledConnection),
    Create(Reservation),
    Wait(WaitKey, oneshot::Receiver<Result<PooledConnection>>),
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    events: Option<Arc<dyn EventPublisher>>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
}

// =============================================================================
// Connection Pool
// =============================================================================

/// A named, bounded pool. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                events: None,
                state: Mutex::new(PoolState::default()),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Pool that reports destroyed connections to `events`
    pub fn with_events(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                events: Some(events),
                state: Mutex::new(PoolState::default()),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Borrow a connection, suspending until one is free or the acquire
    /// deadline passes.
    pub async fn acquire(&self, owner: Option<&str>, priority: Priority) -> Result<PooledConnection> {
        let inner = &self.inner;
        let name = inner.config.name.as_str();
        let started = Instant::now();
        let deadline = started + inner.config.acquire_timeout;
        let owner = owner.map(str::to_string);

        let step = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed(name.to_string()));
            }

            let idle = match state.take_idle() {
                Some(id) => state
                    .connections
                    .get_mut(&id)
                    .map(|c| c.check_out(name, owner.clone())),
                None => None,
            };

            match idle {
                Some(lease) => Step::Ready(lease),
                None if state.has_capacity(inner.config.max_connections) => {
                    state.pending_creates += 1;
                    Step::Create(Reservation::new(inner, 1))
                }
                None => {
                    let (reply, rx) = oneshot::channel();
                    let key = state.waiters.push(
                        priority,
                        Waiter {
                            owner: owner.clone(),
                            enqueued_at: started,
                            deadline,
                            reply,
                        },
                    );
                    debug!(pool = name, ?priority, waiting = state.waiters.len(), "acquire queued");
                    Step::Wait(key, rx)
                }
            }
        };

        match step {
            Step::Ready(lease) => {
                inner.counters.record_acquire(started.elapsed());
                Ok(lease)
            }
            Step::Create(reservation) => {
                inner
                    .create_for_caller(reservation, owner, started, deadline)
                    .await
            }
            Step::Wait(key, rx) => inner.wait_for(key, rx, started, deadline).await,
        }
    }

    /// Hand a connection back. Unhealthy connections are destroyed and, if
    /// callers are waiting, replaced.
    pub async fn release(&self, conn: PooledConnection) -> Result<()> {
        let inner = &self.inner;
        let name = inner.config.name.as_str();
        let foreign = || Error::ForeignConnection {
            pool: name.to_string(),
            connection_id: conn.id().to_string(),
        };
        if conn.pool() != name {
            return Err(foreign());
        }

        let mut replace = false;
        let doomed = {
            let mut state = inner.state.lock();
            let closed = state.closed;
            let info = state.connections.get_mut(&conn.id()).ok_or_else(foreign)?;
            if !info.in_use {
                debug!(pool = name, connection = %conn.id(), "connection released twice");
                return Ok(());
            }

            info.check_in();
            if !conn.is_healthy() {
                info.healthy = false;
            }

            if !info.healthy || closed {
                let removed = state.destroy(&conn.id());
                PoolCounters::bump(&inner.counters.destroyed, 1);
                if !closed
                    && !state.waiters.is_empty()
                    && state.has_capacity(inner.config.max_connections)
                {
                    state.pending_creates += 1;
                    replace = true;
                }
                removed
            } else {
                inner.dispatch(&mut state, conn.id());
                None
            }
        };

        if replace {
            inner.spawn_create();
        }
        if let Some(info) = doomed {
            inner.retire(info, "released unhealthy").await;
        }
        Ok(())
    }

    /// Create handles until the pool holds `min_connections`
    pub async fn warm_up(&self) -> usize {
        self.inner.ensure_min().await
    }

    /// Probe every idle handle, destroy failures, then restore the minimum
    pub async fn health_check(&self) -> HealthSweep {
        let inner = &self.inner;
        let targets: Vec<(Uuid, BackendHandle)> = {
            let state = inner.state.lock();
            state
                .idle
                .iter()
                .filter_map(|id| state.connections.get(id))
                .filter(|c| c.healthy)
                .map(|c| (c.id, c.handle.clone()))
                .collect()
        };

        let probe_timeout = inner.config.health_check_timeout;
        let outcomes = join_all(targets.iter().map(|(id, handle)| async move {
            let ok = matches!(
                timeout(probe_timeout, inner.connector.probe(handle)).await,
                Ok(Ok(()))
            );
            (*id, ok)
        }))
        .await;

        let failed = outcomes.iter().filter(|(_, ok)| !ok).count();
        let doomed: Vec<ConnectionInfo> = {
            let mut state = inner.state.lock();
            for (id, ok) in &outcomes {
                if !ok {
                    if let Some(info) = state.connections.get_mut(id) {
                        info.healthy = false;
                    }
                }
            }

            let unhealthy_idle: Vec<Uuid> = state
                .idle
                .iter()
                .filter(|id| state.connections.get(*id).is_some_and(|c| !c.healthy))
                .copied()
                .collect();
            unhealthy_idle
                .iter()
                .filter_map(|id| state.destroy(id))
                .collect()
        };

        PoolCounters::bump(&inner.counters.health_failures, failed as u64);
        PoolCounters::bump(&inner.counters.destroyed, doomed.len() as u64);
        let destroyed = doomed.len();
        for info in doomed {
            inner.retire(info, "health probe failed").await;
        }

        let replaced = inner.ensure_min().await;
        if failed > 0 {
            warn!(pool = %inner.config.name, probed = targets.len(), failed, replaced, "pool health check found failures");
        } else {
            debug!(pool = %inner.config.name, probed = targets.len(), "pool health check passed");
        }

        HealthSweep {
            probed: targets.len(),
            failed,
            destroyed,
            replaced,
        }
    }

    /// Destroy handles idle longer than `idle_timeout`, never going below
    /// `min_connections`
    pub async fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let now = Instant::now();
        let doomed: Vec<ConnectionInfo> = {
            let mut state = inner.state.lock();
            let budget = state.total().saturating_sub(inner.config.min_connections);
            let stale: Vec<Uuid> = state
                .idle
                .iter()
                .filter(|id| {
                    state
                        .connections
                        .get(*id)
                        .is_some_and(|c| c.idle_for(now) > inner.config.idle_timeout)
                })
                .copied()
                .take(budget)
                .collect();
            stale.iter().filter_map(|id| state.destroy(id)).collect()
        };

        let reaped = doomed.len();
        PoolCounters::bump(&inner.counters.destroyed, reaped as u64);
        for info in doomed {
            inner.connector.close(&info.handle).await;
        }
        if reaped > 0 {
            debug!(pool = %inner.config.name, reaped, "reaped idle connections");
        }
        reaped
    }

    /// Reject every waiter and destroy idle handles. Borrowed handles are
    /// destroyed when released.
    pub async fn close(&self) {
        let inner = &self.inner;
        let name = inner.config.name.clone();
        let (waiters, doomed) = {
            let mut state = inner.state.lock();
            state.closed = true;
            let waiters = state.waiters.drain();
            let idle: Vec<Uuid> = state.idle.drain(..).collect();
            let doomed: Vec<ConnectionInfo> = idle
                .iter()
                .filter_map(|id| state.connections.remove(id))
                .collect();
            (waiters, doomed)
        };

        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.reply.send(Err(Error::PoolClosed(name.clone())));
        }
        PoolCounters::bump(&inner.counters.destroyed, doomed.len() as u64);
        let destroyed = doomed.len();
        for info in doomed {
            inner.connector.close(&info.handle).await;
        }
        info!(pool = %name, rejected, destroyed, "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let state = inner.state.lock();
        let total = state.total();
        let idle = state.idle.len();
        let acquired = c.acquired.load(Ordering::Relaxed);
        let wait_us = c.wait_us.load(Ordering::Relaxed);

        PoolStats {
            name: inner.config.name.clone(),
            total,
            active: total - idle,
            idle,
            pending_creates: state.pending_creates,
            waiting: state.waiters.len(),
            min: inner.config.min_connections,
            max: inner.config.max_connections,
            utilization: (total - idle) as f64 / inner.config.max_connections as f64,
            acquired,
            created: c.created.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            health_failures: c.health_failures.load(Ordering::Relaxed),
            avg_wait_ms: if acquired == 0 {
                0.0
            } else {
                wait_us as f64 / acquired as f64 / 1000.0
            },
            closed: state.closed,
        }
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let mut list: Vec<_> = state.connections.values().map(|c| c.summary(now)).collect();
        list.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        list
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Acquire and Create Paths
// =============================================================================

impl PoolInner {
    /// Give connection `id` to the next live waiter, or park it idle
    fn dispatch(&self, state: &mut PoolState, id: Uuid) {
        let now = Instant::now();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.deadline <= now {
                continue;
            }
            let Some(info) = state.connections.get_mut(&id) else {
                return;
            };
            let lease = info.check_out(&self.config.name, waiter.owner.clone());
            match waiter.reply.send(Ok(lease)) {
                Ok(()) => {
                    self.counters.record_acquire(now.saturating_duration_since(waiter.enqueued_at));
                    return;
                }
                Err(_) => info.check_in(),
            }
        }
        state.idle.push_back(id);
    }

    async fn connect(&self, within: Duration) -> Result<BackendHandle> {
        let name = &self.config.name;
        match timeout(within, self.connector.connect(name)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(Error::ConnectionCreateFailure { reason, .. })) | Ok(Err(Error::Internal(reason))) => {
                Err(Error::ConnectionCreateFailure {
                    pool: name.clone(),
                    reason,
                })
            }
            Ok(Err(e)) => Err(Error::ConnectionCreateFailure {
                pool: name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionCreateFailure {
                pool: name.clone(),
                reason: format!("connect timed out after {}ms", within.as_millis()),
            }),
        }
    }

    async fn create_for_caller(
        self: &Arc<Self>,
        mut reservation: Reservation,
        owner: Option<String>,
        started: Instant,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        let name = self.config.name.as_str();
        let result = timeout_at(deadline, self.connect(self.config.acquire_timeout)).await;

        let mut replace = false;
        let outcome = {
            let mut state = self.state.lock();
            reservation.settle(&mut state);
            let outcome = match result {
                Ok(Ok(handle)) => {
                    PoolCounters::bump(&self.counters.created, 1);
                    if state.closed {
                        Err(handle)
                    } else {
                        let mut info = ConnectionInfo::new(handle);
                        let lease = info.check_out(name, owner);
                        state.connections.insert(info.id, info);
                        Ok(lease)
                    }
                }
                Ok(Err(e)) => {
                    PoolCounters::bump(&self.counters.errors, 1);
                    warn!(pool = name, error = %e, "failed to create connection");
                    return self.after_failed_create(state, e);
                }
                Err(_) => {
                    PoolCounters::bump(&self.counters.timeouts, 1);
                    let e = Error::AcquireTimeout {
                        pool: name.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    };
                    return self.after_failed_create(state, e);
                }
            };
            if !state.waiters.is_empty() && state.has_capacity(self.config.max_connections) {
                state.pending_creates += 1;
                replace = true;
            }
            outcome
        };

        if replace {
            self.spawn_create();
        }
        match outcome {
            Ok(lease) => {
                self.counters.record_acquire(started.elapsed());
                debug!(pool = name, connection = %lease.id(), "created connection");
                Ok(lease)
            }
            Err(handle) => {
                self.connector.close(&handle).await;
                Err(Error::PoolClosed(name.to_string()))
            }
        }
    }

    /// A failed caller-side create frees its slot; let a waiter have it
    fn after_failed_create(
        self: &Arc<Self>,
        mut state: parking_lot::MutexGuard<'_, PoolState>,
        error: Error,
    ) -> Result<PooledConnection> {
        let replace = !state.closed
            && !state.waiters.is_empty()
            && state.has_capacity(self.config.max_connections);
        if replace {
            state.pending_creates += 1;
        }
        drop(state);
        if replace {
            self.spawn_create();
        }
        Err(error)
    }

    async fn wait_for(
        &self,
        key: WaitKey,
        mut rx: oneshot::Receiver<Result<PooledConnection>>,
        started: Instant,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        let timed_out = || Error::AcquireTimeout {
            pool: self.config.name.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                PoolCounters::bump(&self.counters.timeouts, 1);
                Err(timed_out())
            }
            Err(_) => {
                let still_queued = self.state.lock().waiters.remove(&key).is_some();
                if !still_queued {
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                PoolCounters::bump(&self.counters.timeouts, 1);
                debug!(pool = %self.config.name, "acquire timed out in wait queue");
                Err(timed_out())
            }
        }
    }

    /// Create one handle in the background for whoever is waiting.
    /// The caller has already reserved the slot.
    fn spawn_create(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.connect(inner.config.acquire_timeout).await;
            let orphan = {
                let mut state = inner.state.lock();
                state.pending_creates -= 1;
                match result {
                    Ok(handle) => {
                        PoolCounters::bump(&inner.counters.created, 1);
                        if state.closed {
                            Some(handle)
                        } else {
                            let info = ConnectionInfo::new(handle);
                            let id = info.id;
                            state.connections.insert(id, info);
                            inner.dispatch(&mut state, id);
                            None
                        }
                    }
                    Err(e) => {
                        PoolCounters::bump(&inner.counters.errors, 1);
                        warn!(pool = %inner.config.name, error = %e, "background connection create failed");
                        None
                    }
                }
            };
            if let Some(handle) = orphan {
                inner.connector.close(&handle).await;
            }
        });
    }

    async fn ensure_min(self: &Arc<Self>) -> usize {
        let (needed, mut reservation) = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let have = state.total() + state.pending_creates;
            let needed = self.config.min_connections.saturating_sub(have);
            state.pending_creates += needed;
            (needed, Reservation::new(self, needed))
        };
        if needed == 0 {
            return 0;
        }

        let results = join_all((0..needed).map(|_| self.connect(self.config.acquire_timeout))).await;

        let mut created = 0;
        let orphans: Vec<BackendHandle> = {
            let mut state = self.state.lock();
            let mut orphans = Vec::new();
            for result in results {
                reservation.settle(&mut state);
                match result {
                    Ok(handle) => {
                        created += 1;
                        if state.closed {
                            orphans.push(handle);
                        } else {
                            let info = ConnectionInfo::new(handle);
                            let id = info.id;
                            state.connections.insert(id, info);
                            self.dispatch(&mut state, id);
                        }
                    }
                    Err(e) => {
                        PoolCounters::bump(&self.counters.errors, 1);
                        warn!(pool = %self.config.name, error = %e, "failed to create minimum connection");
                    }
                }
            }
            orphans
        };

        PoolCounters::bump(&self.counters.created, created as u64);
        for handle in orphans {
            self.connector.close(&handle).await;
        }
        if created > 0 {
            debug!(pool = %self.config.name, created, "restored minimum pool size");
        }
        created
    }

    async fn retire(&self, info: ConnectionInfo, reason: &str) {
        self.connector.close(&info.handle).await;
        debug!(pool = %self.config.name, connection = %info.id, reason, "connection destroyed");
        if let Some(events) = &self.events {
            let event = DomainEvent::ConnectionDestroyed {
                pool: self.config.name.clone(),
                connection_id: info.id.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            };
            if let Err(e) = events.publish(event).await {
                debug!(error = %e, "failed to publish connection event");
            }
        }
    }
}

// =============================================================================
// Create Reservation
// =============================================================================

/// Slots counted in `pending_creates` for creates that have not finished.
///
/// A create whose future is dropped before `connect` resolves never settles
/// its slots; dropping the reservation gives them back and lets a waiter
/// have one.
struct Reservation {
    inner: Arc<PoolInner>,
    slots: usize,
}

impl Reservation {
    fn new(inner: &Arc<PoolInner>, slots: usize) -> Self {
        Self {
            inner: Arc::clone(inner),
            slots,
        }
    }

    /// One create finished; its slot is now a connection or free again
    fn settle(&mut self, state: &mut PoolState) {
        state.pending_creates -= 1;
        self.slots -= 1;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.slots == 0 {
            return;
        }
        let inner = &self.inner;
        let replace = {
            let mut state = inner.state.lock();
            state.pending_creates -= self.slots;
            let replace = !state.closed
                && !state.waiters.is_empty()
                && state.has_capacity(inner.config.max_connections)
                && tokio::runtime::Handle::try_current().is_ok();
            if replace {
                state.pending_creates += 1;
            }
            replace
        };
        debug!(pool = %inner.config.name, slots = self.slots, replace, "abandoned connection create released its slots");
        if replace {
            inner.spawn_create();
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Outcome of one health sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSweep {
    pub probed: usize,
    pub failed: usize,
    pub destroyed: usize,
    pub replaced: usize,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub pending_creates: usize,
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
    /// Active over max
    pub utilization: f64,
    pub acquired: u64,
    pub created: u64,
    pub destroyed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub health_failures: u64,
    pub avg_wait_ms: f64,
    pub closed: bool,
}
