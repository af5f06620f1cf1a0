//! Pooled Connection Types

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::ports::BackendHandle;

/// Pool-side record of one backend handle
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub handle: BackendHandle,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    pub healthy: bool,
    pub in_use: bool,
    pub owner: Option<String>,
}

impl ConnectionInfo {
    pub fn new(handle: BackendHandle) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            handle,
            created_at: now,
            last_used: now,
            use_count: 0,
            healthy: true,
            in_use: false,
            owner: None,
        }
    }

    pub(crate) fn check_out(&mut self, pool: &str, owner: Option<String>) -> PooledConnection {
        self.in_use = true;
        self.use_count += 1;
        self.last_used = Instant::now();
        self.owner = owner.clone();
        PooledConnection {
            id: self.id,
            pool: pool.to_string(),
            handle: self.handle.clone(),
            owner,
            healthy: true,
        }
    }

    pub(crate) fn check_in(&mut self) {
        self.in_use = false;
        self.owner = None;
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn summary(&self, now: Instant) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.to_string(),
            session_id: self.handle.session_id,
            target: self.handle.target.clone(),
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: self.idle_for(now).as_millis() as u64,
            use_count: self.use_count,
            healthy: self.healthy,
            in_use: self.in_use,
            owner: self.owner.clone(),
        }
    }
}

/// A connection lent to a caller. Hand it back with `release`.
#[derive(Debug)]
pub struct PooledConnection {
    id: Uuid,
    pool: String,
    handle: BackendHandle,
    owner: Option<String>,
    healthy: bool,
}

impl PooledConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Flag the handle as broken; the pool destroys it on release
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub session_id: Uuid,
    pub target: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub use_count: u64,
    pub healthy: bool,
    pub in_use: bool,
    pub owner: Option<String>,
}
