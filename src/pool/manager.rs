//! Named Pool Registry

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::connection::PooledConnection;
use super::pool::{ConnectionPool, HealthSweep, PoolConfig, PoolStats};
use super::wait_queue::Priority;
use crate::domain::ports::{Connector, EventPublisher};
use crate::error::{Error, Result};

/// Every connection pool of the control plane, keyed by name
pub struct PoolManager {
    pools: DashMap<String, ConnectionPool>,
    connector: Arc<dyn Connector>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            pools: DashMap::new(),
            connector,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a pool; replaces nothing
    pub fn register(&self, config: PoolConfig) -> Result<ConnectionPool> {
        config.validate()?;
        if self.pools.contains_key(&config.name) {
            return Err(Error::Config(format!("pool '{}' already registered", config.name)));
        }

        let name = config.name.clone();
        let pool = match &self.events {
            Some(events) => ConnectionPool::with_events(config, self.connector.clone(), events.clone()),
            None => ConnectionPool::new(config, self.connector.clone()),
        };
        self.pools.insert(name.clone(), pool.clone());
        info!(pool = %name, "connection pool registered");
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Result<ConnectionPool> {
        self.pools
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<ConnectionPool> = self.pools.iter().map(|p| p.value().clone()).collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }

    pub async fn acquire(
        &self,
        pool: &str,
        owner: Option<&str>,
        priority: Priority,
    ) -> Result<PooledConnection> {
        self.get(pool)?.acquire(owner, priority).await
    }

    pub async fn release(&self, pool: &str, conn: PooledConnection) -> Result<()> {
        self.get(pool)?.release(conn).await
    }

    pub async fn warm_up_all(&self) -> usize {
        let mut created = 0;
        for pool in self.all() {
            created += pool.warm_up().await;
        }
        created
    }

    pub async fn health_check_all(&self) -> Vec<(String, HealthSweep)> {
        let mut sweeps = Vec::new();
        for pool in self.all() {
            let sweep = pool.health_check().await;
            sweeps.push((pool.name().to_string(), sweep));
        }
        sweeps
    }

    pub async fn reap_all(&self) -> usize {
        let mut reaped = 0;
        for pool in self.all() {
            reaped += pool.reap_idle().await;
        }
        reaped
    }

    pub async fn close_all(&self) {
        for pool in self.all() {
            pool.close().await;
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.all().iter().map(|p| p.stats()).collect()
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::simulated::SimulatedConnector;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_release_by_name() {
        let manager = PoolManager::new(Arc::new(SimulatedConnector::new()));
        manager.register(PoolConfig::named("admin").with_size(0, 2)).unwrap();
        manager.register(PoolConfig::named("reporting").with_size(0, 2)).unwrap();
        assert_eq!(manager.names(), vec!["admin", "reporting"]);

        let conn = manager.acquire("admin", Some("u1"), Priority::High).await.unwrap();
        assert_eq!(conn.pool(), "admin");
        assert_matches!(
            manager.release("reporting", conn).await,
            Err(Error::ForeignConnection { .. })
        );
        assert_matches!(
            manager.acquire("missing", None, Priority::Normal).await,
            Err(Error::PoolNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = PoolManager::new(Arc::new(SimulatedConnector::new()));
        manager.register(PoolConfig::named("admin")).unwrap();
        assert!(manager.register(PoolConfig::named("admin")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_sweep_publishes_destroyed_connections() {
        let connector = Arc::new(SimulatedConnector::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let manager = PoolManager::new(connector.clone()).with_events(events.clone());
        let pool = manager
            .register(
                PoolConfig::named("admin")
                    .with_size(1, 2)
                    .with_acquire_timeout(Duration::from_millis(200)),
            )
            .unwrap();

        assert_eq!(manager.warm_up_all().await, 1);
        connector.set_fail_probe(true);
        let sweeps = manager.health_check_all().await;
        assert_eq!(sweeps[0].1.failed, 1);
        assert_eq!(events.events_of_type("ConnectionDestroyed").len(), 1);

        connector.set_fail_probe(false);
        assert_eq!(pool.stats().total, 1);
    }
}
