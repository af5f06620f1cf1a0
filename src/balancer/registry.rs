//! Instance Registry
//!
//! Ordered by id so tie-breaks are deterministic. Written by the autoscaler
//! and by the balancer's own health and breaker bookkeeping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use super::circuit::CircuitBreaker;
use super::instance::{Instance, InstanceStatus};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<String, Instance>>,
    next_id: AtomicU64,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl InstanceRegistry {
    /// Registry whose new instances get breakers with these settings
    pub fn new(breaker_threshold: u32, breaker_cooldown: Duration) -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            breaker_threshold,
            breaker_cooldown,
        }
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.breaker_threshold, self.breaker_cooldown)
    }

    /// Create and register a simulated instance, returning its id
    pub fn provision(&self, status: InstanceStatus) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("instance-{n:03}");
        let instance = Instance::new(
            id.clone(),
            format!("10.0.{}.{}", n / 250, n % 250 + 1),
            8080,
            self.breaker(),
        )
        .with_status(status);
        self.instances.write().insert(id.clone(), instance);
        id
    }

    pub fn insert(&self, instance: Instance) {
        self.instances.write().insert(instance.id.clone(), instance);
    }

    pub fn remove(&self, id: &str) -> Option<Instance> {
        self.instances.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.read().contains_key(id)
    }

    /// All instances in id order
    pub fn list(&self) -> Vec<Instance> {
        self.instances.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.status == status)
            .count()
    }

    /// Mutate one instance in place
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Instance) -> R) -> Result<R> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        Ok(f(instance))
    }

    /// Run `f` over the whole map under the write lock
    pub fn with_all<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Instance>) -> R) -> R {
        f(&mut self.instances.write())
    }

    /// Set status, returning the previous one if it changed
    pub fn set_status(&self, id: &str, status: InstanceStatus) -> Result<Option<InstanceStatus>> {
        self.update(id, |i| {
            let previous = i.status;
            i.status = status;
            (previous != status).then_some(previous)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_generates_ordered_ids() {
        let registry = InstanceRegistry::new(5, Duration::from_secs(30));
        let a = registry.provision(InstanceStatus::Healthy);
        let b = registry.provision(InstanceStatus::Offline);
        assert!(a < b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.count(InstanceStatus::Healthy), 1);

        let ids: Vec<_> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_set_status_reports_change() {
        let registry = InstanceRegistry::new(5, Duration::from_secs(30));
        let id = registry.provision(InstanceStatus::Offline);
        assert_eq!(
            registry.set_status(&id, InstanceStatus::Healthy).unwrap(),
            Some(InstanceStatus::Offline)
        );
        assert_eq!(registry.set_status(&id, InstanceStatus::Healthy).unwrap(), None);
        assert!(registry.set_status("nope", InstanceStatus::Healthy).is_err());
    }
}
