//! Acquire Wait Queue
//!
//! Pending acquires ordered by priority (highest first), then arrival. Each
//! waiter owns a oneshot sender; the pool completes it while holding its
//! state lock.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::connection::PooledConnection;
use crate::error::Result;

/// Acquire priority
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Position of a waiter in the queue
pub type WaitKey = (Reverse<Priority>, u64);

/// One suspended acquire
#[derive(Debug)]
pub struct Waiter {
    pub owner: Option<String>,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub(crate) reply: oneshot::Sender<Result<PooledConnection>>,
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: BTreeMap<WaitKey, Waiter>,
    next_seq: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue behind every waiter of equal or higher priority
    pub fn push(&mut self, priority: Priority, waiter: Waiter) -> WaitKey {
        self.next_seq += 1;
        let key = (Reverse(priority), self.next_seq);
        self.waiters.insert(key, waiter);
        key
    }

    /// Remove the waiter to serve next
    pub fn pop(&mut self) -> Option<Waiter> {
        self.waiters.pop_first().map(|(_, w)| w)
    }

    pub fn remove(&mut self, key: &WaitKey) -> Option<Waiter> {
        self.waiters.remove(key)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Remove every waiter, in service order
    pub fn drain(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.waiters).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn waiter(owner: &str) -> Waiter {
        let (reply, _rx) = oneshot::channel();
        let now = Instant::now();
        Waiter {
            owner: Some(owner.to_string()),
            enqueued_at: now,
            deadline: now + Duration::from_secs(1),
            reply,
        }
    }

    fn order(queue: &mut WaitQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .filter_map(|w| w.owner)
            .collect()
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = WaitQueue::new();
        queue.push(Priority::Normal, waiter("first"));
        queue.push(Priority::Normal, waiter("second"));
        queue.push(Priority::Normal, waiter("third"));
        assert_eq!(order(&mut queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_higher_priority_jumps_ahead() {
        let mut queue = WaitQueue::new();
        queue.push(Priority::Low, waiter("low"));
        queue.push(Priority::Normal, waiter("normal"));
        queue.push(Priority::Critical, waiter("critical"));
        queue.push(Priority::High, waiter("high"));
        assert_eq!(order(&mut queue), vec!["critical", "high", "normal", "low"]);
    }

    #[test]
    fn test_remove_by_key() {
        let mut queue = WaitQueue::new();
        let a = queue.push(Priority::Normal, waiter("a"));
        queue.push(Priority::Normal, waiter("b"));
        assert!(queue.remove(&a).is_some());
        assert!(queue.remove(&a).is_none());
        assert_eq!(order(&mut queue), vec!["b"]);
    }
}
