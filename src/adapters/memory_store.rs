//! In-Memory Data Store
//!
//! `DataStore` and `SideStore` backed by process memory, with optional
//! latency and failure injection. Rows are kept per table in insertion
//! order; pages are ordered by `created_at` then id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::ports::{
    DataStore, Row, RowFilter, RowQuery, SideStore, SortOrder, WriteBackRecord,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    persisted: RwLock<Vec<WriteBackRecord>>,
    latency: Duration,
    offline: AtomicBool,
    fail_delete: AtomicBool,
    fail_persist: AtomicBool,
    /// Fetches allowed before every further fetch fails; 0 disables
    fetch_budget: AtomicU64,
    fetches: AtomicU64,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps for `latency` first
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every operation, including `ping`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Let the next `n` fetches succeed and fail the rest
    pub fn fail_fetch_after(&self, n: u64) {
        self.fetches.store(0, Ordering::SeqCst);
        self.fetch_budget.store(n + 1, Ordering::SeqCst);
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, Vec::len)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Records received through `SideStore::persist`
    pub fn persisted(&self) -> Vec<WriteBackRecord> {
        self.persisted.read().clone()
    }

    async fn enter(&self, op: &str) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::DataStore(format!("{op}: store offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn count(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        self.enter("count").await?;
        Ok(self
            .tables
            .read()
            .get(table)
            .map_or(0, |rows| rows.iter().filter(|r| filter.matches(r)).count()) as u64)
    }

    async fn fetch(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>> {
        self.enter("fetch").await?;
        let budget = self.fetch_budget.load(Ordering::SeqCst);
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if budget > 0 && n >= budget {
            return Err(Error::DataStore(format!("fetch {n} on '{table}' failed")));
        }

        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<&Row> = rows.iter().filter(|r| query.filter.matches(r)).collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if query.order == SortOrder::Descending {
            matched.reverse();
        }
        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn insert(&self, rows: Vec<Row>) -> Result<u64> {
        self.enter("insert").await?;
        let n = rows.len() as u64;
        let mut tables = self.tables.write();
        for row in rows {
            tables.entry(row.table.clone()).or_default().push(row);
        }
        Ok(n)
    }

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        self.enter("delete").await?;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::DataStore(format!("delete on '{table}' rejected")));
        }
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.enter("ping").await
    }
}

#[async_trait]
impl SideStore for InMemoryDataStore {
    async fn persist(&self, batch: &[WriteBackRecord]) -> Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) || self.offline.load(Ordering::SeqCst) {
            return Err(Error::SideStore("side store unavailable".to_string()));
        }
        self.persisted.write().extend_from_slice(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use super::*;

    async fn store_with(n: usize) -> InMemoryDataStore {
        let store = InMemoryDataStore::new();
        let base = Utc::now() - ChronoDuration::days(10);
        let rows = (0..n)
            .map(|i| {
                Row::new("orders", format!("{i:02}"), json!({"status": if i % 2 == 0 { "open" } else { "closed" }}))
                    .created_at(base + ChronoDuration::minutes(i as i64))
            })
            .collect();
        store.insert(rows).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_paging_is_ordered() {
        let store = store_with(7).await;
        let first = store
            .fetch("orders", &RowQuery::page(RowFilter::default(), 0, 3))
            .await
            .unwrap();
        let last = store
            .fetch("orders", &RowQuery::page(RowFilter::default(), 6, 3))
            .await
            .unwrap();
        assert_eq!(first.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["00", "01", "02"]);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, "06");
    }

    #[tokio::test]
    async fn test_count_and_delete_by_filter() {
        let store = store_with(6).await;
        let closed = RowFilter::default().with_eq("status", json!("closed"));
        assert_eq!(store.count("orders", &closed).await.unwrap(), 3);
        assert_eq!(store.delete("orders", &closed).await.unwrap(), 3);
        assert_eq!(store.table_len("orders"), 3);
        assert_eq!(store.count("missing", &closed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = store_with(3).await;
        store.fail_fetch_after(1);
        let query = RowQuery::page(RowFilter::default(), 0, 10);
        assert!(store.fetch("orders", &query).await.is_ok());
        assert!(matches!(store.fetch("orders", &query).await, Err(Error::DataStore(_))));

        store.set_offline(true);
        assert!(store.ping().await.is_err());
        assert!(store.persist(&[]).await.is_err());
    }
}
