//! Cache Layer
//!
//! One named, size-bounded key space with its own TTL and flags. Recency is a
//! strictly increasing tick per layer, indexed in a `BTreeMap` so the
//! least-recently-used key is always the first entry.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::entry::{CacheEntry, EntryInfo};
use super::metrics::{CounterSnapshot, LayerMetrics};
use crate::config::duration_ms;
use crate::error::{Error, Result};

/// Which entry is removed when a layer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used
    #[default]
    Lru,
}

/// Layer definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLayerConfig {
    pub name: String,
    /// Default time-to-live for entries
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub max_entries: usize,
    pub eviction: EvictionPolicy,
    pub compress: bool,
    pub encrypt: bool,
    /// Queue writes for the side store
    pub sync: bool,
}

impl CacheLayerConfig {
    pub fn new(name: impl Into<String>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            ttl,
            max_entries,
            ..Default::default()
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn synced(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("cache layer name must not be empty".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::Config(format!(
                "cache layer {}: max_entries must be positive",
                self.name
            )));
        }
        if self.ttl.is_zero() {
            return Err(Error::Config(format!(
                "cache layer {}: ttl must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            ttl: Duration::from_secs(300),
            max_entries: 1000,
            eviction: EvictionPolicy::Lru,
            compress: false,
            encrypt: false,
            sync: false,
        }
    }
}

/// Result of a keyed lookup
#[derive(Debug)]
pub enum Lookup {
    Found(CacheEntry),
    Missing,
    /// Entry was present but past its TTL; it has been removed
    Expired,
}

#[derive(Debug, Default)]
struct LayerState {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    stored_bytes: usize,
}

impl LayerState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.stored_bytes -= entry.stored_size();
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(String, CacheEntry)> {
        let (_, key) = self.recency.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.stored_bytes -= entry.stored_size();
        Some((key, entry))
    }
}

/// A bounded key space
#[derive(Debug)]
pub struct CacheLayer {
    config: CacheLayerConfig,
    state: Mutex<LayerState>,
    metrics: LayerMetrics,
}

impl CacheLayer {
    pub fn new(config: CacheLayerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LayerState::default()),
            metrics: LayerMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheLayerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &LayerMetrics {
        &self.metrics
    }

    /// Look up `key`, refreshing its recency on a live hit.
    ///
    /// Does not count hits or misses; the caller decides once the payload has
    /// been verified.
    pub fn lookup(&self, key: &str, now: Instant) -> Lookup {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => return Lookup::Missing,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.take(key);
            self.metrics.record_expirations(1);
            return Lookup::Expired;
        }

        let tick = state.tick();
        let LayerState {
            entries, recency, ..
        } = &mut *state;
        match entries.get_mut(key) {
            Some(entry) => {
                recency.remove(&entry.tick);
                entry.touch(now, tick);
                recency.insert(tick, key.to_string());
                Lookup::Found(entry.clone())
            }
            None => Lookup::Missing,
        }
    }

    /// Insert or replace `key`, evicting least-recently-used entries first
    /// when the layer is full. Returns the evicted keys.
    pub fn insert(&self, key: &str, mut entry: CacheEntry) -> Vec<String> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();

        state.take(key);
        while state.entries.len() >= self.config.max_entries {
            match state.pop_lru() {
                Some((victim, _)) => evicted.push(victim),
                None => break,
            }
        }

        entry.tick = state.tick();
        state.stored_bytes += entry.stored_size();
        state.recency.insert(entry.tick, key.to_string());
        state.entries.insert(key.to_string(), entry);
        drop(state);

        self.metrics.record_set();
        if !evicted.is_empty() {
            self.metrics.record_evictions(evicted.len() as u64);
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().take(key)
    }

    /// Remove every entry for which `predicate(key, entry)` holds.
    /// Returns `(removed, freed stored bytes)`.
    pub fn remove_where<F>(&self, mut predicate: F) -> (usize, usize)
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, e))
            .map(|(k, _)| k.clone())
            .collect();

        let mut freed = 0;
        for key in &doomed {
            if let Some(entry) = state.take(key) {
                freed += entry.stored_size();
            }
        }
        (doomed.len(), freed)
    }

    /// Drop expired entries
    pub fn purge_expired(&self, now: Instant) -> (usize, usize) {
        let (removed, freed) = self.remove_where(|_, e| e.is_expired(now));
        if removed > 0 {
            self.metrics.record_expirations(removed as u64);
        }
        (removed, freed)
    }

    /// Evict least-recently-used entries until at most `target` remain
    pub fn trim_to(&self, target: usize) -> (usize, usize) {
        let mut state = self.state.lock();
        let mut removed = 0;
        let mut freed = 0;
        while state.entries.len() > target {
            match state.pop_lru() {
                Some((_, entry)) => {
                    removed += 1;
                    freed += entry.stored_size();
                }
                None => break,
            }
        }
        drop(state);
        if removed > 0 {
            self.metrics.record_evictions(removed as u64);
        }
        (removed, freed)
    }

    /// Clones of uncompressed entries whose logical size exceeds `min_size`
    pub fn compression_candidates(&self, min_size: usize) -> Vec<(String, CacheEntry)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_compressed() && e.size_bytes > min_size)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Swap in a rewritten payload if the entry has not changed meanwhile.
    /// Returns the stored bytes saved.
    pub fn rewrite(&self, key: &str, original: &CacheEntry, rewritten: CacheEntry) -> Option<usize> {
        let mut state = self.state.lock();
        let current = state.entries.get_mut(key)?;
        if current.checksum != original.checksum || current.created_at != original.created_at {
            return None;
        }

        let before = current.stored_size();
        let after = rewritten.stored_size();
        current.payload = rewritten.payload;
        current.compression = rewritten.compression;
        current.nonce = rewritten.nonce;
        state.stored_bytes = state.stored_bytes + after - before;
        Some(before.saturating_sub(after))
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        state.stored_bytes = 0;
        n
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Entry count over capacity
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.config.max_entries as f64
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.state.lock().recency.values().cloned().collect()
    }

    pub fn entries(&self, now: Instant) -> Vec<EntryInfo> {
        let state = self.state.lock();
        state
            .recency
            .values()
            .rev()
            .filter_map(|k| state.entries.get(k).map(|e| e.info(k, now)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, key: &str, payload: bytes::Bytes) {
        let mut state = self.state.lock();
        let delta = payload.len();
        if let Some(entry) = state.entries.get_mut(key) {
            let before = entry.stored_size();
            entry.payload = payload;
            state.stored_bytes = state.stored_bytes + delta - before;
        }
    }

    pub fn stats(&self) -> LayerStats {
        let (entries, stored_bytes, logical_bytes) = {
            let state = self.state.lock();
            (
                state.entries.len(),
                state.stored_bytes,
                state.entries.values().map(|e| e.size_bytes).sum(),
            )
        };
        LayerStats {
            name: self.config.name.clone(),
            entries,
            max_entries: self.config.max_entries,
            stored_bytes,
            logical_bytes,
            utilization: entries as f64 / self.config.max_entries as f64,
            ttl_ms: self.config.ttl.as_millis() as u64,
            compress: self.config.compress,
            encrypt: self.config.encrypt,
            sync: self.config.sync,
            counters: self.metrics.snapshot(),
        }
    }
}

/// Per-layer statistics
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub name: String,
    pub entries: usize,
    pub max_entries: usize,
    pub stored_bytes: usize,
    pub logical_bytes: usize,
    pub utilization: f64,
    pub ttl_ms: u64,
    pub compress: bool,
    pub encrypt: bool,
    pub sync: bool,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}
