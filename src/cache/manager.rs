//! Cache Manager
//!
//! Typed front end over the named layers. Values are serialized to JSON,
//! checksummed, optionally compressed and encrypted, then stored in their
//! layer. Reads verify the checksum and evict anything that fails.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cipher::EntryCipher;
use super::entry::{checksum, CacheEntry, EntryInfo};
use super::layer::{CacheLayer, CacheLayerConfig, LayerStats, Lookup};
use super::write_back::{WriteBackConfig, WriteBackQueue, WriteBackStats};
use crate::compression::{Codec, CompressionAlgorithm};
use crate::domain::ports::{SideStore, WriteBackRecord};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub layers: Vec<CacheLayerConfig>,
    /// Entries larger than this are compressed by `optimize`
    pub compression_threshold: usize,
    /// Secret for encrypted layers
    pub encryption_key: String,
    /// Trim a layer once its utilization exceeds this
    pub trim_high_watermark: f64,
    /// Trim target utilization
    pub trim_low_watermark: f64,
    pub write_back: WriteBackConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                CacheLayerConfig::new("query", Duration::from_secs(300), 1000).compressed(),
                CacheLayerConfig::new("session", Duration::from_secs(1800), 500)
                    .encrypted()
                    .synced(),
                CacheLayerConfig::new("reference", Duration::from_secs(3600), 200).compressed(),
                CacheLayerConfig::new("computed", Duration::from_secs(600), 500),
            ],
            compression_threshold: 1024,
            encryption_key: "scaleplane-local".to_string(),
            trim_high_watermark: 0.8,
            trim_low_watermark: 0.7,
            write_back: WriteBackConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::Config("at least one cache layer is required".into()));
        }
        let mut names = BTreeSet::new();
        for layer in &self.layers {
            layer.validate()?;
            if !names.insert(layer.name.as_str()) {
                return Err(Error::Config(format!("duplicate cache layer '{}'", layer.name)));
            }
        }
        if !(0.0 < self.trim_low_watermark
            && self.trim_low_watermark < self.trim_high_watermark
            && self.trim_high_watermark <= 1.0)
        {
            return Err(Error::Config(
                "cache watermarks must satisfy 0 < low < high <= 1".into(),
            ));
        }
        if self.layers.iter().any(|l| l.encrypt) && self.encryption_key.is_empty() {
            return Err(Error::Config("encrypted cache layers need an encryption_key".into()));
        }
        self.write_back.validate()
    }
}

// =============================================================================
// Call Options and Reports
// =============================================================================

/// Per-call overrides for `set`
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Replaces the layer TTL
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// What `optimize` did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizeReport {
    pub freed_bytes: usize,
    pub removed_entries: usize,
    pub compressed_entries: usize,
}

/// Whole-cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub layers: Vec<LayerStats>,
    pub total_entries: usize,
    pub total_capacity: usize,
    pub stored_bytes: usize,
    pub hit_rate: f64,
    pub utilization: f64,
    pub write_back: WriteBackStats,
}

// =============================================================================
// Invalidation Patterns
// =============================================================================

/// Key matcher for `invalidate`
enum KeyPattern {
    Substring(String),
    Regex(Regex),
}

impl KeyPattern {
    /// `/.../` is a regular expression, anything else a substring
    fn parse(raw: &str) -> Result<Self> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let body = &raw[1..raw.len() - 1];
            Regex::new(body)
                .map(KeyPattern::Regex)
                .map_err(|e| Error::InvalidPattern {
                    pattern: raw.to_string(),
                    reason: e.to_string(),
                })
        } else {
            Ok(KeyPattern::Substring(raw.to_string()))
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Substring(s) => key.contains(s.as_str()),
            KeyPattern::Regex(re) => re.is_match(key),
        }
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Multi-layer cache
pub struct CacheManager {
    layers: BTreeMap<String, Arc<CacheLayer>>,
    config: CacheConfig,
    codec: Codec,
    cipher: EntryCipher,
    write_back: WriteBackQueue,
    side_store: Option<Arc<dyn SideStore>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let layers = config
            .layers
            .iter()
            .map(|l| (l.name.clone(), Arc::new(CacheLayer::new(l.clone()))))
            .collect();

        Self {
            layers,
            codec: Codec::new(0),
            cipher: EntryCipher::new(&config.encryption_key),
            write_back: WriteBackQueue::new(config.write_back.clone()),
            side_store: None,
            config,
        }
    }

    /// Attach the durable store that `sync` layers write back to
    pub fn with_side_store(mut self, store: Arc<dyn SideStore>) -> Self {
        self.side_store = Some(store);
        self
    }

    pub fn layer(&self, name: &str) -> Option<&Arc<CacheLayer>> {
        self.layers.get(name)
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    /// Fetch a live, verified value.
    ///
    /// Misses when the layer or key is absent, the entry has expired, the
    /// payload fails verification, or it does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, layer: &str, key: &str) -> Option<T> {
        let cache = self.layers.get(layer)?;

        let entry = match cache.lookup(key, Instant::now()) {
            Lookup::Found(entry) => entry,
            Lookup::Missing | Lookup::Expired => {
                cache.metrics().record_miss();
                return None;
            }
        };

        let logical = match self.open(layer, key, &entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(layer, key, error = %e, "evicting entry that failed verification");
                cache.remove(key);
                cache.metrics().record_integrity_failure();
                cache.metrics().record_miss();
                return None;
            }
        };

        match serde_json::from_slice(&logical) {
            Ok(value) => {
                cache.metrics().record_hit();
                Some(value)
            }
            Err(e) => {
                debug!(layer, key, error = %e, "cached value has a different shape");
                cache.metrics().record_miss();
                None
            }
        }
    }

    /// `get`, falling back to `loader` on a miss.
    ///
    /// A loaded value is stored with default options. Loader errors are
    /// logged and reported as a miss.
    pub async fn get_or_load<T, F, Fut>(&self, layer: &str, key: &str, loader: F) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(value) = self.get(layer, key) {
            return Some(value);
        }

        let outcome = loader().await;
        if let Some(cache) = self.layers.get(layer) {
            cache.metrics().record_fallback(outcome.is_ok());
        }

        match outcome {
            Ok(Some(value)) => {
                self.set(layer, key, &value, SetOptions::default());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(layer, key, error = %e, "cache fallback loader failed");
                None
            }
        }
    }

    /// Store `value`; false when the layer is unknown or serialization fails
    pub fn set<T: Serialize + ?Sized>(
        &self,
        layer: &str,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> bool {
        let Some(cache) = self.layers.get(layer) else {
            debug!(layer, "set on unknown cache layer");
            return false;
        };

        let logical = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(layer, key, error = %e, "failed to serialize cache value");
                return false;
            }
        };

        let flags = cache.config();
        let (payload, compression) = if flags.compress {
            self.codec.compress(&logical)
        } else {
            (Bytes::copy_from_slice(&logical), CompressionAlgorithm::None)
        };
        let (payload, nonce) = if flags.encrypt {
            match self.cipher.encrypt(&payload) {
                Ok((sealed, nonce)) => (Bytes::from(sealed), Some(nonce)),
                Err(e) => {
                    warn!(layer, key, error = %e, "failed to encrypt cache value");
                    return false;
                }
            }
        } else {
            (payload, None)
        };

        let entry = CacheEntry::new(
            payload,
            compression,
            nonce,
            options.ttl.unwrap_or(flags.ttl),
            logical.len(),
            checksum(&logical),
            options.tags.into_iter().collect(),
        );

        let evicted = cache.insert(key, entry);
        if !evicted.is_empty() {
            debug!(layer, evicted = ?evicted, "evicted least recently used entries");
        }

        if flags.sync {
            self.write_back.enqueue(WriteBackRecord {
                layer: layer.to_string(),
                key: key.to_string(),
                value: logical,
                written_at: Utc::now(),
                attempts: 0,
            });
        }
        true
    }

    /// Remove entries by key pattern and/or tag.
    ///
    /// With neither a pattern nor tags the layer is cleared; with no layer
    /// every layer is swept.
    pub fn invalidate(
        &self,
        layer: Option<&str>,
        pattern: Option<&str>,
        tags: &[String],
    ) -> Result<usize> {
        let matcher = pattern.map(KeyPattern::parse).transpose()?;

        let targets: Vec<&Arc<CacheLayer>> = match layer {
            Some(name) => vec![self
                .layers
                .get(name)
                .ok_or_else(|| Error::CacheLayerNotFound(name.to_string()))?],
            None => self.layers.values().collect(),
        };

        let mut removed = 0;
        for cache in targets {
            removed += match &matcher {
                None if tags.is_empty() => cache.clear(),
                _ => {
                    cache
                        .remove_where(|key, entry| {
                            matcher.as_ref().is_some_and(|m| m.matches(key))
                                || entry.has_any_tag(tags)
                        })
                        .0
                }
            };
        }

        debug!(layer = ?layer, pattern = ?pattern, removed, "cache invalidated");
        Ok(removed)
    }

    /// Sweep every layer: purge expired entries, compress large ones, trim
    /// layers above the high watermark down to the low watermark.
    pub fn optimize(&self) -> OptimizeReport {
        let mut report = OptimizeReport::default();
        let now = Instant::now();

        for (name, cache) in &self.layers {
            let (removed, freed) = cache.purge_expired(now);
            report.removed_entries += removed;
            report.freed_bytes += freed;

            for (key, entry) in cache.compression_candidates(self.config.compression_threshold) {
                match self.recompress(name, &key, &entry) {
                    Ok(Some(rewritten)) => {
                        if let Some(saved) = cache.rewrite(&key, &entry, rewritten) {
                            report.compressed_entries += 1;
                            report.freed_bytes += saved;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(layer = %name, key = %key, error = %e, "dropping unreadable entry");
                        cache.remove(&key);
                        cache.metrics().record_integrity_failure();
                        report.removed_entries += 1;
                        report.freed_bytes += entry.stored_size();
                    }
                }
            }

            let max = cache.config().max_entries;
            if cache.len() as f64 > max as f64 * self.config.trim_high_watermark {
                let target = (max as f64 * self.config.trim_low_watermark).floor() as usize;
                let (removed, freed) = cache.trim_to(target);
                report.removed_entries += removed;
                report.freed_bytes += freed;
            }
        }

        info!(
            freed_bytes = report.freed_bytes,
            removed = report.removed_entries,
            compressed = report.compressed_entries,
            "cache optimized"
        );
        report
    }

    /// Hand one batch of queued writes to the side store.
    ///
    /// A failed batch is requeued and the error returned.
    pub async fn process_write_back(&self) -> Result<usize> {
        let Some(store) = &self.side_store else {
            return Ok(0);
        };

        let batch = self.write_back.take_batch();
        if batch.is_empty() {
            return Ok(0);
        }

        let n = batch.len();
        match store.persist(&batch).await {
            Ok(()) => {
                self.write_back.mark_persisted(n);
                debug!(records = n, "write-back batch persisted");
                Ok(n)
            }
            Err(e) => {
                let dropped = self.write_back.requeue(batch);
                warn!(records = n, dropped, error = %e, "write-back batch failed");
                Err(Error::SideStore(e.to_string()))
            }
        }
    }

    /// Flush write-back batches until the queue is empty or a batch fails
    pub async fn drain_write_back(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.process_write_back().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Empty one layer, or all of them
    pub fn clear(&self, layer: Option<&str>) -> Result<usize> {
        match layer {
            Some(name) => self
                .layers
                .get(name)
                .map(|l| l.clear())
                .ok_or_else(|| Error::CacheLayerNotFound(name.to_string())),
            None => Ok(self.layers.values().map(|l| l.clear()).sum()),
        }
    }

    pub fn hit_rate(&self, layer: &str) -> Option<f64> {
        self.layers.get(layer).map(|l| l.metrics().hit_rate())
    }

    pub fn entries(&self, layer: &str) -> Result<Vec<EntryInfo>> {
        self.layers
            .get(layer)
            .map(|l| l.entries(Instant::now()))
            .ok_or_else(|| Error::CacheLayerNotFound(layer.to_string()))
    }

    pub fn write_back_pending(&self) -> usize {
        self.write_back.len()
    }

    pub fn stats(&self) -> CacheStats {
        let layers: Vec<LayerStats> = self.layers.values().map(|l| l.stats()).collect();
        let total_entries = layers.iter().map(|l| l.entries).sum();
        let total_capacity: usize = layers.iter().map(|l| l.max_entries).sum();
        let hits: u64 = layers.iter().map(|l| l.counters.hits).sum();
        let lookups: u64 = hits + layers.iter().map(|l| l.counters.misses).sum::<u64>();

        CacheStats {
            total_entries,
            total_capacity,
            stored_bytes: layers.iter().map(|l| l.stored_bytes).sum(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            utilization: if total_capacity == 0 {
                0.0
            } else {
                total_entries as f64 / total_capacity as f64
            },
            write_back: self.write_back.stats(),
            layers,
        }
    }

    /// Decrypt, decompress and verify an entry, yielding the logical bytes
    fn open(&self, layer: &str, key: &str, entry: &CacheEntry) -> Result<Bytes> {
        let integrity = || Error::CacheIntegrityFailure {
            layer: layer.to_string(),
            key: key.to_string(),
        };

        let plain = match &entry.nonce {
            Some(nonce) => Bytes::from(
                self.cipher
                    .decrypt(&entry.payload, nonce)
                    .map_err(|_| integrity())?,
            ),
            None => entry.payload.clone(),
        };

        let logical = self
            .codec
            .decompress(&plain, entry.compression)
            .map_err(|_| integrity())?;
        if checksum(&logical) != entry.checksum {
            return Err(integrity());
        }
        Ok(logical)
    }

    /// Compressed (and re-sealed) copy of `entry`, or `None` if compression
    /// does not shrink it
    fn recompress(&self, layer: &str, key: &str, entry: &CacheEntry) -> Result<Option<CacheEntry>> {
        let logical = self.open(layer, key, entry)?;
        let (packed, algorithm) = self.codec.compress(&logical);
        if !algorithm.is_compressed() {
            return Ok(None);
        }

        let mut rewritten = entry.clone();
        rewritten.compression = algorithm;
        if entry.is_encrypted() {
            let (sealed, nonce) = self.cipher.encrypt(&packed)?;
            rewritten.payload = Bytes::from(sealed);
            rewritten.nonce = Some(nonce);
        } else {
            rewritten.payload = packed;
        }
        Ok(Some(rewritten))
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("layers", &self.layer_names())
            .field("write_back_pending", &self.write_back.len())
            .finish()
    }
}
