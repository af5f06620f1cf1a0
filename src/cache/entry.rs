//! Cache Entry Types

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::compression::CompressionAlgorithm;

/// Per-entry encryption nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// SHA-256 hex digest of the logical (serialized, pre-encryption) value
pub fn checksum(logical: &[u8]) -> String {
    hex::encode(Sha256::digest(logical))
}

/// One stored value and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored bytes, possibly compressed then encrypted
    pub(crate) payload: Bytes,
    pub(crate) compression: CompressionAlgorithm,
    /// Present iff the payload is encrypted
    pub(crate) nonce: Option<[u8; NONCE_LEN]>,
    pub(crate) created_at: Instant,
    pub(crate) last_accessed: Instant,
    pub(crate) access_count: u64,
    /// Recency tick; larger is more recent
    pub(crate) tick: u64,
    pub(crate) ttl: Duration,
    /// Logical size in bytes
    pub(crate) size_bytes: usize,
    pub(crate) checksum: String,
    pub(crate) tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(
        payload: Bytes,
        compression: CompressionAlgorithm,
        nonce: Option<[u8; NONCE_LEN]>,
        ttl: Duration,
        size_bytes: usize,
        checksum: String,
        tags: BTreeSet<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            payload,
            compression,
            nonce,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            tick: 0,
            ttl,
            size_bytes,
            checksum,
            tags,
        }
    }

    /// An entry is expired once its age reaches its TTL
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    /// Bytes actually held in memory
    #[inline]
    pub fn stored_size(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compression.is_compressed()
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.nonce.is_some()
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }

    pub(crate) fn touch(&mut self, now: Instant, tick: u64) {
        self.last_accessed = now;
        self.access_count += 1;
        self.tick = tick;
    }

    /// Serializable view for dashboards
    pub fn info(&self, key: &str, now: Instant) -> EntryInfo {
        EntryInfo {
            key: key.to_string(),
            size_bytes: self.size_bytes,
            stored_bytes: self.stored_size(),
            access_count: self.access_count,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: now.saturating_duration_since(self.last_accessed).as_millis() as u64,
            ttl_ms: self.ttl.as_millis() as u64,
            compressed: self.is_compressed(),
            encrypted: self.is_encrypted(),
            tags: self.tags.iter().cloned().collect(),
        }
    }
}

/// Read-only description of a cache entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub size_bytes: usize,
    pub stored_bytes: usize,
    pub access_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub ttl_ms: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            Bytes::from_static(b"{}"),
            CompressionAlgorithm::None,
            None,
            ttl,
            2,
            checksum(b"{}"),
            ["users".to_string()].into_iter().collect(),
        )
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum(b"hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum(b"hello"));
        assert_ne!(a, checksum(b"hellp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let e = entry(Duration::from_secs(10));
        let start = e.created_at;
        assert!(!e.is_expired(start + Duration::from_millis(9_999)));
        assert!(e.is_expired(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_tag_intersection() {
        let e = entry(Duration::from_secs(1));
        assert!(e.has_any_tag(&["orders".into(), "users".into()]));
        assert!(!e.has_any_tag(&["orders".into()]));
        assert!(!e.has_any_tag(&[]));
    }
}
