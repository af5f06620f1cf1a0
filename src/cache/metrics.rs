//! Cache Layer Counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free per-layer counters
#[derive(Debug, Default)]
pub struct LayerMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    integrity_failures: AtomicU64,
    sets: AtomicU64,
    fallback_loads: AtomicU64,
    fallback_failures: AtomicU64,
}

impl LayerMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, n: u64) {
        self.expirations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, ok: bool) {
        if ok {
            self.fallback_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fallback_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over lookups; zero before any lookup
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            fallback_loads: self.fallback_loads.load(Ordering::Relaxed),
            fallback_failures: self.fallback_failures.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Point-in-time copy of `LayerMetrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub integrity_failures: u64,
    pub sets: u64,
    pub fallback_loads: u64,
    pub fallback_failures: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let m = LayerMetrics::default();
        assert_eq!(m.hit_rate(), 0.0);
        m.record_hit();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        assert!((m.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let m = LayerMetrics::default();
        m.record_evictions(2);
        m.record_integrity_failure();
        m.record_fallback(true);
        m.record_fallback(false);
        let snap = m.snapshot();
        assert_eq!(snap.evictions, 2);
        assert_eq!(snap.integrity_failures, 1);
        assert_eq!(snap.fallback_loads, 1);
        assert_eq!(snap.fallback_failures, 1);
    }
}
