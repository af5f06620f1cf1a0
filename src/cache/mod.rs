//! Multi-Layer Cache
//!
//! Named, bounded layers of serialized values with TTL, strict LRU eviction,
//! checksum verification and an optional write-back queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                            │
//! │   get / get_or_load / set / invalidate / optimize / stats         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  serde_json ─► SHA-256 checksum ─► LZ4 (compress) ─► ChaCha20-    │
//! │                                                Poly1305 (seal)   │
//! ├────────────────┬────────────────┬────────────────┬───────────────┤
//! │  query layer   │  session layer │ reference layer│ computed layer│
//! │  HashMap +     │  ...           │  ...           │  ...          │
//! │  recency ticks │                │                │               │
//! └────────────────┴───────┬────────┴────────────────┴───────────────┘
//!                          │ sync layers
//!                          ▼
//!                  Write-back queue ─► SideStore
//! ```

mod cipher;
mod entry;
mod layer;
mod manager;
mod metrics;
mod proptest;
mod write_back;

pub use cipher::EntryCipher;
pub use entry::{checksum, CacheEntry, EntryInfo};
pub use layer::{CacheLayer, CacheLayerConfig, EvictionPolicy, LayerStats, Lookup};
pub use manager::{CacheConfig, CacheManager, CacheStats, OptimizeReport, SetOptions};
pub use metrics::{CounterSnapshot, LayerMetrics};
pub use write_back::{WriteBackConfig, WriteBackQueue, WriteBackStats};
