//! Property-Based Tests for Cache Layers
//!
//! A layer is checked against a plain vector model of LRU order:
//! capacity is never exceeded and eviction always takes the least
//! recently touched key.

#![cfg(test)]

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::time::Instant;

use super::entry::{checksum, CacheEntry};
use super::layer::{CacheLayer, CacheLayerConfig, Lookup};
use crate::compression::CompressionAlgorithm;

#[derive(Debug, Clone)]
enum Op {
    Set(u8),
    Get(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8).prop_map(Op::Set),
        2 => (0u8..8).prop_map(Op::Get),
        1 => (0u8..8).prop_map(Op::Remove),
    ]
}

fn entry() -> CacheEntry {
    CacheEntry::new(
        Bytes::from_static(b"v"),
        CompressionAlgorithm::None,
        None,
        Duration::from_secs(3600),
        1,
        checksum(b"v"),
        Default::default(),
    )
}

/// Least recently used first
fn touch(model: &mut Vec<String>, key: &str) {
    model.retain(|k| k != key);
    model.push(key.to_string());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_layer_matches_lru_model(
        capacity in 1usize..5,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let layer = CacheLayer::new(CacheLayerConfig::new("prop", Duration::from_secs(3600), capacity));
        let mut model: Vec<String> = Vec::new();
        let now = Instant::now();

        for op in ops {
            match op {
                Op::Set(k) => {
                    let key = format!("k{k}");
                    model.retain(|m| m != &key);
                    let mut expected = Vec::new();
                    while model.len() >= capacity {
                        expected.push(model.remove(0));
                    }
                    model.push(key.clone());
                    let evicted = layer.insert(&key, entry());
                    prop_assert_eq!(evicted, expected);
                }
                Op::Get(k) => {
                    let key = format!("k{k}");
                    let found = matches!(layer.lookup(&key, now), Lookup::Found(_));
                    prop_assert_eq!(found, model.contains(&key));
                    if found {
                        touch(&mut model, &key);
                    }
                }
                Op::Remove(k) => {
                    let key = format!("k{k}");
                    let removed = layer.remove(&key).is_some();
                    prop_assert_eq!(removed, model.contains(&key));
                    model.retain(|m| m != &key);
                }
            }
            prop_assert!(layer.len() <= capacity);
            prop_assert_eq!(layer.keys_by_recency(), model.clone());
        }
    }
}
