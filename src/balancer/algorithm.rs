//! Selection Algorithms
//!
//! Every algorithm picks from an already-filtered candidate list in id order.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::instance::Instance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Fewest cumulative requests
    #[default]
    RoundRobin,
    LeastConnections,
    /// Weight-proportional random draw
    WeightedRoundRobin,
    /// Stable per-client hash
    IpHash,
    Random,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::IpHash => "ip_hash",
            Algorithm::Random => "random",
        };
        write!(f, "{s}")
    }
}

/// Fast non-cryptographic hash (FxHash)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Choose one of `candidates`; `None` only when the list is empty.
///
/// Minimum-based algorithms return the first minimum, which is the lowest id.
pub fn select<'a, R: Rng + ?Sized>(
    algorithm: Algorithm,
    candidates: &[&'a Instance],
    client: Option<&str>,
    rng: &mut R,
) -> Option<&'a Instance> {
    if candidates.is_empty() {
        return None;
    }

    let picked = match algorithm {
        Algorithm::RoundRobin => candidates
            .iter()
            .min_by_key(|i| i.metrics.total_requests)
            .copied(),
        Algorithm::LeastConnections => candidates
            .iter()
            .min_by_key(|i| i.metrics.active_connections)
            .copied(),
        Algorithm::WeightedRoundRobin => weighted(candidates, rng),
        Algorithm::IpHash => match client {
            Some(client) => {
                let idx = (fx_hash(client.as_bytes()) % candidates.len() as u64) as usize;
                Some(candidates[idx])
            }
            None => candidates
                .iter()
                .min_by_key(|i| i.metrics.total_requests)
                .copied(),
        },
        Algorithm::Random => Some(candidates[rng.gen_range(0..candidates.len())]),
    };
    picked
}

fn weighted<'a, R: Rng + ?Sized>(candidates: &[&'a Instance], rng: &mut R) -> Option<&'a Instance> {
    let total: u64 = candidates.iter().map(|i| i.weight as u64).sum();
    if total == 0 {
        return candidates.first().copied();
    }

    let mut ticket = rng.gen_range(0..total);
    for instance in candidates {
        let w = instance.weight as u64;
        if ticket < w {
            return Some(instance);
        }
        ticket -= w;
    }
    candidates.last().copied()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::balancer::circuit::CircuitBreaker;
    use crate::balancer::instance::InstanceStatus;

    fn instance(id: &str, requests: u64, conns: u32, weight: u32) -> Instance {
        let mut i = Instance::new(id, "h", 1, CircuitBreaker::new(3, Duration::from_secs(1)))
            .with_status(InstanceStatus::Healthy)
            .with_weight(weight);
        i.metrics.total_requests = requests;
        i.metrics.active_connections = conns;
        i
    }

    #[test]
    fn test_round_robin_prefers_fewest_requests_then_id() {
        let (a, b, c) = (instance("a", 5, 0, 1), instance("b", 2, 0, 1), instance("c", 2, 0, 1));
        let list = vec![&a, &b, &c];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(Algorithm::RoundRobin, &list, None, &mut rng).unwrap().id, "b");
    }

    #[test]
    fn test_least_connections() {
        let (a, b, c) = (instance("a", 0, 4, 1), instance("b", 0, 1, 1), instance("c", 0, 1, 1));
        let list = vec![&a, &b, &c];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(Algorithm::LeastConnections, &list, None, &mut rng).unwrap().id, "b");
    }

    #[test]
    fn test_ip_hash_is_stable() {
        let (a, b, c) = (instance("a", 0, 0, 1), instance("b", 0, 0, 1), instance("c", 0, 0, 1));
        let list = vec![&a, &b, &c];
        let mut rng = StdRng::seed_from_u64(1);
        let first = select(Algorithm::IpHash, &list, Some("10.1.2.3"), &mut rng).unwrap().id.clone();
        for _ in 0..20 {
            let again = select(Algorithm::IpHash, &list, Some("10.1.2.3"), &mut rng).unwrap();
            assert_eq!(again.id, first);
        }
    }

    #[test]
    fn test_weighted_draw_follows_weights() {
        let (a, b) = (instance("a", 0, 0, 1), instance("b", 0, 0, 3));
        let list = vec![&a, &b];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..4000 {
            let pick = select(Algorithm::WeightedRoundRobin, &list, None, &mut rng).unwrap();
            *counts.entry(pick.id.clone()).or_default() += 1;
        }
        let share_b = counts["b"] as f64 / 4000.0;
        assert!((0.70..0.80).contains(&share_b), "share of b was {share_b}");
    }

    #[test]
    fn test_zero_weights_fall_back_to_first() {
        let (a, b) = (instance("a", 0, 0, 0), instance("b", 0, 0, 0));
        let list = vec![&a, &b];
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(select(Algorithm::WeightedRoundRobin, &list, None, &mut rng).unwrap().id, "a");
    }

    #[test]
    fn test_empty_candidates() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(select(Algorithm::Random, &[], None, &mut rng).is_none());
    }
}
