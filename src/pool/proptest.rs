//! Property-Based Tests for Connection Pools
//!
//! Random acquire/release sequences against a counter model. The pool must
//! never hand out more than `max` connections and its books must balance
//! after every step.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use super::pool::{ConnectionPool, PoolConfig};
use super::wait_queue::Priority;
use crate::adapters::simulated::SimulatedConnector;
use crate::error::Error;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_never_exceeds_max(
        max in 1usize..5,
        ops in prop::collection::vec(any::<bool>(), 1..30),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async move {
            let config = PoolConfig::named("prop")
                .with_size(0, max)
                .with_acquire_timeout(Duration::from_millis(20));
            let pool = ConnectionPool::new(config, Arc::new(SimulatedConnector::new()));
            let mut held = Vec::new();

            for acquire in ops {
                if acquire {
                    match pool.acquire(None, Priority::Normal).await {
                        Ok(conn) => {
                            prop_assert!(held.len() < max);
                            held.push(conn);
                        }
                        Err(Error::AcquireTimeout { .. }) => prop_assert_eq!(held.len(), max),
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                } else if let Some(conn) = held.pop() {
                    pool.release(conn).await.unwrap();
                }

                let stats = pool.stats();
                prop_assert_eq!(stats.active, held.len());
                prop_assert_eq!(stats.active + stats.idle, stats.total);
                prop_assert!(stats.total <= max);
            }
            Ok(())
        })?;
    }
}
