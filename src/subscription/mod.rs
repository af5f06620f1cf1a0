//! Subscription Batching
//!
//! Change events arrive on an mpsc channel, are routed to every stream
//! subscribed to their table and kind, and leave as ordered batches.

mod batcher;
mod event;

pub use batcher::{
    BatchConsumer, BatcherStats, BatchingConfig, StreamConfig, StreamStats, SubscriptionBatcher,
};
pub use event::{Batch, ChangeEvent, ChangeKind, FlushReason};
