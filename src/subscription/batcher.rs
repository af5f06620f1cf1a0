//! Subscription Batcher
//!
//! Buffers change events per stream and hands them to one consumer in
//! bounded batches. A stream flushes when its buffer reaches `batch_size` or
//! when `timeout` has elapsed since the first buffered event, whichever comes
//! first.
//!
//! Every flush takes the delivery lock before draining a buffer, so batches
//! of one stream reach the consumer in the order they were cut. Each flush
//! gives the stream a fresh generation from a batcher-wide counter; a timer
//! armed for any other generation, including one left behind by an earlier
//! stream of the same name, finds nothing to do when it fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{Batch, ChangeEvent, ChangeKind, FlushReason};
use crate::config::duration_ms;
use crate::error::{Error, Result};

// =============================================================================
// Consumer
// =============================================================================

/// Receives every flushed batch
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn deliver(&self, batch: Batch) -> Result<()>;
}

#[async_trait]
impl<F> BatchConsumer for F
where
    F: Fn(Batch) -> Result<()> + Send + Sync,
{
    async fn deliver(&self, batch: Batch) -> Result<()> {
        (self)(batch)
    }
}

// =============================================================================
// Configuration
// =============================================================================

fn default_batch_size() -> usize {
    100
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

/// One named subscription on a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub table: String,
    /// Event kinds to accept; empty accepts all
    #[serde(default)]
    pub kinds: Vec<ChangeKind>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    /// Streams without traffic for this long are dropped on reevaluation
    #[serde(with = "duration_ms", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

impl StreamConfig {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            kinds: Vec::new(),
            batch_size: default_batch_size(),
            timeout: default_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }

    pub fn kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table() == self.table && (self.kinds.is_empty() || self.kinds.contains(&event.kind()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.table.is_empty() {
            return Err(Error::Config("stream needs a name and a table".to_string()));
        }
        if self.batch_size == 0 || self.timeout.is_zero() {
            return Err(Error::Config(format!(
                "stream '{}' batch_size and timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Streams subscribed at startup
    pub streams: Vec<StreamConfig>,
    /// Capacity of the change-event channel
    pub channel_capacity: usize,
    #[serde(with = "duration_ms")]
    pub reevaluate_interval: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            channel_capacity: 1024,
            reevaluate_interval: Duration::from_secs(60),
        }
    }
}

impl BatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 || self.reevaluate_interval.is_zero() {
            return Err(Error::Config(
                "batching channel_capacity and reevaluate_interval must be positive".to_string(),
            ));
        }
        for stream in &self.streams {
            stream.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub name: String,
    pub table: String,
    pub buffered: usize,
    pub batches: u64,
    pub events: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatcherStats {
    pub streams: usize,
    pub buffered: usize,
    pub events_received: u64,
    pub events_unmatched: u64,
    pub batches_delivered: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    pub streams_dropped: u64,
    pub per_stream: Vec<StreamStats>,
}

// =============================================================================
// Stream State
// =============================================================================

struct StreamState {
    config: StreamConfig,
    buffer: Vec<ChangeEvent>,
    generation: u64,
    /// Generation a pending timer was armed for
    timer_generation: Option<u64>,
    next_sequence: u64,
    last_activity: Instant,
    batches: u64,
    events: u64,
}

impl StreamState {
    fn new(config: StreamConfig, generation: u64) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            generation,
            timer_generation: None,
            next_sequence: 0,
            last_activity: Instant::now(),
            batches: 0,
            events: 0,
        }
    }

    fn take(&mut self, reason: FlushReason, generation: u64) -> Batch {
        let events = std::mem::take(&mut self.buffer);
        self.generation = generation;
        self.timer_generation = None;
        self.next_sequence += 1;
        self.batches += 1;
        self.events += events.len() as u64;
        Batch {
            stream: self.config.name.clone(),
            sequence: self.next_sequence,
            reason,
            events,
            flushed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: u64,
    unmatched: u64,
    batches_delivered: u64,
    events_delivered: u64,
    delivery_failures: u64,
    size_flushes: u64,
    timeout_flushes: u64,
    streams_dropped: u64,
}

struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    consumer: Arc<dyn BatchConsumer>,
    delivery: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
    token: CancellationToken,
    closed: AtomicBool,
    generations: AtomicU64,
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn arm_timer(self: &Arc<Self>, stream: String, generation: u64, timeout: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    inner.flush_generation(&stream, generation).await;
                }
            }
        });
    }

    async fn flush_generation(&self, stream: &str, generation: u64) {
        let _order = self.delivery.lock().await;
        let batch = {
            let mut streams = self.streams.lock();
            match streams.get_mut(stream) {
                Some(state) if state.generation == generation && !state.buffer.is_empty() => {
                    Some(state.take(FlushReason::Timeout, self.next_generation()))
                }
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.deliver(batch).await;
        }
    }

    /// Caller holds the delivery lock
    async fn deliver(&self, batch: Batch) -> usize {
        let (stream, sequence, reason, len) =
            (batch.stream.clone(), batch.sequence, batch.reason, batch.len());
        let result = self.consumer.deliver(batch).await;

        let mut counters = self.counters.lock();
        match reason {
            FlushReason::Size => counters.size_flushes += 1,
            FlushReason::Timeout => counters.timeout_flushes += 1,
            _ => {}
        }
        match result {
            Ok(()) => {
                counters.batches_delivered += 1;
                counters.events_delivered += len as u64;
                debug!(stream = %stream, sequence, %reason, events = len, "batch delivered");
            }
            Err(e) => {
                counters.delivery_failures += 1;
                warn!(stream = %stream, sequence, %reason, events = len, error = %e, "batch delivery failed");
            }
        }
        len
    }
}

// =============================================================================
// Subscription Batcher
// =============================================================================

/// Per-stream change-event batcher. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionBatcher {
    inner: Arc<Inner>,
}

impl SubscriptionBatcher {
    pub fn new(consumer: Arc<dyn BatchConsumer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                consumer,
                delivery: tokio::sync::Mutex::new(()),
                counters: Mutex::new(Counters::default()),
                token: CancellationToken::new(),
                closed: AtomicBool::new(false),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Build a batcher with every stream in `config` subscribed
    pub fn from_config(config: &BatchingConfig, consumer: Arc<dyn BatchConsumer>) -> Result<Self> {
        let batcher = Self::new(consumer);
        for stream in &config.streams {
            batcher.subscribe(stream.clone())?;
        }
        Ok(batcher)
    }

    pub fn subscribe(&self, config: StreamConfig) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::BatcherShutdown);
        }
        config.validate()?;

        let mut streams = self.inner.streams.lock();
        if streams.contains_key(&config.name) {
            return Err(Error::StreamExists(config.name));
        }
        info!(stream = %config.name, table = %config.table, batch_size = config.batch_size, "stream subscribed");
        streams.insert(config.name.clone(), StreamState::new(config, self.inner.next_generation()));
        Ok(())
    }

    /// Remove a stream, delivering whatever it still buffers
    pub async fn unsubscribe(&self, name: &str) -> Result<usize> {
        let _order = self.inner.delivery.lock().await;
        let batch = {
            let mut streams = self.inner.streams.lock();
            let mut state = streams
                .remove(name)
                .ok_or_else(|| Error::StreamNotFound(name.to_string()))?;
            (!state.buffer.is_empty())
                .then(|| state.take(FlushReason::Removed, self.inner.next_generation()))
        };
        info!(stream = name, "stream unsubscribed");
        Ok(match batch {
            Some(batch) => self.inner.deliver(batch).await,
            None => 0,
        })
    }

    /// Route one event to every matching stream, returning how many matched
    pub async fn publish(&self, event: ChangeEvent) -> Result<usize> {
        if self.is_shutdown() {
            return Err(Error::BatcherShutdown);
        }

        let _order = self.inner.delivery.lock().await;
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut timers = Vec::new();
        let matched = {
            let mut streams = self.inner.streams.lock();
            let mut matched = 0;
            for (name, state) in streams.iter_mut() {
                if !state.config.matches(&event) {
                    continue;
                }
                matched += 1;
                state.last_activity = now;
                state.buffer.push(event.clone());

                if state.buffer.len() >= state.config.batch_size {
                    ready.push(state.take(FlushReason::Size, self.inner.next_generation()));
                } else if state.timer_generation != Some(state.generation) {
                    state.timer_generation = Some(state.generation);
                    timers.push((name.clone(), state.generation, state.config.timeout));
                }
            }
            matched
        };

        {
            let mut counters = self.inner.counters.lock();
            counters.received += 1;
            if matched == 0 {
                counters.unmatched += 1;
            }
        }
        for (stream, generation, timeout) in timers {
            self.inner.arm_timer(stream, generation, timeout);
        }
        for batch in ready {
            self.inner.deliver(batch).await;
        }
        Ok(matched)
    }

    /// Deliver a stream's buffer now; returns the number of events flushed
    pub async fn flush(&self, name: &str) -> Result<usize> {
        let _order = self.inner.delivery.lock().await;
        let batch = {
            let mut streams = self.inner.streams.lock();
            let state = streams
                .get_mut(name)
                .ok_or_else(|| Error::StreamNotFound(name.to_string()))?;
            (!state.buffer.is_empty())
                .then(|| state.take(FlushReason::Manual, self.inner.next_generation()))
        };
        Ok(match batch {
            Some(batch) => self.inner.deliver(batch).await,
            None => 0,
        })
    }

    /// Consume `rx` until it closes or the batcher shuts down.
    ///
    /// Returns the number of events consumed.
    pub async fn ingest(&self, mut rx: mpsc::Receiver<ChangeEvent>) -> u64 {
        let mut consumed = 0;
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if self.publish(event).await.is_err() {
                        break;
                    }
                    consumed += 1;
                }
            }
        }
        debug!(consumed, "change-event ingest stopped");
        consumed
    }

    pub fn spawn_ingest(&self, rx: mpsc::Receiver<ChangeEvent>) -> JoinHandle<u64> {
        let batcher = self.clone();
        tokio::spawn(async move { batcher.ingest(rx).await })
    }

    /// Drop streams idle past their idle timeout; returns their names
    pub async fn reevaluate(&self) -> Vec<String> {
        let _order = self.inner.delivery.lock().await;
        let now = Instant::now();
        let removed: Vec<(String, Option<Batch>)> = {
            let mut streams = self.inner.streams.lock();
            let idle: Vec<String> = streams
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_activity) >= s.config.idle_timeout)
                .map(|(name, _)| name.clone())
                .collect();
            idle.into_iter()
                .filter_map(|name| {
                    let mut state = streams.remove(&name)?;
                    let batch = (!state.buffer.is_empty())
                        .then(|| state.take(FlushReason::Removed, self.inner.next_generation()));
                    Some((name, batch))
                })
                .collect()
        };

        let mut names = Vec::with_capacity(removed.len());
        for (name, batch) in removed {
            if let Some(batch) = batch {
                self.inner.deliver(batch).await;
            }
            info!(stream = %name, "idle stream dropped");
            names.push(name);
        }
        self.inner.counters.lock().streams_dropped += names.len() as u64;
        names
    }

    /// Stop timers and deliver every buffered event with reason `shutdown`.
    ///
    /// Returns the number of events flushed. Later calls flush nothing.
    pub async fn shutdown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.inner.token.cancel();

        let _order = self.inner.delivery.lock().await;
        let batches: Vec<Batch> = self
            .inner
            .streams
            .lock()
            .values_mut()
            .filter(|s| !s.buffer.is_empty())
            .map(|s| s.take(FlushReason::Shutdown, self.inner.next_generation()))
            .collect();

        let mut flushed = 0;
        for batch in batches {
            flushed += self.inner.deliver(batch).await;
        }
        info!(flushed, "subscription batcher shut down");
        flushed
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn buffered(&self) -> usize {
        self.inner.streams.lock().values().map(|s| s.buffer.len()).sum()
    }

    pub fn stats(&self) -> BatcherStats {
        let now = Instant::now();
        let mut per_stream: Vec<StreamStats> = self
            .inner
            .streams
            .lock()
            .values()
            .map(|s| StreamStats {
                name: s.config.name.clone(),
                table: s.config.table.clone(),
                buffered: s.buffer.len(),
                batches: s.batches,
                events: s.events,
                idle_ms: now.duration_since(s.last_activity).as_millis() as u64,
            })
            .collect();
        per_stream.sort_by(|a, b| a.name.cmp(&b.name));

        let c = self.inner.counters.lock();
        BatcherStats {
            streams: per_stream.len(),
            buffered: per_stream.iter().map(|s| s.buffered).sum(),
            events_received: c.received,
            events_unmatched: c.unmatched,
            batches_delivered: c.batches_delivered,
            events_delivered: c.events_delivered,
            delivery_failures: c.delivery_failures,
            size_flushes: c.size_flushes,
            timeout_flushes: c.timeout_flushes,
            streams_dropped: c.streams_dropped,
            per_stream,
        }
    }
}
