//! Periodic Task Scheduler
//!
//! Ticker + cancellation token. Every background sweep (health checks,
//! reaping, metric collection, archiving) is registered here so the business
//! logic never owns a timer and the whole set can be cancelled at once.
//!
//! Task errors are logged and the ticker keeps running; nothing propagates
//! out of a tick.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Owns every periodic background task of the control plane
pub struct Scheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Create an idle scheduler
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled on shutdown; child components may observe it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run `task` every `period` until shutdown.
    ///
    /// The first run happens one full period after registration. A zero
    /// period is rejected.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::Config(format!("task '{name}' needs a positive period")));
        }
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = name, period_ms = period.as_millis() as u64, "scheduled task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            warn!(task = name, error = %e, "scheduled task failed");
                        }
                    }
                }
            }

            debug!(task = name, "scheduled task stopped");
        });

        self.tasks.lock().push((name, handle));
        Ok(())
    }

    /// Number of registered tasks
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait for them to stop
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "scheduled task panicked");
            }
        }
        info!(tasks = count, "scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
