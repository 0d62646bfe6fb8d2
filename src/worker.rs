//! Background polling loops.
//!
//! The publisher and the dispatcher are both "do one bounded batch, sleep,
//! repeat" jobs. [`spawn`] runs such a job on a tokio task until its
//! [`CancellationToken`] fires. Cancellation is only observed between ticks,
//! so an in-flight batch (including its HTTP calls) always finishes.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let handle = outbox_relay::worker::spawn(publisher, Duration::from_secs(5), token.child_token());
//!
//! // ... on shutdown ...
//! let stats = handle.stop().await;
//! tracing::info!(polls = stats.polls, items = stats.items, "publisher stopped");
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One unit of periodic work.
#[async_trait]
pub trait PollingJob: Send + Sync + 'static {
    /// Used in log lines.
    fn name(&self) -> &str;

    /// Run one batch. Returns the number of items handled.
    async fn poll(&self) -> Result<usize>;
}

#[async_trait]
impl<J: PollingJob + ?Sized> PollingJob for Arc<J> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn poll(&self) -> Result<usize> {
        (**self).poll().await
    }
}

/// Counters reported by a stopped worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: usize,
    pub items: usize,
    pub errors: usize,
}

/// Handle to a running worker.
pub struct WorkerHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<WorkerStats>>,
}

/// Run `job` every `interval` until `token` is cancelled.
///
/// The first tick runs immediately. Ticks that overrun the interval delay the
/// schedule rather than bursting to catch up. A failing tick is logged and
/// the loop continues.
pub fn spawn<J: PollingJob>(job: J, interval: Duration, token: CancellationToken) -> WorkerHandle {
    let loop_token = token.clone();

    let handle = tokio::spawn(async move {
        let mut stats = WorkerStats::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            target: "outbox_relay::worker",
            worker = job.name(),
            interval_ms = interval.as_millis() as u64,
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            stats.polls += 1;
            match job.poll().await {
                Ok(items) => stats.items += items,
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(
                        target: "outbox_relay::worker",
                        worker = job.name(),
                        error = %e,
                        "Worker tick failed"
                    );
                }
            }
        }

        tracing::info!(
            target: "outbox_relay::worker",
            worker = job.name(),
            polls = stats.polls,
            items = stats.items,
            errors = stats.errors,
            "Worker stopped"
        );
        stats
    });

    WorkerHandle {
        token,
        handle: Some(handle),
    }
}

impl WorkerHandle {
    /// Signal the worker to stop and wait for the current tick to finish.
    pub async fn stop(mut self) -> WorkerStats {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => WorkerStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Don't block on drop; the task exits after its current tick.
        self.token.cancel();
    }
}
