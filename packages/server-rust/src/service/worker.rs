//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with periodic tick callbacks. Workers
//! are owned by the process lifecycle and stopped explicitly through a
//! `CancellationToken` rather than relying on process exit.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single on-demand task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when its token is cancelled
///
/// A tick that overruns its interval delays the next one instead of bursting.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker as a child of `parent`.
    ///
    /// Cancelling `parent` (e.g. on process shutdown) stops the worker too.
    /// The channel capacity is fixed at 64.
    pub fn start(
        name: &'static str,
        mut runnable: R,
        tick_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let cancel = parent.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = name, "background worker stopped");
        });

        Self {
            name,
            tx: Some(tx),
            cancel,
            handle: Some(handle),
        }
    }

    /// Worker name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker {} channel closed", self.name)),
            None => Err(anyhow::anyhow!("worker {} not running", self.name)),
        }
    }

    /// Stop the worker, waiting for its task (including `shutdown()`) to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
