//! Background consolidation worker
//!
//! A single task owns the [`ConsolidationContext`] and serves interval ticks
//! and manual triggers one at a time, so two batches can never overlap. A
//! stop request is only seen between batches.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::orchestrator::{BatchReport, ConsolidationContext, ConsolidationOrchestrator, ProcessingStats};
use crate::error::{Result, ReverieError};

/// Commands for the consolidation worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run a batch now and send back its report
    RunNow(oneshot::Sender<BatchReport>),
    /// Stop the worker after the current batch
    Stop,
}

/// Handle to the background consolidation task
pub struct ConsolidationWorker {
    sender: mpsc::Sender<WorkerCommand>,
    stats: Arc<RwLock<ProcessingStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsolidationWorker {
    /// Start the worker. With `run_on_start` one batch runs before the first
    /// interval tick.
    pub fn start(
        orchestrator: Arc<ConsolidationOrchestrator>,
        mut ctx: ConsolidationContext,
        run_on_start: bool,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<WorkerCommand>(16);
        let stats = Arc::new(RwLock::new(ctx.stats.clone()));
        let published = stats.clone();
        let period = Duration::from_secs(orchestrator.config().poll_interval_secs.max(1));

        let task = tokio::spawn(async move {
            if run_on_start {
                Self::run_batch(&orchestrator, &mut ctx, &published).await;
            }

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    cmd = receiver.recv() => match cmd {
                        Some(WorkerCommand::RunNow(reply)) => {
                            let report = Self::run_batch(&orchestrator, &mut ctx, &published).await;
                            let _ = reply.send(report);
                        }
                        Some(WorkerCommand::Stop) | None => break,
                    },
                    _ = ticker.tick() => {
                        Self::run_batch(&orchestrator, &mut ctx, &published).await;
                    }
                }
            }

            tracing::info!(batches = ctx.batches_run, "Consolidation worker stopped");
        });

        Self {
            sender,
            stats,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run_batch(
        orchestrator: &ConsolidationOrchestrator,
        ctx: &mut ConsolidationContext,
        published: &RwLock<ProcessingStats>,
    ) -> BatchReport {
        let report = orchestrator.run_batch(ctx).await;
        *published.write() = ctx.stats.clone();
        report
    }

    /// Run a batch on the worker, queued behind any batch in flight
    pub async fn run_now(&self) -> Result<BatchReport> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WorkerCommand::RunNow(reply))
            .await
            .map_err(|_| Self::stopped())?;
        response.await.map_err(|_| Self::stopped())
    }

    /// Latest stats snapshot, published after every batch
    pub fn stats(&self) -> ProcessingStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Stop the worker and wait for the batch in flight to finish
    pub async fn stop(&self) -> Result<()> {
        // Already stopped is fine
        let _ = self.sender.send(WorkerCommand::Stop).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| ReverieError::Internal(format!("consolidation worker panicked: {}", e)))?;
        }
        Ok(())
    }

    fn stopped() -> ReverieError {
        ReverieError::Unavailable("consolidation worker has stopped".to_string())
    }
}
