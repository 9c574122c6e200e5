//! Consolidation orchestrator
//!
//! Drives one batch end to end:
//! `Idle -> Fetching -> Analyzing -> Planning -> Executing -> Reconciling -> CleaningUp -> Idle`.
//! A fatal error before reconciliation moves the batch to `BatchFailed`; its
//! transcripts stay in the store and are picked up again by the next tick,
//! however old they are by then.

use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::analysis::AnalysisStage;
use super::execution::{ExecutionOutcome, ExecutionStage};
use super::planning::PlanningStage;
use super::reconcile::{ApplyResult, ReconciliationEngine};
use crate::error::{Result, StageError};
use crate::llm::TextCompletion;
use crate::storage::MemoryStore;
use crate::types::{
    format_timestamp, now_timestamp, CleanupPolicy, ConsolidationConfig, TranscriptBatch,
};

/// States of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Fetching,
    Analyzing,
    Planning,
    Executing,
    Reconciling,
    CleaningUp,
    BatchFailed,
}

/// The most recent fatal batch error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub time: String,
    /// The provider or the deadline was at fault, not the completion text
    pub retryable: bool,
}

/// Process-lifetime counters, reset only by a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    /// Transcripts consumed and deleted
    pub total_processed: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub last_error: Option<LastError>,
}

impl ProcessingStats {
    fn record_completed(&mut self, deleted: usize, applied: &ApplyResult) {
        self.total_processed += deleted as u64;
        self.successful_updates += applied.succeeded as u64;
        self.failed_updates += applied.failed as u64;
    }

    fn record_failure(&mut self, err: &StageError) {
        self.last_error = Some(LastError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            time: now_timestamp(),
            retryable: err.is_retryable(),
        });
    }
}

/// State that outlives a single batch. Owned by whoever schedules batches and
/// lent to [`ConsolidationOrchestrator::run_batch`].
#[derive(Debug, Clone, Default)]
pub struct ConsolidationContext {
    pub stats: ProcessingStats,
    /// Batch invocations, including no-op ones
    pub batches_run: u64,
    pub last_run: Option<String>,
    /// Oldest timestamp of transcripts a previous batch left in the store.
    /// The next fetch reaches back to it even when it is outside the window.
    pub backlog_since: Option<String>,
}

impl ConsolidationContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// How a batch ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Nothing to consolidate
    NoOp,
    Completed {
        fetched: usize,
        applied: ApplyResult,
        /// Planned blocks the execution stage had to skip
        skipped_plans: usize,
        deleted: usize,
        retained: usize,
    },
    Failed {
        #[serde(rename = "type")]
        kind: String,
        message: String,
    },
}

/// What one `run_batch` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub started_at: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
    /// States entered, in order
    pub transitions: Vec<BatchState>,
}

impl BatchReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Failed { .. })
    }
}

/// Records state transitions as a batch moves through the pipeline
struct Transitions(Vec<BatchState>);

impl Transitions {
    fn enter(&mut self, state: BatchState) {
        debug!(?state, "batch state");
        self.0.push(state);
    }
}

pub struct ConsolidationOrchestrator {
    store: Arc<dyn MemoryStore>,
    analysis: AnalysisStage,
    planning: PlanningStage,
    execution: ExecutionStage,
    reconciler: ReconciliationEngine,
    config: ConsolidationConfig,
}

impl ConsolidationOrchestrator {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        completer: Arc<dyn TextCompletion>,
        config: ConsolidationConfig,
    ) -> Self {
        let call_timeout = config.call_timeout();
        Self {
            analysis: AnalysisStage::new(completer.clone(), call_timeout),
            planning: PlanningStage::new(completer.clone(), call_timeout),
            execution: ExecutionStage::new(completer, call_timeout),
            reconciler: ReconciliationEngine::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Run one batch. Never returns an error: fatal stage errors are
    /// recorded into `ctx.stats.last_error` and reported in the outcome.
    pub async fn run_batch(&self, ctx: &mut ConsolidationContext) -> BatchReport {
        let started_at = now_timestamp();
        ctx.batches_run += 1;
        ctx.last_run = Some(started_at.clone());

        let mut transitions = Transitions(Vec::with_capacity(8));
        transitions.enter(BatchState::Fetching);

        let batch = match self.fetch(ctx.backlog_since.as_deref()) {
            Ok(batch) => batch,
            Err(e) => return self.fail(ctx, transitions, started_at, StageError::Fetch(e)),
        };
        // Stays set until cleanup has removed the whole batch
        ctx.backlog_since = batch.oldest_timestamp().map(str::to_string);
        if batch.is_empty() {
            debug!("no transcripts to consolidate");
            transitions.enter(BatchState::Idle);
            return BatchReport {
                started_at,
                outcome: BatchOutcome::NoOp,
                transitions: transitions.0,
            };
        }
        info!(transcripts = batch.len(), "consolidating batch");

        let deadline = self.config.batch_deadline();
        let staged =
            tokio::time::timeout(deadline, self.transform(&batch, &mut transitions)).await;
        let outcome = match staged {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return self.fail(ctx, transitions, started_at, e),
            Err(_) => {
                let e = StageError::Deadline(deadline.as_secs());
                return self.fail(ctx, transitions, started_at, e);
            }
        };

        transitions.enter(BatchState::Reconciling);
        let skipped_plans = outcome.skipped.len();
        let applied = self.reconciler.apply(outcome.updates);

        transitions.enter(BatchState::CleaningUp);
        let deleted = self.cleanup(&batch, &applied, skipped_plans);
        ctx.stats.record_completed(deleted, &applied);
        if deleted == batch.len() {
            ctx.backlog_since = None;
        }
        transitions.enter(BatchState::Idle);

        info!(
            succeeded = applied.succeeded,
            failed = applied.failed,
            deleted,
            "batch complete"
        );
        BatchReport {
            started_at,
            outcome: BatchOutcome::Completed {
                fetched: batch.len(),
                applied,
                skipped_plans,
                deleted,
                retained: batch.len() - deleted,
            },
            transitions: transitions.0,
        }
    }

    /// Usable transcripts inside the fetch window, or since `backlog` when
    /// that is earlier
    fn fetch(&self, backlog: Option<&str>) -> Result<TranscriptBatch> {
        let window_start = format_timestamp(Local::now() - self.config.fetch_window());
        let since = match backlog {
            Some(backlog) if backlog < window_start.as_str() => {
                debug!(backlog, "fetching left-over transcripts");
                backlog.to_string()
            }
            _ => window_start,
        };
        let records = self.store.get_transcriptions(Some(&since))?;
        let total = records.len();

        let batch: TranscriptBatch = records.into_iter().filter(|r| r.is_valid()).collect();
        if batch.len() < total {
            warn!(
                dropped = total - batch.len(),
                "ignoring transcripts without text or timestamp"
            );
        }
        Ok(batch)
    }

    async fn transform(
        &self,
        batch: &TranscriptBatch,
        transitions: &mut Transitions,
    ) -> std::result::Result<ExecutionOutcome, StageError> {
        transitions.enter(BatchState::Analyzing);
        let analysis = self
            .analysis
            .analyze(batch)
            .await
            .map_err(StageError::Analysis)?;

        transitions.enter(BatchState::Planning);
        let plans = self
            .planning
            .plan(&analysis, batch)
            .await
            .map_err(StageError::Planning)?;

        transitions.enter(BatchState::Executing);
        self.execution
            .execute(&plans, batch)
            .await
            .map_err(StageError::Execution)
    }

    /// Delete consumed transcripts according to the cleanup policy. Returns
    /// how many were deleted.
    fn cleanup(&self, batch: &TranscriptBatch, applied: &ApplyResult, skipped_plans: usize) -> usize {
        if self.config.cleanup_policy == CleanupPolicy::RequireAllSucceeded
            && (applied.failed > 0 || skipped_plans > 0)
        {
            warn!(
                failed = applied.failed,
                skipped_plans,
                retained = batch.len(),
                "keeping transcripts for reprocessing"
            );
            return 0;
        }

        batch
            .ids()
            .filter(|id| match self.store.delete_transcription(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(id, error = %e, "could not delete consumed transcript");
                    false
                }
            })
            .count()
    }

    fn fail(
        &self,
        ctx: &mut ConsolidationContext,
        mut transitions: Transitions,
        started_at: String,
        err: StageError,
    ) -> BatchReport {
        transitions.enter(BatchState::BatchFailed);
        error!(
            kind = err.kind(),
            retryable = err.is_retryable(),
            error = %err,
            "batch failed, transcripts kept for next run"
        );
        ctx.stats.record_failure(&err);
        transitions.enter(BatchState::Idle);

        BatchReport {
            started_at,
            outcome: BatchOutcome::Failed {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
            transitions: transitions.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedCompletion, ScriptedReply};
    use crate::storage::Storage;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TOPICS: &str = r#"{"topics": [{"name": "trip", "sentences": ["we leave friday"], "emotional_tone": "excited", "importance": 4}]}"#;
    const THREADS: &str = r#"{"conversation_threads": [{"topic": "trip", "context": "weekend", "sentiment": "positive", "continuation": "new"}]}"#;
    const PLAN: &str = r#"{"memory_blocks": [{"topic": "trip", "type": "new_memory", "priority": 4, "structure": {"main_points": ["leave friday"], "context": "weekend", "sentiment": "positive"}}]}"#;

    fn orchestrator(
        store: Arc<Storage>,
        replies: Vec<ScriptedReply>,
        config: ConsolidationConfig,
    ) -> ConsolidationOrchestrator {
        ConsolidationOrchestrator::new(store, Arc::new(ScriptedCompletion::new(replies)), config)
    }

    fn text(s: &str) -> ScriptedReply {
        ScriptedReply::Text(s.to_string())
    }

    fn seed(store: &Storage, texts: &[&str]) {
        for t in texts {
            store.create_transcription(t, &now_timestamp()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let orch = orchestrator(store, vec![], ConsolidationConfig::default());
        let mut ctx = ConsolidationContext::new();

        let report = orch.run_batch(&mut ctx).await;
        assert_eq!(report.outcome, BatchOutcome::NoOp);
        assert_eq!(report.transitions, vec![BatchState::Fetching, BatchState::Idle]);
        assert_eq!(ctx.stats, ProcessingStats::default());
    }

    #[tokio::test]
    async fn test_old_and_blank_transcripts_are_not_fetched() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        store
            .create_transcription("yesterday's chatter", "2000-01-01 00-00-00")
            .unwrap();
        store.create_transcription("   ", &now_timestamp()).unwrap();
        let orch = orchestrator(store.clone(), vec![], ConsolidationConfig::default());

        let report = orch.run_batch(&mut ConsolidationContext::new()).await;
        assert_eq!(report.outcome, BatchOutcome::NoOp);
        assert_eq!(store.get_transcriptions(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_planning_failure_keeps_transcripts() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        seed(&store, &["we leave friday"]);
        let orch = orchestrator(
            store.clone(),
            vec![text(TOPICS), text(THREADS), text("{\"memory_blocks\": []}")],
            ConsolidationConfig::default(),
        );
        let mut ctx = ConsolidationContext::new();

        let report = orch.run_batch(&mut ctx).await;
        assert!(report.is_failure());
        assert_eq!(
            report.transitions,
            vec![
                BatchState::Fetching,
                BatchState::Analyzing,
                BatchState::Planning,
                BatchState::BatchFailed,
                BatchState::Idle
            ]
        );
        let last_error = ctx.stats.last_error.unwrap();
        assert_eq!(last_error.kind, "PlanningError");
        assert!(!last_error.retryable);
        assert_eq!(store.get_transcriptions(None).unwrap().len(), 1);
        assert_eq!(ctx.stats.total_processed, 0);
    }

    #[tokio::test]
    async fn test_deadline_fails_batch() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        seed(&store, &["we leave friday"]);
        let config = ConsolidationConfig {
            batch_deadline_secs: 0,
            ..Default::default()
        };
        let orch = orchestrator(
            store.clone(),
            vec![ScriptedReply::Stall(Duration::from_secs(5))],
            config,
        );
        let mut ctx = ConsolidationContext::new();

        let report = orch.run_batch(&mut ctx).await;
        assert!(matches!(report.outcome, BatchOutcome::Failed { ref kind, .. } if kind == "TimeoutError"));
        assert!(ctx.stats.last_error.unwrap().retryable);
        assert_eq!(store.get_transcriptions(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_strict_cleanup_retains_on_failure() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        seed(&store, &["we leave friday", "pack the tent"]);
        let bad_action = r#"{"memory_update": {"action": "upsert", "content": {"topic": "trip", "sentences": ["x"]}}}"#;
        let config = ConsolidationConfig {
            cleanup_policy: CleanupPolicy::RequireAllSucceeded,
            ..Default::default()
        };
        let orch = orchestrator(
            store.clone(),
            vec![text(TOPICS), text(THREADS), text(PLAN), text(bad_action)],
            config,
        );
        let mut ctx = ConsolidationContext::new();

        let report = orch.run_batch(&mut ctx).await;
        match report.outcome {
            BatchOutcome::Completed {
                applied,
                deleted,
                retained,
                ..
            } => {
                assert_eq!(applied, ApplyResult { succeeded: 0, failed: 1 });
                assert_eq!(deleted, 0);
                assert_eq!(retained, 2);
            }
            other => panic!("expected completed batch, got {:?}", other),
        }
        assert_eq!(store.get_transcriptions(None).unwrap().len(), 2);
        assert_eq!(ctx.stats.failed_updates, 1);
        assert_eq!(ctx.stats.total_processed, 0);
    }
}
