//! Memory consolidation pipeline
//!
//! Turns a batch of raw transcripts into persisted memory updates:
//! fetch -> analyze -> plan -> execute -> reconcile -> cleanup -> stats.
//! Stages run strictly one after another and data only flows downward.

pub mod analysis;
pub mod execution;
pub mod orchestrator;
pub mod planning;
pub mod prompts;
pub mod reconcile;
pub mod validate;
pub mod worker;

pub use analysis::AnalysisStage;
pub use execution::{ExecutionOutcome, ExecutionStage};
pub use orchestrator::{
    BatchOutcome, BatchReport, BatchState, ConsolidationContext, ConsolidationOrchestrator,
    LastError, ProcessingStats,
};
pub use planning::PlanningStage;
pub use reconcile::{merge_memory_content, ApplyResult, ReconciliationEngine};
pub use worker::{ConsolidationWorker, WorkerCommand};
