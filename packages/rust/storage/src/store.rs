//! The persistence interface shared by the sampler, orchestrator and scheduler.

use async_trait::async_trait;
use citeflow_shared::{Citation, PipelineRun, Result, SamplingSession, TaskState};

/// Narrow persistence interface.
///
/// Every write is idempotent under retry: citations are deduplicated by URL,
/// runs and sessions are keyed by id, and task state is a per-task upsert.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a citation. Returns `false` if a citation with the same URL
    /// already exists, in which case nothing is written.
    async fn insert_citation(&self, citation: &Citation) -> Result<bool>;

    /// Whether a citation with this exact URL is stored.
    async fn exists_by_url(&self, url: &str) -> Result<bool>;

    /// Insert or update a pipeline run. Updates to a run that is already
    /// terminal in the store are ignored.
    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<()>;

    /// Insert a finalized sampling session. Re-inserting the same id is a no-op.
    async fn insert_sampling_session(&self, session: &SamplingSession) -> Result<()>;

    /// Record the latest snapshot of a scheduled task.
    async fn save_task_state(&self, state: &TaskState) -> Result<()>;

    async fn list_task_states(&self) -> Result<Vec<TaskState>>;

    /// Most recently created runs first.
    async fn recent_pipeline_runs(&self, limit: usize) -> Result<Vec<PipelineRun>>;

    /// Most recently started sessions first.
    async fn recent_sampling_sessions(&self, limit: usize) -> Result<Vec<SamplingSession>>;

    /// Most recently discovered citations first.
    async fn list_citations(&self, limit: usize) -> Result<Vec<Citation>>;

    /// Highest-confidence citations at or above `min_confidence`.
    async fn top_citations(&self, limit: usize, min_confidence: f64) -> Result<Vec<Citation>>;

    async fn citation_count(&self) -> Result<u64>;
}
