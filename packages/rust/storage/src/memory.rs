//! In-process [`Store`] used for `--dry-run` and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use citeflow_shared::{Citation, PipelineRun, Result, SamplingSession, TaskState};
use tokio::sync::Mutex;

use crate::store::Store;

#[derive(Default)]
struct Tables {
    citations: Vec<Citation>,
    runs: Vec<PipelineRun>,
    sessions: Vec<SamplingSession>,
    tasks: HashMap<String, TaskState>,
}

/// A [`Store`] that keeps everything in memory with the same dedup and
/// terminal-run rules as the libSQL backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_citation(&self, citation: &Citation) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if tables.citations.iter().any(|c| c.url == citation.url) {
            return Ok(false);
        }
        tables.citations.push(citation.clone());
        Ok(true)
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.citations.iter().any(|c| c.url == url))
    }

    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.runs.iter_mut().find(|r| r.id() == run.id()) {
            Some(existing) if existing.is_terminal() => {}
            Some(existing) => *existing = run.clone(),
            None => tables.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn insert_sampling_session(&self, session: &SamplingSession) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if !tables.sessions.iter().any(|s| s.id == session.id) {
            tables.sessions.push(session.clone());
        }
        Ok(())
    }

    async fn save_task_state(&self, state: &TaskState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.tasks.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn list_task_states(&self) -> Result<Vec<TaskState>> {
        let tables = self.tables.lock().await;
        let mut states: Vec<TaskState> = tables.tasks.values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    async fn recent_pipeline_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let tables = self.tables.lock().await;
        let mut runs = tables.runs.clone();
        runs.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    async fn recent_sampling_sessions(&self, limit: usize) -> Result<Vec<SamplingSession>> {
        let tables = self.tables.lock().await;
        let mut sessions = tables.sessions.clone();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn list_citations(&self, limit: usize) -> Result<Vec<Citation>> {
        let tables = self.tables.lock().await;
        let mut citations = tables.citations.clone();
        citations.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at));
        citations.truncate(limit);
        Ok(citations)
    }

    async fn top_citations(&self, limit: usize, min_confidence: f64) -> Result<Vec<Citation>> {
        let tables = self.tables.lock().await;
        let mut citations: Vec<Citation> = tables
            .citations
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .cloned()
            .collect();
        citations.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.discovered_at.cmp(&a.discovered_at))
        });
        citations.truncate(limit);
        Ok(citations)
    }

    async fn citation_count(&self) -> Result<u64> {
        Ok(self.tables.lock().await.citations.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{citation, session, task_state};
    use citeflow_shared::{RunCounts, RunStatus};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn dedups_citations_by_url() {
        let store = MemoryStore::new();
        assert!(store.insert_citation(&citation("https://x.org/a", 0.7)).await.unwrap());
        assert!(!store.insert_citation(&citation("https://x.org/a", 0.9)).await.unwrap());
        assert!(store.exists_by_url("https://x.org/a").await.unwrap());
        assert_eq!(store.citation_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_runs_are_not_overwritten() {
        let store = MemoryStore::new();
        let mut run = PipelineRun::new("data_quality");
        run.start().unwrap();
        store.insert_pipeline_run(&run).await.unwrap();

        let running_snapshot = run.clone();
        run.complete(RunCounts::new(2, 0, 0), BTreeMap::new()).unwrap();
        store.insert_pipeline_run(&run).await.unwrap();
        store.insert_pipeline_run(&running_snapshot).await.unwrap();

        let runs = store.recent_pipeline_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn sessions_and_tasks() {
        let store = MemoryStore::new();
        let s = session();
        store.insert_sampling_session(&s).await.unwrap();
        store.insert_sampling_session(&s).await.unwrap();
        assert_eq!(store.recent_sampling_sessions(10).await.unwrap().len(), 1);

        store.save_task_state(&task_state("b")).await.unwrap();
        store.save_task_state(&task_state("a")).await.unwrap();
        let ids: Vec<String> = store
            .list_task_states()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn top_citations_filters_and_sorts() {
        let store = MemoryStore::new();
        store.insert_citation(&citation("https://x.org/low", 0.2)).await.unwrap();
        store.insert_citation(&citation("https://x.org/mid", 0.7)).await.unwrap();
        store.insert_citation(&citation("https://x.org/high", 0.9)).await.unwrap();

        let top = store.top_citations(1, 0.5).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].url, "https://x.org/high");
    }
}
