//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database for citations, pipeline runs,
//! sampling sessions and scheduler task state. It implements the [`Store`]
//! interface consumed by the rest of the workspace; [`MemoryStore`] is the
//! in-process alternative used for dry runs and tests.
//!
//! **Access rules:**
//! - Scheduler / pipeline commands: read-write via [`Storage::open`]
//! - Status inspection: read-only via [`Storage::open_readonly`]

mod memory;
mod migrations;
mod store;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use citeflow_shared::{
    Citation, CiteflowError, PipelineRun, RelevanceScores, Result, SamplingSession, TaskState,
};
use libsql::{Connection, Database, params};

pub use memory::MemoryStore;
pub use store::Store;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CiteflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CiteflowError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CiteflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CiteflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Run a query whose rows each carry one JSON document in column 0.
    async fn query_json<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        limit: i64,
    ) -> Result<Vec<T>> {
        let mut rows = self
            .conn
            .query(sql, params![limit])
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row.get(0).map_err(storage_err)?;
            results.push(
                serde_json::from_str(&json)
                    .map_err(|e| CiteflowError::Storage(format!("corrupt record: {e}")))?,
            );
        }
        Ok(results)
    }

    async fn query_citations(
        &self,
        sql: &str,
        limit: usize,
        min_confidence: f64,
    ) -> Result<Vec<Citation>> {
        let mut rows = self
            .conn
            .query(sql, params![limit as i64, min_confidence])
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_citation(&row)?);
        }
        Ok(results)
    }
}

const CITATION_COLUMNS: &str = "id, session_id, url, title, excerpt, confidence, topical, \
     geographic, structural, references_json, depth, parent_url, category, content_hash, \
     discovered_at";

#[async_trait]
impl Store for Storage {
    async fn insert_citation(&self, citation: &Citation) -> Result<bool> {
        self.check_writable()?;
        let references = serde_json::to_string(&citation.references)
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO citations (id, session_id, url, title, excerpt, confidence, topical,
                    geographic, structural, references_json, depth, parent_url, category,
                    content_hash, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(url) DO NOTHING",
                params![
                    citation.id.as_str(),
                    citation.session_id.to_string(),
                    citation.url.as_str(),
                    citation.title.as_deref(),
                    citation.excerpt.as_deref(),
                    citation.confidence,
                    citation.scores.topical,
                    citation.scores.geographic,
                    citation.scores.structural,
                    references,
                    i64::from(citation.depth),
                    citation.parent_url.as_deref(),
                    citation.category.as_str(),
                    citation.content_hash.as_str(),
                    citation.discovered_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;
        Ok(inserted > 0)
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM citations WHERE url = ?1 LIMIT 1", params![url])
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(CiteflowError::Storage(e.to_string())),
        }
    }

    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        self.check_writable()?;
        let run_json =
            serde_json::to_string(run).map_err(|e| CiteflowError::Storage(e.to_string()))?;
        let counts = run.counts();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, stage, status, created_at, started_at, ended_at,
                    processed, created, failed, error, run_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   started_at = excluded.started_at,
                   ended_at = excluded.ended_at,
                   processed = excluded.processed,
                   created = excluded.created,
                   failed = excluded.failed,
                   error = excluded.error,
                   run_json = excluded.run_json
                 WHERE pipeline_runs.status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')",
                params![
                    run.id().to_string(),
                    run.stage(),
                    run.status().as_str(),
                    run.created_at().to_rfc3339(),
                    run.started_at().map(|t| t.to_rfc3339()),
                    run.ended_at().map(|t| t.to_rfc3339()),
                    counts.processed as i64,
                    counts.created as i64,
                    counts.failed as i64,
                    run.error(),
                    run_json,
                ],
            )
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn insert_sampling_session(&self, session: &SamplingSession) -> Result<()> {
        self.check_writable()?;
        let session_json =
            serde_json::to_string(session).map_err(|e| CiteflowError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO sampling_sessions (id, started_at, ended_at, status, processed,
                    discovered, failed, session_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    session.id.to_string(),
                    session.started_at.to_rfc3339(),
                    session.ended_at.to_rfc3339(),
                    session.status.as_str(),
                    session.processed as i64,
                    session.discovered as i64,
                    session.failed as i64,
                    session_json,
                ],
            )
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn save_task_state(&self, state: &TaskState) -> Result<()> {
        self.check_writable()?;
        let state_json =
            serde_json::to_string(state).map_err(|e| CiteflowError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO task_state (id, state_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   state_json = excluded.state_json,
                   updated_at = excluded.updated_at",
                params![state.id.as_str(), state_json, now.as_str()],
            )
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_task_states(&self) -> Result<Vec<TaskState>> {
        // A negative LIMIT is unbounded in SQLite.
        self.query_json("SELECT state_json FROM task_state ORDER BY id LIMIT ?1", -1)
            .await
    }

    async fn recent_pipeline_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        self.query_json(
            "SELECT run_json FROM pipeline_runs ORDER BY created_at DESC, id DESC LIMIT ?1",
            limit as i64,
        )
        .await
    }

    async fn recent_sampling_sessions(&self, limit: usize) -> Result<Vec<SamplingSession>> {
        self.query_json(
            "SELECT session_json FROM sampling_sessions ORDER BY started_at DESC, id DESC LIMIT ?1",
            limit as i64,
        )
        .await
    }

    async fn list_citations(&self, limit: usize) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations WHERE confidence >= ?2
             ORDER BY discovered_at DESC, id DESC LIMIT ?1"
        );
        self.query_citations(&sql, limit, 0.0).await
    }

    async fn top_citations(&self, limit: usize, min_confidence: f64) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations WHERE confidence >= ?2
             ORDER BY confidence DESC, discovered_at DESC LIMIT ?1"
        );
        self.query_citations(&sql, limit, min_confidence).await
    }

    async fn citation_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM citations", params![])
            .await
            .map_err(|e| CiteflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(CiteflowError::Storage(e.to_string())),
        }
    }
}

fn storage_err(e: libsql::Error) -> CiteflowError {
    CiteflowError::Storage(e.to_string())
}

/// Convert a database row (selected with [`CITATION_COLUMNS`]) to a [`Citation`].
fn row_to_citation(row: &libsql::Row) -> Result<Citation> {
    let session_id: String = row.get(1).map_err(storage_err)?;
    let references_json: String = row.get(9).map_err(storage_err)?;
    let category: String = row.get(12).map_err(storage_err)?;
    let discovered_at: String = row.get(14).map_err(storage_err)?;

    Ok(Citation {
        id: row.get::<String>(0).map_err(storage_err)?,
        session_id: session_id
            .parse()
            .map_err(|e| CiteflowError::Storage(format!("invalid session id: {e}")))?,
        url: row.get::<String>(2).map_err(storage_err)?,
        title: row.get::<String>(3).ok(),
        excerpt: row.get::<String>(4).ok(),
        confidence: row.get::<f64>(5).map_err(storage_err)?,
        scores: RelevanceScores {
            topical: row.get::<f64>(6).map_err(storage_err)?,
            geographic: row.get::<f64>(7).map_err(storage_err)?,
            structural: row.get::<f64>(8).map_err(storage_err)?,
        },
        references: serde_json::from_str(&references_json)
            .map_err(|e| CiteflowError::Storage(format!("invalid references: {e}")))?,
        depth: row.get::<i64>(10).map_err(storage_err)?.max(0) as u32,
        parent_url: row.get::<String>(11).ok(),
        category: category.parse()?,
        content_hash: row.get::<String>(13).map_err(storage_err)?,
        discovered_at: chrono::DateTime::parse_from_rfc3339(&discovered_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CiteflowError::Storage(format!("invalid date: {e}")))?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use citeflow_shared::{
        Citation, DocumentCategory, RelevanceScores, SamplingSession, SessionId, SessionStatus,
        TaskState, TriggerKind,
    };

    pub fn citation(url: &str, confidence: f64) -> Citation {
        Citation {
            id: uuid::Uuid::now_v7().to_string(),
            session_id: SessionId::new(),
            url: url.into(),
            title: Some("Regional housing report".into()),
            excerpt: None,
            confidence,
            scores: RelevanceScores {
                topical: confidence,
                geographic: 0.5,
                structural: 0.4,
            },
            references: vec!["https://doi.org/10.1000/xyz".into()],
            depth: 1,
            parent_url: Some("https://example.org/seed".into()),
            category: DocumentCategory::Academic,
            content_hash: "abc123".into(),
            discovered_at: Utc::now(),
        }
    }

    pub fn session() -> SamplingSession {
        SamplingSession {
            id: SessionId::new(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            status: SessionStatus::Completed,
            processed: 4,
            discovered: 2,
            references_extracted: 7,
            skipped: 1,
            failed: 1,
            low_confidence: 0,
            duplicates: 0,
            fetch_attempts: 3,
            government_docs_processed: 0,
            depth_reached: 2,
            quality_scores: vec![0.7, 0.9],
            discoveries_by_depth: BTreeMap::from([(0, 1), (1, 1)]),
            categories: BTreeMap::from([("academic".to_string(), 2)]),
            error: None,
        }
    }

    pub fn task_state(id: &str) -> TaskState {
        TaskState {
            id: id.into(),
            action: "stage:data_quality".into(),
            trigger_kind: TriggerKind::Cron,
            trigger_expr: "0 6,18 * * *".into(),
            enabled: true,
            running: false,
            last_run: None,
            next_run: Some(Utc::now()),
            run_count: 0,
            failure_count: 0,
            max_failures: 3,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
