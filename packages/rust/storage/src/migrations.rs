//! SQL migration definitions for the citeflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: citations, pipeline_runs, sampling_sessions, task_state",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Discovered citations; one row per URL
CREATE TABLE IF NOT EXISTS citations (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL,
    url             TEXT NOT NULL UNIQUE,
    title           TEXT,
    excerpt         TEXT,
    confidence      REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    topical         REAL NOT NULL,
    geographic      REAL NOT NULL,
    structural      REAL NOT NULL,
    references_json TEXT NOT NULL DEFAULT '[]',
    depth           INTEGER NOT NULL,
    parent_url      TEXT,
    category        TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    discovered_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_citations_confidence ON citations(confidence);
CREATE INDEX IF NOT EXISTS idx_citations_session ON citations(session_id);

-- Pipeline stage runs
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id         TEXT PRIMARY KEY,
    stage      TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at   TEXT,
    processed  INTEGER NOT NULL DEFAULT 0,
    created    INTEGER NOT NULL DEFAULT 0,
    failed     INTEGER NOT NULL DEFAULT 0,
    error      TEXT,
    run_json   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_stage ON pipeline_runs(stage);
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_created ON pipeline_runs(created_at);

-- Sampling session summaries
CREATE TABLE IF NOT EXISTS sampling_sessions (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    ended_at     TEXT NOT NULL,
    status       TEXT NOT NULL,
    processed    INTEGER NOT NULL,
    discovered   INTEGER NOT NULL,
    failed       INTEGER NOT NULL,
    session_json TEXT NOT NULL
);

-- Latest scheduler snapshot per task
CREATE TABLE IF NOT EXISTS task_state (
    id         TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
