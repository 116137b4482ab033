//! Core domain types shared by the sampler, orchestrator, scheduler and storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CiteflowError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Declares a UUID v7 newtype identifier (time-sortable).
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of one [`PipelineRun`].
    RunId
);

uuid_id!(
    /// Identifier of one [`SamplingSession`].
    SessionId
);

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`PipelineRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CiteflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CiteflowError::parse(format!("unknown run status '{other}'"))),
        }
    }
}

/// Record counts reported by a stage's unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u64,
    pub created: u64,
    pub failed: u64,
}

impl RunCounts {
    pub fn new(processed: u64, created: u64, failed: u64) -> Self {
        Self {
            processed,
            created,
            failed,
        }
    }

    /// Add another set of counts into this one.
    pub fn absorb(&mut self, other: &RunCounts) {
        self.processed = self.processed.saturating_add(other.processed);
        self.created = self.created.saturating_add(other.created);
        self.failed = self.failed.saturating_add(other.failed);
    }
}

/// One execution of one named pipeline stage.
///
/// Fields are private so the state machine is the only way to mutate a run:
/// once the status is terminal, counts, metadata and `ended_at` are frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    id: RunId,
    stage: String,
    status: RunStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    counts: RunCounts,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PipelineRun {
    /// Create a new `PENDING` run for `stage`.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            stage: stage.into(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            counts: RunCounts::default(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn counts(&self) -> RunCounts {
        self.counts
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration between start and end, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// `PENDING → RUNNING`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `RUNNING → COMPLETED`, recording the unit's counts and metadata.
    pub fn complete(
        &mut self,
        counts: RunCounts,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.transition(RunStatus::Completed)?;
        self.counts = counts;
        self.metadata.extend(metadata);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `RUNNING → FAILED`, storing the error message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(message.into());
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `PENDING | RUNNING → CANCELLED`. Only reachable via external request.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Cancelled)?;
        self.error = Some(reason.into());
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Attach a metadata entry. Rejected once the run is terminal.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        if self.is_terminal() {
            return Err(CiteflowError::validation(format!(
                "run {} is {} and can no longer be modified",
                self.id, self.status
            )));
        }
        self.metadata.insert(key.into(), value);
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CiteflowError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Citations & discovery
// ---------------------------------------------------------------------------

/// Topical sub-scores produced by a relevance classifier, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceScores {
    pub topical: f64,
    pub geographic: f64,
    pub structural: f64,
}

impl RelevanceScores {
    /// Clamp every sub-score into `[0, 1]`; NaN becomes 0.
    pub fn clamped(self) -> Self {
        Self {
            topical: clamp_unit(self.topical),
            geographic: clamp_unit(self.geographic),
            structural: clamp_unit(self.structural),
        }
    }
}

/// Clamp a score into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Coarse document category derived from URL and domain cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Government,
    Academic,
    Report,
    Web,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::Academic => "academic",
            Self::Report => "report",
            Self::Web => "web",
        }
    }
}

impl std::str::FromStr for DocumentCategory {
    type Err = CiteflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "government" => Ok(Self::Government),
            "academic" => Ok(Self::Academic),
            "report" => Ok(Self::Report),
            "web" => Ok(Self::Web),
            other => Err(CiteflowError::parse(format!("unknown category '{other}'"))),
        }
    }
}

/// A queued crawl candidate. Lives only inside one sampling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Priority score; for seeds this is the prior relevance score.
    pub priority: f64,
    pub depth: u32,
    /// URL of the citation this item was extracted from (`None` for seeds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl DiscoveryItem {
    /// A depth-0 seed item.
    pub fn seed(url: impl Into<String>, title: Option<String>, score: f64) -> Self {
        Self {
            url: url.into(),
            title,
            priority: score,
            depth: 0,
            parent: None,
        }
    }
}

/// A persisted discovery. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Unique citation identifier (UUID v7).
    pub id: String,
    /// Session that discovered this citation.
    pub session_id: SessionId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    /// Aggregate confidence in `[0, 1]`.
    pub confidence: f64,
    pub scores: RelevanceScores,
    /// Outbound reference links extracted from the document.
    #[serde(default)]
    pub references: Vec<String>,
    /// Crawl depth at which the document was found.
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    pub category: DocumentCategory,
    /// SHA-256 hash of the fetched content.
    pub content_hash: String,
    pub discovered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SamplingSession
// ---------------------------------------------------------------------------

/// Final status of a sampling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    /// A fatal setup failure (e.g. the seed queue could not be built).
    Aborted,
    /// Cancelled cooperatively before the crawl finished.
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Summary of one sampler run. Immutable once finalized by the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Items taken off the queue and evaluated.
    pub processed: u64,
    /// Citations created.
    pub discovered: u64,
    pub references_extracted: u64,
    /// Items skipped by policy (visited, restricted domain, robots, rate limit).
    pub skipped: u64,
    /// Items whose fetch or persistence failed.
    pub failed: u64,
    /// Documents discarded for short content or low confidence.
    pub low_confidence: u64,
    /// Citations that were already stored.
    pub duplicates: u64,
    /// Document fetches attempted (robots.txt lookups excluded).
    pub fetch_attempts: u64,
    /// Allow-listed restricted-domain documents that were fetched.
    pub government_docs_processed: u64,
    /// Number of depth levels processed.
    pub depth_reached: u32,
    /// Confidence of each accepted citation.
    #[serde(default)]
    pub quality_scores: Vec<f64>,
    #[serde(default)]
    pub discoveries_by_depth: BTreeMap<u32, u64>,
    #[serde(default)]
    pub categories: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SamplingSession {
    /// Mean confidence of accepted citations, if any were accepted.
    pub fn average_quality(&self) -> Option<f64> {
        if self.quality_scores.is_empty() {
            return None;
        }
        Some(self.quality_scores.iter().sum::<f64>() / self.quality_scores.len() as f64)
    }
}

// ---------------------------------------------------------------------------
// Scheduled task state
// ---------------------------------------------------------------------------

/// Kind of trigger that makes a scheduled task due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Interval,
    Cron,
    OneTime,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
            Self::OneTime => "one_time",
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = CiteflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            "one_time" | "once" => Ok(Self::OneTime),
            other => Err(CiteflowError::schedule(format!("unknown trigger type '{other}'"))),
        }
    }
}

/// A point-in-time snapshot of a scheduled task, as persisted and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    /// What the task invokes, e.g. `stage:citation_sampling` or `pipeline`.
    pub action: String,
    pub trigger_kind: TriggerKind,
    pub trigger_expr: String,
    pub enabled: bool,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u32,
    pub max_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
