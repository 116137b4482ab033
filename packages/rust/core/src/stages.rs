//! The fixed pipeline stage catalog and the units of work behind it.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use citeflow_sampler::{Sampler, SeedSource};
use citeflow_shared::{
    CiteflowError, ExternalStageConfig, Result, RunCounts, RunId, SamplerConfig, SessionStatus,
};
use citeflow_storage::Store;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A named pipeline stage. [`Stage::ALL`] is the order `run_all` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CitationSampling,
    ScoreCalculation,
    DataQuality,
    ReportGeneration,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::CitationSampling,
        Stage::ScoreCalculation,
        Stage::DataQuality,
        Stage::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CitationSampling => "citation_sampling",
            Self::ScoreCalculation => "score_calculation",
            Self::DataQuality => "data_quality",
            Self::ReportGeneration => "report_generation",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::CitationSampling => "snowball-crawl new citations from seeds",
            Self::ScoreCalculation => "recompute domain scores from stored citations",
            Self::DataQuality => "validate stored citations",
            Self::ReportGeneration => "render reports from the latest scores",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CiteflowError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| {
                let names: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
                CiteflowError::validation(format!(
                    "unknown stage '{s}' (expected one of: {})",
                    names.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Unit interface
// ---------------------------------------------------------------------------

/// What a unit of work gets to see about the run executing it.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: Stage,
    /// Fires on an external cancellation request.
    pub cancel: CancellationToken,
}

/// Counts and metadata reported by a unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub processed: u64,
    pub created: u64,
    pub failed: u64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageOutput {
    pub fn new(processed: u64, created: u64, failed: u64) -> Self {
        Self {
            processed,
            created,
            failed,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn counts(&self) -> RunCounts {
        RunCounts::new(self.processed, self.created, self.failed)
    }
}

/// The work behind one stage.
///
/// An `Err` fails the run with the error's message; `CiteflowError::Cancelled`
/// marks it cancelled instead.
#[async_trait]
pub trait StageUnit: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput>;

    /// Short human-readable description of what backs the stage.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Citation sampling
// ---------------------------------------------------------------------------

/// Runs one sampling session per execution.
pub struct SamplingStage {
    sampler: Arc<Sampler>,
    seeds: Arc<dyn SeedSource>,
}

impl SamplingStage {
    pub fn new(sampler: Arc<Sampler>, seeds: Arc<dyn SeedSource>) -> Self {
        Self { sampler, seeds }
    }
}

#[async_trait]
impl StageUnit for SamplingStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let session = self
            .sampler
            .run_session(self.seeds.as_ref(), &ctx.cancel)
            .await;

        match session.status {
            SessionStatus::Completed => {}
            SessionStatus::Aborted => {
                return Err(CiteflowError::Stage(
                    session
                        .error
                        .unwrap_or_else(|| "sampling session aborted".into()),
                ));
            }
            SessionStatus::Cancelled => {
                return Err(CiteflowError::Cancelled(format!(
                    "sampling session {} cancelled",
                    session.id
                )));
            }
        }

        Ok(
            StageOutput::new(session.processed, session.discovered, session.failed)
                .with_metadata("session_id", serde_json::json!(session.id))
                .with_metadata("fetch_attempts", serde_json::json!(session.fetch_attempts))
                .with_metadata("skipped", serde_json::json!(session.skipped))
                .with_metadata("low_confidence", serde_json::json!(session.low_confidence))
                .with_metadata("duplicates", serde_json::json!(session.duplicates))
                .with_metadata(
                    "references_extracted",
                    serde_json::json!(session.references_extracted),
                )
                .with_metadata("depth_reached", serde_json::json!(session.depth_reached))
                .with_metadata(
                    "government_docs_processed",
                    serde_json::json!(session.government_docs_processed),
                )
                .with_metadata("average_quality", serde_json::json!(session.average_quality()))
                .with_metadata(
                    "discoveries_by_depth",
                    serde_json::json!(session.discoveries_by_depth),
                )
                .with_metadata("categories", serde_json::json!(session.categories)),
        )
    }

    fn describe(&self) -> String {
        "built-in snowball sampler".into()
    }
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

/// How many flagged URLs are listed in the run metadata.
const FLAGGED_SAMPLE: usize = 10;

const DEFAULT_QUALITY_LIMIT: usize = 5000;

/// Tally of problems found by [`DataQualityStage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityIssues {
    pub confidence_out_of_range: u64,
    pub depth_exceeded: u64,
    pub missing_title: u64,
    pub too_many_references: u64,
    pub missing_content_hash: u64,
}

/// Validates stored citations against the sampler's bounds.
///
/// Each flagged citation counts once under `failed`, however many checks it
/// breaks.
pub struct DataQualityStage {
    store: Arc<dyn Store>,
    max_depth: u32,
    max_references: usize,
    limit: usize,
}

impl DataQualityStage {
    pub fn new(store: Arc<dyn Store>, config: &SamplerConfig) -> Self {
        Self {
            store,
            max_depth: config.max_depth,
            max_references: config.max_references_per_document,
            limit: DEFAULT_QUALITY_LIMIT,
        }
    }

    /// Check at most `limit` of the most recent citations.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl StageUnit for DataQualityStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        if ctx.cancel.is_cancelled() {
            return Err(CiteflowError::Cancelled("data quality check cancelled".into()));
        }

        let citations = self.store.list_citations(self.limit).await?;
        let total = self.store.citation_count().await?;

        let mut issues = QualityIssues::default();
        let mut flagged = 0u64;
        let mut flagged_urls = Vec::new();

        for citation in &citations {
            let mut ok = true;
            if !(0.0..=1.0).contains(&citation.confidence) {
                issues.confidence_out_of_range += 1;
                ok = false;
            }
            if citation.depth >= self.max_depth {
                issues.depth_exceeded += 1;
                ok = false;
            }
            if citation.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
                issues.missing_title += 1;
                ok = false;
            }
            if citation.references.len() > self.max_references {
                issues.too_many_references += 1;
                ok = false;
            }
            if citation.content_hash.is_empty() {
                issues.missing_content_hash += 1;
                ok = false;
            }

            if !ok {
                flagged += 1;
                if flagged_urls.len() < FLAGGED_SAMPLE {
                    flagged_urls.push(citation.url.clone());
                }
            }
        }

        info!(
            checked = citations.len(),
            flagged,
            total_citations = total,
            "data quality check finished"
        );

        Ok(StageOutput::new(citations.len() as u64, 0, flagged)
            .with_metadata("issues", serde_json::json!(issues))
            .with_metadata("flagged_urls", serde_json::json!(flagged_urls))
            .with_metadata("total_citations", serde_json::json!(total)))
    }

    fn describe(&self) -> String {
        "built-in citation validator".into()
    }
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Runs a configured external command for an opaque stage.
///
/// The command gets `CITEFLOW_STAGE` and `CITEFLOW_RUN_ID` in its
/// environment and reports its counts as a JSON object on the last JSON line
/// of stdout. Keys other than `processed`, `created` and `failed` become run
/// metadata. A non-zero exit status fails the run.
pub struct CommandStage {
    stage: Stage,
    config: ExternalStageConfig,
    timeout: Duration,
}

impl CommandStage {
    pub fn new(stage: Stage, config: ExternalStageConfig, default_timeout: Duration) -> Self {
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            stage,
            config,
            timeout,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.config.command.as_str())
            .chain(self.config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl StageUnit for CommandStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("CITEFLOW_STAGE", self.stage.as_str())
            .env("CITEFLOW_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(stage = %self.stage, command = %self.command_line(), "spawning stage command");
        let child = cmd.spawn().map_err(|e| {
            CiteflowError::Stage(format!(
                "failed to spawn {}: {e}. Is `{}` installed?",
                self.command_line(),
                self.config.command
            ))
        })?;

        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(CiteflowError::Cancelled(format!("{} cancelled", self.stage)));
            }
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(CiteflowError::Stage(format!(
                        "waiting for {}: {e}",
                        self.command_line()
                    )));
                }
                Err(_) => {
                    return Err(CiteflowError::Stage(format!(
                        "{} timed out after {:?}",
                        self.command_line(),
                        self.timeout
                    )));
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CiteflowError::Stage(format!(
                "{} exited with {}: {}",
                self.command_line(),
                output.status,
                tail(stderr.trim(), 500)
            )));
        }

        parse_command_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn describe(&self) -> String {
        format!("command: {}", self.command_line())
    }
}

/// Parse the counts object a stage command prints.
///
/// Empty output means "nothing to report". Otherwise the last line holding a
/// JSON object wins, so commands may log freely before it.
pub fn parse_command_output(stdout: &str) -> Result<StageOutput> {
    if stdout.trim().is_empty() {
        return Ok(StageOutput::default());
    }

    let object = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(serde_json::Value::Object(map)) => Some(map),
                _ => None,
            }
        })
        .ok_or_else(|| CiteflowError::parse("stage command printed no JSON object on stdout"))?;

    let mut output = StageOutput::default();
    for (key, value) in object {
        match key.as_str() {
            "processed" => output.processed = count_field(&key, &value)?,
            "created" => output.created = count_field(&key, &value)?,
            "failed" => output.failed = count_field(&key, &value)?,
            _ => {
                output.metadata.insert(key, value);
            }
        }
    }
    Ok(output)
}

fn count_field(key: &str, value: &serde_json::Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| {
        CiteflowError::parse(format!(
            "stage command reported '{key}' as {value}, expected a non-negative integer"
        ))
    })
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
