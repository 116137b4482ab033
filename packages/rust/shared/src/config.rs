//! Application configuration for citeflow.
//!
//! User config lives at `~/.citeflow/citeflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CiteflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "citeflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".citeflow";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "citeflow.db";

/// User-Agent string for outbound requests.
pub const USER_AGENT: &str = concat!("citeflow/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Config structs (matching citeflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sampler: SamplerSettings,

    #[serde(default)]
    pub classifier: ClassifierSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub notifications: NotificationSettings,

    /// External commands backing opaque stages, keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, ExternalStageConfig>,

    /// Scheduled task definitions.
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskDefinition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sampler: SamplerSettings::default(),
            classifier: ClassifierSettings::default(),
            scheduler: SchedulerSettings::default(),
            notifications: NotificationSettings::default(),
            stages: BTreeMap::new(),
            tasks: default_tasks(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path. Defaults to `~/.citeflow/citeflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, expanding a leading `~/`.
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(p) => expand_home(p),
            None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

/// `[sampler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_max_citations_per_batch")]
    pub max_citations_per_batch: usize,

    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,

    /// Priority multiplier applied to references of an accepted citation.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,

    #[serde(default = "default_delay_ms")]
    pub delay_between_requests_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,

    #[serde(default = "default_max_references")]
    pub max_references_per_document: usize,

    /// Minimum priority for a depth-1 reference to be enqueued.
    #[serde(default = "default_base_priority_threshold")]
    pub base_priority_threshold: f64,

    /// Added to the enqueue threshold per level of depth.
    #[serde(default = "default_depth_penalty")]
    pub depth_penalty: f64,

    /// Host regexes for government/restricted domains.
    #[serde(default = "default_restricted_patterns")]
    pub restricted_domain_patterns: Vec<String>,

    /// Restricted hosts that may still be fetched.
    #[serde(default)]
    pub allowed_restricted_domains: Vec<String>,

    /// Optional TOML seed file (`[[seeds]]` entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<String>,

    /// How many top stored citations re-seed the next session.
    #[serde(default = "default_stored_seed_limit")]
    pub stored_seed_limit: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_citations_per_batch: default_max_citations_per_batch(),
            min_confidence_threshold: default_min_confidence(),
            decay_factor: default_decay_factor(),
            delay_between_requests_ms: default_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            respect_robots_txt: true,
            min_content_length: default_min_content_length(),
            max_references_per_document: default_max_references(),
            base_priority_threshold: default_base_priority_threshold(),
            depth_penalty: default_depth_penalty(),
            restricted_domain_patterns: default_restricted_patterns(),
            allowed_restricted_domains: Vec::new(),
            seed_file: None,
            stored_seed_limit: default_stored_seed_limit(),
        }
    }
}

fn default_max_depth() -> u32 {
    3
}
fn default_max_citations_per_batch() -> usize {
    50
}
fn default_min_confidence() -> f64 {
    0.6
}
fn default_decay_factor() -> f64 {
    0.8
}
fn default_delay_ms() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_min_content_length() -> usize {
    500
}
fn default_max_references() -> usize {
    25
}
fn default_base_priority_threshold() -> f64 {
    0.3
}
fn default_depth_penalty() -> f64 {
    0.1
}
fn default_restricted_patterns() -> Vec<String> {
    [
        r"(^|\.)gov(\.[a-z]{2})?$",
        r"(^|\.)mil(\.[a-z]{2})?$",
        r"(^|\.)gouv\.[a-z]{2}$",
        r"(^|\.)gob\.[a-z]{2}$",
        r"(^|\.)govt\.[a-z]{2}$",
        r"(^|\.)go\.[a-z]{2}$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_stored_seed_limit() -> usize {
    20
}

/// `[classifier]` section, consumed by the default keyword classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_topical_terms")]
    pub topical_terms: Vec<String>,

    /// Place names and regional terms. Empty means geography is not scored.
    #[serde(default)]
    pub geographic_terms: Vec<String>,

    #[serde(default = "default_topical_weight")]
    pub topical_weight: f64,

    #[serde(default = "default_geographic_weight")]
    pub geographic_weight: f64,

    #[serde(default = "default_structural_weight")]
    pub structural_weight: f64,

    /// Distinct term hits at which a sub-score saturates to 1.0.
    #[serde(default = "default_saturation")]
    pub saturation: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            topical_terms: default_topical_terms(),
            geographic_terms: Vec::new(),
            topical_weight: default_topical_weight(),
            geographic_weight: default_geographic_weight(),
            structural_weight: default_structural_weight(),
            saturation: default_saturation(),
        }
    }
}

fn default_topical_terms() -> Vec<String> {
    [
        "research",
        "study",
        "report",
        "analysis",
        "evidence",
        "survey",
        "policy",
        "findings",
        "methodology",
        "data",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_topical_weight() -> f64 {
    0.5
}
fn default_geographic_weight() -> f64 {
    0.3
}
fn default_structural_weight() -> f64 {
    0.2
}
fn default_saturation() -> usize {
    5
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How often the coordinating loop checks for due tasks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_failures")]
    pub default_max_failures: u32,

    #[serde(default = "default_task_timeout")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            default_max_failures: default_max_failures(),
            default_timeout_secs: default_task_timeout(),
            default_retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}
fn default_max_failures() -> u32 {
    3
}
fn default_task_timeout() -> u64 {
    3600
}
fn default_retry_delay() -> u64 {
    300
}

/// `[notifications]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// When set, notifications are POSTed here as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_notify_timeout() -> u64 {
    10
}

/// `[stages.<name>]` entry: an external command backing an opaque stage.
///
/// The command must print a JSON object with `processed`, `created` and
/// `failed` counts on stdout; any other keys become run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStageConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    /// `stage:<name>` or `pipeline`.
    pub action: String,
    /// `interval`, `cron` or `one_time`.
    pub trigger: String,
    /// Trigger expression, e.g. `6h`, `0 6,18 * * *`, `2024-01-01T00:00:00Z`.
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
}

impl TaskDefinition {
    fn new(id: &str, action: &str, trigger: &str, schedule: &str, enabled: bool) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            trigger: trigger.into(),
            schedule: schedule.into(),
            enabled,
            max_failures: None,
            timeout_secs: None,
            retry_delay_secs: None,
            notify_on_success: false,
            notify_on_failure: true,
        }
    }
}

fn default_tasks() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new(
            "citation-sampling",
            "stage:citation_sampling",
            "cron",
            "0 6 * * *",
            true,
        ),
        // Needs a `[stages.score_calculation]` command before it can be enabled.
        TaskDefinition::new(
            "score-calculation",
            "stage:score_calculation",
            "interval",
            "6h",
            false,
        ),
        TaskDefinition::new(
            "data-quality",
            "stage:data_quality",
            "cron",
            "0 6,18 * * *",
            true,
        ),
        TaskDefinition::new("weekly-pipeline", "pipeline", "cron", "0 2 * * 1", true),
    ]
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config file + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime sampler configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub max_depth: u32,
    pub max_citations_per_batch: usize,
    pub min_confidence_threshold: f64,
    pub decay_factor: f64,
    pub delay_between_requests: Duration,
    pub request_timeout: Duration,
    pub respect_robots_txt: bool,
    pub min_content_length: usize,
    pub max_references_per_document: usize,
    pub base_priority_threshold: f64,
    pub depth_penalty: f64,
    pub restricted_domain_patterns: Vec<String>,
    pub allowed_restricted_domains: Vec<String>,
    pub user_agent: String,
}

impl SamplerConfig {
    /// Priority a reference at `depth` must exceed to be enqueued.
    pub fn enqueue_threshold(&self, depth: u32) -> f64 {
        self.base_priority_threshold + self.depth_penalty * depth.saturating_sub(1) as f64
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SamplerConfig {
    fn from(config: &AppConfig) -> Self {
        let s = &config.sampler;
        Self {
            max_depth: s.max_depth,
            max_citations_per_batch: s.max_citations_per_batch,
            min_confidence_threshold: s.min_confidence_threshold,
            decay_factor: s.decay_factor,
            delay_between_requests: Duration::from_millis(s.delay_between_requests_ms),
            request_timeout: Duration::from_secs(s.request_timeout_secs),
            respect_robots_txt: s.respect_robots_txt,
            min_content_length: s.min_content_length,
            max_references_per_document: s.max_references_per_document,
            base_priority_threshold: s.base_priority_threshold,
            depth_penalty: s.depth_penalty,
            restricted_domain_patterns: s.restricted_domain_patterns.clone(),
            allowed_restricted_domains: s.allowed_restricted_domains.clone(),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub default_max_failures: u32,
    pub default_timeout: Duration,
    pub default_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        let s = &config.scheduler;
        Self {
            poll_interval: Duration::from_secs(s.poll_interval_secs.max(1)),
            default_max_failures: s.default_max_failures,
            default_timeout: Duration::from_secs(s.default_timeout_secs),
            default_retry_delay: Duration::from_secs(s.default_retry_delay_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check value ranges and cross-field constraints.
    ///
    /// Trigger expressions are validated by the scheduler when tasks are
    /// registered, since the trigger grammar lives there.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sampler;
        if s.max_depth == 0 {
            return Err(CiteflowError::config("sampler.max_depth must be at least 1"));
        }
        for (name, value) in [
            ("sampler.min_confidence_threshold", s.min_confidence_threshold),
            ("sampler.base_priority_threshold", s.base_priority_threshold),
            ("sampler.depth_penalty", s.depth_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CiteflowError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(s.decay_factor > 0.0 && s.decay_factor <= 1.0) {
            return Err(CiteflowError::config(format!(
                "sampler.decay_factor must be within (0, 1], got {}",
                s.decay_factor
            )));
        }

        let c = &self.classifier;
        let weights = [c.topical_weight, c.geographic_weight, c.structural_weight];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(CiteflowError::config(
                "classifier weights must be non-negative with a positive sum",
            ));
        }

        if let Some(hook) = &self.notifications.webhook_url {
            url::Url::parse(hook).map_err(|e| {
                CiteflowError::config(format!("notifications.webhook_url '{hook}': {e}"))
            })?;
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(CiteflowError::config("task id must not be empty"));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(CiteflowError::config(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            if task.max_failures == Some(0) {
                return Err(CiteflowError::config(format!(
                    "task '{}': max_failures must be at least 1",
                    task.id
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.citeflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CiteflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.citeflow/citeflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CiteflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CiteflowError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CiteflowError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CiteflowError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| CiteflowError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CiteflowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
