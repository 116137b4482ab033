//! Shared types, error model, and configuration for citeflow.
//!
//! This crate is the foundation depended on by all other citeflow crates.
//! It provides:
//! - [`CiteflowError`], the unified error type
//! - Domain types ([`PipelineRun`], [`Citation`], [`DiscoveryItem`], [`SamplingSession`], [`TaskState`])
//! - Configuration ([`AppConfig`], [`SamplerConfig`], [`SchedulerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifierSettings, ExternalStageConfig, NotificationSettings, SamplerConfig,
    SamplerSettings, SchedulerConfig, SchedulerSettings, StorageConfig, TaskDefinition,
    USER_AGENT, config_dir, config_file_path, init_config, init_config_at, load_config,
    load_config_from,
};
pub use error::{CiteflowError, Result};
pub use types::{
    Citation, DiscoveryItem, DocumentCategory, PipelineRun, RelevanceScores, RunCounts, RunId,
    RunStatus, SamplingSession, SessionId, SessionStatus, TaskState, TriggerKind, clamp_unit,
};
