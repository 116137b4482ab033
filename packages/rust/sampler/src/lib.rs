//! Snowball citation sampling.
//!
//! This crate provides:
//! - [`engine`]: the depth-bounded, breadth-first [`Sampler`]
//! - [`fetcher`]: the [`DocumentFetcher`] interface and its reqwest implementation
//! - [`classifier`] and [`extractor`]: pluggable relevance scoring and reference extraction
//! - [`policy`] and [`robots`]: what may be fetched
//! - [`seeds`]: where a session's initial queue comes from

pub mod classifier;
pub mod engine;
pub mod extractor;
pub mod fetcher;
pub mod policy;
pub mod robots;
pub mod seeds;

pub use classifier::{ConfidenceWeights, KeywordClassifier, RelevanceClassifier};
pub use engine::Sampler;
pub use extractor::{ExtractedDocument, HtmlReferenceExtractor, ReferenceExtractor};
pub use fetcher::{DocumentFetcher, FetchOutcome, FetchResponse, HttpFetcher};
pub use policy::{DomainPolicy, DomainVerdict};
pub use robots::RobotsTxt;
pub use seeds::{ChainedSeeds, SeedFile, SeedSource, StaticSeeds, StoredCitationSeeds};
