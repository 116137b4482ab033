//! Seed sources supplying the initial discovery queue of a session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use citeflow_shared::{CiteflowError, DiscoveryItem, Result};
use citeflow_storage::Store;
use serde::Deserialize;
use tracing::debug;

/// Supplies the initial [`DiscoveryItem`]s for a sampling session.
///
/// An error here is fatal for the session: the sampler records it and
/// aborts without fetching anything.
#[async_trait]
pub trait SeedSource: Send + Sync {
    async fn seeds(&self) -> Result<Vec<DiscoveryItem>>;
}

/// A fixed list of seeds.
#[derive(Debug, Clone, Default)]
pub struct StaticSeeds {
    items: Vec<DiscoveryItem>,
}

impl StaticSeeds {
    pub fn new(items: Vec<DiscoveryItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl SeedSource for StaticSeeds {
    async fn seeds(&self) -> Result<Vec<DiscoveryItem>> {
        Ok(self.items.clone())
    }
}

// ---------------------------------------------------------------------------
// Seed file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SeedFileContents {
    #[serde(default)]
    seeds: Vec<SeedEntry>,
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default = "default_seed_score")]
    score: f64,
}

fn default_seed_score() -> f64 {
    1.0
}

/// Seeds read from a TOML file of `[[seeds]]` tables (`url`, `title`, `score`).
#[derive(Debug, Clone)]
pub struct SeedFile {
    path: PathBuf,
}

impl SeedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(path: &Path, content: &str) -> Result<Vec<DiscoveryItem>> {
        let parsed: SeedFileContents = toml::from_str(content).map_err(|e| {
            CiteflowError::parse(format!("invalid seed file {}: {e}", path.display()))
        })?;
        Ok(parsed
            .seeds
            .into_iter()
            .map(|s| DiscoveryItem::seed(s.url, s.title, s.score))
            .collect())
    }
}

#[async_trait]
impl SeedSource for SeedFile {
    async fn seeds(&self) -> Result<Vec<DiscoveryItem>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CiteflowError::io(&self.path, e))?;
        let items = Self::parse(&self.path, &content)?;
        debug!(path = %self.path.display(), count = items.len(), "loaded seed file");
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Stored citations
// ---------------------------------------------------------------------------

/// Re-seeds from the highest-confidence citations already stored.
pub struct StoredCitationSeeds {
    store: Arc<dyn Store>,
    limit: usize,
    min_confidence: f64,
}

impl StoredCitationSeeds {
    pub fn new(store: Arc<dyn Store>, limit: usize, min_confidence: f64) -> Self {
        Self {
            store,
            limit,
            min_confidence,
        }
    }
}

#[async_trait]
impl SeedSource for StoredCitationSeeds {
    async fn seeds(&self) -> Result<Vec<DiscoveryItem>> {
        if self.limit == 0 {
            return Ok(Vec::new());
        }
        let citations = self
            .store
            .top_citations(self.limit, self.min_confidence)
            .await?;
        Ok(citations
            .into_iter()
            .map(|c| DiscoveryItem::seed(c.url, c.title, c.confidence))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Chained
// ---------------------------------------------------------------------------

/// Merges several sources; duplicates by URL keep the highest priority.
#[derive(Default)]
pub struct ChainedSeeds {
    sources: Vec<Box<dyn SeedSource>>,
}

impl ChainedSeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl SeedSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SeedSource for ChainedSeeds {
    async fn seeds(&self) -> Result<Vec<DiscoveryItem>> {
        let mut merged: Vec<DiscoveryItem> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for source in &self.sources {
            for item in source.seeds().await? {
                match index.get(&item.url) {
                    Some(&i) => {
                        if item.priority > merged[i].priority {
                            let title = merged[i].title.take();
                            merged[i] = item;
                            if merged[i].title.is_none() {
                                merged[i].title = title;
                            }
                        }
                    }
                    None => {
                        index.insert(item.url.clone(), merged.len());
                        merged.push(item);
                    }
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use citeflow_shared::{Citation, DocumentCategory, RelevanceScores, SessionId};
    use citeflow_storage::MemoryStore;

    #[test]
    fn parse_seed_file() {
        let content = r#"
[[seeds]]
url = "https://example.org/a"
title = "A"
score = 0.9

[[seeds]]
url = "https://example.org/b"
"#;
        let items = SeedFile::parse(Path::new("seeds.toml"), content).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title.as_deref(), Some("A"));
        assert_eq!(items[0].priority, 0.9);
        assert_eq!(items[1].priority, 1.0);
        assert!(items.iter().all(|i| i.depth == 0 && i.parent.is_none()));
    }

    #[tokio::test]
    async fn missing_seed_file_is_an_error() {
        let source = SeedFile::new("/definitely/not/here/seeds.toml");
        assert!(source.seeds().await.is_err());
    }

    #[tokio::test]
    async fn chained_seeds_keep_highest_priority() {
        let first = StaticSeeds::new(vec![
            DiscoveryItem::seed("https://a.example", Some("A".into()), 0.7),
            DiscoveryItem::seed("https://b.example", None, 0.9),
        ]);
        let second = StaticSeeds::new(vec![
            DiscoveryItem::seed("https://a.example", None, 0.95),
            DiscoveryItem::seed("https://c.example", None, 0.8),
        ]);

        let seeds = ChainedSeeds::new().with(first).with(second).seeds().await.unwrap();
        let urls: Vec<&str> = seeds.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example", "https://b.example", "https://c.example"]);
        assert_eq!(seeds[0].priority, 0.95);
        assert_eq!(seeds[0].title.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn stored_citations_become_seeds() {
        let store = Arc::new(MemoryStore::new());
        for (url, confidence) in [("https://s.example/1", 0.9), ("https://s.example/2", 0.3)] {
            store
                .insert_citation(&Citation {
                    id: uuid::Uuid::now_v7().to_string(),
                    session_id: SessionId::new(),
                    url: url.into(),
                    title: Some("Stored".into()),
                    excerpt: None,
                    confidence,
                    scores: RelevanceScores::default(),
                    references: vec![],
                    depth: 0,
                    parent_url: None,
                    category: DocumentCategory::Web,
                    content_hash: "h".into(),
                    discovered_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let source = StoredCitationSeeds::new(store, 10, 0.6);
        let seeds = source.seeds().await.unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].url, "https://s.example/1");
        assert_eq!(seeds[0].priority, 0.9);
    }
}
