//! Snowball sampling engine.
//!
//! A session starts from seed documents and performs a breadth-first,
//! depth-bounded crawl: each accepted document is stored as a citation and
//! its reference links become the next depth level's queue. Items are
//! fetched one at a time with a fixed delay between fetch attempts.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use citeflow_shared::{
    AppConfig, Citation, DiscoveryItem, Result, SamplerConfig, SamplingSession, SessionId,
    SessionStatus,
};
use citeflow_storage::Store;

use crate::classifier::{ConfidenceWeights, KeywordClassifier, RelevanceClassifier};
use crate::extractor::{HtmlReferenceExtractor, ReferenceExtractor, normalize_url};
use crate::fetcher::{DocumentFetcher, FetchOutcome, HttpFetcher};
use crate::policy::{DomainPolicy, DomainVerdict};
use crate::robots::{RobotsCache, RobotsTxt};
use crate::seeds::SeedSource;

/// Redirect hops followed for a single discovery item.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Runs sampling sessions against a fetcher, classifier, extractor and store.
pub struct Sampler {
    config: SamplerConfig,
    fetcher: Arc<dyn DocumentFetcher>,
    classifier: Arc<dyn RelevanceClassifier>,
    weights: ConfidenceWeights,
    extractor: Arc<dyn ReferenceExtractor>,
    policy: DomainPolicy,
    store: Arc<dyn Store>,
}

impl Sampler {
    /// A sampler with the default classifier and extractor.
    pub fn new(
        config: SamplerConfig,
        fetcher: Arc<dyn DocumentFetcher>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let policy = DomainPolicy::from_config(&config)?;
        Ok(Self {
            config,
            fetcher,
            classifier: Arc::new(KeywordClassifier::default()),
            weights: ConfidenceWeights::default(),
            extractor: Arc::new(HtmlReferenceExtractor),
            policy,
            store,
        })
    }

    /// An HTTP-backed sampler configured from the application config.
    pub fn from_app_config(config: &AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        let sampler_config = SamplerConfig::from(config);
        let fetcher = Arc::new(HttpFetcher::new(&sampler_config)?);
        let classifier = Arc::new(KeywordClassifier::new(&config.classifier)?);
        Ok(Self::new(sampler_config, fetcher, store)?
            .with_classifier(classifier, ConfidenceWeights::from(&config.classifier)))
    }

    pub fn with_classifier(
        mut self,
        classifier: Arc<dyn RelevanceClassifier>,
        weights: ConfidenceWeights,
    ) -> Self {
        self.classifier = classifier;
        self.weights = weights;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_policy(mut self, policy: DomainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one sampling session to completion (or cancellation).
    ///
    /// Never fails: per-item problems are counted on the session, and a seed
    /// source error is recorded as an `Aborted` session. The finalized
    /// session is persisted before it is returned.
    #[instrument(skip_all, fields(max_depth = self.config.max_depth))]
    pub async fn run_session(
        &self,
        seeds: &dyn SeedSource,
        cancel: &CancellationToken,
    ) -> SamplingSession {
        let mut run = SessionRun::new();
        info!(session_id = %run.session.id, "starting sampling session");

        let seed_items = match seeds.seeds().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "seed queue construction failed, aborting session");
                run.session.status = SessionStatus::Aborted;
                run.session.error = Some(format!("seed queue construction failed: {e}"));
                return self.finalize(run).await;
            }
        };

        let mut level = self.initial_queue(seed_items, &mut run);
        info!(seeds = level.len(), "discovery queue built");

        'levels: for depth in 0..self.config.max_depth {
            if level.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            run.session.depth_reached = depth + 1;
            let mut next_level = Vec::new();

            debug!(depth, items = level.len(), "processing depth level");
            for item in level {
                if cancel.is_cancelled() {
                    break 'levels;
                }
                self.process_item(item, depth, &mut run, &mut next_level, cancel)
                    .await;
            }

            info!(
                depth,
                discovered = run.session.discoveries_by_depth.get(&depth).copied().unwrap_or(0),
                queued_next = next_level.len(),
                "depth level complete"
            );
            level = next_level;
        }

        if cancel.is_cancelled() {
            run.session.status = SessionStatus::Cancelled;
            run.session.error = Some("sampling session cancelled".into());
        }
        self.finalize(run).await
    }

    /// Filter by minimum confidence, de-duplicate, sort by priority and cap.
    fn initial_queue(&self, seeds: Vec<DiscoveryItem>, run: &mut SessionRun) -> Vec<DiscoveryItem> {
        let mut queue: Vec<DiscoveryItem> = seeds
            .into_iter()
            .filter(|s| s.priority >= self.config.min_confidence_threshold)
            .map(|mut s| {
                s.depth = 0;
                s
            })
            .collect();
        queue.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        let mut kept = Vec::with_capacity(queue.len().min(self.config.max_citations_per_batch));
        for item in queue {
            if kept.len() >= self.config.max_citations_per_batch {
                break;
            }
            if run.queued.insert(queue_key(&item.url)) {
                kept.push(item);
            }
        }
        kept
    }

    async fn process_item(
        &self,
        item: DiscoveryItem,
        depth: u32,
        run: &mut SessionRun,
        next_level: &mut Vec<DiscoveryItem>,
        cancel: &CancellationToken,
    ) {
        run.session.processed += 1;

        let url = match Url::parse(&item.url) {
            Ok(u) => u,
            Err(e) => {
                debug!(url = %item.url, error = %e, "unparseable URL, skipping");
                run.session.skipped += 1;
                return;
            }
        };
        let Some(verdict) = self.admit(&url, run, cancel).await else {
            return;
        };

        // Fetch, following redirects only to targets that pass the same checks
        let (mut url, mut verdict) = (url, verdict);
        let mut redirects = 0;
        let response = loop {
            run.visited.insert(normalize_url(&url));
            run.session.fetch_attempts += 1;
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.fetcher.fetch(&url, self.config.request_timeout) => r,
            };
            self.pause(cancel).await;

            let FetchOutcome::Redirect(target) = response.outcome.clone() else {
                break response;
            };
            redirects += 1;
            if redirects > MAX_REDIRECTS {
                warn!(%url, "too many redirects");
                run.session.failed += 1;
                return;
            }
            debug!(from = %url, to = %target, "following redirect");
            match self.admit(&target, run, cancel).await {
                Some(next) => {
                    verdict = next;
                    url = target;
                }
                None => return,
            }
        };

        let content = match response.outcome {
            FetchOutcome::Ok => match response.content {
                Some(c) if c.trim().len() >= self.config.min_content_length => c,
                _ => {
                    debug!(%url, "content absent or too short, discarding");
                    run.session.low_confidence += 1;
                    return;
                }
            },
            FetchOutcome::TooShort => {
                debug!(%url, "content too short, discarding");
                run.session.low_confidence += 1;
                return;
            }
            FetchOutcome::BlockedByRobots | FetchOutcome::RateLimited => {
                info!(%url, outcome = ?response.outcome, "fetch refused, skipping");
                run.session.skipped += 1;
                return;
            }
            FetchOutcome::HttpError(code) => {
                warn!(%url, status = code, "fetch failed");
                run.session.failed += 1;
                return;
            }
            FetchOutcome::TransportError(ref message) => {
                warn!(%url, error = %message, "fetch failed");
                run.session.failed += 1;
                return;
            }
            FetchOutcome::Redirect(ref target) => {
                warn!(%url, %target, "redirect not followed");
                run.session.failed += 1;
                return;
            }
        };

        if verdict == DomainVerdict::AllowListed {
            run.session.government_docs_processed += 1;
        }

        // Score
        let document =
            self.extractor
                .extract(&content, &url, self.config.max_references_per_document);
        let scores = self.classifier.score(&document.text).clamped();
        let confidence = self.weights.aggregate(&scores);
        if confidence < self.config.min_confidence_threshold {
            debug!(%url, confidence, "below confidence threshold, discarding");
            run.session.low_confidence += 1;
            return;
        }

        run.session.references_extracted += document.references.len() as u64;
        let category = self.policy.categorize(&url);

        // Persist
        let citation = Citation {
            id: Uuid::now_v7().to_string(),
            session_id: run.session.id,
            url: normalize_url(&url),
            title: document.title.or(item.title),
            excerpt: document.excerpt,
            confidence,
            scores,
            references: document.references.clone(),
            depth,
            parent_url: item.parent,
            category,
            content_hash: compute_hash(&content),
            discovered_at: Utc::now(),
        };

        match self.store.insert_citation(&citation).await {
            Ok(true) => {
                run.session.discovered += 1;
                run.session.quality_scores.push(confidence);
                *run.session.discoveries_by_depth.entry(depth).or_insert(0) += 1;
                *run
                    .session
                    .categories
                    .entry(category.as_str().to_string())
                    .or_insert(0) += 1;
                debug!(%url, depth, confidence, "citation stored");
            }
            Ok(false) => {
                debug!(%url, "citation already stored");
                run.session.duplicates += 1;
            }
            Err(e) => {
                warn!(%url, error = %e, "failed to store citation");
                run.session.failed += 1;
            }
        }

        // Enqueue references for the next level
        let child_depth = depth + 1;
        if child_depth >= self.config.max_depth {
            return;
        }
        let priority = confidence * self.config.decay_factor;
        let threshold = self.config.enqueue_threshold(child_depth);
        if priority <= threshold {
            debug!(%url, priority, threshold, "child priority below threshold");
            return;
        }

        for reference in document.references {
            let Ok(ref_url) = Url::parse(&reference) else {
                continue;
            };
            let ref_key = normalize_url(&ref_url);
            if run.visited.contains(&ref_key) || run.queued.contains(&ref_key) {
                continue;
            }
            match self.store.exists_by_url(&ref_key).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    warn!(url = %ref_url, error = %e, "store lookup failed, not enqueueing");
                    continue;
                }
            }
            run.queued.insert(ref_key);
            next_level.push(DiscoveryItem {
                url: ref_url.to_string(),
                title: None,
                priority,
                depth: child_depth,
                parent: Some(citation.url.clone()),
            });
        }
    }

    /// Pre-fetch checks for one URL: already visited, domain policy and
    /// robots.txt. Counts a skip and returns `None` when the URL must not be
    /// fetched.
    async fn admit(
        &self,
        url: &Url,
        run: &mut SessionRun,
        cancel: &CancellationToken,
    ) -> Option<DomainVerdict> {
        if run.visited.contains(&normalize_url(url)) {
            run.session.skipped += 1;
            return None;
        }

        let verdict = self.policy.evaluate(url);
        if !verdict.may_fetch() {
            info!(%url, ?verdict, "domain policy: skipped without fetching");
            run.session.skipped += 1;
            return None;
        }

        if self.config.respect_robots_txt && self.blocked_by_robots(url, run, cancel).await {
            info!(%url, "robots.txt disallows crawling, skipping");
            run.session.skipped += 1;
            return None;
        }

        if cancel.is_cancelled() {
            return None;
        }
        Some(verdict)
    }

    /// Blanket-disallow check, cached per origin for the session.
    async fn blocked_by_robots(
        &self,
        url: &Url,
        run: &mut SessionRun,
        cancel: &CancellationToken,
    ) -> bool {
        let origin = url.origin().ascii_serialization();
        if let Some(blocked) = run.robots.get(&origin) {
            return blocked;
        }

        let Ok(origin_url) = Url::parse(&origin) else {
            return false;
        };
        let body = tokio::select! {
            _ = cancel.cancelled() => return false,
            b = self.fetcher.fetch_robots(&origin_url, self.config.request_timeout) => b,
        };
        let blocked = body
            .map(|b| RobotsTxt::parse(&b).disallows_all(&self.config.user_agent))
            .unwrap_or(false);
        run.robots.insert(origin, blocked);
        blocked
    }

    /// Fixed inter-request delay; returns early on cancellation.
    async fn pause(&self, cancel: &CancellationToken) {
        if self.config.delay_between_requests.is_zero() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.delay_between_requests) => {}
        }
    }

    async fn finalize(&self, mut run: SessionRun) -> SamplingSession {
        run.session.ended_at = Utc::now();
        let session = run.session;

        if let Err(e) = self.store.insert_sampling_session(&session).await {
            warn!(session_id = %session.id, error = %e, "failed to persist sampling session");
        }

        info!(
            session_id = %session.id,
            status = session.status.as_str(),
            processed = session.processed,
            discovered = session.discovered,
            skipped = session.skipped,
            failed = session.failed,
            fetch_attempts = session.fetch_attempts,
            depth_reached = session.depth_reached,
            "sampling session finished"
        );
        session
    }
}

// ---------------------------------------------------------------------------
// Session-local state
// ---------------------------------------------------------------------------

/// State owned by exactly one running session.
struct SessionRun {
    session: SamplingSession,
    /// URLs that have been fetched (or attempted).
    visited: HashSet<String>,
    /// URLs that have been placed on any level's queue.
    queued: HashSet<String>,
    robots: RobotsCache,
}

impl SessionRun {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            session: SamplingSession {
                id: SessionId::new(),
                started_at: now,
                ended_at: now,
                status: SessionStatus::Completed,
                processed: 0,
                discovered: 0,
                references_extracted: 0,
                skipped: 0,
                failed: 0,
                low_confidence: 0,
                duplicates: 0,
                fetch_attempts: 0,
                government_docs_processed: 0,
                depth_reached: 0,
                quality_scores: Vec::new(),
                discoveries_by_depth: BTreeMap::new(),
                categories: BTreeMap::new(),
                error: None,
            },
            visited: HashSet::new(),
            queued: HashSet::new(),
            robots: RobotsCache::new(),
        }
    }
}

fn queue_key(raw: &str) -> String {
    Url::parse(raw)
        .map(|u| normalize_url(&u))
        .unwrap_or_else(|_| raw.to_string())
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
