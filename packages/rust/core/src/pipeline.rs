//! Pipeline orchestration: run one stage or the whole catalog, tracking each
//! execution as a persisted [`PipelineRun`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use citeflow_sampler::{ChainedSeeds, Sampler, SeedFile, StoredCitationSeeds};
use citeflow_shared::{AppConfig, CiteflowError, PipelineRun, Result, RunId, RunStatus};
use citeflow_storage::Store;

use crate::report::PipelineReport;
use crate::stages::{
    CommandStage, DataQualityStage, SamplingStage, Stage, StageContext, StageOutput, StageUnit,
};

/// How long a cancelled unit may keep running to wind down on its own.
pub(crate) const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage is about to start.
    fn phase(&self, stage: Stage);
    /// Called when a stage's run reaches a terminal state.
    fn stage_finished(&self, run: &PipelineRun);
    /// Called when the whole pipeline completes.
    fn done(&self, report: &PipelineReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _stage: Stage) {}
    fn stage_finished(&self, _run: &PipelineRun) {}
    fn done(&self, _report: &PipelineReport) {}
}

/// Executes pipeline stages and owns their runs.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    units: HashMap<Stage, Arc<dyn StageUnit>>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

impl Orchestrator {
    /// An orchestrator with no stage units registered.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            units: HashMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the unit behind `stage`.
    pub fn with_unit(mut self, stage: Stage, unit: Arc<dyn StageUnit>) -> Self {
        self.units.insert(stage, unit);
        self
    }

    /// The built-in sampling and data-quality units plus one command unit
    /// per `[stages.<name>]` entry. A configured command replaces the
    /// built-in unit for its stage.
    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        let sampler = Sampler::from_app_config(config, store.clone())?;
        let sampler_config = sampler.config().clone();

        let mut seeds = ChainedSeeds::new();
        if let Some(path) = &config.sampler.seed_file {
            seeds = seeds.with(SeedFile::new(path));
        }
        seeds = seeds.with(StoredCitationSeeds::new(
            store.clone(),
            config.sampler.stored_seed_limit,
            config.sampler.min_confidence_threshold,
        ));

        let mut orchestrator = Self::new(store.clone())
            .with_unit(
                Stage::CitationSampling,
                Arc::new(SamplingStage::new(Arc::new(sampler), Arc::new(seeds))),
            )
            .with_unit(
                Stage::DataQuality,
                Arc::new(DataQualityStage::new(store, &sampler_config)),
            );

        let default_timeout = Duration::from_secs(config.scheduler.default_timeout_secs);
        for (name, command) in &config.stages {
            let stage: Stage = name.parse().map_err(|e| {
                CiteflowError::config(format!("[stages.{name}] does not name a stage: {e}"))
            })?;
            orchestrator = orchestrator.with_unit(
                stage,
                Arc::new(CommandStage::new(stage, command.clone(), default_timeout)),
            );
        }

        Ok(orchestrator)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// What backs `stage`, or `None` if nothing is registered.
    pub fn describe_unit(&self, stage: Stage) -> Option<String> {
        self.units.get(&stage).map(|unit| unit.describe())
    }

    /// Run one stage to a terminal state.
    pub async fn run_stage(&self, stage: Stage) -> PipelineRun {
        self.run_stage_until(stage, &CancellationToken::new()).await
    }

    /// Run one stage; cancelling `cancel` cancels the run.
    ///
    /// Never fails: a unit error ends the run `FAILED` with the error message,
    /// and a stage without a unit fails the same way. The run is persisted
    /// when it starts and again once it is terminal.
    #[instrument(skip_all, fields(stage = stage.as_str()))]
    pub async fn run_stage_until(&self, stage: Stage, cancel: &CancellationToken) -> PipelineRun {
        let mut run = PipelineRun::new(stage.as_str());
        let token = cancel.child_token();
        self.active.lock().await.insert(run.id(), token.clone());

        if token.is_cancelled() {
            settle(
                &mut run,
                Err(CiteflowError::Cancelled("cancelled before start".into())),
            );
        } else {
            if let Err(e) = run.start() {
                warn!(run_id = %run.id(), error = %e, "run could not be started");
            }
            self.persist(&run).await;
            info!(run_id = %run.id(), "stage started");

            let result = match self.units.get(&stage) {
                Some(unit) => {
                    let ctx = StageContext {
                        run_id: run.id(),
                        stage,
                        cancel: token.clone(),
                    };
                    execute_cancellable(unit.as_ref(), &ctx).await
                }
                None => Err(CiteflowError::Stage(format!(
                    "stage '{stage}' has no unit configured; add a [stages.{stage}] command"
                ))),
            };
            settle(&mut run, result);
        }

        self.active.lock().await.remove(&run.id());
        self.persist(&run).await;

        let counts = run.counts();
        match run.status() {
            RunStatus::Completed => info!(
                run_id = %run.id(),
                processed = counts.processed,
                created = counts.created,
                failed = counts.failed,
                "stage completed"
            ),
            status => warn!(
                run_id = %run.id(),
                status = status.as_str(),
                error = run.error().unwrap_or_default(),
                "stage did not complete"
            ),
        }
        run
    }

    /// Run every stage in catalog order, continuing past failures.
    pub async fn run_all(&self, progress: &dyn ProgressReporter) -> PipelineReport {
        self.run_all_until(progress, &CancellationToken::new()).await
    }

    #[instrument(skip_all)]
    pub async fn run_all_until(
        &self,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> PipelineReport {
        let started_at = Utc::now();
        let mut runs = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            progress.phase(stage);
            let run = self.run_stage_until(stage, cancel).await;
            progress.stage_finished(&run);
            runs.push(run);
        }

        let report = PipelineReport::new(started_at, runs);
        info!(
            completed = report.count(RunStatus::Completed),
            failed = report.count(RunStatus::Failed),
            cancelled = report.count(RunStatus::Cancelled),
            created = report.totals.created,
            "pipeline finished"
        );
        progress.done(&report);
        report
    }

    /// Request cancellation of an active run. Returns `false` if no run with
    /// this id is pending or running.
    pub async fn cancel(&self, run_id: RunId) -> bool {
        match self.active.lock().await.get(&run_id) {
            Some(token) => {
                info!(%run_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs that have not reached a terminal state yet.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.active.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.store.insert_pipeline_run(run).await {
            warn!(run_id = %run.id(), error = %e, "failed to persist pipeline run");
        }
    }
}

/// Execute `unit`, giving it [`CANCEL_GRACE`] to return after cancellation
/// before it is dropped.
async fn execute_cancellable(unit: &dyn StageUnit, ctx: &StageContext) -> Result<StageOutput> {
    let execution = unit.execute(ctx);
    tokio::pin!(execution);

    tokio::select! {
        result = &mut execution => result,
        _ = ctx.cancel.cancelled() => {
            if tokio::time::timeout(CANCEL_GRACE, &mut execution).await.is_err() {
                warn!(run_id = %ctx.run_id, "stage unit ignored cancellation, dropping it");
            }
            Err(CiteflowError::Cancelled(format!("run {} cancelled", ctx.run_id)))
        }
    }
}

/// Apply a unit's result to its run.
fn settle(run: &mut PipelineRun, result: Result<StageOutput>) {
    let transition = match result {
        Ok(output) => {
            let counts = output.counts();
            run.complete(counts, output.metadata)
        }
        Err(CiteflowError::Cancelled(reason)) => run.cancel(reason),
        Err(e) => run.fail(e.to_string()),
    };
    if let Err(e) = transition {
        warn!(run_id = %run.id(), error = %e, "run transition rejected");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{FakeUnit, orchestrator};
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use citeflow_sampler::{ConfidenceWeights, DocumentFetcher, FetchResponse, RelevanceClassifier, StaticSeeds};
    use citeflow_shared::{DiscoveryItem, RelevanceScores, RunCounts, SamplerConfig};
    use citeflow_storage::MemoryStore;
    use url::Url;

    #[derive(Default)]
    struct RecordingProgress {
        events: StdMutex<Vec<String>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, stage: Stage) {
            self.events.lock().unwrap().push(format!("start {stage}"));
        }
        fn stage_finished(&self, run: &PipelineRun) {
            self.events
                .lock()
                .unwrap()
                .push(format!("end {} {}", run.stage(), run.status()));
        }
        fn done(&self, report: &PipelineReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {}", report.outcomes.len()));
        }
    }

    #[tokio::test]
    async fn successful_stage_completes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store.clone());

        let run = orch.run_stage(Stage::CitationSampling).await;
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.counts(), RunCounts::new(10, 4, 0));
        assert_eq!(run.metadata()["unit"], "fake");
        assert!(run.started_at().is_some() && run.ended_at().is_some());

        let stored = store.recent_pipeline_runs(10).await.unwrap();
        assert_eq!(stored, vec![run]);
        assert!(orch.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn failing_unit_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        let run = orchestrator(store).run_stage(Stage::ScoreCalculation).await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error().unwrap().contains("scorer crashed"));
        assert_eq!(run.counts(), RunCounts::default());
        assert!(run.ended_at().is_some());
    }

    #[tokio::test]
    async fn stage_without_unit_fails_descriptively() {
        let store = Arc::new(MemoryStore::new());
        let run = orchestrator(store).run_stage(Stage::ReportGeneration).await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error().unwrap().contains("[stages.report_generation]"));
    }

    #[tokio::test]
    async fn terminal_runs_read_back_identically() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store.clone());
        orch.run_stage(Stage::DataQuality).await;

        let first = store.recent_pipeline_runs(1).await.unwrap();
        let second = store.recent_pipeline_runs(1).await.unwrap();
        assert_eq!(first, second);
        assert!(first[0].is_terminal());
    }

    #[tokio::test]
    async fn run_all_continues_past_failures() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store.clone());
        let progress = RecordingProgress::default();

        let report = orch.run_all(&progress).await;

        let statuses: Vec<RunStatus> = report.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Completed,
                RunStatus::Failed
            ]
        );
        assert_eq!(report.totals, RunCounts::new(14, 4, 1));
        assert!(report.any_failed());
        assert!(!report.all_failed());
        // data_quality: 1 failed vs 0 created
        assert!(report.recommendations.iter().any(|r| matches!(
            r,
            crate::report::Recommendation::HighFailureRate { stage, .. } if stage == "data_quality"
        )));
        assert_eq!(store.recent_pipeline_runs(10).await.unwrap().len(), 4);

        let events = progress.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("start citation_sampling"));
        assert_eq!(events.get(3).map(String::as_str), Some("end score_calculation FAILED"));
        assert_eq!(events.last().map(String::as_str), Some("done 4"));
    }

    #[tokio::test]
    async fn external_cancel_moves_run_to_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let orch = Arc::new(
            Orchestrator::new(store.clone())
                .with_unit(Stage::CitationSampling, Arc::new(FakeUnit::WaitsForCancel)),
        );

        let handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_stage(Stage::CitationSampling).await })
        };

        let run_id = loop {
            if let Some(id) = orch.active_runs().await.first().copied() {
                break id;
            }
            tokio::task::yield_now().await;
        };
        assert!(orch.cancel(run_id).await);

        let run = handle.await.unwrap();
        assert_eq!(run.id(), run_id);
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert!(!orch.cancel(run_id).await);

        let stored = store.recent_pipeline_runs(1).await.unwrap();
        assert_eq!(stored[0].status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_parent_cancels_remaining_stages() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator(store)
            .run_all_until(&SilentProgress, &cancel)
            .await;
        assert_eq!(report.count(RunStatus::Cancelled), 4);
        assert!(report.all_failed());
        assert!(report.outcomes.iter().all(|o| o.duration_ms.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_ignoring_cancellation_is_dropped_after_grace() {
        struct Stubborn;

        #[async_trait]
        impl StageUnit for Stubborn {
            async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(StageOutput::default())
            }
            fn describe(&self) -> String {
                "stubborn".into()
            }
        }

        let store = Arc::new(MemoryStore::new());
        let orch = Orchestrator::new(store).with_unit(Stage::DataQuality, Arc::new(Stubborn));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let run = orch.run_stage_until(Stage::DataQuality, &cancel).await;
        canceller.await.unwrap();
        assert_eq!(run.status(), RunStatus::Cancelled);
    }

    // -----------------------------------------------------------------------
    // Sampling stage through the orchestrator
    // -----------------------------------------------------------------------

    struct OnePage;

    #[async_trait]
    impl DocumentFetcher for OnePage {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> FetchResponse {
            FetchResponse::ok(format!(
                "<html><head><title>Doc {}</title></head><body>\
                 <p>Regional housing research with enough text to pass.</p></body></html>",
                url.path()
            ))
        }

        async fn fetch_robots(&self, _origin: &Url, _timeout: Duration) -> Option<String> {
            None
        }
    }

    struct AlwaysRelevant;

    impl RelevanceClassifier for AlwaysRelevant {
        fn score(&self, _content: &str) -> RelevanceScores {
            RelevanceScores {
                topical: 0.9,
                geographic: 0.9,
                structural: 0.9,
            }
        }
    }

    #[tokio::test]
    async fn sampling_stage_reports_session_counts() {
        let store = Arc::new(MemoryStore::new());
        let config = SamplerConfig {
            min_content_length: 10,
            delay_between_requests: Duration::ZERO,
            respect_robots_txt: false,
            ..SamplerConfig::default()
        };
        let sampler = Sampler::new(config, Arc::new(OnePage), store.clone())
            .unwrap()
            .with_classifier(Arc::new(AlwaysRelevant), ConfidenceWeights::default());
        let seeds = StaticSeeds::new(vec![
            DiscoveryItem::seed("https://research.example/a", None, 0.9),
            DiscoveryItem::seed("https://research.example/b", None, 0.9),
        ]);

        let orch = Orchestrator::new(store.clone()).with_unit(
            Stage::CitationSampling,
            Arc::new(SamplingStage::new(Arc::new(sampler), Arc::new(seeds))),
        );
        let run = orch.run_stage(Stage::CitationSampling).await;

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.counts(), RunCounts::new(2, 2, 0));
        assert_eq!(run.metadata()["fetch_attempts"], 2);
        assert_eq!(store.citation_count().await.unwrap(), 2);
        assert_eq!(store.recent_sampling_sessions(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aborted_session_fails_the_run() {
        struct Unreadable;

        #[async_trait]
        impl citeflow_sampler::SeedSource for Unreadable {
            async fn seeds(&self) -> Result<Vec<DiscoveryItem>> {
                Err(CiteflowError::parse("seed index unreadable"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let sampler = Sampler::new(SamplerConfig::default(), Arc::new(OnePage), store.clone()).unwrap();
        let orch = Orchestrator::new(store).with_unit(
            Stage::CitationSampling,
            Arc::new(SamplingStage::new(Arc::new(sampler), Arc::new(Unreadable))),
        );

        let run = orch.run_stage(Stage::CitationSampling).await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error().unwrap().contains("seed index unreadable"));
    }

    #[test]
    fn from_config_rejects_unknown_stage_commands() {
        let mut config = AppConfig::default();
        config.stages.insert(
            "scoring".into(),
            citeflow_shared::ExternalStageConfig {
                command: "true".into(),
                args: vec![],
                working_dir: None,
                timeout_secs: None,
            },
        );
        let err = Orchestrator::from_config(&config, Arc::new(MemoryStore::new()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("[stages.scoring]"));
    }

    #[test]
    fn from_config_registers_units() {
        let mut config = AppConfig::default();
        config.stages.insert(
            "score_calculation".into(),
            citeflow_shared::ExternalStageConfig {
                command: "python3".into(),
                args: vec!["-m".into(), "scoring".into()],
                working_dir: None,
                timeout_secs: None,
            },
        );
        let orch = Orchestrator::from_config(&config, Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(
            orch.describe_unit(Stage::ScoreCalculation).as_deref(),
            Some("command: python3 -m scoring")
        );
        assert!(orch.describe_unit(Stage::CitationSampling).is_some());
        assert!(orch.describe_unit(Stage::DataQuality).is_some());
        assert!(orch.describe_unit(Stage::ReportGeneration).is_none());
    }
}
