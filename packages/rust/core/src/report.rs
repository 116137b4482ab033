//! Aggregate report over one full pipeline pass.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use citeflow_shared::{PipelineRun, RunCounts, RunId, RunStatus};

use crate::stages::Stage;

/// Outcome of one stage within a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub run_id: RunId,
    pub status: RunStatus,
    pub counts: RunCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PipelineRun> for StageOutcome {
    fn from(run: &PipelineRun) -> Self {
        Self {
            stage: run.stage().to_string(),
            run_id: run.id(),
            status: run.status(),
            counts: run.counts(),
            duration_ms: run.duration().map(|d| d.num_milliseconds()),
            error: run.error().map(str::to_string),
        }
    }
}

/// Heuristic follow-up suggested by a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    StageFailed { stage: String, error: String },
    /// More than 10% of the records a stage created failed.
    HighFailureRate { stage: String, failed: u64, created: u64 },
    NoNewCitations,
    NothingProcessed,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageFailed { stage, error } => {
                write!(f, "stage {stage} failed ({error}); fix it and rerun the stage")
            }
            Self::HighFailureRate {
                stage,
                failed,
                created,
            } => write!(
                f,
                "high failure rate in {stage}: {failed} failed against {created} created"
            ),
            Self::NoNewCitations => f.write_str(
                "no new citations were discovered; add seeds or lower min_confidence_threshold",
            ),
            Self::NothingProcessed => f.write_str("no stage processed any records"),
        }
    }
}

/// Result of `run_all`: every stage's run plus totals and recommendations.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// In execution order.
    pub outcomes: Vec<StageOutcome>,
    pub totals: RunCounts,
    pub recommendations: Vec<Recommendation>,
    /// Keyed by stage name.
    pub runs: BTreeMap<String, PipelineRun>,
}

impl PipelineReport {
    pub fn new(started_at: DateTime<Utc>, runs: Vec<PipelineRun>) -> Self {
        let outcomes: Vec<StageOutcome> = runs.iter().map(StageOutcome::from).collect();

        let mut totals = RunCounts::default();
        for run in &runs {
            totals.absorb(&run.counts());
        }

        let recommendations = recommend(&runs, &totals);
        let runs = runs
            .into_iter()
            .map(|run| (run.stage().to_string(), run))
            .collect();

        Self {
            started_at,
            ended_at: Utc::now(),
            outcomes,
            totals,
            recommendations,
            runs,
        }
    }

    pub fn run(&self, stage: Stage) -> Option<&PipelineRun> {
        self.runs.get(stage.as_str())
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// True when no stage completed.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.count(RunStatus::Completed) == 0
    }

    pub fn any_failed(&self) -> bool {
        self.count(RunStatus::Failed) > 0
    }
}

fn recommend(runs: &[PipelineRun], totals: &RunCounts) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for run in runs {
        match run.status() {
            RunStatus::Failed => out.push(Recommendation::StageFailed {
                stage: run.stage().to_string(),
                error: run.error().unwrap_or("unknown error").to_string(),
            }),
            RunStatus::Completed => {
                let counts = run.counts();
                if counts.failed.saturating_mul(10) > counts.created {
                    out.push(Recommendation::HighFailureRate {
                        stage: run.stage().to_string(),
                        failed: counts.failed,
                        created: counts.created,
                    });
                }
                if run.stage() == Stage::CitationSampling.as_str() && counts.created == 0 {
                    out.push(Recommendation::NoNewCitations);
                }
            }
            _ => {}
        }
    }

    if totals.processed == 0 {
        out.push(Recommendation::NothingProcessed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(stage: Stage, counts: RunCounts) -> PipelineRun {
        let mut run = PipelineRun::new(stage.as_str());
        run.start().unwrap();
        run.complete(counts, BTreeMap::new()).unwrap();
        run
    }

    fn failed(stage: Stage, error: &str) -> PipelineRun {
        let mut run = PipelineRun::new(stage.as_str());
        run.start().unwrap();
        run.fail(error).unwrap();
        run
    }

    #[test]
    fn totals_and_order() {
        let report = PipelineReport::new(
            Utc::now(),
            vec![
                completed(Stage::CitationSampling, RunCounts::new(40, 12, 1)),
                failed(Stage::ScoreCalculation, "no unit"),
                completed(Stage::DataQuality, RunCounts::new(12, 0, 0)),
                completed(Stage::ReportGeneration, RunCounts::new(3, 3, 0)),
            ],
        );

        assert_eq!(report.totals, RunCounts::new(55, 15, 1));
        let stages: Vec<&str> = report.outcomes.iter().map(|o| o.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["citation_sampling", "score_calculation", "data_quality", "report_generation"]
        );
        assert_eq!(report.count(RunStatus::Completed), 3);
        assert!(report.any_failed());
        assert!(!report.all_failed());
        assert_eq!(
            report.run(Stage::ScoreCalculation).and_then(|r| r.error()),
            Some("no unit")
        );
        assert_eq!(
            report.recommendations,
            vec![Recommendation::StageFailed {
                stage: "score_calculation".into(),
                error: "no unit".into(),
            }]
        );
    }

    #[test]
    fn high_failure_rate_threshold() {
        let at_threshold = PipelineReport::new(
            Utc::now(),
            vec![completed(Stage::CitationSampling, RunCounts::new(50, 10, 1))],
        );
        assert!(at_threshold.recommendations.is_empty());

        let above = PipelineReport::new(
            Utc::now(),
            vec![completed(Stage::CitationSampling, RunCounts::new(50, 10, 2))],
        );
        assert_eq!(
            above.recommendations,
            vec![Recommendation::HighFailureRate {
                stage: "citation_sampling".into(),
                failed: 2,
                created: 10,
            }]
        );
    }

    #[test]
    fn extreme_counts_from_a_command_do_not_overflow() {
        let output = crate::stages::parse_command_output(
            r#"{"processed": 5, "created": 3, "failed": 18446744073709551615}"#,
        )
        .unwrap();
        assert_eq!(output.failed, u64::MAX);

        let report = PipelineReport::new(
            Utc::now(),
            vec![
                completed(Stage::DataQuality, output.counts()),
                completed(Stage::ReportGeneration, RunCounts::new(u64::MAX, 1, 1)),
            ],
        );

        assert_eq!(report.totals, RunCounts::new(u64::MAX, 4, u64::MAX));
        assert_eq!(
            report.recommendations,
            vec![
                Recommendation::HighFailureRate {
                    stage: "data_quality".into(),
                    failed: u64::MAX,
                    created: 3,
                },
                Recommendation::HighFailureRate {
                    stage: "report_generation".into(),
                    failed: 1,
                    created: 1,
                },
            ]
        );
    }

    #[test]
    fn empty_sampling_is_flagged() {
        let report = PipelineReport::new(
            Utc::now(),
            vec![completed(Stage::CitationSampling, RunCounts::default())],
        );
        assert_eq!(
            report.recommendations,
            vec![Recommendation::NoNewCitations, Recommendation::NothingProcessed]
        );
    }

    #[test]
    fn every_stage_failed() {
        let report = PipelineReport::new(
            Utc::now(),
            Stage::ALL.iter().map(|s| failed(*s, "down")).collect(),
        );
        assert!(report.all_failed());
        assert_eq!(report.count(RunStatus::Failed), 4);
    }

    #[test]
    fn report_serializes_with_tagged_recommendations() {
        let report = PipelineReport::new(
            Utc::now(),
            vec![failed(Stage::DataQuality, "store offline")],
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["recommendations"][0]["kind"], "stage_failed");
        assert_eq!(json["outcomes"][0]["status"], "FAILED");
        assert_eq!(json["runs"]["data_quality"]["error"], "store offline");
    }
}
