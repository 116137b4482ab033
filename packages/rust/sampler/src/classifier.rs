//! Pluggable relevance scoring.
//!
//! The sampler only depends on [`RelevanceClassifier`]; [`KeywordClassifier`]
//! is the default strategy driven by the `[classifier]` config section.

use std::sync::LazyLock;

use citeflow_shared::{ClassifierSettings, CiteflowError, RelevanceScores, Result, clamp_unit};
use regex::Regex;

/// Scores a document's text for topical relevance.
pub trait RelevanceClassifier: Send + Sync {
    /// Sub-scores in `[0, 1]`. Implementations need not clamp; callers do.
    fn score(&self, content: &str) -> RelevanceScores;
}

/// Weights combining sub-scores into one confidence value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    pub topical: f64,
    pub geographic: f64,
    pub structural: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self::from(&ClassifierSettings::default())
    }
}

impl From<&ClassifierSettings> for ConfidenceWeights {
    fn from(settings: &ClassifierSettings) -> Self {
        Self {
            topical: settings.topical_weight,
            geographic: settings.geographic_weight,
            structural: settings.structural_weight,
        }
    }
}

impl ConfidenceWeights {
    /// Weighted mean of the clamped sub-scores, itself clamped into `[0, 1]`.
    pub fn aggregate(&self, scores: &RelevanceScores) -> f64 {
        let s = scores.clamped();
        let total = self.topical + self.geographic + self.structural;
        if total <= 0.0 || total.is_nan() {
            return 0.0;
        }
        clamp_unit(
            (self.topical * s.topical + self.geographic * s.geographic + self.structural * s.structural)
                / total,
        )
    }
}

/// Structural cues typical of research documents.
static STRUCTURAL_CUES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?im)^\s*(references|bibliography|works cited)\b",
        r"(?i)\babstract\b",
        r"(?i)\b(methodology|methods)\b",
        r"(?i)\b(conclusions?|findings)\b",
        r"(?i)\bet al\.",
        r"(?i)\b(doi:|doi\.org/)",
        r"(?i)\b(table|figure)\s+\d+",
        r"\(\s*[A-Z][A-Za-z\-]+,?\s+(19|20)\d{2}\s*\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Term-density classifier.
///
/// Topical and geographic sub-scores are the share of distinct configured
/// terms found, saturating at `saturation` hits. With no geographic terms
/// configured the geographic sub-score is a neutral 0.5.
pub struct KeywordClassifier {
    topical: Vec<Regex>,
    geographic: Vec<Regex>,
    saturation: usize,
}

impl KeywordClassifier {
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        Ok(Self {
            topical: compile_terms(&settings.topical_terms)?,
            geographic: compile_terms(&settings.geographic_terms)?,
            saturation: settings.saturation.max(1),
        })
    }

    fn term_score(&self, terms: &[Regex], content: &str) -> f64 {
        let wanted = self.saturation.min(terms.len()).max(1);
        let hits = terms.iter().filter(|re| re.is_match(content)).count();
        clamp_unit(hits as f64 / wanted as f64)
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            topical: compile_terms(&ClassifierSettings::default().topical_terms)
                .unwrap_or_default(),
            geographic: Vec::new(),
            saturation: ClassifierSettings::default().saturation,
        }
    }
}

impl RelevanceClassifier for KeywordClassifier {
    fn score(&self, content: &str) -> RelevanceScores {
        let topical = self.term_score(&self.topical, content);
        let geographic = if self.geographic.is_empty() {
            0.5
        } else {
            self.term_score(&self.geographic, content)
        };

        let cues = STRUCTURAL_CUES.iter().filter(|re| re.is_match(content)).count();
        let structural = clamp_unit(cues as f64 / 4.0);

        RelevanceScores {
            topical,
            geographic,
            structural,
        }
    }
}

/// Case-insensitive whole-word matchers for each non-empty term.
fn compile_terms(terms: &[String]) -> Result<Vec<Regex>> {
    terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(t)))
                .map_err(|e| CiteflowError::config(format!("invalid classifier term '{t}': {e}")))
        })
        .collect()
}
