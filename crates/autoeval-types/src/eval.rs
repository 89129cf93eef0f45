//! Evaluation schemas: cases, summaries, judgments, and suite rollups.
//!
//! The `validate` methods encode the structural rules agent output must obey.
//! Agents (and the stages that call them) treat a violation as an agent error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggregate score at or above which a non-hallucinating result passes.
pub const PASS_THRESHOLD: f64 = 3.5;

const MAX_KEY_POINT_WORDS: usize = 24;
const MAX_ABSTRACT_WORDS: usize = 120;
const MAX_RATIONALE_WORDS: usize = 60;
const MAX_EVIDENCE_SPANS: usize = 2;
const MAX_SCORE: u8 = 5;

/// Round to four decimal places.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

/// The closed failure taxonomy a judge may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    MissedKeyPoint,
    HallucinatedFact,
    UnsupportedClaim,
    VerbosityExcess,
    OverCompression,
    PoorStructure,
    TopicDrift,
    EntityError,
}

impl FailureTag {
    pub const ALL: [FailureTag; 8] = [
        FailureTag::MissedKeyPoint,
        FailureTag::HallucinatedFact,
        FailureTag::UnsupportedClaim,
        FailureTag::VerbosityExcess,
        FailureTag::OverCompression,
        FailureTag::PoorStructure,
        FailureTag::TopicDrift,
        FailureTag::EntityError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureTag::MissedKeyPoint => "missed_key_point",
            FailureTag::HallucinatedFact => "hallucinated_fact",
            FailureTag::UnsupportedClaim => "unsupported_claim",
            FailureTag::VerbosityExcess => "verbosity_excess",
            FailureTag::OverCompression => "over_compression",
            FailureTag::PoorStructure => "poor_structure",
            FailureTag::TopicDrift => "topic_drift",
            FailureTag::EntityError => "entity_error",
        }
    }
}

impl std::fmt::Display for FailureTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SuiteVersion
// ---------------------------------------------------------------------------

/// Which iteration of the loop a suite belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteVersion {
    V1,
    V2,
}

impl SuiteVersion {
    pub fn number(self) -> u32 {
        match self {
            SuiteVersion::V1 => 1,
            SuiteVersion::V2 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SuiteVersion::V1 => "v1",
            SuiteVersion::V2 => "v2",
        }
    }

    /// Suite-scoped case id, e.g. `v1-case-0003` for `index = 2`.
    pub fn case_id(self, index: usize) -> String {
        format!("{}-case-{:04}", self.as_str(), index + 1)
    }

    /// Suite id, e.g. `{run_id}#v1`.
    pub fn suite_id(self, run_id: &str) -> String {
        format!("{}#{}", run_id, self.as_str())
    }
}

impl std::fmt::Display for SuiteVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EvalCase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    /// Format: `v{n}-case-{0001}`.
    pub eval_id: String,
    pub doc_id: String,
    pub prompt_template: String,
    #[serde(default)]
    pub constraints: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rubric_note: String,
    pub difficulty_tag: Difficulty,
    pub category_tag: String,
}

impl EvalCase {
    /// Text used for similarity comparison: prompt template plus rubric note.
    pub fn comparison_text(&self) -> String {
        let mut text = self.prompt_template.trim().to_string();
        let note = self.rubric_note.trim();
        if !note.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(note);
        }
        text
    }
}

// ---------------------------------------------------------------------------
// StructuredSummary
// ---------------------------------------------------------------------------

/// Summarizer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSummary {
    pub title: String,
    pub key_points: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
}

impl StructuredSummary {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is empty".into());
        }
        if self.key_points.len() != 5 {
            return Err(format!(
                "expected exactly 5 key_points, got {}",
                self.key_points.len()
            ));
        }
        for (i, point) in self.key_points.iter().enumerate() {
            let words = point.split_whitespace().count();
            if words > MAX_KEY_POINT_WORDS {
                return Err(format!(
                    "key_points[{i}] has {words} words (max {MAX_KEY_POINT_WORDS})"
                ));
            }
        }
        let words = self.abstract_text.split_whitespace().count();
        if words == 0 {
            return Err("abstract is empty".into());
        }
        if words > MAX_ABSTRACT_WORDS {
            return Err(format!(
                "abstract has {words} words (max {MAX_ABSTRACT_WORDS})"
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Judgments
// ---------------------------------------------------------------------------

/// Per-dimension integer scores, each 0–5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub coverage: u8,
    pub faithfulness: u8,
    pub conciseness: u8,
    pub structure: u8,
}

impl ScoreCard {
    pub const DIMENSIONS: [&'static str; 4] =
        ["coverage", "faithfulness", "conciseness", "structure"];

    pub fn values(&self) -> [u8; 4] {
        [self.coverage, self.faithfulness, self.conciseness, self.structure]
    }

    /// Mean of the four dimensions, rounded to 4 decimals.
    pub fn aggregate(&self) -> f64 {
        let total: u32 = self.values().iter().map(|v| u32::from(*v)).sum();
        round4(f64::from(total) / 4.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCaseResult {
    pub eval_id: String,
    pub scores: ScoreCard,
    pub aggregate_score: f64,
    pub hallucination_flag: bool,
    #[serde(default)]
    pub failure_tags: Vec<FailureTag>,
    pub rationale: String,
    #[serde(default)]
    pub evidence_spans: Vec<String>,
    #[serde(rename = "pass")]
    pub pass: bool,
}

impl JudgeCaseResult {
    /// Build a result with aggregate and pass derived from the scores.
    pub fn from_scores(
        eval_id: impl Into<String>,
        scores: ScoreCard,
        hallucination_flag: bool,
        failure_tags: Vec<FailureTag>,
        rationale: impl Into<String>,
        evidence_spans: Vec<String>,
    ) -> Self {
        let aggregate_score = scores.aggregate();
        Self {
            eval_id: eval_id.into(),
            scores,
            aggregate_score,
            hallucination_flag,
            failure_tags,
            rationale: rationale.into(),
            evidence_spans,
            pass: aggregate_score >= PASS_THRESHOLD && !hallucination_flag,
        }
    }

    /// Recompute aggregate and pass from the dimension scores, whatever the
    /// judge claimed. A hallucination is an automatic fail.
    /// Returns `true` if either value had to be corrected.
    pub fn enforce_pass_rule(&mut self) -> bool {
        let aggregate_score = self.scores.aggregate();
        let pass = aggregate_score >= PASS_THRESHOLD && !self.hallucination_flag;
        let corrected = aggregate_score != self.aggregate_score || pass != self.pass;
        self.aggregate_score = aggregate_score;
        self.pass = pass;
        corrected
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(score) = self.scores.values().iter().find(|s| **s > MAX_SCORE) {
            return Err(format!("dimension score {score} out of range 0-{MAX_SCORE}"));
        }
        if !(0.0..=f64::from(MAX_SCORE)).contains(&self.aggregate_score) {
            return Err(format!(
                "aggregate_score {} out of range",
                self.aggregate_score
            ));
        }
        if self.evidence_spans.len() > MAX_EVIDENCE_SPANS {
            return Err(format!(
                "{} evidence spans (max {MAX_EVIDENCE_SPANS})",
                self.evidence_spans.len()
            ));
        }
        let words = self.rationale.split_whitespace().count();
        if words > MAX_RATIONALE_WORDS {
            return Err(format!(
                "rationale has {words} words (max {MAX_RATIONALE_WORDS})"
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CaseExecution
// ---------------------------------------------------------------------------

/// Summarizer outcome for one case. Lives only inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseExecution {
    pub eval_id: String,
    pub doc_id: String,
    pub summary: Option<StructuredSummary>,
    pub error: Option<String>,
    pub tokens_used: u64,
}

impl CaseExecution {
    pub fn failed(case: &EvalCase, error: impl Into<String>) -> Self {
        Self {
            eval_id: case.eval_id.clone(),
            doc_id: case.doc_id.clone(),
            summary: None,
            error: Some(error.into()),
            tokens_used: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// SuiteMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteMetrics {
    /// Format: `{run_id}#v{n}`.
    pub suite_id: String,
    pub avg_scores_by_dimension: BTreeMap<String, f64>,
    pub aggregate_avg: f64,
    pub pass_rate: f64,
    pub failure_detection_rate: f64,
    pub top_failure_modes: Vec<FailureTag>,
    pub worst_examples: Vec<EvalCase>,
}

impl SuiteMetrics {
    /// Metrics for a suite with no judged results.
    pub fn zero(suite_id: impl Into<String>) -> Self {
        Self {
            suite_id: suite_id.into(),
            avg_scores_by_dimension: ScoreCard::DIMENSIONS
                .iter()
                .map(|d| (d.to_string(), 0.0))
                .collect(),
            aggregate_avg: 0.0,
            pass_rate: 0.0,
            failure_detection_rate: 0.0,
            top_failure_modes: Vec::new(),
            worst_examples: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Curriculum output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPlan {
    pub retained_count: usize,
    pub replaced_count: usize,
    #[serde(default)]
    pub targeted_failure_modes: Vec<FailureTag>,
    #[serde(default)]
    pub dedup_rejections: usize,
    pub representative_changes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumOutput {
    pub next_suite: Vec<EvalCase>,
    pub improvement_plan: ImprovementPlan,
}
