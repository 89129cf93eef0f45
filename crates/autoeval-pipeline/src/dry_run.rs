//! Deterministic agents that never call a model.
//!
//! Used by `--dry-run` and by tests that need a full pipeline without
//! scripting every call. Output always satisfies the schema rules.

use std::collections::BTreeMap;

use async_trait::async_trait;

use autoeval_types::{
    AutoevalError, CurriculumOutput, Document, EvalCase, FailureTag, ImprovementPlan,
    JudgeCaseResult, Result, ScoreCard, StructuredSummary, SuiteMetrics, SuiteVersion,
};

use crate::agents::EvalAgents;
use crate::vector::stable_hash;

const KEY_POINT_WORDS: usize = 12;
const ABSTRACT_WORDS: usize = 120;

#[derive(Debug, Clone, Default)]
pub struct DryRunAgents;

impl DryRunAgents {
    pub fn new() -> Self {
        Self
    }
}

fn case_constraints() -> BTreeMap<String, serde_json::Value> {
    let mut constraints = BTreeMap::new();
    constraints.insert("key_points".into(), serde_json::json!(5));
    constraints.insert("max_key_point_words".into(), serde_json::json!(24));
    constraints.insert("max_abstract_words".into(), serde_json::json!(ABSTRACT_WORDS));
    constraints
}

fn authored_case(version: SuiteVersion, index: usize, doc: &Document, focus: Option<FailureTag>) -> EvalCase {
    let (prompt_template, rubric_note) = match focus {
        Some(tag) => (
            format!(
                "Summarize {} for a {} reader, guarding against {}.",
                doc.doc_id,
                doc.category_tag,
                tag.as_str().replace('_', " ")
            ),
            format!("Penalize any {} relative to the source.", tag),
        ),
        None => (
            format!(
                "Summarize {} for a {} reader in a title, five key points and an abstract.",
                doc.doc_id, doc.category_tag
            ),
            format!("Key facts of {} must appear without invented detail.", doc.doc_id),
        ),
    };
    EvalCase {
        eval_id: version.case_id(index),
        doc_id: doc.doc_id.clone(),
        prompt_template,
        constraints: case_constraints(),
        rubric_note,
        difficulty_tag: doc.difficulty_tag,
        category_tag: doc.category_tag.clone(),
    }
}

#[async_trait]
impl EvalAgents for DryRunAgents {
    async fn author(
        &self,
        docs: &[Document],
        suite_size: usize,
        version: SuiteVersion,
    ) -> Result<Vec<EvalCase>> {
        if docs.is_empty() {
            return Err(AutoevalError::agent("author", "no documents supplied"));
        }
        Ok((0..suite_size)
            .map(|i| authored_case(version, i, &docs[i % docs.len()], None))
            .collect())
    }

    async fn summarize(
        &self,
        doc_text: &str,
        constraints: &BTreeMap<String, serde_json::Value>,
    ) -> Result<StructuredSummary> {
        let words: Vec<&str> = doc_text.split_whitespace().collect();
        if words.is_empty() {
            return Err(AutoevalError::agent("summarizer", "document is empty"));
        }
        let abstract_limit = constraints
            .get("max_abstract_words")
            .and_then(|v| v.as_u64())
            .map_or(ABSTRACT_WORDS, |n| (n as usize).clamp(1, ABSTRACT_WORDS));

        let mut chunks = words.chunks(KEY_POINT_WORDS).map(|c| c.join(" "));
        let key_points = (0..5)
            .map(|_| {
                chunks
                    .next()
                    .unwrap_or_else(|| "No further detail in the source.".to_string())
            })
            .collect();

        Ok(StructuredSummary {
            title: words.iter().take(8).copied().collect::<Vec<_>>().join(" "),
            key_points,
            abstract_text: words
                .iter()
                .take(abstract_limit)
                .copied()
                .collect::<Vec<_>>()
                .join(" "),
        })
    }

    async fn judge(
        &self,
        case: &EvalCase,
        _doc_text: &str,
        summary: &StructuredSummary,
    ) -> Result<JudgeCaseResult> {
        let h = stable_hash(&case.eval_id) ^ stable_hash(&summary.title).rotate_left(17);
        let bump = u8::from(case.eval_id.starts_with("v2"));
        let scores = ScoreCard {
            coverage: (2 + (h % 4) as u8 + bump).min(5),
            faithfulness: (2 + ((h >> 8) % 4) as u8 + bump).min(5),
            conciseness: 3 + ((h >> 16) % 3) as u8,
            structure: if summary.key_points.len() == 5 {
                4 + ((h >> 24) % 2) as u8
            } else {
                2
            },
        };
        let hallucination = (h >> 32) % 10 == 0;

        let mut tags = Vec::new();
        if scores.coverage <= 2 {
            tags.push(FailureTag::MissedKeyPoint);
        }
        if scores.faithfulness <= 2 {
            tags.push(FailureTag::UnsupportedClaim);
        }
        if scores.conciseness == 3 {
            tags.push(FailureTag::VerbosityExcess);
        }
        if hallucination {
            tags.push(FailureTag::HallucinatedFact);
        }

        let evidence = summary.key_points.iter().take(1).cloned().collect();
        Ok(JudgeCaseResult::from_scores(
            case.eval_id.clone(),
            scores,
            hallucination,
            tags,
            format!(
                "Coverage {}/5 and faithfulness {}/5 against the source.",
                scores.coverage, scores.faithfulness
            ),
            evidence,
        ))
    }

    async fn curriculum(
        &self,
        prev_metrics: &SuiteMetrics,
        worst_cases: &[EvalCase],
        docs: &[Document],
        similar_prompt_hints: &[String],
        suite_size: usize,
    ) -> Result<CurriculumOutput> {
        let focus = &prev_metrics.top_failure_modes;
        let mut next_suite: Vec<EvalCase> = worst_cases
            .iter()
            .take(suite_size)
            .enumerate()
            .map(|(i, case)| EvalCase {
                eval_id: SuiteVersion::V2.case_id(i),
                rubric_note: format!(
                    "Regression check carried from {}; it scored among the worst.",
                    case.eval_id
                ),
                ..case.clone()
            })
            .collect();
        let retained_count = next_suite.len();
        let replaced_count = suite_size - retained_count;

        if replaced_count > 0 && docs.is_empty() {
            return Err(AutoevalError::agent("curriculum", "no documents for new cases"));
        }
        for j in 0..replaced_count {
            let doc = &docs[j % docs.len().max(1)];
            let tag = (!focus.is_empty()).then(|| focus[j % focus.len()]);
            next_suite.push(authored_case(SuiteVersion::V2, retained_count + j, doc, tag));
        }

        let targeted: Vec<String> = focus.iter().map(|t| t.to_string()).collect();
        Ok(CurriculumOutput {
            next_suite,
            improvement_plan: ImprovementPlan {
                retained_count,
                replaced_count,
                targeted_failure_modes: focus.clone(),
                dedup_rejections: 0,
                representative_changes: format!(
                    "Kept {} regression cases and added {} targeting [{}] using {} recalled failures.",
                    retained_count,
                    replaced_count,
                    targeted.join(", "),
                    similar_prompt_hints.len()
                ),
            },
        })
    }
}
