//! Near-duplicate filter for newly authored eval cases.

use autoeval_types::EvalCase;

use crate::vector::{VectorIndex, NS_EVAL_PROMPTS};

/// Similarity at or above which a candidate counts as a duplicate.
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.90;

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub accepted: Vec<EvalCase>,
    /// Rejected cases with the similarity of their nearest indexed neighbour.
    pub rejected: Vec<(EvalCase, f64)>,
}

/// Split `candidates` into accepted and rejected against the indexed prompts.
///
/// Empty comparison text is always accepted. Vector-service errors fail open:
/// the case is accepted and the error logged. Without an index every case is
/// accepted.
pub async fn filter_duplicates(
    index: Option<&dyn VectorIndex>,
    candidates: Vec<EvalCase>,
    threshold: f64,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let Some(index) = index else {
        outcome.accepted = candidates;
        return outcome;
    };

    for case in candidates {
        let text = case.comparison_text();
        if text.is_empty() {
            outcome.accepted.push(case);
            continue;
        }
        match index.query_text(&text, NS_EVAL_PROMPTS, 1).await {
            Ok(matches) => match matches.first() {
                Some(top) if top.score >= threshold => {
                    tracing::info!(
                        eval_id = %case.eval_id,
                        similar_to = %top.id,
                        score = top.score,
                        "Rejected near-duplicate case"
                    );
                    outcome.rejected.push((case, top.score));
                }
                _ => outcome.accepted.push(case),
            },
            Err(e) => {
                tracing::warn!(eval_id = %case.eval_id, error = %e, "Dedup lookup failed, accepting case");
                outcome.accepted.push(case);
            }
        }
    }
    outcome
}
