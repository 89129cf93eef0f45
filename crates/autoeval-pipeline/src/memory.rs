//! Prompt indexing and failure memory on top of the vector service.
//!
//! Everything here fails open: a vector error is logged and the caller
//! proceeds as if nothing was indexed or recalled.

use std::collections::HashMap;

use autoeval_types::{EvalCase, FailureTag, JudgeCaseResult, SuiteVersion};

use crate::vector::{Metadata, VectorIndex, VectorItem, NS_EVAL_PROMPTS, NS_FAILURES};

fn tag_list(tags: &[FailureTag]) -> String {
    tags.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn failure_text(result: &JudgeCaseResult) -> String {
    format!(
        "Failure tags: {}. Rationale: {}",
        tag_list(&result.failure_tags),
        result.rationale
    )
}

async fn embed_items(
    index: &dyn VectorIndex,
    entries: Vec<(String, String, Metadata)>,
) -> autoeval_types::Result<Vec<VectorItem>> {
    let mut items = Vec::with_capacity(entries.len());
    for (id, text, metadata) in entries {
        let vector = index.embed(&text).await?;
        items.push(VectorItem {
            id,
            vector,
            metadata,
        });
    }
    Ok(items)
}

/// Index each case's comparison text under `{run_id}#{version}#{eval_id}`.
/// Returns how many were indexed.
pub async fn upsert_eval_prompts(
    index: &dyn VectorIndex,
    run_id: &str,
    version: SuiteVersion,
    cases: &[EvalCase],
) -> usize {
    let entries: Vec<_> = cases
        .iter()
        .filter_map(|case| {
            let text = case.comparison_text();
            if text.is_empty() {
                return None;
            }
            let mut metadata = Metadata::new();
            metadata.insert("eval_id".into(), case.eval_id.clone().into());
            metadata.insert("doc_id".into(), case.doc_id.clone().into());
            metadata.insert("run_id".into(), run_id.into());
            metadata.insert("version".into(), version.as_str().into());
            metadata.insert("difficulty".into(), case.difficulty_tag.as_str().into());
            metadata.insert("category".into(), case.category_tag.clone().into());
            Some((format!("{}#{}#{}", run_id, version, case.eval_id), text, metadata))
        })
        .collect();
    let count = entries.len();
    if count == 0 {
        return 0;
    }

    let outcome = match embed_items(index, entries).await {
        Ok(items) => index.upsert(items, NS_EVAL_PROMPTS).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            tracing::debug!(run_id = %run_id, version = %version, count, "Indexed eval prompts");
            count
        }
        Err(e) => {
            tracing::warn!(run_id = %run_id, version = %version, error = %e, "Prompt indexing failed");
            0
        }
    }
}

/// Embed every failing result into the failures namespace.
/// Returns how many were stored.
pub async fn store_failures(
    index: &dyn VectorIndex,
    run_id: &str,
    version: SuiteVersion,
    cases: &[EvalCase],
    results: &[JudgeCaseResult],
) -> usize {
    let by_id: HashMap<&str, &EvalCase> = cases.iter().map(|c| (c.eval_id.as_str(), c)).collect();
    let entries: Vec<_> = results
        .iter()
        .filter(|r| !r.pass)
        .map(|result| {
            let mut metadata = Metadata::new();
            metadata.insert("eval_id".into(), result.eval_id.clone().into());
            metadata.insert("run_id".into(), run_id.into());
            metadata.insert("version".into(), version.as_str().into());
            metadata.insert(
                "failure_tags".into(),
                serde_json::to_value(&result.failure_tags).unwrap_or_default(),
            );
            metadata.insert("aggregate_score".into(), result.aggregate_score.into());
            if let Some(case) = by_id.get(result.eval_id.as_str()) {
                metadata.insert("difficulty".into(), case.difficulty_tag.as_str().into());
                metadata.insert("category".into(), case.category_tag.clone().into());
            }
            (
                format!("{}#{}#{}#fail", run_id, version, result.eval_id),
                failure_text(result),
                metadata,
            )
        })
        .collect();
    let count = entries.len();
    if count == 0 {
        return 0;
    }

    let outcome = match embed_items(index, entries).await {
        Ok(items) => index.upsert(items, NS_FAILURES).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            tracing::debug!(run_id = %run_id, version = %version, count, "Stored failures");
            count
        }
        Err(e) => {
            tracing::warn!(run_id = %run_id, version = %version, error = %e, "Failure storage failed");
            0
        }
    }
}

/// Recall past failures resembling `tags`, formatted as curriculum hints:
/// `[score=0.87] tag_a, tag_b | difficulty=hard | category=science`.
pub async fn retrieve_failure_exemplars(
    index: &dyn VectorIndex,
    tags: &[FailureTag],
    top_k: usize,
) -> Vec<String> {
    if tags.is_empty() || top_k == 0 {
        return Vec::new();
    }
    let query = format!("Failure tags: {}", tag_list(tags));
    let matches = match index.query_text(&query, NS_FAILURES, top_k).await {
        Ok(matches) => matches,
        Err(e) => {
            tracing::warn!(error = %e, "Failure exemplar lookup failed");
            return Vec::new();
        }
    };

    matches
        .into_iter()
        .map(|m| {
            let tags = m
                .metadata
                .get("failure_tags")
                .and_then(|v| serde_json::from_value::<Vec<FailureTag>>(v.clone()).ok())
                .map(|t| tag_list(&t))
                .unwrap_or_default();
            let field = |key: &str| {
                m.metadata
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string()
            };
            format!(
                "[score={:.2}] {} | difficulty={} | category={}",
                m.score,
                tags,
                field("difficulty"),
                field("category")
            )
        })
        .collect()
}
