//! Suite-level rollup of judged results.

use std::collections::{BTreeMap, HashSet};

use autoeval_types::eval::round4;
use autoeval_types::{EvalCase, FailureTag, JudgeCaseResult, ScoreCard, SuiteMetrics};

const TOP_FAILURE_MODES: usize = 5;

/// Size of the regression core: `max(1, round(0.4 * suite_size))`.
pub fn worst_example_count(suite_size: usize) -> usize {
    ((0.4 * suite_size as f64).round() as usize).max(1)
}

/// Reduce a suite's judged results into [`SuiteMetrics`].
///
/// `results` may cover fewer cases than `cases`. With no results at all the
/// all-zero record is returned.
pub fn compute_suite_metrics(
    suite_id: &str,
    cases: &[EvalCase],
    results: &[JudgeCaseResult],
    suite_size: usize,
) -> SuiteMetrics {
    if results.is_empty() {
        return SuiteMetrics::zero(suite_id);
    }
    let total = results.len() as f64;

    let mut sums = [0u32; 4];
    for result in results {
        for (sum, value) in sums.iter_mut().zip(result.scores.values()) {
            *sum += u32::from(value);
        }
    }
    let avg_scores_by_dimension: BTreeMap<String, f64> = ScoreCard::DIMENSIONS
        .iter()
        .zip(sums)
        .map(|(name, sum)| (name.to_string(), round4(f64::from(sum) / total)))
        .collect();

    let aggregate_avg = round4(results.iter().map(|r| r.aggregate_score).sum::<f64>() / total);
    let passed = results.iter().filter(|r| r.pass).count() as f64;
    let failed = total - passed;

    SuiteMetrics {
        suite_id: suite_id.to_string(),
        avg_scores_by_dimension,
        aggregate_avg,
        pass_rate: round4(passed / total),
        failure_detection_rate: round4(failed / total),
        top_failure_modes: top_failure_modes(results),
        worst_examples: worst_examples(cases, results, worst_example_count(suite_size)),
    }
}

/// Most frequent tags among failed results; ties keep first-seen order.
fn top_failure_modes(results: &[JudgeCaseResult]) -> Vec<FailureTag> {
    let mut counts: Vec<(FailureTag, usize)> = Vec::new();
    for result in results.iter().filter(|r| !r.pass) {
        for tag in &result.failure_tags {
            match counts.iter_mut().find(|(t, _)| t == tag) {
                Some((_, n)) => *n += 1,
                None => counts.push((*tag, 1)),
            }
        }
    }
    // Stable, so equal counts stay in encounter order.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(TOP_FAILURE_MODES)
        .map(|(tag, _)| tag)
        .collect()
}

/// The `n` lowest-scoring judged cases, returned in suite order. Ties on
/// score go to the earlier result.
fn worst_examples(cases: &[EvalCase], results: &[JudgeCaseResult], n: usize) -> Vec<EvalCase> {
    let mut ranked: Vec<&JudgeCaseResult> = results.iter().collect();
    ranked.sort_by(|a, b| a.aggregate_score.total_cmp(&b.aggregate_score));
    let worst: HashSet<&str> = ranked.iter().take(n).map(|r| r.eval_id.as_str()).collect();
    cases
        .iter()
        .filter(|c| worst.contains(c.eval_id.as_str()))
        .cloned()
        .collect()
}
