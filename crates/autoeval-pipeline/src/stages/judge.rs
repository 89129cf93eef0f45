//! Score every successful execution, then roll the suite up into metrics.

use std::collections::HashMap;
use std::sync::Arc;

use autoeval_types::{
    AutoevalError, EvalCase, JudgeCaseResult, Result, StructuredSummary, SuiteVersion,
};

use crate::budget::{TokenBudget, JUDGE_OVERHEAD_TOKENS};
use crate::executor::{run_bounded, JobOutput};
use crate::memory::{retrieve_failure_exemplars, store_failures};
use crate::metrics::compute_suite_metrics;
use crate::records::{save_results_batch, save_suite, SuiteRecord};
use crate::retry::with_retry;
use crate::state::{HaltReason, RunState, StatePatch};

use super::StageContext;

pub async fn run(
    ctx: &StageContext<'_>,
    state: &RunState,
    budget: &mut TokenBudget,
    version: SuiteVersion,
) -> Result<StatePatch> {
    let iteration = state.iteration(version);
    let cases: HashMap<&str, &EvalCase> = iteration
        .suite
        .iter()
        .map(|case| (case.eval_id.as_str(), case))
        .collect();

    let mut errors = Vec::new();
    let mut items: Vec<(EvalCase, StructuredSummary)> = Vec::new();
    for execution in &iteration.executions {
        let Some(summary) = &execution.summary else {
            continue;
        };
        match cases.get(execution.eval_id.as_str()) {
            Some(case) => items.push(((*case).clone(), summary.clone())),
            None => errors.push(format!(
                "judge_{}/{}: execution has no matching case",
                version.as_str(),
                execution.eval_id
            )),
        }
    }
    let total = items.len();

    let job = |(case, summary): (EvalCase, StructuredSummary)| {
        let agents = Arc::clone(&ctx.services.agents);
        let policy = ctx.retry.clone();
        let doc = state
            .document(&case.doc_id)
            .map(|d| (d.text.clone(), d.token_count));
        async move {
            let Some((text, doc_tokens)) = doc else {
                return JobOutput::failed(format!(
                    "judge_{}/{}: document {} is not in the loaded corpus",
                    version.as_str(),
                    case.eval_id,
                    case.doc_id
                ));
            };
            let label = format!("judge/{}", case.eval_id);
            let agents = agents.as_ref();
            let text = text.as_str();
            let case_ref = &case;
            let summary = &summary;
            let judged = with_retry(&policy, &label, move || async move {
                let result = agents.judge(case_ref, text, summary).await?;
                result
                    .validate()
                    .map_err(|m| AutoevalError::agent("judge", format!("invalid verdict: {m}")))?;
                Ok(result)
            })
            .await;

            match judged {
                Ok(mut result) => {
                    result.eval_id = case.eval_id.clone();
                    if result.enforce_pass_rule() {
                        tracing::debug!(
                            eval_id = %case.eval_id,
                            aggregate = result.aggregate_score,
                            pass = result.pass,
                            "Judge verdict recomputed from scores"
                        );
                    }
                    JobOutput::ok(result, JUDGE_OVERHEAD_TOKENS + doc_tokens)
                }
                Err(e) => JobOutput::failed(format!("judge_{}/{}: {}", version.as_str(), case.eval_id, e)),
            }
        }
    };

    let report = run_bounded(items, ctx.settings().run_workers, ctx.cancel, budget, job).await;
    errors.extend(report.errors);
    let results: Vec<JudgeCaseResult> = report.completed;

    let metrics = compute_suite_metrics(
        &version.suite_id(&state.run_id),
        &iteration.suite,
        &results,
        state.config.suite_size,
    );
    tracing::info!(
        run_id = %state.run_id,
        version = %version.as_str(),
        total,
        judged = results.len(),
        aggregate_avg = metrics.aggregate_avg,
        pass_rate = metrics.pass_rate,
        "Judging finished"
    );

    let mut suite = SuiteRecord::new(&state.run_id, version, iteration.suite.clone());
    save_results_batch(ctx.store(), &suite.suite_id, &results).await?;
    suite.metrics = Some(metrics.clone());
    save_suite(ctx.store(), &suite).await?;

    let mut exemplars = None;
    if let Some(index) = ctx.vectors() {
        let stored = store_failures(index, &state.run_id, version, &iteration.suite, &results).await;
        tracing::debug!(run_id = %state.run_id, stored, "Stored failures");
        if version == SuiteVersion::V1 {
            exemplars = Some(
                retrieve_failure_exemplars(
                    index,
                    &metrics.top_failure_modes,
                    ctx.settings().failure_exemplar_top_k,
                )
                .await,
            );
        }
    }

    let mut patch = StatePatch::new()
        .judge_results(version, results)
        .metrics(version, metrics)
        .errors(errors)
        .tokens_used(budget.used());
    if let Some(hints) = exemplars {
        patch = patch.failure_exemplars(hints);
    }
    if report.budget_exceeded {
        patch = patch.halt(HaltReason::BudgetExhausted);
    }
    Ok(patch)
}
