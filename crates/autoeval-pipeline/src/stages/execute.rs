//! Summarize every case of a suite under the worker limit.

use std::sync::Arc;

use autoeval_types::{AutoevalError, CaseExecution, EvalCase, Result, SuiteVersion};

use crate::budget::{TokenBudget, SUMMARIZER_OVERHEAD_TOKENS};
use crate::executor::{run_bounded, JobOutput};
use crate::retry::with_retry;
use crate::state::{HaltReason, RunState, StatePatch};

use super::StageContext;

pub async fn run(
    ctx: &StageContext<'_>,
    state: &RunState,
    budget: &mut TokenBudget,
    version: SuiteVersion,
) -> Result<StatePatch> {
    let suite = state.iteration(version).suite.clone();
    let total = suite.len();

    let job = |case: EvalCase| {
        let agents = Arc::clone(&ctx.services.agents);
        let policy = ctx.retry.clone();
        let doc = state
            .document(&case.doc_id)
            .map(|d| (d.text.clone(), d.token_count));
        async move {
            let Some((text, doc_tokens)) = doc else {
                return missing_document(&case);
            };
            let label = format!("summarize/{}", case.eval_id);
            let agents = agents.as_ref();
            let text = text.as_str();
            let constraints = &case.constraints;
            let summarized = with_retry(&policy, &label, move || async move {
                let summary = agents.summarize(text, constraints).await?;
                summary
                    .validate()
                    .map_err(|m| AutoevalError::agent("summarizer", format!("invalid summary: {m}")))?;
                Ok(summary)
            })
            .await;

            match summarized {
                Ok(summary) => {
                    let tokens = SUMMARIZER_OVERHEAD_TOKENS + doc_tokens;
                    let execution = CaseExecution {
                        eval_id: case.eval_id.clone(),
                        doc_id: case.doc_id.clone(),
                        summary: Some(summary),
                        error: None,
                        tokens_used: tokens,
                    };
                    JobOutput::ok(execution, tokens)
                }
                Err(e) => {
                    let error = format!("{}: {}", case.eval_id, e);
                    JobOutput {
                        value: Some(CaseExecution::failed(&case, error.clone())),
                        error: Some(error),
                        tokens: 0,
                    }
                }
            }
        }
    };

    let report = run_bounded(suite, ctx.settings().run_workers, ctx.cancel, budget, job).await;

    let succeeded = report
        .completed
        .iter()
        .filter(|execution| execution.summary.is_some())
        .count();
    tracing::info!(
        run_id = %state.run_id,
        version = %version.as_str(),
        total,
        succeeded,
        failed = report.errors.len(),
        skipped = report.skipped,
        abandoned = report.abandoned,
        "Execution finished"
    );

    let mut patch = StatePatch::new()
        .executions(version, report.completed)
        .errors(report.errors)
        .tokens_used(budget.used());
    if report.budget_exceeded {
        patch = patch.halt(HaltReason::BudgetExhausted);
    }
    Ok(patch)
}

fn missing_document(case: &EvalCase) -> JobOutput<CaseExecution> {
    let error = format!("{}: document {} is not in the loaded corpus", case.eval_id, case.doc_id);
    JobOutput {
        value: Some(CaseExecution::failed(case, error.clone())),
        error: Some(error),
        tokens: 0,
    }
}
