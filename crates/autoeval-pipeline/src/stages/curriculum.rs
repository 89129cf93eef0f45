use autoeval_types::{AutoevalError, Result, SuiteVersion};

use crate::budget::{TokenBudget, CURRICULUM_TOKENS};
use crate::dedup::filter_duplicates;
use crate::memory::upsert_eval_prompts;
use crate::records::{save_suite, SuiteRecord};
use crate::retry::with_retry;
use crate::state::{HaltReason, RunState, StatePatch};

use super::{normalize_eval_ids, StageContext};

/// Curate the v2 suite from v1's metrics, its worst cases and any recalled
/// failure exemplars, then drop near-duplicates of already indexed prompts.
pub async fn run(
    ctx: &StageContext<'_>,
    state: &RunState,
    budget: &mut TokenBudget,
) -> Result<StatePatch> {
    let Some(metrics_v1) = state.v1.metrics.as_ref() else {
        let msg = "curriculum_v2: metrics_v1 is missing, cannot generate v2 suite";
        tracing::error!(run_id = %state.run_id, "{}", msg);
        return Ok(StatePatch::new()
            .error(msg)
            .halt(HaltReason::Fatal(msg.to_string())));
    };

    let agents = ctx.services.agents.as_ref();
    let worst = metrics_v1.worst_examples.as_slice();
    let docs = state.docs.as_slice();
    let hints = state.failure_exemplars.as_slice();
    let suite_size = state.config.suite_size;

    let curated = with_retry(&ctx.retry, "curriculum_v2", move || async move {
        let output = agents
            .curriculum(metrics_v1, worst, docs, hints, suite_size)
            .await?;
        if output.next_suite.is_empty() {
            return Err(AutoevalError::agent("curriculum", "returned an empty suite"));
        }
        Ok(output)
    })
    .await;

    let output = match curated {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(run_id = %state.run_id, error = %e, "Curriculum failed");
            let msg = format!("curriculum_v2: {e}");
            return Ok(StatePatch::new()
                .error(msg.clone())
                .halt(HaltReason::Fatal(msg)));
        }
    };

    if let Err(e) = budget.add(CURRICULUM_TOKENS) {
        tracing::warn!(run_id = %state.run_id, used = budget.used(), "Budget exhausted by curriculum");
        return Ok(StatePatch::new()
            .error(format!("token_cap_exceeded: {e}"))
            .halt(HaltReason::BudgetExhausted));
    }

    let (candidates, renumbered) = normalize_eval_ids(SuiteVersion::V2, output.next_suite);
    if renumbered {
        tracing::warn!(run_id = %state.run_id, "Curriculum returned malformed or duplicate ids, renumbered suite");
    }

    let outcome = filter_duplicates(ctx.vectors(), candidates, ctx.settings().dedup_threshold).await;
    let mut suite = outcome.accepted;
    suite.truncate(suite_size);

    let mut plan = output.improvement_plan;
    plan.dedup_rejections = outcome.rejected.len();

    if let Some(index) = ctx.vectors() {
        let indexed = upsert_eval_prompts(index, &state.run_id, SuiteVersion::V2, &suite).await;
        tracing::debug!(run_id = %state.run_id, indexed, "Indexed v2 prompts");
    }
    save_suite(ctx.store(), &SuiteRecord::new(&state.run_id, SuiteVersion::V2, suite.clone())).await?;

    tracing::info!(
        run_id = %state.run_id,
        cases = suite.len(),
        retained = plan.retained_count,
        replaced = plan.replaced_count,
        dedup_rejected = plan.dedup_rejections,
        "Curated v2 suite"
    );
    Ok(StatePatch::new()
        .suite(SuiteVersion::V2, suite)
        .improvement_plan(plan)
        .tokens_used(budget.used()))
}
