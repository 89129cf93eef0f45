use autoeval_types::{AutoevalError, Result, SuiteVersion};

use crate::budget::{TokenBudget, AUTHOR_TOKENS};
use crate::memory::upsert_eval_prompts;
use crate::records::{save_suite, SuiteRecord};
use crate::retry::with_retry;
use crate::state::{HaltReason, RunState, StatePatch};

use super::{normalize_eval_ids, StageContext};

/// Author the v1 suite over the loaded corpus.
pub async fn run(
    ctx: &StageContext<'_>,
    state: &RunState,
    budget: &mut TokenBudget,
) -> Result<StatePatch> {
    let agents = ctx.services.agents.as_ref();
    let docs = state.docs.as_slice();
    let suite_size = state.config.suite_size;

    let authored = with_retry(&ctx.retry, "author_v1", move || async move {
        let cases = agents.author(docs, suite_size, SuiteVersion::V1).await?;
        if cases.is_empty() {
            return Err(AutoevalError::agent("author", "returned an empty suite"));
        }
        Ok(cases)
    })
    .await;

    let cases = match authored {
        Ok(cases) => cases,
        Err(e) => {
            tracing::error!(run_id = %state.run_id, error = %e, "Authoring failed");
            let msg = format!("author_v1: {e}");
            return Ok(StatePatch::new()
                .error(msg.clone())
                .halt(HaltReason::Fatal(msg)));
        }
    };

    if let Err(e) = budget.add(AUTHOR_TOKENS) {
        tracing::warn!(run_id = %state.run_id, used = budget.used(), "Budget exhausted by authoring");
        return Ok(StatePatch::new()
            .error(format!("token_cap_exceeded: {e}"))
            .halt(HaltReason::BudgetExhausted));
    }

    let (mut cases, renumbered) = normalize_eval_ids(SuiteVersion::V1, cases);
    if renumbered {
        tracing::warn!(run_id = %state.run_id, "Author returned malformed or duplicate ids, renumbered suite");
    }
    cases.truncate(suite_size);

    save_suite(ctx.store(), &SuiteRecord::new(&state.run_id, SuiteVersion::V1, cases.clone())).await?;
    if let Some(index) = ctx.vectors() {
        let indexed = upsert_eval_prompts(index, &state.run_id, SuiteVersion::V1, &cases).await;
        tracing::debug!(run_id = %state.run_id, indexed, "Indexed v1 prompts");
    }

    tracing::info!(run_id = %state.run_id, cases = cases.len(), "Authored v1 suite");
    Ok(StatePatch::new()
        .suite(SuiteVersion::V1, cases)
        .tokens_used(budget.used()))
}
