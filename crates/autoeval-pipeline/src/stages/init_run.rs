use autoeval_types::{Result, SuiteVersion};

use crate::budget::TokenBudget;
use crate::state::{HaltReason, RunState, StatePatch};

use super::StageContext;

/// Reset per-iteration state and check the run config before any agent call.
/// Accumulated errors are kept.
pub async fn run(
    _ctx: &StageContext<'_>,
    state: &RunState,
    budget: &mut TokenBudget,
) -> Result<StatePatch> {
    if state.config.suite_size == 0 {
        let msg = "init_run: suite_size must be at least 1";
        return Ok(StatePatch::new()
            .error(msg)
            .halt(HaltReason::Fatal(msg.to_string())));
    }

    tracing::debug!(
        run_id = %state.run_id,
        docs = state.docs.len(),
        cap = budget.cap(),
        "Run initialised"
    );
    Ok(StatePatch::new()
        .suite(SuiteVersion::V1, Vec::new())
        .suite(SuiteVersion::V2, Vec::new())
        .executions(SuiteVersion::V1, Vec::new())
        .executions(SuiteVersion::V2, Vec::new())
        .judge_results(SuiteVersion::V1, Vec::new())
        .judge_results(SuiteVersion::V2, Vec::new())
        .failure_exemplars(Vec::new())
        .tokens_used(budget.used()))
}
