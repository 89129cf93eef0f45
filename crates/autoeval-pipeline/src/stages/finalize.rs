//! Terminal stage: decide the run's status and write it with the metrics.

use autoeval_types::{Result, RunStatus};

use crate::records::{update_run_status, StatusUpdate};
use crate::state::{HaltReason, RunState, StatePatch};

use super::StageContext;

const SURFACED_ERRORS: usize = 5;

/// Message recorded when a user-cancelled run has no other errors.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user request.";

/// Terminal status for the accumulated state.
///
/// Cancellation and fatal halts fail the run. Budget exhaustion fails it
/// only when nothing was judged in either iteration.
pub fn final_status(state: &RunState, cancelled: bool) -> RunStatus {
    match &state.halt {
        _ if cancelled => RunStatus::Failed,
        Some(HaltReason::Cancelled) | Some(HaltReason::Fatal(_)) => RunStatus::Failed,
        Some(HaltReason::BudgetExhausted) if state.judged_count() == 0 => RunStatus::Failed,
        Some(HaltReason::BudgetExhausted) => RunStatus::CompletedWithErrors,
        None if state.errors.is_empty() => RunStatus::Completed,
        None => RunStatus::CompletedWithErrors,
    }
}

/// First few errors joined for the run record.
pub fn error_summary(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .take(SURFACED_ERRORS)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; "),
    )
}

pub async fn run(ctx: &StageContext<'_>, state: &RunState) -> Result<StatePatch> {
    let cancelled = ctx.cancel.is_set() || state.halt == Some(HaltReason::Cancelled);
    let status = final_status(state, cancelled);

    let error_message = match error_summary(&state.errors) {
        Some(summary) => Some(summary),
        None if cancelled => Some(CANCELLED_MESSAGE.to_string()),
        None => None,
    };

    let update = StatusUpdate {
        error_message,
        metrics_v1: state.v1.metrics.clone(),
        metrics_v2: state.v2.metrics.clone(),
        tokens_used: Some(state.tokens_used),
    };
    update_run_status(ctx.store(), &state.run_id, status, update).await?;

    tracing::info!(
        run_id = %state.run_id,
        status = %status,
        errors = state.errors.len(),
        tokens_used = state.tokens_used,
        "Run finalized"
    );
    Ok(StatePatch::new().final_status(status))
}
