//! Bounded concurrent fan-out with completion-order fan-in.
//!
//! Every job is spawned up front, but a counting gate admits at most `limit`
//! of them into their external call at once. The fan-in loop is the only
//! place that touches the token budget or the error log.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::budget::TokenBudget;
use crate::cancel::CancelFlag;

/// What a single job hands back to the fan-in loop.
#[derive(Debug)]
pub struct JobOutput<T> {
    pub value: Option<T>,
    pub error: Option<String>,
    /// Token estimate to charge against the run budget.
    pub tokens: u64,
}

impl<T> JobOutput<T> {
    pub fn ok(value: T, tokens: u64) -> Self {
        Self {
            value: Some(value),
            error: None,
            tokens,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
            tokens: 0,
        }
    }
}

enum Completion<T> {
    Finished(JobOutput<T>),
    Skipped,
}

/// Partial or complete result of one fan-out.
///
/// `completed` is in completion order; correlate by id, never by position.
#[derive(Debug)]
pub struct FanInReport<T> {
    pub completed: Vec<T>,
    pub errors: Vec<String>,
    /// Jobs that saw cancellation before their external call.
    pub skipped: usize,
    /// Jobs still pending or in flight when the fan-in stopped early.
    pub abandoned: usize,
    pub budget_exceeded: bool,
    pub cancelled: bool,
}

impl<T> Default for FanInReport<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            errors: Vec::new(),
            skipped: 0,
            abandoned: 0,
            budget_exceeded: false,
            cancelled: false,
        }
    }
}

/// Run `job` over every item with at most `limit` external calls in flight.
///
/// After each completion the job's error is logged and its token estimate is
/// charged. A charge that would exceed the budget drops that job's value and
/// stops the fan-in, as does observing `cancel`. On stop, jobs that have not
/// reached their external call are skipped and in-flight ones are left to
/// finish in the background with their results discarded.
pub async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancelFlag,
    budget: &mut TokenBudget,
    job: F,
) -> FanInReport<T>
where
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = JobOutput<T>> + Send + 'static,
{
    let gate = Arc::new(Semaphore::new(limit.max(1)));
    let mut join_set = JoinSet::new();

    for item in items {
        let gate = gate.clone();
        let cancel = cancel.clone();
        let work = job(item);
        join_set.spawn(async move {
            let _permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Completion::Skipped,
            };
            if cancel.is_set() {
                return Completion::Skipped;
            }
            Completion::Finished(work.await)
        });
    }

    let mut report = FanInReport::default();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Completion::Skipped) => report.skipped += 1,
            Ok(Completion::Finished(output)) => {
                if let Some(error) = output.error {
                    report.errors.push(error);
                }
                match budget.add(output.tokens) {
                    Ok(()) => {
                        if let Some(value) = output.value {
                            report.completed.push(value);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            used = budget.used(),
                            cap = budget.cap(),
                            "Token budget exhausted, stopping fan-out"
                        );
                        report.errors.push(format!("token_cap_exceeded: {e}"));
                        report.budget_exceeded = true;
                    }
                }
            }
            Err(join_err) => report.errors.push(format!("job task failed: {join_err}")),
        }

        if report.budget_exceeded || cancel.is_set() {
            report.cancelled = cancel.is_set();
            gate.close();
            report.abandoned = join_set.len();
            join_set.detach_all();
            break;
        }
    }

    report
}
