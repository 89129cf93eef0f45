//! Accumulated run state and the typed patches stages return.
//!
//! A stage never mutates [`RunState`] directly: it returns a [`StatePatch`],
//! an ordered list of [`StateUpdate`]s the engine applies once the stage is
//! done. Each update replaces its field (last writer wins), except `Errors`
//! which appends.

use autoeval_types::{
    CaseExecution, Document, EvalCase, ImprovementPlan, JudgeCaseResult, RunConfig, RunStatus,
    SuiteMetrics, SuiteVersion,
};

/// Why a stage asked the engine to skip ahead to finalize.
#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    /// Cancellation was requested for the run.
    Cancelled,
    /// The token budget would have been exceeded.
    BudgetExhausted,
    /// A required input was missing or a stage could not produce its output.
    Fatal(String),
}

/// Everything one suite iteration produces.
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    pub suite: Vec<EvalCase>,
    pub executions: Vec<CaseExecution>,
    pub judge_results: Vec<JudgeCaseResult>,
    pub metrics: Option<SuiteMetrics>,
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub config: RunConfig,
    pub docs: Vec<Document>,
    pub v1: IterationState,
    pub v2: IterationState,
    pub failure_exemplars: Vec<String>,
    pub improvement_plan: Option<ImprovementPlan>,
    pub tokens_used: u64,
    pub errors: Vec<String>,
    pub halt: Option<HaltReason>,
    pub final_status: Option<RunStatus>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            docs: Vec::new(),
            v1: IterationState::default(),
            v2: IterationState::default(),
            failure_exemplars: Vec::new(),
            improvement_plan: None,
            tokens_used: 0,
            errors: Vec::new(),
            halt: None,
            final_status: None,
        }
    }

    pub fn iteration(&self, version: SuiteVersion) -> &IterationState {
        match version {
            SuiteVersion::V1 => &self.v1,
            SuiteVersion::V2 => &self.v2,
        }
    }

    fn iteration_mut(&mut self, version: SuiteVersion) -> &mut IterationState {
        match version {
            SuiteVersion::V1 => &mut self.v1,
            SuiteVersion::V2 => &mut self.v2,
        }
    }

    /// Judged cases across both iterations.
    pub fn judged_count(&self) -> usize {
        self.v1.judge_results.len() + self.v2.judge_results.len()
    }

    pub fn document(&self, doc_id: &str) -> Option<&Document> {
        self.docs.iter().find(|d| d.doc_id == doc_id)
    }

    /// Apply a stage's patch, in order.
    pub fn apply(&mut self, patch: StatePatch) {
        for update in patch.updates {
            match update {
                StateUpdate::Docs(docs) => self.docs = docs,
                StateUpdate::Suite(v, suite) => self.iteration_mut(v).suite = suite,
                StateUpdate::Executions(v, executions) => {
                    self.iteration_mut(v).executions = executions
                }
                StateUpdate::JudgeResults(v, results) => self.iteration_mut(v).judge_results = results,
                StateUpdate::Metrics(v, metrics) => self.iteration_mut(v).metrics = Some(metrics),
                StateUpdate::FailureExemplars(hints) => self.failure_exemplars = hints,
                StateUpdate::ImprovementPlan(plan) => self.improvement_plan = Some(plan),
                StateUpdate::TokensUsed(tokens) => self.tokens_used = tokens,
                StateUpdate::Errors(mut errors) => self.errors.append(&mut errors),
                StateUpdate::Halt(reason) => self.halt = Some(reason),
                StateUpdate::FinalStatus(status) => self.final_status = Some(status),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum StateUpdate {
    Docs(Vec<Document>),
    Suite(SuiteVersion, Vec<EvalCase>),
    Executions(SuiteVersion, Vec<CaseExecution>),
    JudgeResults(SuiteVersion, Vec<JudgeCaseResult>),
    Metrics(SuiteVersion, SuiteMetrics),
    FailureExemplars(Vec<String>),
    ImprovementPlan(ImprovementPlan),
    TokensUsed(u64),
    Errors(Vec<String>),
    Halt(HaltReason),
    FinalStatus(RunStatus),
}

/// Ordered updates produced by one stage.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    updates: Vec<StateUpdate>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> &[StateUpdate] {
        &self.updates
    }

    pub fn push(mut self, update: StateUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn docs(self, docs: Vec<Document>) -> Self {
        self.push(StateUpdate::Docs(docs))
    }

    pub fn suite(self, version: SuiteVersion, suite: Vec<EvalCase>) -> Self {
        self.push(StateUpdate::Suite(version, suite))
    }

    pub fn executions(self, version: SuiteVersion, executions: Vec<CaseExecution>) -> Self {
        self.push(StateUpdate::Executions(version, executions))
    }

    pub fn judge_results(self, version: SuiteVersion, results: Vec<JudgeCaseResult>) -> Self {
        self.push(StateUpdate::JudgeResults(version, results))
    }

    pub fn metrics(self, version: SuiteVersion, metrics: SuiteMetrics) -> Self {
        self.push(StateUpdate::Metrics(version, metrics))
    }

    pub fn failure_exemplars(self, hints: Vec<String>) -> Self {
        self.push(StateUpdate::FailureExemplars(hints))
    }

    pub fn improvement_plan(self, plan: ImprovementPlan) -> Self {
        self.push(StateUpdate::ImprovementPlan(plan))
    }

    pub fn tokens_used(self, tokens: u64) -> Self {
        self.push(StateUpdate::TokensUsed(tokens))
    }

    /// Append errors; a no-op for an empty list.
    pub fn errors(self, errors: Vec<String>) -> Self {
        if errors.is_empty() {
            return self;
        }
        self.push(StateUpdate::Errors(errors))
    }

    pub fn error(self, error: impl Into<String>) -> Self {
        self.push(StateUpdate::Errors(vec![error.into()]))
    }

    pub fn halt(self, reason: HaltReason) -> Self {
        self.push(StateUpdate::Halt(reason))
    }

    pub fn final_status(self, status: RunStatus) -> Self {
        self.push(StateUpdate::FinalStatus(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_fields_persist() {
        let mut state = RunState::new("run-1", RunConfig::default());
        state.apply(StatePatch::new().docs(vec![Document::inline("d1", "text")]));
        state.apply(StatePatch::new().tokens_used(6_000));
        assert_eq!(state.docs.len(), 1);
        assert_eq!(state.tokens_used, 6_000);
        assert!(state.halt.is_none());
    }

    #[test]
    fn last_writer_wins_within_and_across_patches() {
        let mut state = RunState::new("run-1", RunConfig::default());
        state.apply(StatePatch::new().tokens_used(10).tokens_used(20));
        assert_eq!(state.tokens_used, 20);
        state.apply(StatePatch::new().tokens_used(5));
        assert_eq!(state.tokens_used, 5);
    }

    #[test]
    fn errors_append() {
        let mut state = RunState::new("run-1", RunConfig::default());
        state.apply(StatePatch::new().error("first"));
        state.apply(StatePatch::new().errors(vec!["second".into(), "third".into()]));
        state.apply(StatePatch::new().errors(vec![]));
        assert_eq!(state.errors, vec!["first", "second", "third"]);
    }

    #[test]
    fn iterations_are_independent() {
        let mut state = RunState::new("run-1", RunConfig::default());
        state.apply(
            StatePatch::new()
                .metrics(SuiteVersion::V1, SuiteMetrics::zero("run-1#v1"))
                .halt(HaltReason::BudgetExhausted),
        );
        assert!(state.iteration(SuiteVersion::V1).metrics.is_some());
        assert!(state.iteration(SuiteVersion::V2).metrics.is_none());
        assert_eq!(state.halt, Some(HaltReason::BudgetExhausted));
        assert_eq!(state.judged_count(), 0);
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut state = RunState::new("run-1", RunConfig::default());
        let patch = StatePatch::new().errors(vec![]);
        assert!(patch.is_empty());
        state.apply(patch);
        assert!(state.errors.is_empty());
    }
}
