//! Generation and judging agents consumed by the pipeline stages.

use std::collections::BTreeMap;

use async_trait::async_trait;

use autoeval_types::{
    CurriculumOutput, Document, EvalCase, JudgeCaseResult, Result, StructuredSummary,
    SuiteMetrics, SuiteVersion,
};

/// The four model-backed agents.
///
/// Every method either returns fully structured output or fails with
/// `AutoevalError::Agent`. Stages still re-validate what comes back, so a
/// lenient implementation gets retried rather than trusted.
#[async_trait]
pub trait EvalAgents: Send + Sync {
    /// Author a suite of `suite_size` cases over `docs`.
    async fn author(
        &self,
        docs: &[Document],
        suite_size: usize,
        version: SuiteVersion,
    ) -> Result<Vec<EvalCase>>;

    async fn summarize(
        &self,
        doc_text: &str,
        constraints: &BTreeMap<String, serde_json::Value>,
    ) -> Result<StructuredSummary>;

    async fn judge(
        &self,
        case: &EvalCase,
        doc_text: &str,
        summary: &StructuredSummary,
    ) -> Result<JudgeCaseResult>;

    /// Revise the suite given the previous iteration's metrics and its worst
    /// cases (the regression core).
    async fn curriculum(
        &self,
        prev_metrics: &SuiteMetrics,
        worst_cases: &[EvalCase],
        docs: &[Document],
        similar_prompt_hints: &[String],
        suite_size: usize,
    ) -> Result<CurriculumOutput>;
}
