//! Shared types, errors, and records for the AutoEval run engine.
//!
//! This crate provides the foundational types used across the other AutoEval crates:
//! - `AutoevalError`: unified error taxonomy
//! - `RunRecord` / `RunStatus` / `RunConfig`: run lifecycle records
//! - `EvalCase`, `JudgeCaseResult`, `SuiteMetrics`: evaluation schemas
//! - `Document`: corpus document records

pub mod document;
pub mod eval;
pub mod run;

pub use document::Document;
pub use eval::{
    CaseExecution, CurriculumOutput, Difficulty, EvalCase, FailureTag, ImprovementPlan,
    JudgeCaseResult, ScoreCard, StructuredSummary, SuiteMetrics, SuiteVersion, PASS_THRESHOLD,
};
pub use run::{RunConfig, RunRecord, RunStatus};

/// Unified error type for all AutoEval subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AutoevalError {
    // === External collaborator errors ===
    #[error("Agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Store {operation} failed: {message}")]
    Store { operation: String, message: String },

    #[error("Vector service {operation} failed: {message}")]
    Vector { operation: String, message: String },

    // === Run control errors ===
    #[error("Token budget exceeded: {attempted} > {cap}")]
    TokenBudgetExceeded { attempted: u64, cap: u64 },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Document {doc_id} unavailable: {message}")]
    DocumentUnavailable { doc_id: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AutoevalError {
    /// Shorthand for an agent error.
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        AutoevalError::Agent {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AutoevalError::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a vector-service error.
    pub fn vector(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AutoevalError::Vector {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for the budget-exhaustion error.
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, AutoevalError::TokenBudgetExceeded { .. })
    }

    /// Maps the error to an HTTP status code for an API front end.
    pub fn http_status(&self) -> u16 {
        match self {
            AutoevalError::RunNotFound { .. } => 404,
            AutoevalError::Config(_) => 400,
            AutoevalError::Agent { .. } | AutoevalError::Vector { .. } => 502,
            AutoevalError::TokenBudgetExceeded { .. } => 429,
            _ => 500,
        }
    }
}

/// A convenience alias for `Result<T, AutoevalError>`.
pub type Result<T> = std::result::Result<T, AutoevalError>;
