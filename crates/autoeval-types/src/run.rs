//! Run lifecycle records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eval::SuiteMetrics;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    /// `true` once a run can no longer change status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

/// Immutable parameters for a single run, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub seed: u64,
    pub corpus_size: usize,
    pub suite_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            corpus_size: 150,
            suite_size: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// Persisted run entity. Keyed by `run_id` in the runs table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub config: RunConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metrics_v1: Option<SuiteMetrics>,
    #[serde(default)]
    pub metrics_v2: Option<SuiteMetrics>,
    /// Tokens accounted against the run budget so far.
    #[serde(default)]
    pub tokens_used: u64,
    /// Last stage the pipeline reported.
    #[serde(default)]
    pub current_stage: Option<String>,
}

impl RunRecord {
    /// A freshly enqueued run.
    pub fn create(run_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Queued,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            metrics_v1: None,
            metrics_v2: None,
            tokens_used: 0,
            current_stage: None,
        }
    }
}
