//! Typed persistence for runs, suites, results, and documents.
//!
//! Key layout:
//! - runs: `pk = run_id`
//! - suites: `pk = run_id`, `sk = v1 | v2`
//! - results: `pk = suite_id`, `sk = eval_id`
//! - documents: `pk = doc_id`

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use autoeval_types::{
    AutoevalError, Document, EvalCase, JudgeCaseResult, Result, RunRecord, RunStatus,
    SuiteMetrics, SuiteVersion,
};

use crate::store::{RecordStore, StoreKey, Table};

/// Message written onto runs found `running` at startup.
pub const ORPHANED_RUN_MESSAGE: &str = "Process restarted while run was in progress.";

fn decode<T: DeserializeOwned>(table: Table, item: serde_json::Value) -> Result<T> {
    serde_json::from_value(item)
        .map_err(|e| AutoevalError::store("decode", format!("{}: {}", table.name(), e)))
}

fn decode_all<T: DeserializeOwned>(table: Table, items: Vec<serde_json::Value>) -> Result<Vec<T>> {
    items.into_iter().map(|item| decode(table, item)).collect()
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Optional fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error_message: Option<String>,
    pub metrics_v1: Option<SuiteMetrics>,
    pub metrics_v2: Option<SuiteMetrics>,
    pub tokens_used: Option<u64>,
}

impl StatusUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

pub async fn save_run(store: &dyn RecordStore, run: &RunRecord) -> Result<()> {
    store
        .put(Table::Runs, StoreKey::new(&run.run_id), serde_json::to_value(run)?)
        .await
}

pub async fn get_run(store: &dyn RecordStore, run_id: &str) -> Result<Option<RunRecord>> {
    match store.get(Table::Runs, &StoreKey::new(run_id)).await? {
        Some(item) => decode(Table::Runs, item).map(Some),
        None => Ok(None),
    }
}

async fn require_run(store: &dyn RecordStore, run_id: &str) -> Result<RunRecord> {
    get_run(store, run_id)
        .await?
        .ok_or_else(|| AutoevalError::RunNotFound {
            run_id: run_id.to_string(),
        })
}

/// Set a run's status. Entering `running` stamps `started_at`; entering a
/// terminal status stamps `completed_at`.
pub async fn update_run_status(
    store: &dyn RecordStore,
    run_id: &str,
    status: RunStatus,
    update: StatusUpdate,
) -> Result<RunRecord> {
    let mut run = require_run(store, run_id).await?;
    let now: DateTime<Utc> = Utc::now();
    run.status = status;
    if status == RunStatus::Running {
        run.started_at = Some(now);
    }
    if status.is_terminal() {
        run.completed_at = Some(now);
    }
    if update.error_message.is_some() {
        run.error_message = update.error_message;
    }
    if update.metrics_v1.is_some() {
        run.metrics_v1 = update.metrics_v1;
    }
    if update.metrics_v2.is_some() {
        run.metrics_v2 = update.metrics_v2;
    }
    if let Some(tokens) = update.tokens_used {
        run.tokens_used = tokens;
    }
    save_run(store, &run).await?;
    tracing::debug!(run_id = %run_id, status = %status, "Run status updated");
    Ok(run)
}

/// Surface the budget counter and current stage into the run record.
pub async fn record_progress(
    store: &dyn RecordStore,
    run_id: &str,
    tokens_used: u64,
    stage: &str,
) -> Result<()> {
    let mut run = require_run(store, run_id).await?;
    run.tokens_used = tokens_used;
    run.current_stage = Some(stage.to_string());
    save_run(store, &run).await
}

/// All runs, newest first.
pub async fn list_runs(store: &dyn RecordStore) -> Result<Vec<RunRecord>> {
    let mut runs: Vec<RunRecord> = decode_all(Table::Runs, store.scan(Table::Runs).await?)?;
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(runs)
}

/// Rewrite every run still marked `running` to `failed`. Returns their ids.
pub async fn mark_stale_runs_failed(store: &dyn RecordStore) -> Result<Vec<String>> {
    let mut recovered = Vec::new();
    for run in list_runs(store).await? {
        if run.status != RunStatus::Running {
            continue;
        }
        update_run_status(
            store,
            &run.run_id,
            RunStatus::Failed,
            StatusUpdate::error(ORPHANED_RUN_MESSAGE),
        )
        .await?;
        tracing::warn!(run_id = %run.run_id, "Marked orphaned run as failed");
        recovered.push(run.run_id);
    }
    Ok(recovered)
}

// ---------------------------------------------------------------------------
// Suites and results
// ---------------------------------------------------------------------------

/// Snapshot of one suite iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRecord {
    pub run_id: String,
    pub version: SuiteVersion,
    /// Format: `{run_id}#v{n}`.
    pub suite_id: String,
    pub cases: Vec<EvalCase>,
    #[serde(default)]
    pub metrics: Option<SuiteMetrics>,
    pub created_at: DateTime<Utc>,
}

impl SuiteRecord {
    pub fn new(run_id: &str, version: SuiteVersion, cases: Vec<EvalCase>) -> Self {
        Self {
            run_id: run_id.to_string(),
            version,
            suite_id: version.suite_id(run_id),
            cases,
            metrics: None,
            created_at: Utc::now(),
        }
    }
}

pub async fn save_suite(store: &dyn RecordStore, suite: &SuiteRecord) -> Result<()> {
    store
        .put(
            Table::Suites,
            StoreKey::with_sort(&suite.run_id, suite.version.as_str()),
            serde_json::to_value(suite)?,
        )
        .await
}

/// Suites of a run, v1 before v2.
pub async fn list_suites_for_run(store: &dyn RecordStore, run_id: &str) -> Result<Vec<SuiteRecord>> {
    decode_all(Table::Suites, store.query(Table::Suites, run_id, Some("v")).await?)
}

pub async fn save_results_batch(
    store: &dyn RecordStore,
    suite_id: &str,
    results: &[JudgeCaseResult],
) -> Result<()> {
    for result in results {
        store
            .put(
                Table::Results,
                StoreKey::with_sort(suite_id, &result.eval_id),
                serde_json::to_value(result)?,
            )
            .await?;
    }
    Ok(())
}

/// Results of a suite, ordered by eval id.
pub async fn list_results_for_suite(
    store: &dyn RecordStore,
    suite_id: &str,
) -> Result<Vec<JudgeCaseResult>> {
    decode_all(Table::Results, store.query(Table::Results, suite_id, None).await?)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

pub async fn save_document(store: &dyn RecordStore, doc: &Document) -> Result<()> {
    store
        .put(Table::Documents, StoreKey::new(&doc.doc_id), serde_json::to_value(doc)?)
        .await
}

/// Every document, ordered by `doc_id`.
pub async fn list_documents(store: &dyn RecordStore) -> Result<Vec<Document>> {
    let mut docs: Vec<Document> = decode_all(Table::Documents, store.scan(Table::Documents).await?)?;
    docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    Ok(docs)
}

/// Resolve a document's body: inline text if present, else `content_path`
/// under `data_dir`.
pub async fn load_document_text(doc: &Document, data_dir: &Path) -> Result<String> {
    if !doc.text.is_empty() {
        return Ok(doc.text.clone());
    }
    if doc.content_path.is_empty() {
        return Err(AutoevalError::DocumentUnavailable {
            doc_id: doc.doc_id.clone(),
            message: "no inline text and no content_path".into(),
        });
    }
    let path = data_dir.join(&doc.content_path);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AutoevalError::DocumentUnavailable {
            doc_id: doc.doc_id.clone(),
            message: format!("{}: {}", path.display(), e),
        })
}
