//! End-to-end tests for the run engine.
//!
//! Each test drives complete runs through `RunService` with an in-memory
//! store and deterministic agents: start -> queue -> stages -> finalize ->
//! inspect the persisted records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use autoeval_pipeline::records::{get_run, save_document, save_run, ORPHANED_RUN_MESSAGE};
use autoeval_pipeline::{
    DryRunAgents, EvalAgents, EventEmitter, InMemoryVectorIndex, MemoryStore, RecordStore,
    RetrySettings, RunEvent, RunService, Services, Settings, VectorIndex,
};
use autoeval_types::{
    AutoevalError, CurriculumOutput, Document, EvalCase, JudgeCaseResult, Result, RunConfig,
    RunRecord, RunStatus, ScoreCard, StructuredSummary, SuiteMetrics, SuiteVersion,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BROKEN_MARKER: &str = "BROKEN";

/// Dry-run agents with a few knobs: summaries of documents containing
/// [`BROKEN_MARKER`] always fail, authoring can be held on a gate, and the
/// judge can report verdicts that contradict its own scores.
#[derive(Default)]
struct ScriptedAgents {
    inner: DryRunAgents,
    summarize_calls: AtomicUsize,
    broken_calls: AtomicUsize,
    author_gate: Option<Arc<Notify>>,
    inflated_verdicts: bool,
}

#[async_trait]
impl EvalAgents for ScriptedAgents {
    async fn author(
        &self,
        docs: &[Document],
        suite_size: usize,
        version: SuiteVersion,
    ) -> Result<Vec<EvalCase>> {
        if let Some(gate) = &self.author_gate {
            gate.notified().await;
        }
        self.inner.author(docs, suite_size, version).await
    }

    async fn summarize(
        &self,
        doc_text: &str,
        constraints: &BTreeMap<String, serde_json::Value>,
    ) -> Result<StructuredSummary> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        if doc_text.contains(BROKEN_MARKER) {
            self.broken_calls.fetch_add(1, Ordering::SeqCst);
            return Err(AutoevalError::agent("summarizer", "upstream timeout"));
        }
        self.inner.summarize(doc_text, constraints).await
    }

    async fn judge(
        &self,
        case: &EvalCase,
        doc_text: &str,
        summary: &StructuredSummary,
    ) -> Result<JudgeCaseResult> {
        let mut result = self.inner.judge(case, doc_text, summary).await?;
        if self.inflated_verdicts {
            result.scores = ScoreCard {
                coverage: 1,
                faithfulness: 1,
                conciseness: 1,
                structure: 1,
            };
            result.hallucination_flag = false;
            result.aggregate_score = 4.8;
            result.pass = true;
        }
        Ok(result)
    }

    async fn curriculum(
        &self,
        prev_metrics: &SuiteMetrics,
        worst_cases: &[EvalCase],
        docs: &[Document],
        similar_prompt_hints: &[String],
        suite_size: usize,
    ) -> Result<CurriculumOutput> {
        self.inner
            .curriculum(prev_metrics, worst_cases, docs, similar_prompt_hints, suite_size)
            .await
    }
}

fn doc(id: &str, text: &str, token_count: u64) -> Document {
    let mut doc = Document::inline(id, text);
    doc.token_count = token_count;
    doc
}

fn corpus_text(topic: &str) -> String {
    (0..80)
        .map(|i| format!("{topic}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn test_settings(max_token_budget: u64) -> Settings {
    Settings {
        max_token_budget,
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 0,
            jitter: 0.0,
        },
        ..Settings::default()
    }
}

fn config(corpus_size: usize, suite_size: usize) -> RunConfig {
    RunConfig {
        seed: 42,
        corpus_size,
        suite_size,
    }
}

async fn service_with(
    docs: &[Document],
    agents: Arc<dyn EvalAgents>,
    vectors: Option<Arc<dyn VectorIndex>>,
    settings: Settings,
) -> (RunService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for d in docs {
        save_document(store.as_ref(), d).await.expect("seed document");
    }
    let services = Services::new(store.clone(), agents, vectors, settings);
    let service = RunService::new(services, EventEmitter::new(1024))
        .await
        .expect("service should start");
    (service, store)
}

fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Test 1: Dry run completes both iterations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_completes_both_iterations() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 120),
        doc("doc-b", &corpus_text("beta"), 120),
        doc("doc-c", &corpus_text("gamma"), 120),
    ];
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(300_000)).await;
    let mut rx = service.events().subscribe();

    let ticket = service.start(config(3, 4)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Completed);

    let run = service.get_status(&ticket.run_id).await.expect("status");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
    assert!(run.error_message.is_none());
    // author 6000 + 4*(600+120) + 4*(400+120) + curriculum 12000 + same again for v2
    assert_eq!(run.tokens_used, 6_000 + 2 * (4 * 720 + 4 * 520) + 12_000);

    let results = service.get_results(&ticket.run_id).await.expect("results");
    assert!(results.metrics_v1.is_some());
    assert!(results.metrics_v2.is_some());
    assert_eq!(results.suites.len(), 2);
    assert_eq!(results.suites[0].suite.suite_id, format!("{}#v1", ticket.run_id));
    assert_eq!(results.suites[0].results.len(), 4);
    assert_eq!(results.suites[1].suite.cases.len(), 4);
    assert!(results.suites[1]
        .suite
        .cases
        .iter()
        .all(|c| c.eval_id.starts_with("v2-case-")));

    let stages: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::StageStarted { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            "load_docs",
            "init_run",
            "author_v1",
            "execute_v1",
            "judge_v1",
            "curriculum_v2",
            "execute_v2",
            "judge_v2",
            "finalize"
        ]
    );
}

// ---------------------------------------------------------------------------
// Test 2: Dry run with the in-memory vector index
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_with_vector_memory_finishes() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 100),
        doc("doc-b", &corpus_text("beta"), 100),
    ];
    let index = Arc::new(InMemoryVectorIndex::new());
    let (service, _store) = service_with(
        &docs,
        Arc::new(DryRunAgents::new()),
        Some(index.clone() as Arc<dyn VectorIndex>),
        test_settings(300_000),
    )
    .await;

    let ticket = service.start(config(2, 3)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Completed);

    assert!(index.count("eval_prompts").await >= 3);
    let results = service.get_results(&ticket.run_id).await.expect("results");
    assert_eq!(results.suites.len(), 2);
    assert!(results.suites[1].suite.cases.len() <= 3);
}

// ---------------------------------------------------------------------------
// Test 3: Failing summarizer is retried, then recorded as a case error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_case_completes_with_errors() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 100),
        doc("doc-b", &format!("{} {}", BROKEN_MARKER, corpus_text("beta")), 100),
    ];
    let agents = Arc::new(ScriptedAgents::default());
    let (service, _store) =
        service_with(&docs, agents.clone(), None, test_settings(300_000)).await;

    let ticket = service.start(config(2, 2)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::CompletedWithErrors);

    let broken = agents.broken_calls.load(Ordering::SeqCst);
    assert!(broken >= 3, "expected retries, got {broken} calls");
    assert_eq!(broken % 3, 0, "each failing case uses all three attempts");

    let run = service.get_status(&ticket.run_id).await.expect("status");
    let message = run.error_message.expect("error message recorded");
    assert!(message.contains("v1-case-0002"), "got: {message}");
    assert!(run.metrics_v1.is_some());
    assert!(run.metrics_v2.is_some());
}

// ---------------------------------------------------------------------------
// Test 4: Cancellation during authoring routes straight to finalize
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_authoring_skips_remaining_stages() {
    let docs = vec![doc("doc-a", &corpus_text("alpha"), 100)];
    let gate = Arc::new(Notify::new());
    let agents = Arc::new(ScriptedAgents {
        author_gate: Some(gate.clone()),
        ..ScriptedAgents::default()
    });
    let (service, _store) =
        service_with(&docs, agents.clone(), None, test_settings(300_000)).await;
    let mut rx = service.events().subscribe();

    let ticket = service.start(config(1, 2)).await.expect("start");
    loop {
        match rx.recv().await.expect("event stream") {
            RunEvent::StageStarted { stage, .. } if stage == "author_v1" => break,
            _ => {}
        }
    }
    let response = service.cancel(&ticket.run_id).await.expect("cancel");
    assert!(response.accepted);
    gate.notify_one();

    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(agents.summarize_calls.load(Ordering::SeqCst), 0);

    let events = drain(&mut rx);
    assert!(events.contains(&RunEvent::RoutedToFinalize {
        run_id: ticket.run_id.clone(),
        after: "author_v1".into(),
        skipped: "execute_v1".into(),
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::StageStarted { stage, .. } if stage == "execute_v1")));

    let run = service.get_status(&ticket.run_id).await.expect("status");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.is_some());
    assert!(run.metrics_v1.is_none());
}

// ---------------------------------------------------------------------------
// Test 5: Budget exhausted before anything is judged fails the run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_exhausted_in_first_execution_fails() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 400),
        doc("doc-b", &corpus_text("beta"), 400),
    ];
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(8_500)).await;

    let ticket = service.start(config(2, 4)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Failed);

    let run = service.get_status(&ticket.run_id).await.expect("status");
    // author 6000 + two summaries at 1000 each; the third would overrun
    assert_eq!(run.tokens_used, 8_000);
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("token_cap_exceeded")));
    assert!(run.metrics_v1.is_none());
}

// ---------------------------------------------------------------------------
// Test 6: Budget exhausted in the second iteration keeps v1's results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_exhausted_in_second_execution_completes_with_errors() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 400),
        doc("doc-b", &corpus_text("beta"), 400),
    ];
    // 6000 + 2*1000 + 2*800 + 12000 = 21600, leaving room for one v2 summary
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(22_600)).await;

    let ticket = service.start(config(2, 2)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::CompletedWithErrors);

    let run = service.get_status(&ticket.run_id).await.expect("status");
    assert_eq!(run.tokens_used, 22_600);
    assert!(run.metrics_v1.is_some());
    assert!(run.metrics_v2.is_none());
}

// ---------------------------------------------------------------------------
// Test 7: Only one run is active at a time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_execute_one_at_a_time() {
    let docs = vec![doc("doc-a", &corpus_text("alpha"), 50)];
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(300_000)).await;
    let mut rx = service.events().subscribe();

    let first = service.start(config(1, 2)).await.expect("start first");
    let second = service.start(config(1, 2)).await.expect("start second");
    assert_eq!(first.handle.await.expect("first task"), RunStatus::Completed);
    assert_eq!(second.handle.await.expect("second task"), RunStatus::Completed);

    let lifecycle: Vec<(bool, String)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::RunStarted { run_id } => Some((true, run_id)),
            RunEvent::RunFinished { run_id, .. } => Some((false, run_id)),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle.len(), 4);
    // started(x), finished(x), started(y), finished(y)
    assert!(lifecycle[0].0 && !lifecycle[1].0 && lifecycle[2].0 && !lifecycle[3].0);
    assert_eq!(lifecycle[0].1, lifecycle[1].1);
    assert_eq!(lifecycle[2].1, lifecycle[3].1);
    assert_ne!(lifecycle[0].1, lifecycle[2].1);
    assert!(service.active_run_id().is_none());
}

// ---------------------------------------------------------------------------
// Test 8: Orphaned runs are failed once at startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphaned_runs_recovered_once() {
    let store = Arc::new(MemoryStore::new());
    let mut orphan = RunRecord::create("orphan-1", RunConfig::default());
    orphan.status = RunStatus::Running;
    save_run(store.as_ref(), &orphan).await.expect("seed run");
    save_run(store.as_ref(), &RunRecord::create("done-1", RunConfig::default()))
        .await
        .expect("seed run");

    let shared: Arc<dyn RecordStore> = store.clone();
    let services = Services::new(
        shared,
        Arc::new(DryRunAgents::new()),
        None,
        test_settings(300_000),
    );
    let service = RunService::new(services, EventEmitter::default())
        .await
        .expect("service should start");

    let run = get_run(store.as_ref(), "orphan-1")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some(ORPHANED_RUN_MESSAGE));

    let untouched = service.get_status("done-1").await.expect("status");
    assert_eq!(untouched.status, RunStatus::Queued);

    assert!(service.recover_orphans().await.expect("recover").is_empty());
}

// ---------------------------------------------------------------------------
// Test 9: Cancel semantics for unknown and inactive runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_unknown_and_inactive_runs() {
    let docs = vec![doc("doc-a", &corpus_text("alpha"), 50)];
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(300_000)).await;

    let err = service.cancel("no-such-run").await.unwrap_err();
    assert!(matches!(err, AutoevalError::RunNotFound { .. }));
    assert_eq!(err.http_status(), 404);

    let ticket = service.start(config(1, 1)).await.expect("start");
    ticket.handle.await.expect("run task");
    let response = service.cancel(&ticket.run_id).await.expect("cancel");
    assert!(!response.accepted);
}

// ---------------------------------------------------------------------------
// Test 10: An empty corpus fails the run without calling any agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_corpus_fails_run() {
    let agents = Arc::new(ScriptedAgents::default());
    let (service, _store) = service_with(&[], agents.clone(), None, test_settings(300_000)).await;

    let ticket = service.start(config(5, 2)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(agents.summarize_calls.load(Ordering::SeqCst), 0);

    let run = service.get_status(&ticket.run_id).await.expect("status");
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("corpus is empty")));
    assert_eq!(run.tokens_used, 0);
}

// ---------------------------------------------------------------------------
// Test 11: Judge verdicts are recomputed from the dimension scores
// ---------------------------------------------------------------------------

#[tokio::test]
async fn judge_verdict_follows_scores_not_claims() {
    let docs = vec![
        doc("doc-a", &corpus_text("alpha"), 100),
        doc("doc-b", &corpus_text("beta"), 100),
    ];
    let agents = Arc::new(ScriptedAgents {
        inflated_verdicts: true,
        ..ScriptedAgents::default()
    });
    let (service, _store) = service_with(&docs, agents, None, test_settings(300_000)).await;

    let ticket = service.start(config(2, 3)).await.expect("start");
    let status = ticket.handle.await.expect("run task");
    assert_eq!(status, RunStatus::Completed);

    let results = service.get_results(&ticket.run_id).await.expect("results");
    let judged = &results.suites[0].results;
    assert_eq!(judged.len(), 3);
    for result in judged {
        assert_eq!(result.aggregate_score, 1.0);
        assert!(!result.pass, "{} kept the claimed pass", result.eval_id);
    }

    let metrics = results.metrics_v1.expect("v1 metrics");
    assert_eq!(metrics.aggregate_avg, 1.0);
    assert_eq!(metrics.pass_rate, 0.0);
    assert_eq!(metrics.failure_detection_rate, 1.0);
}

// ---------------------------------------------------------------------------
// Test 12: Runs are admitted in the order they were started
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_admitted_in_start_order() {
    let docs = vec![doc("doc-a", &corpus_text("alpha"), 50)];
    let (service, _store) =
        service_with(&docs, Arc::new(DryRunAgents::new()), None, test_settings(300_000)).await;

    for _ in 0..5 {
        let mut rx = service.events().subscribe();
        let mut tickets = Vec::new();
        for _ in 0..6 {
            tickets.push(service.start(config(1, 1)).await.expect("start"));
        }

        let started: Vec<String> = tickets.iter().map(|t| t.run_id.clone()).collect();
        for ticket in tickets {
            assert_eq!(ticket.handle.await.expect("run task"), RunStatus::Completed);
        }

        let admitted: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::RunStarted { run_id } => Some(run_id),
                _ => None,
            })
            .collect();
        assert_eq!(admitted, started);
    }
    assert!(service.active_run_id().is_none());
}
