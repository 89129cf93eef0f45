//! Pipeline state machine: the staged run loop.
//!
//! `load_docs → init_run → author_v1 → execute_v1 → judge_v1 → curriculum_v2
//! → execute_v2 → judge_v2 → finalize`. Before every transition except the
//! one into finalize the loop checks the cancellation flag and any halt a
//! stage requested; either routes straight to finalize. Finalize runs exactly
//! once per invocation.

use std::sync::Arc;
use std::time::Instant;

use autoeval_types::{Result, RunConfig, SuiteVersion};

use crate::agents::EvalAgents;
use crate::budget::TokenBudget;
use crate::cancel::CancelFlag;
use crate::config::Settings;
use crate::events::{EventEmitter, RunEvent};
use crate::records;
use crate::stages::{self, StageContext};
use crate::state::{HaltReason, RunState, StatePatch};
use crate::store::RecordStore;
use crate::vector::VectorIndex;

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Long-lived collaborators shared by every run of the process.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RecordStore>,
    pub agents: Arc<dyn EvalAgents>,
    /// Without a vector service, dedup accepts everything and failure
    /// memory is skipped.
    pub vectors: Option<Arc<dyn VectorIndex>>,
    pub settings: Arc<Settings>,
}

impl Services {
    pub fn new(
        store: Arc<dyn RecordStore>,
        agents: Arc<dyn EvalAgents>,
        vectors: Option<Arc<dyn VectorIndex>>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            agents,
            vectors,
            settings: Arc::new(settings),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    LoadDocs,
    InitRun,
    AuthorV1,
    ExecuteV1,
    JudgeV1,
    CurriculumV2,
    ExecuteV2,
    JudgeV2,
    Finalize,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::LoadDocs => "load_docs",
            Stage::InitRun => "init_run",
            Stage::AuthorV1 => "author_v1",
            Stage::ExecuteV1 => "execute_v1",
            Stage::JudgeV1 => "judge_v1",
            Stage::CurriculumV2 => "curriculum_v2",
            Stage::ExecuteV2 => "execute_v2",
            Stage::JudgeV2 => "judge_v2",
            Stage::Finalize => "finalize",
        }
    }

    /// Nominal successor; `None` after finalize.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::LoadDocs => Some(Stage::InitRun),
            Stage::InitRun => Some(Stage::AuthorV1),
            Stage::AuthorV1 => Some(Stage::ExecuteV1),
            Stage::ExecuteV1 => Some(Stage::JudgeV1),
            Stage::JudgeV1 => Some(Stage::CurriculumV2),
            Stage::CurriculumV2 => Some(Stage::ExecuteV2),
            Stage::ExecuteV2 => Some(Stage::JudgeV2),
            Stage::JudgeV2 => Some(Stage::Finalize),
            Stage::Finalize => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// RunPipeline
// ---------------------------------------------------------------------------

/// Drives one run through every stage.
#[derive(Clone)]
pub struct RunPipeline {
    services: Services,
    events: EventEmitter,
}

impl RunPipeline {
    pub fn new(services: Services, events: EventEmitter) -> Self {
        Self { services, events }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run the pipeline for `run_id` and return the final state.
    ///
    /// Terminal status is written by finalize. An `Err` means a stage failed
    /// unexpectedly before finalize could run; the caller owns writing
    /// `failed` in that case.
    pub async fn run(&self, run_id: &str, config: RunConfig, cancel: &CancelFlag) -> Result<RunState> {
        let ctx = StageContext {
            services: &self.services,
            cancel,
            retry: self.services.settings.retry_policy(),
        };
        let mut state = RunState::new(run_id, config);
        let mut budget = TokenBudget::new(self.services.settings.max_token_budget);
        let mut stage = Stage::LoadDocs;

        tracing::info!(
            run_id = %run_id,
            seed = config.seed,
            corpus_size = config.corpus_size,
            suite_size = config.suite_size,
            "Pipeline started"
        );

        loop {
            self.events.emit(RunEvent::StageStarted {
                run_id: run_id.to_string(),
                stage: stage.name().to_string(),
            });
            tracing::debug!(run_id = %run_id, stage = %stage, "Stage started");
            let started = Instant::now();

            let patch = self.run_stage(stage, &ctx, &state, &mut budget).await?;
            state.apply(patch);

            let duration_ms = started.elapsed().as_millis() as u64;
            self.events.emit(RunEvent::StageCompleted {
                run_id: run_id.to_string(),
                stage: stage.name().to_string(),
                duration_ms,
            });
            tracing::info!(
                run_id = %run_id,
                stage = %stage,
                duration_ms,
                tokens_used = state.tokens_used,
                errors = state.errors.len(),
                "Stage completed"
            );

            let Some(nominal) = stage.next() else {
                break;
            };
            records::record_progress(
                self.services.store.as_ref(),
                run_id,
                state.tokens_used,
                stage.name(),
            )
            .await?;

            stage = if nominal != Stage::Finalize && (cancel.is_set() || state.halt.is_some()) {
                if cancel.is_set() && state.halt.is_none() {
                    state.apply(StatePatch::new().halt(HaltReason::Cancelled));
                }
                tracing::info!(
                    run_id = %run_id,
                    after = %stage,
                    skipped = %nominal,
                    halt = ?state.halt,
                    "Routing to finalize"
                );
                self.events.emit(RunEvent::RoutedToFinalize {
                    run_id: run_id.to_string(),
                    after: stage.name().to_string(),
                    skipped: nominal.name().to_string(),
                });
                Stage::Finalize
            } else {
                nominal
            };
        }

        Ok(state)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &StageContext<'_>,
        state: &RunState,
        budget: &mut TokenBudget,
    ) -> Result<StatePatch> {
        match stage {
            Stage::LoadDocs => stages::load_docs::run(ctx, state).await,
            Stage::InitRun => stages::init_run::run(ctx, state, budget).await,
            Stage::AuthorV1 => stages::author::run(ctx, state, budget).await,
            Stage::ExecuteV1 => stages::execute::run(ctx, state, budget, SuiteVersion::V1).await,
            Stage::JudgeV1 => stages::judge::run(ctx, state, budget, SuiteVersion::V1).await,
            Stage::CurriculumV2 => stages::curriculum::run(ctx, state, budget).await,
            Stage::ExecuteV2 => stages::execute::run(ctx, state, budget, SuiteVersion::V2).await,
            Stage::JudgeV2 => stages::judge::run(ctx, state, budget, SuiteVersion::V2).await,
            Stage::Finalize => stages::finalize::run(ctx, state).await,
        }
    }
}
