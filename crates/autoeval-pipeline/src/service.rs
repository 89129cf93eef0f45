//! Run lifecycle: start, status, cancel and results.
//!
//! [`RunService`] is what a CLI or HTTP layer talks to. It persists a queued
//! run record, spawns the run behind the [`RunQueue`], and reads records back
//! for status and results.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use autoeval_types::{
    AutoevalError, JudgeCaseResult, Result, RunConfig, RunRecord, RunStatus, SuiteMetrics,
};

use crate::engine::{RunPipeline, Services};
use crate::events::{EventEmitter, RunEvent};
use crate::queue::{Place, RunQueue};
use crate::records::{self, StatusUpdate, SuiteRecord};
use crate::store::RecordStore;

/// Handle to a started run.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: String,
    /// Another run was active when this one was enqueued.
    pub queued_behind: bool,
    /// Resolves to the terminal status once the run has finished.
    pub handle: JoinHandle<RunStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteResults {
    pub suite: SuiteRecord,
    pub results: Vec<JudgeCaseResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResults {
    pub run_id: String,
    pub status: RunStatus,
    pub metrics_v1: Option<SuiteMetrics>,
    pub metrics_v2: Option<SuiteMetrics>,
    pub suites: Vec<SuiteResults>,
}

#[derive(Clone)]
pub struct RunService {
    services: Services,
    queue: Arc<RunQueue>,
    events: EventEmitter,
    pipeline: RunPipeline,
}

impl RunService {
    /// Build the service, failing any run a previous process left `running`.
    pub async fn new(services: Services, events: EventEmitter) -> Result<Self> {
        let service = Self::attach(services, events);
        service.recover_orphans().await?;
        Ok(service)
    }

    /// Build the service without touching existing records. For inspecting
    /// a store another process may still be running against.
    pub fn attach(services: Services, events: EventEmitter) -> Self {
        Self {
            pipeline: RunPipeline::new(services.clone(), events.clone()),
            services,
            queue: Arc::new(RunQueue::new()),
            events,
        }
    }

    fn store(&self) -> &dyn RecordStore {
        self.services.store.as_ref()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Fail runs still marked `running`. Returns their ids.
    pub async fn recover_orphans(&self) -> Result<Vec<String>> {
        let recovered = records::mark_stale_runs_failed(self.store()).await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered orphaned runs");
        }
        Ok(recovered)
    }

    /// Persist a queued run and start it in the background.
    pub async fn start(&self, config: RunConfig) -> Result<RunTicket> {
        let run_id = uuid::Uuid::now_v7().to_string();
        records::save_run(self.store(), &RunRecord::create(&run_id, config)).await?;

        let queued_behind = self.queue.is_busy();
        let place = self.queue.reserve();
        self.events.emit(RunEvent::RunQueued {
            run_id: run_id.clone(),
            queued_behind,
        });
        tracing::info!(run_id = %run_id, queued_behind, "Run queued");

        let handle = tokio::spawn(drive_run(
            self.queue.clone(),
            place,
            self.pipeline.clone(),
            self.services.store.clone(),
            self.events.clone(),
            run_id.clone(),
            config,
        ));

        Ok(RunTicket {
            run_id,
            queued_behind,
            handle,
        })
    }

    pub async fn get_status(&self, run_id: &str) -> Result<RunRecord> {
        records::get_run(self.store(), run_id)
            .await?
            .ok_or_else(|| AutoevalError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Request cancellation. Accepted only if `run_id` is the active run and
    /// has not yet written its terminal status.
    pub async fn cancel(&self, run_id: &str) -> Result<CancelResponse> {
        let run = self.get_status(run_id).await?;
        if run.status.is_terminal() {
            return Ok(CancelResponse { accepted: false });
        }
        Ok(CancelResponse {
            accepted: self.queue.request_cancel(run_id),
        })
    }

    pub async fn get_results(&self, run_id: &str) -> Result<RunResults> {
        let run = self.get_status(run_id).await?;
        let mut suites = Vec::new();
        for suite in records::list_suites_for_run(self.store(), run_id).await? {
            let results = records::list_results_for_suite(self.store(), &suite.suite_id).await?;
            suites.push(SuiteResults { suite, results });
        }
        Ok(RunResults {
            run_id: run.run_id,
            status: run.status,
            metrics_v1: run.metrics_v1,
            metrics_v2: run.metrics_v2,
            suites,
        })
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        records::list_runs(self.store()).await
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.queue.active_run_id()
    }
}

/// Background body of one run. The queue slot is held until the terminal
/// status is on disk.
async fn drive_run(
    queue: Arc<RunQueue>,
    place: Place,
    pipeline: RunPipeline,
    store: Arc<dyn RecordStore>,
    events: EventEmitter,
    run_id: String,
    config: RunConfig,
) -> RunStatus {
    let slot = match queue.acquire(place, &run_id, store.as_ref()).await {
        Ok(slot) => slot,
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Run could not be admitted");
            let status = RunStatus::Failed;
            if let Err(e) = records::update_run_status(
                store.as_ref(),
                &run_id,
                status,
                StatusUpdate::error(format!("admission failed: {e}")),
            )
            .await
            {
                tracing::error!(run_id = %run_id, error = %e, "Could not record admission failure");
            }
            events.emit(RunEvent::RunFinished { run_id, status });
            return status;
        }
    };
    events.emit(RunEvent::RunStarted {
        run_id: run_id.clone(),
    });

    let status = match pipeline.run(&run_id, config, slot.cancel_flag()).await {
        Ok(state) => state.final_status.unwrap_or(RunStatus::Failed),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Pipeline aborted");
            if let Err(e) = records::update_run_status(
                store.as_ref(),
                &run_id,
                RunStatus::Failed,
                StatusUpdate::error(format!("pipeline error: {e}")),
            )
            .await
            {
                tracing::error!(run_id = %run_id, error = %e, "Could not record pipeline failure");
            }
            RunStatus::Failed
        }
    };
    drop(slot);

    tracing::info!(run_id = %run_id, status = %status, "Run finished");
    events.emit(RunEvent::RunFinished { run_id, status });
    status
}
