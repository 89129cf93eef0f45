//! Run orchestration engine for the AutoEval evaluation-improvement loop.
//!
//! This crate sequences the staged pipeline (author → execute → judge →
//! curriculum → re-execute → re-judge → finalize), enforces the per-run token
//! budget, fans out per-case work under a concurrency limit, retries external
//! calls, and admits one run at a time through the run queue.

pub mod agents;
pub mod budget;
pub mod cancel;
pub mod config;
pub mod dedup;
pub mod dry_run;
pub mod engine;
pub mod events;
pub mod executor;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod records;
pub mod retry;
pub mod service;
pub mod stages;
pub mod state;
pub mod store;
pub mod vector;

pub use agents::EvalAgents;
pub use budget::TokenBudget;
pub use cancel::CancelFlag;
pub use config::{RetrySettings, Settings};
pub use dedup::{filter_duplicates, DedupOutcome};
pub use dry_run::DryRunAgents;
pub use engine::{RunPipeline, Services, Stage};
pub use events::{EventEmitter, RunEvent};
pub use executor::{run_bounded, FanInReport, JobOutput};
pub use metrics::{compute_suite_metrics, worst_example_count};
pub use queue::{Place, RunQueue, RunSlot};
pub use records::{StatusUpdate, SuiteRecord};
pub use retry::{with_retry, RetryPolicy};
pub use service::{CancelResponse, RunResults, RunService, RunTicket, SuiteResults};
pub use state::{HaltReason, IterationState, RunState, StatePatch};
pub use store::{JsonFileStore, MemoryStore, RecordStore, StoreKey, Table};
pub use vector::{InMemoryVectorIndex, VectorIndex, VectorItem, VectorMatch};
