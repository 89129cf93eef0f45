//! CLI binary for starting and inspecting AutoEval runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use autoeval_pipeline::records;
use autoeval_pipeline::{
    DryRunAgents, EventEmitter, InMemoryVectorIndex, JsonFileStore, RunEvent, RunService,
    Services, Settings,
};
use autoeval_types::{Document, RunConfig, RunRecord, SuiteMetrics};

#[derive(Parser)]
#[command(name = "autoeval", version, about = "Evaluation-improvement loop for a summarization service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the record store
    #[arg(long, global = true, default_value = "data/store")]
    store: PathBuf,

    /// Settings file (JSON). Defaults come from AUTOEVAL_* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and wait for it to finish
    Run {
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Documents sampled from the corpus
        #[arg(long, default_value = "150")]
        corpus_size: usize,

        /// Cases per suite
        #[arg(long, default_value = "20")]
        suite_size: usize,

        /// Use deterministic local agents instead of a model backend
        #[arg(long)]
        dry_run: bool,
    },

    /// Show a run's status record
    Status { run_id: String },

    /// Print a run's suites, results and metrics as JSON
    Results { run_id: String },

    /// List runs, newest first
    List,

    /// Fail runs a crashed process left marked running
    Recover,

    /// Load corpus documents from a JSON array into the store
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            seed,
            corpus_size,
            suite_size,
            dry_run,
        } => {
            let config = RunConfig {
                seed,
                corpus_size,
                suite_size,
            };
            cmd_run(&cli.store, settings, config, dry_run).await?;
        }
        Commands::Status { run_id } => {
            let service = service(&cli.store, settings).await?;
            print_run(&service.get_status(&run_id).await?);
        }
        Commands::Results { run_id } => {
            let service = service(&cli.store, settings).await?;
            let results = service.get_results(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::List => {
            let service = service(&cli.store, settings).await?;
            let runs = service.list_runs().await?;
            if runs.is_empty() {
                println!("No runs");
            }
            for run in runs {
                println!(
                    "{}  {:<22} {}  tokens={}",
                    run.run_id,
                    run.status.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.tokens_used
                );
            }
        }
        Commands::Recover => {
            let service = service(&cli.store, settings).await?;
            let recovered = service.recover_orphans().await?;
            println!("Recovered {} orphaned run(s)", recovered.len());
            for run_id in recovered {
                println!("  {}", run_id);
            }
        }
        Commands::Import { file } => {
            cmd_import(&cli.store, &file).await?;
        }
    }

    Ok(())
}

async fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path).await?,
        None => Settings::from_env()?,
    };
    settings.validate()?;
    Ok(settings)
}

/// Read-only view of the file store. It never starts a run, so the agents
/// are placeholders and orphan recovery is left to `run` and `recover`.
async fn service(store_dir: &Path, settings: Settings) -> anyhow::Result<RunService> {
    let store = JsonFileStore::open(store_dir).await?;
    let services = Services::new(Arc::new(store), Arc::new(DryRunAgents::new()), None, settings);
    Ok(RunService::attach(services, EventEmitter::default()))
}

async fn cmd_run(
    store_dir: &Path,
    settings: Settings,
    config: RunConfig,
    dry_run: bool,
) -> anyhow::Result<()> {
    if !dry_run {
        anyhow::bail!("no agent backend configured; pass --dry-run to use local deterministic agents");
    }
    println!("(dry run mode -- no model calls)");
    println!(
        "Seed: {}  corpus: {}  suite: {}  budget: {} tokens",
        config.seed, config.corpus_size, config.suite_size, settings.max_token_budget
    );

    let store = JsonFileStore::open(store_dir).await?;
    let services = Services::new(
        Arc::new(store),
        Arc::new(DryRunAgents::new()),
        Some(Arc::new(InMemoryVectorIndex::new())),
        settings,
    );
    let service = RunService::new(services, EventEmitter::default()).await?;
    let mut events = service.events().subscribe();

    let mut ticket = service.start(config).await?;
    println!("Run: {}", ticket.run_id);

    let status = loop {
        tokio::select! {
            joined = &mut ticket.handle => break joined.context("run task panicked")?,
            event = events.recv() => {
                if let Ok(RunEvent::StageCompleted { stage, duration_ms, .. }) = event {
                    println!("  {stage} ({duration_ms} ms)");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let response = service.cancel(&ticket.run_id).await?;
                println!("Cancellation requested (accepted: {})", response.accepted);
            }
        }
    };

    println!("\nRun finished: {status}");
    print_run(&service.get_status(&ticket.run_id).await?);
    Ok(())
}

async fn cmd_import(store_dir: &Path, file: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let docs: Vec<Document> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    let store = JsonFileStore::open(store_dir).await?;
    for doc in &docs {
        records::save_document(&store, doc).await?;
    }
    println!("Imported {} document(s) into {}", docs.len(), store.dir().display());
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!("Run: {}", run.run_id);
    println!("Status: {}", run.status);
    println!(
        "Config: seed={} corpus_size={} suite_size={}",
        run.config.seed, run.config.corpus_size, run.config.suite_size
    );
    println!("Created: {}", run.created_at.to_rfc3339());
    if let Some(started) = run.started_at {
        println!("Started: {}", started.to_rfc3339());
    }
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed.to_rfc3339());
    }
    if let Some(stage) = &run.current_stage {
        println!("Last stage: {}", stage);
    }
    println!("Tokens used: {}", run.tokens_used);
    if let Some(error) = &run.error_message {
        println!("Errors: {}", error);
    }
    print_metrics("v1", run.metrics_v1.as_ref());
    print_metrics("v2", run.metrics_v2.as_ref());
}

fn print_metrics(label: &str, metrics: Option<&SuiteMetrics>) {
    let Some(m) = metrics else {
        return;
    };
    println!(
        "Metrics {}: aggregate={:.4} pass_rate={:.4} failure_rate={:.4}",
        label, m.aggregate_avg, m.pass_rate, m.failure_detection_rate
    );
    for (dimension, avg) in &m.avg_scores_by_dimension {
        println!("  {:<13} {:.4}", dimension, avg);
    }
    if !m.top_failure_modes.is_empty() {
        let tags: Vec<String> = m.top_failure_modes.iter().map(|t| t.to_string()).collect();
        println!("  top failures: {}", tags.join(", "));
    }
}
