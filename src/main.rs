//! Judgeloop command line
//!
//! Every subcommand maps to one core operation. State lives in a JSON
//! snapshot that is loaded before the command and saved after it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use judgeloop_core::{
    scheduler::{BatchSweepJob, EvaluationCycleJob},
    services::MetricsCache,
    AnthropicJudge, BackgroundScheduler, ChatEndpointInvoker, EndpointId, EngineConfig, EventBus,
    EventWorker, ImprovementLoop, JudgeClient, JudgeloopError, MemoryStore, NoopMetricsCache,
    RecordId,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{self, EnvFilter};

/// Pending events the bus holds before dropping
const EVENT_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "judgeloop")]
#[command(about = "Closed-loop LLM output evaluation and prompt optimization", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State snapshot file
    #[arg(long, env = "JUDGELOOP_STATE", default_value = "judgeloop-state.json")]
    state: PathBuf,

    /// Configuration file (TOML)
    #[arg(short, long, env = "JUDGELOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronous evaluation cycle for an evaluator
    RunCycle {
        #[arg(long, value_parser = parse_endpoint_id)]
        evaluator: EndpointId,
    },

    /// Run one full improvement pass: evaluate, derive insights, optimize, compare
    RunLoop {
        #[arg(long, value_parser = parse_endpoint_id)]
        evaluator: EndpointId,
    },

    /// Submit one cycle's sample as a provider batch
    SubmitBatch {
        #[arg(long, value_parser = parse_endpoint_id)]
        evaluator: EndpointId,
    },

    /// Poll one batch job
    PollBatch {
        #[arg(long)]
        job: String,
    },

    /// Reconcile every pending batch job
    CheckBatches,

    /// Generate insights for an incorrect record
    GenerateInsights {
        #[arg(long, value_parser = parse_record_id)]
        record: RecordId,
    },

    /// Rewrite an endpoint's prompt from its latest insights
    Optimize {
        #[arg(long, value_parser = parse_endpoint_id)]
        endpoint: EndpointId,
    },

    /// Generate insights for one record and optimize from them
    OptimizeFromRecord {
        #[arg(long, value_parser = parse_record_id)]
        record: RecordId,
    },

    /// Release a prompt version
    Release {
        #[arg(long, value_parser = parse_endpoint_id)]
        endpoint: EndpointId,

        #[arg(long)]
        version: u32,
    },

    /// Replay base records through the principal challenger
    AbTest {
        #[arg(long, value_parser = parse_endpoint_id)]
        base: EndpointId,
    },

    /// Pick the endpoint that should serve one request
    Route {
        #[arg(long, value_parser = parse_endpoint_id)]
        base: EndpointId,
    },

    /// Run evaluation cycles and batch sweeps until interrupted
    Serve {
        /// Evaluators to run cycles for (repeatable)
        #[arg(long, value_parser = parse_endpoint_id)]
        evaluator: Vec<EndpointId>,
    },

    /// Print the default configuration as TOML
    InitConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_endpoint_id(s: &str) -> Result<EndpointId, String> {
    EndpointId::from_string(s).map_err(|e| format!("invalid endpoint id '{}': {}", s, e))
}

fn parse_record_id(s: &str) -> Result<RecordId, String> {
    RecordId::from_string(s).map_err(|e| format!("invalid record id '{}': {}", s, e))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("judgeloop={0},judgeloop_core={0}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Judgeloop v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        let status = e
            .downcast_ref::<JudgeloopError>()
            .map(JudgeloopError::status_code)
            .unwrap_or(500);
        error!(status, "{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::InitConfig { output } = &cli.command {
        let rendered = config.to_toml()?;
        match output {
            Some(path) => {
                tokio::fs::write(path, rendered)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Wrote configuration to {}", path.display());
            }
            None => print!("{}", rendered),
        }
        return Ok(());
    }

    let store = Arc::new(
        MemoryStore::load(&cli.state)
            .await
            .with_context(|| format!("Failed to load state from {}", cli.state.display()))?,
    );
    let judge: Arc<dyn JudgeClient> =
        Arc::new(AnthropicJudge::new(config.judge.clone()).context("Failed to create judge client")?);
    let invoker = Arc::new(ChatEndpointInvoker::new(Arc::clone(&judge)));

    let cache: Arc<dyn MetricsCache> = Arc::new(NoopMetricsCache);
    let (events, mut worker) = EventBus::channel(EVENT_CAPACITY, cache);
    let pipeline = ImprovementLoop::new(&config, store.clone(), judge, invoker, events.clone());

    let outcome = match cli.command {
        Commands::Serve { evaluator } => serve(&config, &pipeline, evaluator, worker).await,
        command => {
            let outcome = execute(command, &pipeline).await;
            let report = worker.drain().await;
            debug!(
                handled = report.handled,
                failures = report.failures,
                dropped = events.dropped_count(),
                "Drained pipeline events"
            );
            outcome
        }
    };

    save_state(&store, &cli.state).await?;
    outcome
}

async fn execute(command: Commands, pipeline: &ImprovementLoop) -> anyhow::Result<()> {
    match command {
        Commands::RunCycle { evaluator } => {
            let report = pipeline.executor().run_cycle(evaluator).await?;
            print_json(&report)
        }
        Commands::RunLoop { evaluator } => {
            let report = pipeline.run_once(evaluator).await?;
            print_json(&report)
        }
        Commands::SubmitBatch { evaluator } => match pipeline.executor().batch_evaluate(evaluator).await? {
            Some(job) => print_json(&job),
            None => {
                info!("Backlog below threshold, nothing submitted");
                Ok(())
            }
        },
        Commands::PollBatch { job } => {
            let report = pipeline.reconciler().poll_job(&job).await?;
            print_json(&report)
        }
        Commands::CheckBatches => {
            let report = pipeline.reconciler().check_all_pending_batches().await?;
            print_json(&report)
        }
        Commands::GenerateInsights { record } => {
            let insights = pipeline.insights().generate_for_record(record).await?;
            print_json(&insights)
        }
        Commands::Optimize { endpoint } => {
            let result = pipeline.optimizer().optimize(endpoint).await?;
            print_json(&result)
        }
        Commands::OptimizeFromRecord { record } => {
            let result = pipeline.optimizer().optimize_from_record(record).await?;
            print_json(&result)
        }
        Commands::Release { endpoint, version } => {
            let entry = pipeline.optimizer().release(endpoint, version).await?;
            print_json(&entry)
        }
        Commands::AbTest { base } => {
            let report = pipeline.comparison().run(base).await?;
            print_json(&report)
        }
        Commands::Route { base } => {
            let decision = pipeline.router().route(base).await?;
            print_json(&decision)
        }
        Commands::Serve { .. } | Commands::InitConfig { .. } => {
            anyhow::bail!("command is not a one-shot operation")
        }
    }
}

async fn serve(
    config: &EngineConfig,
    pipeline: &ImprovementLoop,
    evaluators: Vec<EndpointId>,
    worker: EventWorker,
) -> anyhow::Result<()> {
    let (stop_events, events_stopped) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(worker.run_until(async move {
        let _ = events_stopped.await;
    }));

    let mut scheduler = BackgroundScheduler::new(config.scheduler.clone());
    if !evaluators.is_empty() {
        scheduler.register_job(Arc::new(EvaluationCycleJob::new(
            pipeline.executor().clone(),
            evaluators,
            Duration::from_secs(config.scheduler.evaluation_interval_secs),
        )));
    }
    scheduler.register_job(Arc::new(BatchSweepJob::new(
        pipeline.reconciler().clone(),
        Duration::from_secs(config.scheduler.batch_sweep_interval_secs),
    )));

    let scheduler = Arc::new(scheduler);
    let runner = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { runner.start().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    scheduler.stop();

    handle.await.context("Scheduler task panicked")??;

    let _ = stop_events.send(());
    let report = worker.await.context("Event worker panicked")?;
    debug!(
        handled = report.handled,
        failures = report.failures,
        "Event worker stopped"
    );
    Ok(())
}

async fn save_state(store: &MemoryStore, path: &Path) -> anyhow::Result<()> {
    store
        .save(path)
        .await
        .with_context(|| format!("Failed to save state to {}", path.display()))
}
