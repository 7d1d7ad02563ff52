mod tasks;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vendflow_core::config::AppConfig;
use vendflow_core::event::EventBus;
use vendflow_core::types::VerificationRequest;
use vendflow_engine::{ExecutionRecord, RetryPolicy, RunLogger, Workflow, WorkflowExecutor};
use vendflow_store::SqliteResultStore;

use crate::tasks::HttpTaskExecutor;

#[derive(Parser)]
#[command(
    name = "vendflow",
    version,
    about = "Vending machine verification workflow engine"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "VENDFLOW_CONFIG", default_value = "vendflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one verification against the configured task endpoint
    Run {
        /// Verification request as JSON ("-" reads stdin)
        #[arg(short, long)]
        input: PathBuf,
        /// Include the final execution context in the output
        #[arg(long)]
        full: bool,
    },
    /// Show a stored verification result
    Show {
        /// Verification ID
        verification_id: String,
    },
    /// List recently stored results
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the workflow stages and transitions
    Stages,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vendflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "vendflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
    }

    match cli.command {
        Commands::Run { input, full } => run_verification(&config, &input, full).await?,
        Commands::Show { verification_id } => {
            let store = SqliteResultStore::open(Path::new(&config.store.path))?;
            match store.load(&verification_id)? {
                Some(stored) => {
                    println!("{}", serde_json::to_string_pretty(&stored)?);
                    let notified = store.notifications(&verification_id)?;
                    if let Some(at) = notified.last() {
                        println!("Notified: {}", at.to_rfc3339());
                    }
                }
                None => anyhow::bail!("no stored result for {}", verification_id),
            }
        }
        Commands::List { limit } => {
            let store = SqliteResultStore::open(Path::new(&config.store.path))?;
            let results = store.list_recent(limit)?;
            if results.is_empty() {
                println!("No stored results.");
            }
            for stored in &results {
                println!(
                    "{:<36} {:<20} {:<10} {:<10} {:.2}  {}",
                    stored.verification_id,
                    stored.verification_type,
                    stored.vending_machine_id,
                    stored.result.verification_status,
                    stored.result.confidence_score,
                    stored.stored_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Stages => {
            let workflow = Workflow::verification(&RetryPolicy::from(&config.retry))?;
            print!("{}", workflow.render());
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn run_verification(config: &AppConfig, input: &Path, full: bool) -> anyhow::Result<()> {
    let request = read_request(input)?;

    let tasks = Arc::new(HttpTaskExecutor::new(&config.tasks)?);
    let store = Arc::new(SqliteResultStore::open(Path::new(&config.store.path))?);
    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    // Spawn RunLogger if logging is enabled. It stops when the bus closes,
    // so an interrupted run still logs its recovery stages.
    let mut log_handle = None;
    if let Some(log_config) = config.log.as_ref().filter(|l| l.enabled) {
        let logger = RunLogger::new(&log_config.log_dir, log_config.level);
        let rx = event_bus.subscribe();
        log_handle = Some(tokio::spawn(logger.run(rx, CancellationToken::new())));
        info!("RunLogger started (level {})", log_config.level);
    }

    let executor = WorkflowExecutor::from_config(config, tasks, store)?
        .with_event_bus(event_bus.clone())
        .with_cancellation(cancel.clone());

    let record = {
        let run = executor.run_request(&request);
        tokio::pin!(run);
        tokio::select! {
            record = &mut run => record?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, storing a failed result before exit");
                cancel.cancel();
                run.await?
            }
        }
    };

    // Close the bus so the logger drains and exits
    drop(executor);
    drop(event_bus);
    if let Some(handle) = log_handle {
        handle.await.ok();
    }

    print_record(&record, full)?;
    Ok(())
}

fn read_request(input: &Path) -> anyhow::Result<VerificationRequest> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("reading {}", input.display()))?
    };
    let request: VerificationRequest =
        serde_json::from_str(&raw).context("parsing verification request")?;
    Ok(request)
}

fn print_record(record: &ExecutionRecord, full: bool) -> anyhow::Result<()> {
    if full {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    let stages: Vec<String> = record
        .stage_sequence()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let summary = serde_json::json!({
        "runId": record.run_id,
        "verificationId": record.verification_id,
        "outcome": record.outcome,
        "stored": record.stored,
        "failureReason": record.failure_reason,
        "finalResult": record.final_result,
        "stages": stages,
        "totalElapsedMs": record.total_elapsed_ms,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
