//! `etl-pipeline` binary entrypoint: loads configuration, initializes
//! tracing, wires a `Supervisor` for the requested pipeline spec, and runs
//! it until a shutdown signal arrives (§1.1).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stream_etl_core::config::{PipelineSpec, RuntimeConfig};
use stream_etl_core::dlq::DlqSubsystem;
use stream_etl_core::error::{PipelineError, Result};
use stream_etl_core::streamlog::jetstream::JetStreamLog;
use stream_etl_core::streamlog::StreamLog;
use stream_etl_core::supervisor::Supervisor;
use stream_etl_core::util::clickhouse_pool::create_clickhouse_pool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about = "Streaming ETL data-plane core", long_about = None)]
struct Cli {
    /// Process runtime config (YAML/TOML). Defaults to `ETL__`-prefixed
    /// environment variables if omitted.
    #[arg(long, value_name = "FILE", global = true)]
    runtime_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a pipeline and run until SIGINT/SIGTERM.
    Run {
        /// Pipeline spec file (YAML/TOML).
        #[arg(short, long, value_name = "FILE")]
        spec: PathBuf,
    },
    /// Validate a pipeline spec without starting it.
    Validate {
        #[arg(short, long, value_name = "FILE")]
        spec: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime_config = load_runtime_config(cli.runtime_config.as_deref())?;
    init_logging(&runtime_config.runtime.log_level)?;

    match cli.command {
        Commands::Run { spec } => run(spec, runtime_config).await,
        Commands::Validate { spec } => validate(spec),
    }
}

fn load_runtime_config(path: Option<&std::path::Path>) -> Result<RuntimeConfig> {
    match path {
        Some(p) => RuntimeConfig::load(p),
        None => RuntimeConfig::from_env(),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| PipelineError::config(format!("failed to init tracing: {e}")))?;
    Ok(())
}

fn validate(spec_path: PathBuf) -> Result<()> {
    let spec = PipelineSpec::load(&spec_path)?;
    println!("pipeline_id: {}", spec.pipeline_id);
    println!("sources: {}", spec.sources.len());
    println!("join: {}", spec.join.is_some());
    println!("sink table: {}.{}", spec.sink.database, spec.sink.table);
    println!("column mapping entries: {}", spec.sink.column_mapping.len());
    Ok(())
}

async fn run(spec_path: PathBuf, runtime_config: RuntimeConfig) -> Result<()> {
    let spec = PipelineSpec::load(&spec_path)?;
    info!(pipeline_id = %spec.pipeline_id, "loaded pipeline spec");

    let log: Arc<dyn StreamLog> = Arc::new(JetStreamLog::connect(&runtime_config.nats.url).await?);
    let dlq = Arc::new(DlqSubsystem::new(log.clone(), runtime_config.nats.dlq_max_batch_size));

    let pool = create_clickhouse_pool(
        spec.sink.clickhouse.url.clone(),
        spec.sink.database.clone(),
        spec.sink.clickhouse.user.clone(),
        spec.sink.clickhouse.password.clone(),
        spec.sink.clickhouse.pool_size,
    )
    .await
    .map_err(|e| PipelineError::fatal(format!("failed to build clickhouse pool: {e}")))?;

    let supervisor = Supervisor::new(spec, log, dlq, pool);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let result = supervisor.run(shutdown, runtime_config.runtime.shutdown_grace).await;
    if let Err(e) = &result {
        error!(error = %e, "pipeline exited with error");
    }
    result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
