#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use streams::{CheckLog, RedisLog};
use timeseries::{ClickHouseHttp, TimeSeriesSink};
use tracing::{debug, error, info, warn};

mod config;
mod enqueue;
mod error;
mod monitoring;
mod worker;

use config::Config;
use error::AppError;
use monitoring::HttpProber;
use worker::{LoopSettings, Worker};

#[derive(Parser)]
#[command(name = "uppe-worker", version, about = "Regional uptime check worker")]
struct Cli {
    /// TOML configuration file. Environment variables override its values.
    #[arg(short, long, env = "UPPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume check requests for this region until interrupted (default).
    Run,
    /// Append the check requests in a JSON array file to the log.
    Enqueue {
        /// File holding `[{"url": ..., "id": ...}, ...]`.
        file: PathBuf,
    },
    /// Print the region group's pending-entry summary.
    Pending,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;
    debug!("Loaded configuration:\n{}", config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_worker(&config).await,
        Command::Enqueue { file } => {
            let log = connect_log(&config).await?;
            enqueue::enqueue_file(&log, &file, config.tuning.append_chunk_size).await?;
            Ok(())
        }
        Command::Pending => report_pending(&config).await,
    }
}

async fn connect_log(config: &Config) -> Result<RedisLog, AppError> {
    let (settings, stream) = config.log_settings()?;
    Ok(RedisLog::connect(&settings, stream).await?)
}

async fn run_worker(config: &Config) -> Result<(), AppError> {
    let identity = config.identity()?;
    let log = connect_log(config).await?;
    log.ensure_group(&identity.region_id).await?;

    let clickhouse = config.clickhouse_settings()?;
    let store = ClickHouseHttp::new(&clickhouse)?;
    let sink = Arc::new(TimeSeriesSink::new(Arc::new(store), clickhouse.table.clone()));
    let prober = HttpProber::new(config.probe_settings()).map_err(AppError::ProbeSetup)?;

    let worker = Worker::new(
        Arc::new(log),
        sink,
        Arc::new(prober),
        identity,
        LoopSettings::from(&config.tuning),
    );
    worker.run_until(shutdown_signal()).await.map_err(AppError::Worker)
}

async fn report_pending(config: &Config) -> Result<(), AppError> {
    let identity = config.identity()?;
    let log = connect_log(config).await?;
    let summary = log.pending_summary(&identity.region_id).await?;

    info!(
        stream = %log.stream(),
        group = %identity.region_id,
        pending = summary.count,
        backlog = summary.backlog_length,
        lowest = summary.lowest_id.as_deref().unwrap_or("-"),
        highest = summary.highest_id.as_deref().unwrap_or("-"),
        "pending summary"
    );
    for consumer in &summary.consumers {
        info!(consumer = %consumer.consumer, pending = consumer.pending, "consumer backlog");
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing the current cycle");
}
