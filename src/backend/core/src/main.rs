//! Jobforge Server - Main entry point
//!
//! Runs a job queue with the built-in handlers until SIGINT/SIGTERM, then
//! drains it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use jobforge_core::{
    config::{Config, CONFIG_PATH_ENV},
    jobs::{register_builtins, JobEvent, JobQueue, ScheduleSpec},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "jobforge-server", version, about = "Background job execution engine")]
struct Args {
    /// Path to a config file (TOML, YAML or JSON)
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Override the number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enqueue sample jobs on startup
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(workers) = args.workers {
        config.queue.workers = workers;
    }
    config.validate()?;

    let telemetry = telemetry::init_telemetry(&config.telemetry())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue.name,
        workers = config.queue.workers,
        "Starting Jobforge Server"
    );

    let queue = Arc::new(JobQueue::from_config(&config)?);
    register_builtins(queue.registry());

    let event_logger = tokio::spawn(log_events(queue.subscribe()));

    queue.start()?;

    if args.demo {
        enqueue_demo_jobs(&queue)?;
    }

    shutdown_signal().await;

    queue.stop().await;
    if let Err(e) = event_logger.await {
        tracing::warn!(error = %e, "Event logger terminated abnormally");
    }

    let stats = queue.get_stats();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        pending = stats.pending,
        scheduled = stats.scheduled,
        "Server shutdown complete"
    );
    telemetry.shutdown();
    Ok(())
}

/// Log every lifecycle event until the queue reports it has stopped.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(JobEvent::Stopped) | Err(RecvError::Closed) => break,
            Ok(event) => {
                tracing::info!(
                    event = event.kind(),
                    job_id = ?event.job_id(),
                    "Job event"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged behind");
            }
        }
    }
}

fn enqueue_demo_jobs(queue: &JobQueue) -> jobforge_core::Result<()> {
    let defaults = queue.job_defaults().clone();

    queue.enqueue("echo", json!({ "message": "hello from jobforge" }), defaults.clone())?;
    queue.enqueue("sleep", json!({ "ms": 250 }), defaults.clone())?;
    queue.enqueue(
        "sleep",
        json!({ "ms": 10, "fail": true }),
        defaults.clone().with_max_retries(1).with_retry_delay(std::time::Duration::from_millis(200)),
    )?;
    queue.schedule(
        "echo",
        json!({ "message": "delayed" }),
        std::time::Duration::from_secs(2),
        defaults.clone(),
    )?;
    queue.schedule_with(
        "echo",
        json!({ "message": "top of the minute" }),
        ScheduleSpec::cron("* * * * *"),
        defaults,
    )?;

    tracing::info!("Demo jobs enqueued");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
