use std::path::{Path, PathBuf};

use anyhow::Context;
use futures::StreamExt;
use rukh_core::messages::JobEnvelope;
use rukh_planner::sim::{EngineScript, SimulatedEngines};
use rukh_planner::{LogFormat, Planner, PlannerClient, PlannerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Consumer group the binary's own watchers join.
const WATCH_GROUP: &str = "rukh-planner-cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (if present) before reading any config.
    dotenvy::dotenv().ok();

    let config = PlannerConfig::from_env().context("Invalid planner configuration")?;
    init_tracing(config.log_format);

    tracing::info!(
        broker_url = %config.broker_url,
        prefix = %config.topic_prefix,
        simulated_engines = config.simulated_engines,
        "Starting analysis planner"
    );

    // --- Broker ---
    let connect_cancel = CancellationToken::new();
    let channel = rukh_channel::connect_with_backoff(
        || rukh_channel::connect(&config.broker_url, config.broker_config()),
        &config.reconnect_config(),
        &connect_cancel,
    )
    .await
    .with_context(|| format!("Failed to connect to broker at {}", config.broker_url))?;

    // --- Planner ---
    let topics = config.topics();
    let planner = Planner::start(config.clone(), channel.clone())
        .await
        .context("Failed to start planner")?;

    let engines = if config.simulated_engines {
        Some(
            SimulatedEngines::spawn(channel.clone(), topics.clone(), EngineScript::default())
                .await
                .context("Failed to start simulated engines")?,
        )
    } else {
        None
    };

    // --- Watchers and job files ---
    let client = PlannerClient::new(channel.clone(), topics, WATCH_GROUP);
    let job_files: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();

    let watch_cancel = CancellationToken::new();
    let watcher = if job_files.is_empty() {
        None
    } else {
        let mut progress = client.watch_progress(None).await?;
        let mut results = client.watch_results(None).await?;
        let cancel = watch_cancel.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = progress.next() => {
                        tracing::info!(
                            job_id = %event.job_id,
                            phase = %event.phase,
                            progress = event.progress,
                            error = event.error.as_deref(),
                            "Progress",
                        );
                    }
                    Some(result) = results.next() => {
                        tracing::info!(
                            job_id = %result.job_id,
                            status = result.status.as_str(),
                            phases = ?result.phases_completed,
                            error = result.error.as_deref(),
                            "Job result",
                        );
                    }
                    else => break,
                }
            }
        }))
    };

    for path in &job_files {
        let envelope = read_job_file(path)?;
        client.submit_job(&envelope).await?;
    }

    shutdown_signal().await;

    // --- Graceful shutdown ---
    watch_cancel.cancel();
    if let Some(handle) = watcher {
        let _ = handle.await;
    }
    if let Some(engines) = engines {
        engines.shutdown().await;
    }
    planner.shutdown().await;
    channel.close().await;

    tracing::info!("Analysis planner stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rukh_planner=debug,rukh_channel=info".into());

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Read a job envelope from disk. A file without `job_id` gets a fresh one.
fn read_job_file(path: &Path) -> anyhow::Result<JobEnvelope> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Job file {} is not valid JSON", path.display()))?;

    if let Some(object) = value.as_object_mut() {
        object
            .entry("job_id")
            .or_insert_with(|| PlannerClient::generate_job_id().into());
    }
    serde_json::from_value(value)
        .with_context(|| format!("Job file {} is not a job envelope", path.display()))
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
