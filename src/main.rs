use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use vidsift::analyzer::{AnalyzerConfig, ChunkScheduler};
use vidsift::config::AppConfig;
use vidsift::logging::{self, LogConfig};
use vidsift::pool::{CredentialPool, PoolConfig};
use vidsift::queue::{JobQueue, QueueConfig, RedisJobStore};
use vidsift::trimmer::FfmpegTrimmer;
use vidsift::uploader::{Uploader, UploaderConfig};
use vidsift::worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Guard must live until exit so file logs flush
    let _log_guard = logging::init_logging(LogConfig::default())
        .context("Failed to initialize logging system")?;

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    tokio::fs::create_dir_all(&config.temp_video_dir)
        .await
        .context("Failed to create temp video directory")?;

    tracing::info!(
        target: "main",
        credentials = config.credentials.len(),
        max_queue = config.max_queue_size,
        chunk_minutes = config.chunk_size_minutes,
        "Starting vidsift service"
    );

    let store = RedisJobStore::connect(&config.queue_url)
        .await
        .context("Failed to connect to the durable queue store")?;
    let queue = JobQueue::new(
        Arc::new(store),
        QueueConfig {
            max_waiting: config.max_queue_size,
            max_attempts: config.max_job_attempts,
            retry_base_delay: config.retry_base_delay,
            lease_timeout: config.lease_timeout,
            ..QueueConfig::default()
        },
    );

    // Resume state left by a previous process before taking new work
    if let Err(err) = queue.resume_incomplete_jobs().await {
        tracing::warn!(
            target: "main",
            error = %err,
            "Failed to resume jobs from the durable store"
        );
    }

    let pool = CredentialPool::new(
        config.credentials.clone(),
        PoolConfig {
            per_cred_cap: config.per_cred_cap,
            cooldown: config.rate_limit_cooldown,
        },
    );

    let api = Arc::new(
        analysis_api::Client::new(&config.analysis_base_url)
            .context("Failed to create analysis service client")?,
    );
    let uploader = Arc::new(Uploader::new(Arc::clone(&api), UploaderConfig::default()));
    let scheduler = Arc::new(ChunkScheduler::new(
        Arc::clone(&api),
        Arc::clone(&pool),
        AnalyzerConfig {
            max_concurrency: config.max_concurrent_chunks,
            acquire_timeout: config.pool_acquire_timeout,
            ..AnalyzerConfig::default()
        },
    ));

    let shutdown = CancellationToken::new();
    queue
        .spawn_housekeeper(Duration::from_secs(30), shutdown.clone())
        .await;

    let worker = Worker::new(
        Arc::clone(&queue),
        pool,
        uploader,
        scheduler,
        Arc::new(FfmpegTrimmer),
        WorkerConfig {
            chunk_target_s: config.chunk_target_secs(),
            chunk_overlap_s: config.chunk_overlap_seconds,
            job_soft_deadline: config.job_soft_deadline,
            temp_dir: config.temp_video_dir.clone(),
        },
        shutdown.clone(),
    );

    let worker_handle = tokio::spawn(async move { worker.run().await });

    shutdown_signal().await;
    tracing::info!(target: "main", "Shutting down gracefully");

    shutdown.cancel();
    queue.shutdown().await;
    let _ = worker_handle.await;

    tracing::info!(target: "main", "Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }
}
