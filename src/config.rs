//! Environment-driven service configuration

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Maximum number of jobs allowed to wait in the queue
    pub max_queue_size: usize,
    /// Upper bound on concurrent chunk analyses within one job
    pub max_concurrent_chunks: usize,
    /// Maximum in-flight generate calls per credential
    pub per_cred_cap: u32,
    /// Cooldown applied to a credential after a rate-limit signal
    pub rate_limit_cooldown: Duration,
    /// Target chunk length in minutes
    pub chunk_size_minutes: u64,
    /// Read-only context appended to each non-terminal chunk
    pub chunk_overlap_seconds: u64,
    /// Ingress hint: files above this size get chunked automatically
    pub auto_chunk_threshold_mb: u64,
    /// Opaque Analysis Service credentials
    pub credentials: Vec<String>,
    /// Scratch directory for per-job video files
    pub temp_video_dir: PathBuf,
    /// Durable queue store URL (`redis://` or `rediss://`)
    pub queue_url: String,
    /// Analysis Service base URL
    pub analysis_base_url: String,
    /// Soft deadline for one job end to end
    pub job_soft_deadline: Duration,
    /// Active leases older than this are reclaimed by the sweeper
    pub lease_timeout: Duration,
    /// Maximum lifecycle entries per job before it fails terminally
    pub max_job_attempts: u32,
    /// Base delay for job retry backoff (doubles per attempt)
    pub retry_base_delay: Duration,
    /// How long a chunk work unit waits for a credential
    pub pool_acquire_timeout: Duration,
}

impl AppConfig {
    /// Resolve configuration from the process environment.
    ///
    /// Numeric variables fall back to their defaults on parse failure with a
    /// logged warning; the credential list, queue URL, temp directory and
    /// service URL have no sensible defaults and fail startup when absent.
    pub fn from_env() -> Result<Self> {
        let credentials: Vec<String> = std::env::var("CREDENTIALS")
            .context("CREDENTIALS is not set")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if credentials.is_empty() {
            bail!("CREDENTIALS is set but contains no usable entries");
        }

        let temp_video_dir =
            PathBuf::from(std::env::var("TEMP_VIDEO_DIR").context("TEMP_VIDEO_DIR is not set")?);
        let queue_url = std::env::var("QUEUE_URL").context("QUEUE_URL is not set")?;
        let analysis_base_url =
            std::env::var("ANALYSIS_BASE_URL").context("ANALYSIS_BASE_URL is not set")?;

        Ok(Self {
            max_queue_size: env_or("MAX_QUEUE_SIZE", 10),
            max_concurrent_chunks: env_or("MAX_CONCURRENT_CHUNKS", 12),
            per_cred_cap: env_or("PER_CRED_CAP", 3u32).max(1),
            rate_limit_cooldown: Duration::from_millis(env_or("RATE_LIMIT_COOLDOWN_MS", 60_000u64)),
            chunk_size_minutes: env_or("CHUNK_SIZE_MINUTES", 20u64).max(1),
            chunk_overlap_seconds: env_or("CHUNK_OVERLAP_SECONDS", 5u64),
            auto_chunk_threshold_mb: env_or("AUTO_CHUNK_THRESHOLD_MB", 500u64),
            credentials,
            temp_video_dir,
            queue_url,
            analysis_base_url,
            job_soft_deadline: Duration::from_secs(env_or("JOB_SOFT_DEADLINE_SECS", 900u64)),
            lease_timeout: Duration::from_secs(env_or("LEASE_TIMEOUT_SECS", 600u64)),
            max_job_attempts: env_or("MAX_JOB_ATTEMPTS", 3u32),
            retry_base_delay: Duration::from_secs(env_or("RETRY_BASE_DELAY_SECS", 30u64)),
            pool_acquire_timeout: Duration::from_secs(env_or("POOL_ACQUIRE_TIMEOUT_SECS", 120u64)),
        })
    }

    /// Target chunk length in seconds.
    pub fn chunk_target_secs(&self) -> u64 {
        self.chunk_size_minutes * 60
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    target: "config",
                    var = name,
                    raw = %raw,
                    default = %default,
                    "Unparseable value, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
