//! Bounded durable FIFO job queue.
//!
//! Jobs persist in the durable store; the queue enforces the waiting bound,
//! enforces monotonic progress publication, schedules retry backoff, applies
//! terminal retention, and reclaims stale leases left by crashed workers.

pub mod models;
mod redis_store;
mod store;

pub use models::{
    Job, JobProgress, JobStage, JobState, MAX_FILE_SIZE, ProgressEvent,
};
pub use redis_store::RedisJobStore;
pub use store::{JobStore, MemoryJobStore, StoreError};

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long one blocking lease poll runs before re-checking shutdown
const LEASE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs allowed in the waiting list
    pub max_waiting: usize,
    /// Lifecycle entries per job before a retriable failure turns terminal
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Active leases older than this are reclaimed
    pub lease_timeout: Duration,
    pub keep_succeeded: usize,
    pub keep_failed: usize,
    /// Succeeded records older than this are purged
    pub succeeded_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_waiting: 10,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(600),
            lease_timeout: Duration::from_secs(600),
            keep_succeeded: 100,
            keep_failed: 50,
            succeeded_retention: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("queue is full ({waiting} jobs waiting, limit {limit})")]
    QueueFull { waiting: usize, limit: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingress submission; the queue assigns the job id
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source_path: PathBuf,
    pub display_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub model_id: String,
    pub submitter_id: String,
    pub submitter_label: Option<String>,
    pub chat_ref: String,
    pub reply_ref: String,
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub job_id: String,
    /// 1-based position among waiting jobs
    pub position: usize,
}

/// What `ack_failure` decided to do with the job
#[derive(Debug)]
pub enum FailureDisposition {
    Retried { attempt: u32, delay: Duration },
    Terminal,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub job_id: String,
    pub position: usize,
}

#[derive(Debug, Clone, Default)]
pub struct UserStatus {
    pub active_job: Option<String>,
    pub waiting: Vec<WaitingEntry>,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    /// Last published `(stage_rank, percent)` per job, for monotonicity
    last_progress: DashMap<String, (u8, u8)>,
    shutting_down: AtomicBool,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            last_progress: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            housekeeper: Mutex::new(None),
        })
    }

    /// Validate and enqueue one job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SubmitError::InputInvalid("queue is shutting down".into()));
        }
        if !request.mime_type.starts_with("video/") {
            return Err(SubmitError::InputInvalid(format!(
                "unsupported media type {}",
                request.mime_type
            )));
        }
        if request.size_bytes == 0 || request.size_bytes > MAX_FILE_SIZE {
            return Err(SubmitError::InputInvalid(format!(
                "file size {} outside the accepted range (max 1 GB)",
                request.size_bytes
            )));
        }
        if !request.source_path.exists() {
            return Err(SubmitError::InputInvalid(format!(
                "source file {} does not exist",
                request.source_path.display()
            )));
        }

        let waiting = self.store.waiting_ids().await?.len();
        if waiting >= self.config.max_waiting {
            return Err(SubmitError::QueueFull {
                waiting,
                limit: self.config.max_waiting,
            });
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            chat_ref: request.chat_ref,
            reply_ref: request.reply_ref,
            source_path: request.source_path,
            display_name: request.display_name,
            mime_type: request.mime_type,
            size_bytes: request.size_bytes,
            model_id: request.model_id,
            submitter_id: request.submitter_id,
            submitter_label: request.submitter_label,
            enqueued_at: Utc::now(),
            state: JobState::Queued,
            attempts: 0,
            leased_at: None,
            next_attempt_at: None,
            finished_at: None,
        };

        self.store.put_job(&job).await?;
        self.store.push_waiting(&job.id).await?;
        let position = self.waiting_position(&job.id).await?.unwrap_or(waiting + 1);

        info!(
            target: "queue",
            job_id = %job.id,
            file = %job.display_name,
            position,
            "Job enqueued"
        );

        let progress = JobProgress::new(
            JobStage::Queued,
            0,
            format!("Queued at position {position}"),
        );
        self.publish_progress(&job.id, progress).await?;

        Ok(SubmitReceipt {
            job_id: job.id,
            position,
        })
    }

    /// Block until a job can be leased. Returns `None` once shutdown begins.
    pub async fn lease(&self) -> Result<Option<Job>, StoreError> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let Some(job_id) = self.store.lease_next(LEASE_POLL).await? else {
                continue;
            };

            let Some(mut job) = self.store.get_job(&job_id).await? else {
                // Record purged while the id sat in the list; drop the lease
                warn!(target: "queue", job_id = %job_id, "Leased id without a record, discarding");
                self.store.remove_active(&job_id).await?;
                continue;
            };

            if let Some(next_attempt_at) = job.next_attempt_at {
                let now = Utc::now();
                if next_attempt_at > now {
                    // Backoff window still open; rotate the job to the tail
                    // so other waiting jobs go first, and wait a beat
                    self.store.remove_active(&job_id).await?;
                    self.store.push_waiting(&job_id).await?;
                    let remaining = (next_attempt_at - now).to_std().unwrap_or_default();
                    tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
                    continue;
                }
            }

            job.state = JobState::Active;
            job.leased_at = Some(Utc::now());
            job.next_attempt_at = None;
            self.store.put_job(&job).await?;

            debug!(target: "queue", job_id = %job.id, attempts = job.attempts, "Job leased");
            return Ok(Some(job));
        }
    }

    pub async fn ack_success(&self, job_id: &str) -> Result<(), StoreError> {
        self.finish_job(job_id, JobState::Succeeded).await
    }

    /// Terminal or retriable failure. On a retriable failure under the
    /// attempt budget the job re-enters the waiting list after
    /// `base_delay * 2^attempt`, capped; otherwise it lands in the failed
    /// retention list and the single terminal error event is published.
    pub async fn ack_failure(
        &self,
        job_id: &str,
        message: &str,
        retriable: bool,
    ) -> Result<FailureDisposition, StoreError> {
        self.store.remove_active(job_id).await?;
        let Some(mut job) = self.store.get_job(job_id).await? else {
            warn!(target: "queue", job_id = %job_id, "Acking failure for unknown job");
            return Ok(FailureDisposition::Terminal);
        };

        if retriable && job.attempts + 1 < self.config.max_attempts {
            let exponent = (job.attempts + 1).min(10);
            let delay = self
                .config
                .retry_base_delay
                .saturating_mul(1 << exponent)
                .min(self.config.retry_max_delay);

            // Re-enqueue synchronously: the job must already sit in the
            // waiting list when this call returns, so a crash during the
            // backoff cannot orphan it. The lease path enforces the delay
            // via `next_attempt_at`.
            job.attempts += 1;
            job.state = JobState::Queued;
            job.leased_at = None;
            job.next_attempt_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600)),
            );
            self.store.put_job(&job).await?;
            self.store.push_waiting_front(&job.id).await?;
            self.last_progress.remove(job_id);

            warn!(
                target: "queue",
                job_id = %job_id,
                attempt = job.attempts,
                delay_s = delay.as_secs(),
                error = message,
                "Job failed, queued for retry after backoff"
            );

            return Ok(FailureDisposition::Retried {
                attempt: job.attempts,
                delay,
            });
        }

        job.state = JobState::Failed;
        job.finished_at = Some(Utc::now());
        self.store.put_job(&job).await?;
        self.retain_terminal(job_id, false).await?;
        self.last_progress.remove(job_id);

        self.store
            .publish_event(&ProgressEvent::Error {
                job_id: job_id.to_string(),
                message: message.to_string(),
            })
            .await?;

        info!(target: "queue", job_id = %job_id, error = message, "Job failed terminally");
        Ok(FailureDisposition::Terminal)
    }

    /// Terminal cancellation; publishes the single `error` event.
    pub async fn ack_cancelled(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.remove_active(job_id).await?;
        if let Some(mut job) = self.store.get_job(job_id).await? {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
            self.store.put_job(&job).await?;
        }
        self.retain_terminal(job_id, false).await?;
        self.last_progress.remove(job_id);
        self.store
            .publish_event(&ProgressEvent::Error {
                job_id: job_id.to_string(),
                message: "cancelled".to_string(),
            })
            .await
    }

    /// Publish a progress snapshot, enforcing monotonic `(stage, percent)`.
    pub async fn publish_progress(
        &self,
        job_id: &str,
        progress: JobProgress,
    ) -> Result<(), StoreError> {
        let key = progress.monotonic_key();
        if progress.stage != JobStage::Error {
            if let Some(last) = self.last_progress.get(job_id) {
                if key < *last {
                    debug!(
                        target: "queue",
                        job_id = %job_id,
                        stage = ?progress.stage,
                        percent = progress.percent,
                        "Dropping non-monotonic progress update"
                    );
                    return Ok(());
                }
            }
        }
        self.last_progress.insert(job_id.to_string(), key);

        self.store
            .publish_event(&ProgressEvent::Progress {
                job_id: job_id.to_string(),
                stage: progress.stage,
                percent: progress.percent,
                message: progress.message,
                eta: progress.eta_seconds,
            })
            .await
    }

    /// Publish the job's result artifact.
    pub async fn publish_result(
        &self,
        job_id: &str,
        artifact: crate::merger::MergedArtifact,
    ) -> Result<(), StoreError> {
        self.store
            .publish_event(&ProgressEvent::Result {
                job_id: job_id.to_string(),
                artifact: Box::new(artifact),
            })
            .await
    }

    /// Queue view for one submitter.
    pub async fn status(&self, user_id: &str) -> Result<UserStatus, StoreError> {
        let mut status = UserStatus::default();

        for job_id in self.store.active_ids().await? {
            if let Some(job) = self.store.get_job(&job_id).await? {
                if job.submitter_id == user_id {
                    status.active_job = Some(job_id);
                    break;
                }
            }
        }

        for (index, job_id) in self.store.waiting_ids().await?.iter().enumerate() {
            if let Some(job) = self.store.get_job(job_id).await? {
                if job.submitter_id == user_id {
                    status.waiting.push(WaitingEntry {
                        job_id: job_id.clone(),
                        position: index + 1,
                    });
                }
            }
        }

        Ok(status)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        Ok(QueueStats {
            waiting: self.store.waiting_ids().await?.len(),
            active: self.store.active_ids().await?.len(),
            succeeded: self.store.terminal_ids(true).await?.len(),
            failed: self.store.terminal_ids(false).await?.len(),
        })
    }

    /// Boot-time resume after a process restart.
    ///
    /// Re-validates every waiting entry, resets its state, and re-publishes
    /// its queue position so subscribers reconnect to a live picture; then
    /// runs one housekeeping pass so leases orphaned by the previous process
    /// are reclaimed on their timeout rather than on the first timer tick.
    pub async fn resume_incomplete_jobs(&self) -> Result<(), StoreError> {
        let mut position = 0usize;
        let mut resumed = 0usize;
        for job_id in self.store.waiting_ids().await? {
            let Some(mut job) = self.store.get_job(&job_id).await? else {
                // The lease path discards dangling ids when it meets them
                warn!(
                    target: "queue",
                    job_id = %job_id,
                    "Waiting entry without a record, leaving for lease-time discard"
                );
                continue;
            };
            position += 1;

            if job.state != JobState::Queued || job.leased_at.is_some() {
                job.state = JobState::Queued;
                job.leased_at = None;
                self.store.put_job(&job).await?;
            }

            self.publish_progress(
                &job_id,
                JobProgress::new(
                    JobStage::Queued,
                    0,
                    format!("Queued at position {position}"),
                ),
            )
            .await?;
            resumed += 1;
        }

        if resumed > 0 {
            info!(
                target: "queue",
                count = resumed,
                "Resumed waiting jobs from the durable store"
            );
        }

        self.housekeep().await
    }

    /// One housekeeping pass: reclaim stale leases, purge aged records.
    pub async fn housekeep(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let lease_timeout = chrono::Duration::from_std(self.config.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        for job_id in self.store.active_ids().await? {
            let Some(mut job) = self.store.get_job(&job_id).await? else {
                self.store.remove_active(&job_id).await?;
                continue;
            };
            let stale = job
                .leased_at
                .map(|at| now - at > lease_timeout)
                .unwrap_or(true);
            if !stale {
                continue;
            }

            if job.attempts + 1 >= self.config.max_attempts {
                warn!(
                    target: "queue",
                    job_id = %job_id,
                    attempts = job.attempts,
                    "Stale lease with exhausted attempts, failing job"
                );
                self.ack_failure(&job_id, "worker lost the job repeatedly", false)
                    .await?;
                continue;
            }

            job.attempts += 1;
            job.state = JobState::Queued;
            job.leased_at = None;
            self.store.put_job(&job).await?;
            if self.store.requeue_active(&job_id).await? {
                self.last_progress.remove(&job_id);
                warn!(
                    target: "queue",
                    job_id = %job_id,
                    attempt = job.attempts,
                    "Reclaimed stale lease, job returned to waiting"
                );
            }
        }

        let retention = chrono::Duration::from_std(self.config.succeeded_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        for job_id in self.store.terminal_ids(true).await? {
            let expired = match self.store.get_job(&job_id).await? {
                Some(job) => job
                    .finished_at
                    .map(|at| now - at > retention)
                    .unwrap_or(true),
                None => true,
            };
            if expired {
                self.store.remove_terminal(&job_id, true).await?;
                self.store.delete_job(&job_id).await?;
                debug!(target: "queue", job_id = %job_id, "Purged aged succeeded record");
            }
        }

        Ok(())
    }

    /// Run housekeeping every `interval` until the token cancels.
    pub async fn spawn_housekeeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = queue.housekeep().await {
                            warn!(target: "queue", error = %err, "Housekeeping pass failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        *self.housekeeper.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.housekeeper.lock().await.take() {
            handle.abort();
        }
        info!(target: "queue", "Job queue shut down");
    }

    async fn finish_job(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        self.store.remove_active(job_id).await?;
        if let Some(mut job) = self.store.get_job(job_id).await? {
            job.state = state;
            job.finished_at = Some(Utc::now());
            self.store.put_job(&job).await?;
        }
        self.retain_terminal(job_id, state == JobState::Succeeded)
            .await?;
        self.last_progress.remove(job_id);
        Ok(())
    }

    async fn retain_terminal(&self, job_id: &str, succeeded: bool) -> Result<(), StoreError> {
        let keep = if succeeded {
            self.config.keep_succeeded
        } else {
            self.config.keep_failed
        };
        let evicted = self.store.push_terminal(job_id, succeeded, keep).await?;
        for old_id in evicted {
            self.store.delete_job(&old_id).await?;
        }
        Ok(())
    }

    async fn waiting_position(&self, job_id: &str) -> Result<Option<usize>, StoreError> {
        Ok(self
            .store
            .waiting_ids()
            .await?
            .iter()
            .position(|id| id == job_id)
            .map(|index| index + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config() -> QueueConfig {
        QueueConfig {
            max_waiting: 2,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(100),
            lease_timeout: Duration::from_millis(50),
            keep_succeeded: 3,
            keep_failed: 2,
            succeeded_retention: Duration::from_secs(24 * 3600),
        }
    }

    fn queue_with_store() -> (Arc<JobQueue>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = JobQueue::new(store.clone(), test_config());
        (queue, store)
    }

    fn request_for(file: &tempfile::NamedTempFile, user: &str) -> SubmitRequest {
        SubmitRequest {
            source_path: file.path().to_path_buf(),
            display_name: "lecture.mp4".into(),
            size_bytes: 4096,
            mime_type: "video/mp4".into(),
            model_id: "analyst-1".into(),
            submitter_id: user.into(),
            submitter_label: None,
            chat_ref: "chat-1".into(),
            reply_ref: "msg-1".into(),
        }
    }

    fn video_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not really a video").unwrap();
        file
    }

    #[tokio::test]
    async fn submit_assigns_position_and_publishes_queued() {
        let (queue, store) = queue_with_store();
        let file = video_file();

        let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();
        assert_eq!(receipt.position, 1);

        let second = queue.submit(request_for(&file, "u2")).await.unwrap();
        assert_eq!(second.position, 2);

        let events = store.published_events();
        assert!(matches!(
            &events[0],
            ProgressEvent::Progress { stage: JobStage::Queued, .. }
        ));
    }

    #[tokio::test]
    async fn queue_full_rejects_excess_submissions() {
        let (queue, _store) = queue_with_store();
        let file = video_file();

        queue.submit(request_for(&file, "u1")).await.unwrap();
        queue.submit(request_for(&file, "u1")).await.unwrap();
        let err = queue.submit(request_for(&file, "u1")).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::QueueFull { waiting: 2, limit: 2 }
        ));

        // Draining one slot makes the next submission succeed
        let job = queue.lease().await.unwrap().unwrap();
        queue.ack_success(&job.id).await.unwrap();
        queue.submit(request_for(&file, "u1")).await.unwrap();
    }

    #[tokio::test]
    async fn submit_validates_input() {
        let (queue, _store) = queue_with_store();
        let file = video_file();

        let mut bad_mime = request_for(&file, "u1");
        bad_mime.mime_type = "application/pdf".into();
        assert!(matches!(
            queue.submit(bad_mime).await.unwrap_err(),
            SubmitError::InputInvalid(_)
        ));

        let mut too_big = request_for(&file, "u1");
        too_big.size_bytes = MAX_FILE_SIZE + 1;
        assert!(matches!(
            queue.submit(too_big).await.unwrap_err(),
            SubmitError::InputInvalid(_)
        ));

        let mut missing = request_for(&file, "u1");
        missing.source_path = PathBuf::from("/definitely/not/here.mp4");
        assert!(matches!(
            queue.submit(missing).await.unwrap_err(),
            SubmitError::InputInvalid(_)
        ));
    }

    #[tokio::test]
    async fn lease_marks_job_active() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();

        let job = queue.lease().await.unwrap().unwrap();
        assert_eq!(job.id, receipt.job_id);
        assert_eq!(job.state, JobState::Active);
        assert!(job.leased_at.is_some());
        assert_eq!(store.active_ids().await.unwrap(), vec![job.id.clone()]);
    }

    #[tokio::test]
    async fn retriable_failure_reenters_waiting_synchronously() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();
        let job = queue.lease().await.unwrap().unwrap();

        let disposition = queue
            .ack_failure(&job.id, "credential pool exhausted", true)
            .await
            .unwrap();
        assert!(matches!(
            disposition,
            FailureDisposition::Retried { attempt: 1, .. }
        ));

        // The job sits in the waiting list before ack_failure returns; a
        // crash during the backoff cannot orphan it
        assert_eq!(store.waiting_ids().await.unwrap(), vec![receipt.job_id.clone()]);
        let stored = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.state, JobState::Queued);
        assert!(stored.next_attempt_at.is_some());

        // The lease path waits out the backoff window, then clears it
        let retried = queue.lease().await.unwrap().unwrap();
        assert_eq!(retried.id, receipt.job_id);
        assert_eq!(retried.state, JobState::Active);
        assert!(retried.next_attempt_at.is_none());
        assert!(stored.next_attempt_at.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn exhausted_attempts_turn_terminal() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        queue.submit(request_for(&file, "u1")).await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            // lease() itself waits out each retry's backoff window
            let job = queue.lease().await.unwrap().unwrap();
            last = Some(
                queue
                    .ack_failure(&job.id, "still broken", true)
                    .await
                    .unwrap(),
            );
        }
        assert!(matches!(last, Some(FailureDisposition::Terminal)));

        let events = store.published_events();
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn non_retriable_failure_publishes_single_error_event() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        queue.submit(request_for(&file, "u1")).await.unwrap();
        let job = queue.lease().await.unwrap().unwrap();

        let disposition = queue
            .ack_failure(&job.id, "file intake failed: corrupt container", false)
            .await
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::Terminal));

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);

        let errors: Vec<_> = store
            .published_events()
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic_per_job() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();

        queue
            .publish_progress(
                &receipt.job_id,
                JobProgress::new(JobStage::Analyzing, 60, "chunk 3/5"),
            )
            .await
            .unwrap();
        // Regression: lower percent in the same stage is dropped
        queue
            .publish_progress(
                &receipt.job_id,
                JobProgress::new(JobStage::Analyzing, 40, "stale"),
            )
            .await
            .unwrap();
        // Terminal error is always allowed through
        queue
            .publish_progress(
                &receipt.job_id,
                JobProgress::new(JobStage::Error, 0, "boom"),
            )
            .await
            .unwrap();

        let stages: Vec<(JobStage, u8)> = store
            .published_events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Progress { stage, percent, .. } => Some((stage, percent)),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                (JobStage::Queued, 0),
                (JobStage::Analyzing, 60),
                (JobStage::Error, 0),
            ]
        );
    }

    #[tokio::test]
    async fn stale_leases_are_reclaimed() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();
        queue.lease().await.unwrap().unwrap();

        // Backdate the lease beyond the timeout
        let mut job = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        job.leased_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.put_job(&job).await.unwrap();

        queue.housekeep().await.unwrap();

        assert_eq!(store.waiting_ids().await.unwrap(), vec![receipt.job_id.clone()]);
        assert!(store.active_ids().await.unwrap().is_empty());
        let job = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn boot_resume_republishes_waiting_and_reclaims_stale_actives() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        let active = queue.submit(request_for(&file, "u1")).await.unwrap();
        let waiting = queue.submit(request_for(&file, "u2")).await.unwrap();
        queue.lease().await.unwrap().unwrap();

        // Simulate the previous process dying mid-job
        let mut job = store.get_job(&active.job_id).await.unwrap().unwrap();
        job.leased_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.put_job(&job).await.unwrap();

        // A fresh process over the same store resumes cleanly
        let restarted = JobQueue::new(store.clone(), test_config());
        restarted.resume_incomplete_jobs().await.unwrap();

        // The waiting job's position was re-published
        let queued_for_waiting = store
            .published_events()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    ProgressEvent::Progress { job_id, stage: JobStage::Queued, .. }
                        if *job_id == waiting.job_id
                )
            })
            .count();
        assert_eq!(queued_for_waiting, 2);

        // The orphaned lease went back to waiting with an attempt recorded
        assert!(store.active_ids().await.unwrap().is_empty());
        let ids = store.waiting_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&active.job_id));
        let reclaimed = store.get_job(&active.job_id).await.unwrap().unwrap();
        assert_eq!(reclaimed.state, JobState::Queued);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn succeeded_retention_trims_and_purges() {
        let (queue, store) = queue_with_store();
        let file = video_file();

        // keep_succeeded is 3; the fourth success evicts the oldest record
        let mut ids = Vec::new();
        for _ in 0..4 {
            let receipt = queue.submit(request_for(&file, "u1")).await.unwrap();
            let job = queue.lease().await.unwrap().unwrap();
            queue.ack_success(&job.id).await.unwrap();
            ids.push(receipt.job_id);
        }

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.succeeded, 3);
        assert!(store.get_job(&ids[0]).await.unwrap().is_none());
        assert!(store.get_job(&ids[3]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_job_publishes_cancelled_error() {
        let (queue, store) = queue_with_store();
        let file = video_file();
        queue.submit(request_for(&file, "u1")).await.unwrap();
        let job = queue.lease().await.unwrap().unwrap();

        queue.ack_cancelled(&job.id).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        let events = store.published_events();
        assert!(events.iter().any(|event| matches!(
            event,
            ProgressEvent::Error { message, .. } if message == "cancelled"
        )));
    }

    #[tokio::test]
    async fn status_reports_per_user_view() {
        let (queue, _store) = queue_with_store();
        let file = video_file();
        let first = queue.submit(request_for(&file, "u1")).await.unwrap();
        let second = queue.submit(request_for(&file, "u2")).await.unwrap();

        let active = queue.lease().await.unwrap().unwrap();
        assert_eq!(active.id, first.job_id);

        let status = queue.status("u1").await.unwrap();
        assert_eq!(status.active_job, Some(first.job_id.clone()));
        assert!(status.waiting.is_empty());

        let status = queue.status("u2").await.unwrap();
        assert!(status.active_job.is_none());
        assert_eq!(status.waiting.len(), 1);
        assert_eq!(status.waiting[0].job_id, second.job_id);
        assert_eq!(status.waiting[0].position, 1);
    }
}
