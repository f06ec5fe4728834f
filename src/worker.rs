//! Job execution pipeline.
//!
//! A worker leases one job at a time and drives it end to end: per-credential
//! uploads, chunk planning, the parallel analysis fan-out, merging, the
//! optional trim, result publication and temp-file cleanup. Failures are
//! classified and acked back to the queue with a retriable flag.

use crate::analyzer::{
    AnalysisError, ChunkResult, ChunkScheduler, ParallelProgress, ScheduleEvents, ScheduleRequest,
};
use crate::merger;
use crate::planner;
use crate::pool::CredentialPool;
use crate::queue::{FailureDisposition, Job, JobProgress, JobQueue, JobStage, MAX_FILE_SIZE};
use crate::trimmer::{TrimSegment, Trimmer};
use crate::uploader::{
    FnTransferProgress, NoTransferProgress, TransferProgress, Uploader, UploadError, format_bytes,
};
use analysis_api::api::{FilesApi, GenerateApi};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period before a delivered trim artifact is removed from disk
const TRIM_CLEANUP_GRACE: Duration = Duration::from_secs(60);

/// Progress band for the upload phase
const UPLOAD_BAND: (u8, u8) = (10, 40);
/// Progress band the scheduler's percent maps into
const ANALYZE_BAND: (u8, u8) = (42, 90);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub chunk_target_s: u64,
    pub chunk_overlap_s: u64,
    pub job_soft_deadline: Duration,
    pub temp_dir: PathBuf,
}

/// Internal failure classification for one job run
#[derive(Debug)]
enum JobFailure {
    Cancelled,
    Fatal(String),
    Retriable(String),
}

impl From<UploadError> for JobFailure {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Cancelled => JobFailure::Cancelled,
            err if err.is_retriable() => JobFailure::Retriable(err.to_string()),
            err => JobFailure::Fatal(err.to_string()),
        }
    }
}

/// Runs leased jobs one at a time
pub struct Worker<A> {
    queue: Arc<JobQueue>,
    pool: Arc<CredentialPool>,
    uploader: Arc<Uploader<A>>,
    scheduler: Arc<ChunkScheduler<A>>,
    trimmer: Arc<dyn Trimmer>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl<A> Worker<A>
where
    A: FilesApi + GenerateApi + Send + Sync + 'static,
{
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<CredentialPool>,
        uploader: Arc<Uploader<A>>,
        scheduler: Arc<ChunkScheduler<A>>,
        trimmer: Arc<dyn Trimmer>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            pool,
            uploader,
            scheduler,
            trimmer,
            config,
            cancel,
        }
    }

    /// Lease and execute jobs until shutdown.
    pub async fn run(&self) {
        info!(target: "worker", "Worker started");
        loop {
            let leased = tokio::select! {
                _ = self.cancel.cancelled() => break,
                leased = self.queue.lease() => leased,
            };
            match leased {
                Ok(Some(job)) => self.handle_job(job).await,
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "worker", error = %err, "Lease failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(target: "worker", "Worker stopped");
    }

    async fn handle_job(&self, job: Job) {
        info!(
            target: "worker",
            job_id = %job.id,
            file = %job.display_name,
            size = %format_bytes(job.size_bytes),
            attempt = job.attempts,
            "Executing job"
        );

        // Size is validated at submit; re-check at lease so a corrupted
        // record cannot drag a worker into an oversized upload
        let result = if job.size_bytes > MAX_FILE_SIZE {
            Err(JobFailure::Fatal(format!(
                "file size {} exceeds the 1 GB limit",
                format_bytes(job.size_bytes)
            )))
        } else {
            match tokio::time::timeout(self.config.job_soft_deadline, self.execute(&job)).await {
                Ok(result) => result,
                Err(_) => Err(JobFailure::Retriable(format!(
                    "job exceeded its {}s deadline",
                    self.config.job_soft_deadline.as_secs()
                ))),
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.queue.ack_success(&job.id).await {
                    error!(target: "worker", job_id = %job.id, error = %err, "Failed to ack success");
                }
                info!(target: "worker", job_id = %job.id, "Job completed");
            }
            Err(JobFailure::Cancelled) => {
                if let Err(err) = self.queue.ack_cancelled(&job.id).await {
                    error!(target: "worker", job_id = %job.id, error = %err, "Failed to ack cancellation");
                }
                info!(target: "worker", job_id = %job.id, "Job cancelled");
            }
            Err(failure) => {
                let (message, retriable) = match &failure {
                    JobFailure::Fatal(message) => (message.clone(), false),
                    JobFailure::Retriable(message) => (message.clone(), true),
                    JobFailure::Cancelled => unreachable!(),
                };
                error!(
                    target: "worker",
                    job_id = %job.id,
                    retriable,
                    error = %message,
                    "Job failed"
                );
                match self.queue.ack_failure(&job.id, &message, retriable).await {
                    Ok(FailureDisposition::Terminal) => {
                        let progress = JobProgress::new(JobStage::Error, 0, message);
                        if let Err(err) = self.queue.publish_progress(&job.id, progress).await {
                            warn!(target: "worker", job_id = %job.id, error = %err, "Failed to publish error stage");
                        }
                    }
                    Ok(FailureDisposition::Retried { attempt, delay }) => {
                        debug!(
                            target: "worker",
                            job_id = %job.id,
                            attempt,
                            delay_s = delay.as_secs(),
                            "Job queued for retry"
                        );
                    }
                    Err(err) => {
                        error!(target: "worker", job_id = %job.id, error = %err, "Failed to ack failure");
                    }
                }
            }
        }

        self.cleanup_source(&job).await;
    }

    async fn execute(&self, job: &Job) -> Result<(), JobFailure> {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<JobProgress>();

        // Single forwarder keeps progress publication ordered
        let forwarder = {
            let queue = Arc::clone(&self.queue);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    if let Err(err) = queue.publish_progress(&job_id, progress).await {
                        warn!(target: "worker", job_id = %job_id, error = %err, "Progress publish failed");
                    }
                }
            })
        };

        let result = self.run_pipeline(job, &tx, started).await;

        drop(tx);
        let _ = forwarder.await;
        result
    }

    async fn run_pipeline(
        &self,
        job: &Job,
        tx: &UnboundedSender<JobProgress>,
        started: Instant,
    ) -> Result<(), JobFailure> {
        self.check_cancelled()?;
        send(tx, JobProgress::new(JobStage::Uploading, UPLOAD_BAND.0, "Uploading video to the analysis service"));

        let file_refs = self.upload_per_credential(job, tx).await?;

        self.check_cancelled()?;
        send(tx, JobProgress::new(JobStage::Processing, UPLOAD_BAND.1, "Upload complete, planning analysis"));

        let plan = planner::plan_for_size(
            job.size_bytes,
            self.config.chunk_target_s,
            self.config.chunk_overlap_s,
        );
        send(
            tx,
            JobProgress::new(
                JobStage::Processing,
                UPLOAD_BAND.1 + 1,
                format!(
                    "Planned {} segment(s) over ~{} min of estimated footage",
                    plan.len(),
                    plan.estimated_duration_s / 60
                ),
            ),
        );

        let outcome = self
            .scheduler
            .run(
                ScheduleRequest {
                    plan,
                    file_refs,
                    mime_type: job.mime_type.clone(),
                    model_id: job.model_id.clone(),
                },
                Arc::new(AnalyzeProgress { tx: tx.clone() }),
                &self.cancel,
            )
            .await;

        if outcome.cancelled {
            return Err(JobFailure::Cancelled);
        }
        if let Some(reason) = &outcome.fatal {
            return Err(JobFailure::Fatal(format!(
                "the video is too large for the model's context window: {reason}"
            )));
        }

        let mut artifact = merge_outcome(&outcome.results, job, &outcome, started);

        self.check_cancelled()?;
        let keep_ranges = artifact.content_metadata.main_content_timestamps.clone();
        if !keep_ranges.is_empty() {
            send(tx, JobProgress::new(JobStage::Trimming, 92, "Trimming filler from the video"));
            let segments: Vec<TrimSegment> = keep_ranges
                .iter()
                .map(|range| TrimSegment {
                    start: range.start.clone(),
                    end: range.end.clone(),
                })
                .collect();
            let output = self
                .config
                .temp_dir
                .join(format!("{}_trimmed.mp4", job.id));
            match self.trimmer.trim(&job.source_path, &segments, &output).await {
                Ok(()) => {
                    artifact.processing_metadata.trimmed_video =
                        Some(output.display().to_string());
                    schedule_trim_cleanup(output);
                }
                Err(err) => {
                    // A failed trim degrades the result, it does not sink it
                    warn!(
                        target: "worker",
                        job_id = %job.id,
                        error = %err,
                        "Trimmer failed, delivering untrimmed result"
                    );
                }
            }
        }

        send(tx, JobProgress::new(JobStage::Sending, 95, "Delivering results"));
        self.queue
            .publish_result(&job.id, artifact)
            .await
            .map_err(|err| JobFailure::Retriable(format!("failed to publish result: {err}")))?;
        send(tx, JobProgress::new(JobStage::Complete, 100, "Analysis complete"));

        Ok(())
    }

    /// Upload the source once per credential; the external service scopes
    /// file references to the uploading credential, so the fan-out needs one
    /// reference per credential it may use.
    async fn upload_per_credential(
        &self,
        job: &Job,
        tx: &UnboundedSender<JobProgress>,
    ) -> Result<HashMap<String, String>, JobFailure> {
        let credentials = self.pool.key_list();
        let mut join_set = JoinSet::new();

        for (slot, (cred_id, secret)) in credentials.into_iter().enumerate() {
            let uploader = Arc::clone(&self.uploader);
            let cancel = self.cancel.clone();
            let path = job.source_path.clone();
            let display_name = job.display_name.clone();
            let mime_type = job.mime_type.clone();
            let size_bytes = job.size_bytes;

            // Only the first credential's transfer narrates job progress
            let progress: Arc<dyn TransferProgress> = if slot == 0 {
                let tx = tx.clone();
                Arc::new(FnTransferProgress(move |update: crate::uploader::TransferUpdate| {
                    let span = (UPLOAD_BAND.1 - UPLOAD_BAND.0) as f64;
                    let percent = UPLOAD_BAND.0 + (update.fraction * span) as u8;
                    let progress =
                        JobProgress::new(JobStage::Uploading, percent, update.describe())
                            .with_eta(update.eta_seconds);
                    let _ = tx.send(progress);
                }))
            } else {
                Arc::new(NoTransferProgress)
            };

            join_set.spawn(async move {
                let handle = uploader
                    .upload(
                        &secret,
                        &path,
                        &display_name,
                        &mime_type,
                        size_bytes,
                        progress,
                        &cancel,
                    )
                    .await?;
                uploader
                    .wait_ready(&secret, &handle.name, size_bytes, &cancel)
                    .await?;
                Ok::<(String, String), UploadError>((cred_id, handle.uri))
            });
        }

        let mut file_refs = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((cred_id, uri))) => {
                    file_refs.insert(cred_id, uri);
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(err) => {
                    return Err(JobFailure::Retriable(format!("upload task aborted: {err}")));
                }
            }
        }

        debug!(
            target: "worker",
            job_id = %job.id,
            uploads = file_refs.len(),
            "Per-credential uploads complete"
        );
        Ok(file_refs)
    }

    fn check_cancelled(&self) -> Result<(), JobFailure> {
        if self.cancel.is_cancelled() {
            Err(JobFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn cleanup_source(&self, job: &Job) {
        match tokio::fs::remove_file(&job.source_path).await {
            Ok(()) => debug!(target: "worker", job_id = %job.id, "Removed source temp file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target: "worker",
                job_id = %job.id,
                path = %job.source_path.display(),
                error = %err,
                "Failed to remove source temp file"
            ),
        }
    }
}

/// Maps scheduler snapshots into the job's analyzing band
struct AnalyzeProgress {
    tx: UnboundedSender<JobProgress>,
}

impl ScheduleEvents for AnalyzeProgress {
    fn on_progress(&self, progress: ParallelProgress) {
        let span = (ANALYZE_BAND.1 - ANALYZE_BAND.0) as u32;
        let percent =
            ANALYZE_BAND.0 + (progress.overall_percent as u32 * span / 100) as u8;
        let message = format!(
            "Analyzing: {}/{} segments done ({} active)",
            progress.completed + progress.failed,
            progress.total,
            progress.active
        );
        let update = JobProgress::new(JobStage::Analyzing, percent, message)
            .with_eta(progress.eta_seconds);
        let _ = self.tx.send(update);
    }

    fn on_chunk_error(&self, index: usize, error: &AnalysisError) {
        debug!(target: "worker", chunk = index, error = %error, "Chunk degraded to placeholder");
    }
}

fn send(tx: &UnboundedSender<JobProgress>, progress: JobProgress) {
    let _ = tx.send(progress);
}

fn merge_outcome(
    results: &[ChunkResult],
    job: &Job,
    outcome: &crate::analyzer::ScheduleOutcome,
    started: Instant,
) -> merger::MergedArtifact {
    let mut artifact = merger::merge(results);
    artifact.processing_metadata.successful_chunks = outcome.successful;
    artifact.processing_metadata.failed_chunks = outcome.failed;
    artifact.processing_metadata.model_id = job.model_id.clone();
    artifact.processing_metadata.analysis_elapsed_s = started.elapsed().as_secs();
    artifact
}

fn schedule_trim_cleanup(path: PathBuf) {
    tokio::spawn(async move {
        tokio::time::sleep(TRIM_CLEANUP_GRACE).await;
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "worker",
                    path = %path.display(),
                    error = %err,
                    "Failed to remove trimmed artifact"
                );
            }
        }
    });
}
