//! Resumable upload adapter for the Analysis Service file intake.
//!
//! Two-step protocol: an initiation call yields a session transfer URL, then
//! the file body streams to it in one segment (small files) or 64 MB
//! segments (large files), the last carrying the finalize command. After the
//! transfer the file is polled until the service reports it ACTIVE.

mod chunk;
mod progress;

pub use chunk::{SegmentInfo, split_segments};
pub use progress::{
    FnTransferProgress, NoTransferProgress, TransferProgress, TransferTracker, TransferUpdate,
    format_bytes,
};

use analysis_api::api::FilesApi;
use analysis_api::client::TRANSFER_TIMEOUT;
use analysis_api::models::files::{FileHandle, FileState};
use analysis_api::ApiError;
use chunk::SegmentStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Files above this size use segmented transfer (50 MB)
const SINGLE_SHOT_THRESHOLD: u64 = 50 * 1024 * 1024;
/// Segment size for large files (64 MB)
const SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload cancelled")]
    Cancelled,

    /// Wait-for-ready exceeded its computed bound
    #[error("file was not ready after {0:?}")]
    TimedOut(Duration),

    /// Intake reported FAILED, or the protocol broke irrecoverably
    #[error("file intake failed: {0}")]
    Terminal(String),

    #[error("failed reading source file: {0}")]
    Source(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl UploadError {
    /// Whether the owning job should be retried with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Api(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Upload adapter tuning knobs
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Retry attempts per segment and per initiation call
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Segmented transfer applies above this size
    pub single_shot_threshold: u64,
    pub segment_size: u64,
    /// Fixed wait-for-ready poll interval
    pub poll_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            single_shot_threshold: SINGLE_SHOT_THRESHOLD,
            segment_size: SEGMENT_SIZE,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Streams local files into the intake service, one upload per credential
pub struct Uploader<A> {
    api: Arc<A>,
    config: UploaderConfig,
}

impl<A: FilesApi + Send + Sync> Uploader<A> {
    pub fn new(api: Arc<A>, config: UploaderConfig) -> Self {
        Self { api, config }
    }

    /// Upload one file under one credential and return its durable handle.
    ///
    /// Memory use is bounded: the body streams from disk in small buffers,
    /// never materializing a segment, let alone the file.
    pub async fn upload(
        &self,
        key: &str,
        path: &Path,
        display_name: &str,
        mime_type: &str,
        size_bytes: u64,
        progress: Arc<dyn TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<FileHandle, UploadError> {
        let upload_url = self
            .start_with_retry(key, display_name, size_bytes, mime_type, cancel)
            .await?;

        let segment_size = if size_bytes > self.config.single_shot_threshold {
            self.config.segment_size
        } else {
            size_bytes.max(1)
        };
        let segments = split_segments(size_bytes, segment_size);

        info!(
            target: "uploader",
            file = display_name,
            size = %format_bytes(size_bytes),
            segments = segments.len(),
            "Starting upload transfer"
        );

        let tracker = TransferTracker::new(size_bytes, segments.len());

        // Progress reporter, torn down when the transfer settles
        let reporter_stop = CancellationToken::new();
        let reporter = {
            let tracker = Arc::clone(&tracker);
            let progress = Arc::clone(&progress);
            let stop = reporter_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {
                            progress.on_transfer(tracker.update());
                        }
                        _ = stop.cancelled() => break,
                    }
                }
            })
        };

        let mut handle = None;
        let mut transfer_result = Ok(());
        for segment in &segments {
            match self
                .transfer_segment(path, &upload_url, segment, &tracker, cancel)
                .await
            {
                Ok(finalized) => handle = finalized,
                Err(err) => {
                    transfer_result = Err(err);
                    break;
                }
            }
        }

        reporter_stop.cancel();
        let _ = reporter.await;
        progress.on_transfer(tracker.update());

        transfer_result?;
        handle.ok_or_else(|| {
            UploadError::Terminal("service returned no file handle on finalize".to_string())
        })
    }

    /// Poll the intake service until the uploaded file is ACTIVE.
    ///
    /// The wait bound scales with file size: 45 s plus 18 s per started
    /// 10 MB, capped at 15 minutes.
    pub async fn wait_ready(
        &self,
        key: &str,
        name: &str,
        size_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let max_wait = ready_wait_bound(size_bytes);
        let deadline = Instant::now() + max_wait;

        debug!(
            target: "uploader",
            file = name,
            max_wait_s = max_wait.as_secs(),
            "Waiting for file to become ready"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match self.api.get_file_status(key, name).await {
                Ok(status) => match status.state {
                    FileState::Active => return Ok(()),
                    FileState::Failed => {
                        let message = status
                            .error
                            .map(|err| err.message)
                            .filter(|m| !m.is_empty())
                            .unwrap_or_else(|| "file processing failed".to_string());
                        return Err(UploadError::Terminal(message));
                    }
                    _ => {}
                },
                Err(err) if err.is_transient() => {
                    warn!(
                        target: "uploader",
                        file = name,
                        error = %err,
                        "Transient error polling file status"
                    );
                }
                Err(err) => return Err(err.into()),
            }

            if Instant::now() + self.config.poll_interval >= deadline {
                return Err(UploadError::TimedOut(max_wait));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            }
        }
    }

    async fn start_with_retry(
        &self,
        key: &str,
        display_name: &str,
        size_bytes: u64,
        mime_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Url, UploadError> {
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if attempt > 0 {
                self.backoff(attempt, cancel).await?;
            }

            match self
                .api
                .start_resumable_upload(key, display_name, size_bytes, mime_type)
                .await
            {
                Ok(url) => return Ok(url),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        target: "uploader",
                        file = display_name,
                        attempt,
                        error = %err,
                        "Upload initiation failed, will retry"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("initiation retry loop always returns")
    }

    async fn transfer_segment(
        &self,
        path: &Path,
        upload_url: &Url,
        segment: &SegmentInfo,
        tracker: &Arc<TransferTracker>,
        cancel: &CancellationToken,
    ) -> Result<Option<FileHandle>, UploadError> {
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if attempt > 0 {
                self.backoff(attempt, cancel).await?;
            }

            let sent_before = tracker.sent();
            // Fresh stream per attempt; a failed body cannot be rewound
            let stream = SegmentStream::open(path, segment, Arc::clone(tracker))
                .await
                .map_err(|err| UploadError::Source(err.to_string()))?;
            let body = reqwest::Body::wrap_stream(stream);

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = self.api.upload_segment(
                    upload_url,
                    segment.offset,
                    segment.size,
                    body,
                    segment.is_last,
                    TRANSFER_TIMEOUT,
                ) => result,
            };

            match result {
                Ok(finalized) => {
                    tracker.complete_segment();
                    debug!(
                        target: "uploader",
                        segment = segment.index,
                        finalize = segment.is_last,
                        "Segment transferred"
                    );
                    return Ok(finalized);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    tracker.rewind_bytes(tracker.sent() - sent_before);
                    warn!(
                        target: "uploader",
                        segment = segment.index,
                        attempt,
                        error = %err,
                        "Segment transfer failed, will retry"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("segment retry loop always returns")
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), UploadError> {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let delay = Duration::from_millis(base * (1 << attempt.min(10)))
            .min(self.config.retry_max_delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }
}

/// Wait-for-ready bound: `min(15 min, 45 s + ceil(size_MB / 10) * 18 s)`.
pub fn ready_wait_bound(size_bytes: u64) -> Duration {
    let size_mb = size_bytes.div_ceil(1024 * 1024);
    let scaled = 45 + size_mb.div_ceil(10) * 18;
    Duration::from_secs(scaled.min(15 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_api::ApiResult;
    use analysis_api::models::files::{FileStatus, FileStatusError};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct SeenSegment {
        offset: u64,
        length: u64,
        finalize: bool,
    }

    struct StubIntake {
        segments: Mutex<Vec<SeenSegment>>,
        fail_first_n_transfers: AtomicU32,
        statuses: Mutex<Vec<FileState>>,
    }

    impl StubIntake {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                segments: Mutex::new(Vec::new()),
                fail_first_n_transfers: AtomicU32::new(0),
                statuses: Mutex::new(vec![FileState::Active]),
            })
        }
    }

    #[async_trait]
    impl FilesApi for StubIntake {
        async fn start_resumable_upload(
            &self,
            _key: &str,
            _display_name: &str,
            _total_size: u64,
            _mime_type: &str,
        ) -> ApiResult<Url> {
            Ok(Url::parse("https://svc/upload/session-1").unwrap())
        }

        async fn upload_segment(
            &self,
            _upload_url: &Url,
            offset: u64,
            content_length: u64,
            body: reqwest::Body,
            finalize: bool,
            _timeout: Duration,
        ) -> ApiResult<Option<FileHandle>> {
            drop(body);
            if self
                .fail_first_n_transfers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n > 0).then(|| n - 1)
                })
                .is_ok()
            {
                return Err(ApiError::Service {
                    status: 503,
                    message: "backend unavailable".into(),
                });
            }
            self.segments.lock().unwrap().push(SeenSegment {
                offset,
                length: content_length,
                finalize,
            });
            if finalize {
                Ok(Some(FileHandle {
                    uri: "https://svc/files/f1".into(),
                    name: "files/f1".into(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn get_file_status(&self, _key: &str, _name: &str) -> ApiResult<FileStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            let state = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            };
            Ok(FileStatus {
                state,
                error: (state == FileState::Failed).then(|| FileStatusError {
                    message: "container unreadable".into(),
                }),
            })
        }
    }

    fn test_config() -> UploaderConfig {
        UploaderConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            single_shot_threshold: 256,
            segment_size: 128,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn temp_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; len]).unwrap();
        file
    }

    #[tokio::test]
    async fn small_file_uses_one_finalizing_segment() {
        let api = StubIntake::new();
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let file = temp_file(100);
        let cancel = CancellationToken::new();

        let handle = uploader
            .upload(
                "secret",
                file.path(),
                "clip.mp4",
                "video/mp4",
                100,
                Arc::new(NoTransferProgress),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(handle.uri, "https://svc/files/f1");
        let segments = api.segments.lock().unwrap();
        assert_eq!(
            *segments,
            vec![SeenSegment {
                offset: 0,
                length: 100,
                finalize: true
            }]
        );
    }

    #[tokio::test]
    async fn large_file_streams_in_segments() {
        let api = StubIntake::new();
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let file = temp_file(300);
        let cancel = CancellationToken::new();

        uploader
            .upload(
                "secret",
                file.path(),
                "clip.mp4",
                "video/mp4",
                300,
                Arc::new(NoTransferProgress),
                &cancel,
            )
            .await
            .unwrap();

        let segments = api.segments.lock().unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].offset, 0);
        assert_eq!(segments[1].offset, 128);
        assert_eq!(segments[2].offset, 256);
        assert_eq!(segments[2].length, 44);
        assert!(segments[2].finalize);
        assert!(!segments[0].finalize);
    }

    #[tokio::test]
    async fn transient_segment_failures_are_retried() {
        let api = StubIntake::new();
        api.fail_first_n_transfers.store(2, Ordering::SeqCst);
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let file = temp_file(100);
        let cancel = CancellationToken::new();

        let handle = uploader
            .upload(
                "secret",
                file.path(),
                "clip.mp4",
                "video/mp4",
                100,
                Arc::new(NoTransferProgress),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(handle.name, "files/f1");
        assert_eq!(api.segments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate() {
        let api = StubIntake::new();
        api.fail_first_n_transfers.store(10, Ordering::SeqCst);
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let file = temp_file(100);
        let cancel = CancellationToken::new();

        let err = uploader
            .upload(
                "secret",
                file.path(),
                "clip.mp4",
                "video/mp4",
                100,
                Arc::new(NoTransferProgress),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn cancellation_aborts_mid_transfer() {
        let api = StubIntake::new();
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let file = temp_file(100);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader
            .upload(
                "secret",
                file.path(),
                "clip.mp4",
                "video/mp4",
                100,
                Arc::new(NoTransferProgress),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert!(api.segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_ready_resolves_when_active() {
        let api = StubIntake::new();
        *api.statuses.lock().unwrap() = vec![
            FileState::Processing,
            FileState::Processing,
            FileState::Active,
        ];
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let cancel = CancellationToken::new();

        uploader
            .wait_ready("secret", "files/f1", 10 * 1024 * 1024, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_ready_fails_terminally_on_failed_state() {
        let api = StubIntake::new();
        *api.statuses.lock().unwrap() = vec![FileState::Failed];
        let uploader = Uploader::new(Arc::clone(&api), test_config());
        let cancel = CancellationToken::new();

        let err = uploader
            .wait_ready("secret", "files/f1", 1024, &cancel)
            .await
            .unwrap_err();

        match err {
            UploadError::Terminal(message) => assert_eq!(message, "container unreadable"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ready_wait_bound_scales_with_size_and_caps() {
        const MB: u64 = 1024 * 1024;
        assert_eq!(ready_wait_bound(0), Duration::from_secs(45));
        assert_eq!(ready_wait_bound(10 * MB), Duration::from_secs(63));
        assert_eq!(ready_wait_bound(95 * MB), Duration::from_secs(45 + 10 * 18));
        // A 1 GB file hits the 15 minute cap
        assert_eq!(ready_wait_bound(1024 * MB), Duration::from_secs(900));
    }
}
