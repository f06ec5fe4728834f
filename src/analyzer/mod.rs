//! Parallel chunk scheduler.
//!
//! Fans the chunks of one job out across the credential pool, with bounded
//! concurrency, per-chunk state tracking and a 1 Hz progress stream. Chunk
//! failures are recovered locally: the failed chunk is replaced by a
//! placeholder analysis so downstream merging keeps dense indexes.

mod document;
mod prompt;
mod repair;

pub use document::{
    Chapter, ChunkAnalysis, ChunkResult, ContentMetadata, FilteredCategory, TimeRange,
};

use crate::planner::Chunk;
use crate::pool::{CredentialLease, CredentialPool, PoolError, PoolStatus};
use analysis_api::ApiError;
use analysis_api::api::GenerateApi;
use analysis_api::models::generate::GenerateRequest;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Upper bound on concurrent chunk analyses (further capped by the pool)
    pub max_concurrency: usize,
    /// How long one work unit waits for a credential
    pub acquire_timeout: Duration,
    /// Hard deadline for a single generate call
    pub generate_deadline: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 12,
            acquire_timeout: Duration::from_secs(120),
            generate_deadline: Duration::from_secs(8 * 60),
        }
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("credential pool exhausted: {0}")]
    Pool(#[from] PoolError),

    #[error("generate call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("model returned unparseable JSON")]
    BadJson,

    #[error("no uploaded file for credential {0}")]
    MissingFileRef(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Runtime state of one chunk task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkTaskView {
    pub index: usize,
    pub status: ChunkStatus,
    pub progress: f64,
}

/// Snapshot emitted to the progress sink at most once per second
#[derive(Debug, Clone, Serialize)]
pub struct ParallelProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
    pub overall_percent: u8,
    pub per_chunk: Vec<ChunkTaskView>,
    pub eta_seconds: Option<u64>,
    pub pool: PoolStatus,
}

/// Progress sink for one scheduling run
pub trait ScheduleEvents: Send + Sync {
    fn on_progress(&self, _progress: ParallelProgress) {}
    fn on_chunk_complete(&self, _result: &ChunkResult) {}
    fn on_chunk_error(&self, _index: usize, _error: &AnalysisError) {}
}

/// No-op sink
pub struct NoEvents;

impl ScheduleEvents for NoEvents {}

/// Inputs for one scheduling run
pub struct ScheduleRequest {
    pub plan: crate::planner::ChunkPlan,
    /// Credential id to uploaded file reference; refs are scoped to the
    /// credential that uploaded them
    pub file_refs: HashMap<String, String>,
    pub mime_type: String,
    pub model_id: String,
}

/// Result of one scheduling run; `results` is dense and index-ordered
pub struct ScheduleOutcome {
    pub results: Vec<ChunkResult>,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Set when a chunk error must end the whole job (context overflow)
    pub fatal: Option<String>,
}

struct TaskState {
    status: ChunkStatus,
    progress: f64,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

struct TaskTable {
    tasks: Mutex<Vec<TaskState>>,
    started: Instant,
}

impl TaskTable {
    fn new(total: usize) -> Arc<Self> {
        let tasks = (0..total)
            .map(|_| TaskState {
                status: ChunkStatus::Pending,
                progress: 0.0,
                started_at: None,
                ended_at: None,
            })
            .collect();
        Arc::new(Self {
            tasks: Mutex::new(tasks),
            started: Instant::now(),
        })
    }

    fn mark_processing(&self, index: usize) {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        tasks[index].status = ChunkStatus::Processing;
        tasks[index].started_at = Some(Instant::now());
    }

    fn mark_done(&self, index: usize, succeeded: bool) {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        tasks[index].status = if succeeded {
            ChunkStatus::Completed
        } else {
            ChunkStatus::Failed
        };
        tasks[index].progress = 1.0;
        tasks[index].ended_at = Some(Instant::now());
    }

    fn snapshot(&self, pool: PoolStatus) -> ParallelProgress {
        let tasks = self.tasks.lock().expect("task table poisoned");
        let total = tasks.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut active = 0;
        let mut effective = 0.0;
        let per_chunk = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                match task.status {
                    ChunkStatus::Completed => completed += 1,
                    ChunkStatus::Failed => failed += 1,
                    ChunkStatus::Processing => active += 1,
                    _ => {}
                }
                effective += match task.status {
                    ChunkStatus::Completed | ChunkStatus::Failed => 1.0,
                    _ => task.progress,
                };
                ChunkTaskView {
                    index,
                    status: task.status,
                    progress: task.progress,
                }
            })
            .collect();

        let processed = completed + failed;
        let eta_seconds = if processed > 0 && processed < total {
            let elapsed = self.started.elapsed().as_secs_f64();
            let remaining = (total - processed) as f64;
            Some((elapsed * remaining / processed as f64).round() as u64)
        } else {
            None
        };

        ParallelProgress {
            total,
            completed,
            failed,
            active,
            overall_percent: if total == 0 {
                100
            } else {
                (100.0 * effective / total as f64).round() as u8
            },
            per_chunk,
            eta_seconds,
            pool,
        }
    }
}

/// Drives the chunk analyses of one job through the pool
pub struct ChunkScheduler<A> {
    api: Arc<A>,
    pool: Arc<CredentialPool>,
    config: AnalyzerConfig,
}

impl<A: GenerateApi + Send + Sync + 'static> ChunkScheduler<A> {
    pub fn new(api: Arc<A>, pool: Arc<CredentialPool>, config: AnalyzerConfig) -> Self {
        Self { api, pool, config }
    }

    /// Analyze every chunk of the plan, returning results sorted by index.
    ///
    /// Cancellation stops dispatch of pending chunks and aborts in-flight
    /// calls; completed results are kept and the outcome is marked partial.
    pub async fn run(
        &self,
        request: ScheduleRequest,
        events: Arc<dyn ScheduleEvents>,
        cancel: &CancellationToken,
    ) -> ScheduleOutcome {
        let total = request.plan.len();
        let concurrency = self
            .config
            .max_concurrency
            .min(total)
            .min(self.pool.max_concurrency())
            .max(1);

        info!(
            target: "analyzer",
            chunks = total,
            concurrency,
            model = %request.model_id,
            "Starting parallel chunk analysis"
        );

        let table = TaskTable::new(total);
        let file_refs = Arc::new(request.file_refs);
        let mime_type: Arc<str> = request.mime_type.as_str().into();
        let model_id: Arc<str> = request.model_id.as_str().into();

        let reporter_stop = CancellationToken::new();
        let reporter = {
            let table = Arc::clone(&table);
            let events = Arc::clone(&events);
            let pool = Arc::clone(&self.pool);
            let stop = reporter_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            events.on_progress(table.snapshot(pool.status()));
                        }
                        _ = stop.cancelled() => break,
                    }
                }
            })
        };

        let tasks: Vec<_> = request
            .plan
            .chunks
            .iter()
            .map(|chunk| {
                let api = Arc::clone(&self.api);
                let pool = Arc::clone(&self.pool);
                let table = Arc::clone(&table);
                let events = Arc::clone(&events);
                let file_refs = Arc::clone(&file_refs);
                let mime_type = Arc::clone(&mime_type);
                let model_id = Arc::clone(&model_id);
                let cancel = cancel.clone();
                let prompt = prompt::chunk_prompt(chunk, total);
                let chunk = chunk.clone();
                let deadline = self.config.generate_deadline;
                let acquire_timeout = self.config.acquire_timeout;

                move |lease: CredentialLease| async move {
                    if cancel.is_cancelled() {
                        return Err(AnalysisError::Cancelled);
                    }
                    table.mark_processing(chunk.index);
                    let outcome = analyze_chunk(
                        api.as_ref(),
                        &pool,
                        lease,
                        &file_refs,
                        &chunk,
                        &prompt,
                        &mime_type,
                        &model_id,
                        deadline,
                        acquire_timeout,
                        &cancel,
                    )
                    .await;

                    match outcome {
                        Ok(analysis) => {
                            table.mark_done(chunk.index, true);
                            let result = ChunkResult {
                                chunk_index: chunk.index,
                                chunk_start_offset_s: chunk.start_s,
                                analysis,
                            };
                            events.on_chunk_complete(&result);
                            Ok(result)
                        }
                        Err(err) => {
                            table.mark_done(chunk.index, false);
                            events.on_chunk_error(chunk.index, &err);
                            warn!(
                                target: "analyzer",
                                chunk = chunk.index,
                                error = %err,
                                "Chunk analysis failed"
                            );
                            Err(err)
                        }
                    }
                }
            })
            .collect();

        let raw = self
            .pool
            .run_with_all(tasks, Some(concurrency), self.config.acquire_timeout)
            .await;

        reporter_stop.cancel();
        let _ = reporter.await;

        let mut results = Vec::with_capacity(total);
        let mut successful = 0;
        let mut failed = 0;
        let mut fatal = None;
        for (index, unit) in raw.into_iter().enumerate() {
            let chunk = &request.plan.chunks[index];
            match unit {
                Ok(Ok(result)) => {
                    successful += 1;
                    results.push(result);
                }
                Ok(Err(err)) => {
                    failed += 1;
                    if let AnalysisError::Api(ApiError::ContextExceeded(message)) = &err {
                        fatal.get_or_insert_with(|| message.clone());
                    }
                    results.push(placeholder_result(chunk, &err.to_string()));
                }
                Err(pool_err) => {
                    failed += 1;
                    let err = AnalysisError::Pool(pool_err);
                    events.on_chunk_error(index, &err);
                    results.push(placeholder_result(chunk, &err.to_string()));
                }
            }
        }

        events.on_progress(table.snapshot(self.pool.status()));

        info!(
            target: "analyzer",
            successful,
            failed,
            cancelled = cancel.is_cancelled(),
            "Chunk analysis finished"
        );

        ScheduleOutcome {
            results,
            successful,
            failed,
            cancelled: cancel.is_cancelled(),
            fatal,
        }
    }
}

fn placeholder_result(chunk: &Chunk, reason: &str) -> ChunkResult {
    ChunkResult {
        chunk_index: chunk.index,
        chunk_start_offset_s: chunk.start_s,
        analysis: ChunkAnalysis::placeholder(chunk, reason),
    }
}

/// Run one generate call, retrying at most once on rate-limit or transient
/// errors with a freshly leased credential.
#[allow(clippy::too_many_arguments)]
async fn analyze_chunk<A: GenerateApi>(
    api: &A,
    pool: &Arc<CredentialPool>,
    first_lease: CredentialLease,
    file_refs: &HashMap<String, String>,
    chunk: &Chunk,
    prompt: &str,
    mime_type: &str,
    model_id: &str,
    deadline: Duration,
    acquire_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ChunkAnalysis, AnalysisError> {
    let mut lease = first_lease;
    for attempt in 0..2 {
        let credential_id = lease.id().to_string();
        let Some(file_uri) = file_refs.get(&credential_id) else {
            lease.release();
            return Err(AnalysisError::MissingFileRef(credential_id));
        };

        let request = GenerateRequest {
            file_uri: file_uri.clone(),
            mime_type: mime_type.to_string(),
            prompt: prompt.to_string(),
        };
        let key = lease.secret().to_string();

        debug!(
            target: "analyzer",
            chunk = chunk.index,
            credential = %credential_id,
            attempt,
            "Dispatching generate call"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                lease.release();
                return Err(AnalysisError::Cancelled);
            }
            result = api.generate_content(&key, model_id, &request, deadline) => result,
        };

        match outcome {
            Ok(text) => {
                lease.release();
                return ChunkAnalysis::from_model_text(&text).map_err(|err| {
                    warn!(
                        target: "analyzer",
                        chunk = chunk.index,
                        error = %err,
                        "Model output did not parse after repair"
                    );
                    AnalysisError::BadJson
                });
            }
            Err(err) => {
                if let ApiError::Request(inner) = &err {
                    if inner.is_timeout() {
                        lease.fail(false);
                        return Err(AnalysisError::DeadlineExceeded(deadline));
                    }
                }
                if matches!(err, ApiError::ContextExceeded(_)) {
                    lease.fail(false);
                    return Err(AnalysisError::Api(err));
                }

                let rate_limited = err.is_rate_limit();
                let retriable = rate_limited || err.is_transient();
                lease.fail(rate_limited);

                if attempt == 0 && retriable {
                    warn!(
                        target: "analyzer",
                        chunk = chunk.index,
                        credential = %credential_id,
                        rate_limited,
                        error = %err,
                        "Generate call failed, retrying once on a fresh credential"
                    );
                    lease = pool.acquire(acquire_timeout).await?;
                    continue;
                }
                return Err(AnalysisError::Api(err));
            }
        }
    }
    unreachable!("chunk retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use crate::pool::PoolConfig;
    use analysis_api::ApiResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_analysis(tag: &str) -> String {
        format!(
            r#"{{"clean_script":"script {tag}","chapters":[{{"title":"c","start_time":"00:00","end_time":"05:00"}}],"summary":"sum {tag}","concepts":["{tag}"],"practice":[],"content_metadata":{{"original_duration_estimate":"20:00","essential_content_duration":"15:00","removed_percentage":25,"filtered_categories":[],"main_content_timestamps":[]}}}}"#
        )
    }

    /// Stub service keyed on the segment number baked into the prompt
    struct StubApi {
        calls: AtomicUsize,
        rate_limit_first_call: bool,
        bad_json_segment: Option<usize>,
    }

    impl StubApi {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rate_limit_first_call: false,
                bad_json_segment: None,
            })
        }
    }

    #[async_trait]
    impl GenerateApi for StubApi {
        async fn generate_content(
            &self,
            _key: &str,
            _model_id: &str,
            request: &GenerateRequest,
            _timeout: Duration,
        ) -> ApiResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limit_first_call && call == 0 {
                return Err(ApiError::RateLimited("quota exceeded".into()));
            }
            let segment = (1..=16)
                .find(|n| request.prompt.contains(&format!("segment {n} of")))
                .unwrap_or(0);
            if self.bad_json_segment == Some(segment) {
                return Ok("definitely not json {{{".to_string());
            }
            Ok(sample_analysis(&format!("part-{segment}")))
        }
    }

    fn scheduler_with(
        api: Arc<StubApi>,
        credentials: usize,
    ) -> (ChunkScheduler<StubApi>, Arc<CredentialPool>) {
        let pool = CredentialPool::new(
            (0..credentials).map(|i| format!("secret-{i}")).collect(),
            PoolConfig {
                per_cred_cap: 3,
                cooldown: Duration::from_millis(200),
            },
        );
        let config = AnalyzerConfig {
            max_concurrency: 12,
            acquire_timeout: Duration::from_millis(500),
            generate_deadline: Duration::from_secs(5),
        };
        (
            ChunkScheduler::new(api, Arc::clone(&pool), config),
            pool,
        )
    }

    fn request_for(plan: crate::planner::ChunkPlan, pool: &CredentialPool) -> ScheduleRequest {
        let file_refs = pool
            .credential_ids()
            .into_iter()
            .map(|id| (id.clone(), format!("https://svc/files/{id}")))
            .collect();
        ScheduleRequest {
            plan,
            file_refs,
            mime_type: "video/mp4".to_string(),
            model_id: "analyst-1".to_string(),
        }
    }

    #[tokio::test]
    async fn healthy_run_completes_every_chunk_in_order() {
        let (scheduler, pool) = scheduler_with(StubApi::ok(), 2);
        let plan = planner::plan(3600, 1200, 5);
        let cancel = CancellationToken::new();

        let outcome = scheduler
            .run(request_for(plan, &pool), Arc::new(NoEvents), &cancel)
            .await;

        assert_eq!(outcome.successful, 3);
        assert_eq!(outcome.failed, 0);
        assert!(!outcome.cancelled);
        let indexes: Vec<usize> = outcome.results.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(outcome.results[1].chunk_start_offset_s, 1200);
        assert_eq!(outcome.results[1].analysis.clean_script, "script part-2");
    }

    #[tokio::test]
    async fn bad_json_chunk_becomes_placeholder() {
        let api = Arc::new(StubApi {
            calls: AtomicUsize::new(0),
            rate_limit_first_call: false,
            bad_json_segment: Some(2),
        });
        let (scheduler, pool) = scheduler_with(api, 2);
        let plan = planner::plan(3600, 1200, 0);
        let cancel = CancellationToken::new();

        let outcome = scheduler
            .run(request_for(plan, &pool), Arc::new(NoEvents), &cancel)
            .await;

        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.results.len(), 3);
        let placeholder = &outcome.results[1];
        assert_eq!(placeholder.chunk_index, 1);
        assert!(placeholder.analysis.clean_script.starts_with("[Content from"));
        assert_eq!(placeholder.analysis.chapters.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_cools_credential_and_retries_elsewhere() {
        let api = Arc::new(StubApi {
            calls: AtomicUsize::new(0),
            rate_limit_first_call: true,
            bad_json_segment: None,
        });
        let (scheduler, pool) = scheduler_with(api, 2);
        let plan = planner::plan(900, 1200, 0);
        let cancel = CancellationToken::new();

        let outcome = scheduler
            .run(request_for(plan, &pool), Arc::new(NoEvents), &cancel)
            .await;

        assert_eq!(outcome.successful, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(pool.status().cooling_down, 1);
    }

    #[tokio::test]
    async fn cancellation_yields_partial_placeholder_results() {
        let (scheduler, pool) = scheduler_with(StubApi::ok(), 2);
        let plan = planner::plan(3600, 1200, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scheduler
            .run(request_for(plan, &pool), Arc::new(NoEvents), &cancel)
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.successful, 0);
        assert_eq!(outcome.results.len(), 3);
        assert!(
            outcome
                .results
                .iter()
                .all(|r| r.analysis.clean_script.contains("cancelled"))
        );
    }

    #[tokio::test]
    async fn progress_snapshots_reach_the_sink() {
        struct Capture {
            snapshots: Mutex<Vec<ParallelProgress>>,
            completed: AtomicUsize,
        }
        impl ScheduleEvents for Capture {
            fn on_progress(&self, progress: ParallelProgress) {
                self.snapshots.lock().unwrap().push(progress);
            }
            fn on_chunk_complete(&self, _result: &ChunkResult) {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (scheduler, pool) = scheduler_with(StubApi::ok(), 2);
        let plan = planner::plan(2400, 1200, 0);
        let cancel = CancellationToken::new();
        let capture = Arc::new(Capture {
            snapshots: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        });

        let outcome = scheduler
            .run(
                request_for(plan, &pool),
                Arc::clone(&capture) as Arc<dyn ScheduleEvents>,
                &cancel,
            )
            .await;

        assert_eq!(outcome.successful, 2);
        assert_eq!(capture.completed.load(Ordering::SeqCst), 2);
        let snapshots = capture.snapshots.lock().unwrap();
        let last = snapshots.last().expect("final snapshot emitted");
        assert_eq!(last.total, 2);
        assert_eq!(last.completed, 2);
        assert_eq!(last.overall_percent, 100);
    }
}
