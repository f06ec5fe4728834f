//! Job records, lifecycle states and progress events.

use crate::merger::MergedArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hard cap on accepted source files (1 GB)
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// The unit of work the queue dispatches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Opaque ingress channel reference for publishing progress
    pub chat_ref: String,
    /// Opaque ingress message reference to attach replies to
    pub reply_ref: String,
    pub source_path: PathBuf,
    pub display_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// External model variant selector
    pub model_id: String,
    pub submitter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_label: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
    /// Lifecycle entries so far; retries reuse the same job id
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_at: Option<DateTime<Utc>>,
    /// Earliest time a retried job may be leased again; the job stays in the
    /// waiting list for the whole backoff so a crash cannot orphan it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// High-level phase published in progress snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Downloading,
    Uploading,
    Processing,
    Analyzing,
    Trimming,
    Sending,
    Complete,
    Error,
}

impl JobStage {
    /// Monotonic ordering rank; progress may never regress in
    /// `(rank, percent)` except into the terminal error stage.
    pub fn rank(&self) -> u8 {
        match self {
            JobStage::Queued => 0,
            JobStage::Downloading => 1,
            JobStage::Uploading => 2,
            JobStage::Processing => 3,
            JobStage::Analyzing => 4,
            JobStage::Trimming => 5,
            JobStage::Sending => 6,
            JobStage::Complete => 7,
            JobStage::Error => 8,
        }
    }
}

/// Snapshot published whenever a worker advances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: JobStage,
    /// 0-100
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl JobProgress {
    pub fn new(stage: JobStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
            eta_seconds: None,
        }
    }

    pub fn with_eta(mut self, eta_seconds: Option<u64>) -> Self {
        self.eta_seconds = eta_seconds;
        self
    }

    /// Key used to enforce monotonic progress within one job.
    pub fn monotonic_key(&self) -> (u8, u8) {
        (self.stage.rank(), self.percent)
    }
}

/// Events published on a job's progress channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        job_id: String,
        stage: JobStage,
        percent: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta: Option<u64>,
    },
    Result {
        job_id: String,
        artifact: Box<MergedArtifact>,
    },
    Error {
        job_id: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { job_id, .. } => job_id,
            ProgressEvent::Result { job_id, .. } => job_id,
            ProgressEvent::Error { job_id, .. } => job_id,
        }
    }
}
