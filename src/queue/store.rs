//! Durable queue store seam.
//!
//! The queue talks to its backing store through `JobStore`, which models the
//! primitives the durable backend offers: job records keyed by id, the
//! waiting/active/terminal lists, an atomic waiting-to-active move, and
//! per-job pub/sub. `MemoryJobStore` backs tests and embedded runs;
//! `RedisJobStore` is the production implementation.

use crate::queue::models::{Job, ProgressEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;

    /// Append to the waiting list tail.
    async fn push_waiting(&self, job_id: &str) -> Result<(), StoreError>;
    /// Push to the waiting list head (reclaimed or retried jobs).
    async fn push_waiting_front(&self, job_id: &str) -> Result<(), StoreError>;
    async fn waiting_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn active_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Atomically move the oldest waiting id to the active list, blocking up
    /// to `timeout`. `None` means the wait elapsed with an empty list.
    async fn lease_next(&self, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn remove_active(&self, job_id: &str) -> Result<(), StoreError>;

    /// Move an id from active back to the waiting head. Returns false when
    /// the id was no longer active (already acked by its worker).
    async fn requeue_active(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Record a terminal job, trimming the list to `keep` entries.
    /// Returns the ids evicted by the trim so the caller can purge them.
    async fn push_terminal(
        &self,
        job_id: &str,
        succeeded: bool,
        keep: usize,
    ) -> Result<Vec<String>, StoreError>;
    async fn terminal_ids(&self, succeeded: bool) -> Result<Vec<String>, StoreError>;
    async fn remove_terminal(&self, job_id: &str, succeeded: bool) -> Result<(), StoreError>;

    /// Publish an event on the job's progress channel.
    async fn publish_event(&self, event: &ProgressEvent) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, Job>,
    waiting: VecDeque<String>,
    active: Vec<String>,
    succeeded: VecDeque<String>,
    failed: VecDeque<String>,
}

/// In-process store with the same semantics as the durable backend
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
    waiting_notify: Notify,
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first.
    pub fn published_events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.jobs.remove(job_id);
        Ok(())
    }

    async fn push_waiting(&self, job_id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().expect("store poisoned");
            inner.waiting.push_back(job_id.to_string());
        }
        self.waiting_notify.notify_waiters();
        Ok(())
    }

    async fn push_waiting_front(&self, job_id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().expect("store poisoned");
            inner.waiting.push_front(job_id.to_string());
        }
        self.waiting_notify.notify_waiters();
        Ok(())
    }

    async fn waiting_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.waiting.iter().cloned().collect())
    }

    async fn active_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.active.clone())
    }

    async fn lease_next(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().expect("store poisoned");
                if let Some(id) = inner.waiting.pop_front() {
                    inner.active.push(id.clone());
                    return Ok(Some(id));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.waiting_notify.notified()).await;
        }
    }

    async fn remove_active(&self, job_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.active.retain(|id| id != job_id);
        Ok(())
    }

    async fn requeue_active(&self, job_id: &str) -> Result<bool, StoreError> {
        let moved = {
            let mut inner = self.inner.lock().expect("store poisoned");
            let before = inner.active.len();
            inner.active.retain(|id| id != job_id);
            if inner.active.len() < before {
                inner.waiting.push_front(job_id.to_string());
                true
            } else {
                false
            }
        };
        if moved {
            self.waiting_notify.notify_waiters();
        }
        Ok(moved)
    }

    async fn push_terminal(
        &self,
        job_id: &str,
        succeeded: bool,
        keep: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let list = if succeeded {
            &mut inner.succeeded
        } else {
            &mut inner.failed
        };
        list.push_front(job_id.to_string());
        let mut evicted = Vec::new();
        while list.len() > keep.max(1) {
            if let Some(old) = list.pop_back() {
                evicted.push(old);
            }
        }
        Ok(evicted)
    }

    async fn terminal_ids(&self, succeeded: bool) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        let list = if succeeded {
            &inner.succeeded
        } else {
            &inner.failed
        };
        Ok(list.iter().cloned().collect())
    }

    async fn remove_terminal(&self, job_id: &str, succeeded: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let list = if succeeded {
            &mut inner.succeeded
        } else {
            &mut inner.failed
        };
        list.retain(|id| id != job_id);
        Ok(())
    }

    async fn publish_event(&self, event: &ProgressEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .expect("event log poisoned")
            .push(event.clone());
        Ok(())
    }
}
