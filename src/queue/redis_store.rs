//! Redis-backed durable queue store.
//!
//! Layout: per-job JSON records under `job:{id}`, the four lifecycle lists
//! (`queue:waiting`, `queue:active`, `queue:succeeded`, `queue:failed`), and
//! pub/sub on `progress:{job_id}`. The waiting-to-active move is a single
//! `BLMOVE`, which is what makes the at-most-one-lease invariant hold across
//! worker processes. `rediss://` URLs get TLS from the driver.

use crate::queue::models::{Job, ProgressEvent};
use crate::queue::store::{JobStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

const WAITING_LIST: &str = "queue:waiting";
const ACTIVE_LIST: &str = "queue:active";
const SUCCEEDED_LIST: &str = "queue:succeeded";
const FAILED_LIST: &str = "queue:failed";

fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

fn progress_channel(job_id: &str) -> String {
    format!("progress:{job_id}")
}

fn terminal_list(succeeded: bool) -> &'static str {
    if succeeded { SUCCEEDED_LIST } else { FAILED_LIST }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Production store; the connection manager reconnects and keeps the
/// connection alive across broker restarts
pub struct RedisJobStore {
    manager: ConnectionManager,
}

impl RedisJobStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(target: "store", "Connected to durable queue store");
        Ok(Self { manager })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.manager.clone();
        let _: () = conn.set(job_key(&job.id), payload).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(job_key(job_id)).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(job_key(job_id)).await?;
        Ok(())
    }

    async fn push_waiting(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.rpush(WAITING_LIST, job_id).await?;
        Ok(())
    }

    async fn push_waiting_front(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(WAITING_LIST, job_id).await?;
        Ok(())
    }

    async fn waiting_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(WAITING_LIST, 0, -1).await?)
    }

    async fn active_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(ACTIVE_LIST, 0, -1).await?)
    }

    async fn lease_next(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let leased: Option<String> = redis::cmd("BLMOVE")
            .arg(WAITING_LIST)
            .arg(ACTIVE_LIST)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        if let Some(job_id) = &leased {
            debug!(target: "store", job_id = %job_id, "Leased job from waiting list");
        }
        Ok(leased)
    }

    async fn remove_active(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.lrem(ACTIVE_LIST, 1, job_id).await?;
        Ok(())
    }

    async fn requeue_active(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.lrem(ACTIVE_LIST, 1, job_id).await?;
        if removed == 0 {
            return Ok(false);
        }
        let _: () = conn.lpush(WAITING_LIST, job_id).await?;
        Ok(true)
    }

    async fn push_terminal(
        &self,
        job_id: &str,
        succeeded: bool,
        keep: usize,
    ) -> Result<Vec<String>, StoreError> {
        let list = terminal_list(succeeded);
        let keep = keep.max(1) as isize;
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(list, job_id).await?;
        let evicted: Vec<String> = conn.lrange(list, keep, -1).await?;
        let _: () = conn.ltrim(list, 0, keep - 1).await?;
        Ok(evicted)
    }

    async fn terminal_ids(&self, succeeded: bool) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(terminal_list(succeeded), 0, -1).await?)
    }

    async fn remove_terminal(&self, job_id: &str, succeeded: bool) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.lrem(terminal_list(succeeded), 0, job_id).await?;
        Ok(())
    }

    async fn publish_event(&self, event: &ProgressEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();
        let _: () = conn.publish(progress_channel(event.job_id()), payload).await?;
        Ok(())
    }
}
