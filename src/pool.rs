//! Credential pool with per-credential concurrency caps and cooldowns.
//!
//! A fixed set of Analysis Service credentials is loaded at startup. Work
//! units lease the least-loaded credential, ties broken by least-recent use,
//! so sustained load rotates fairly across the set. Rate-limited credentials
//! sit out a cooldown window but are never removed.

use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long an acquirer sleeps between selection attempts when no release
/// notification arrives (cooldown expiry does not notify).
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum PoolError {
    /// Every credential was saturated or cooling down for the whole wait
    #[error("no credential capacity became available within {0:?}")]
    NoCapacity(Duration),

    /// A work unit spawned by `run_with_all` panicked
    #[error("pool work unit panicked")]
    UnitPanicked,
}

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum in-flight leases per credential
    pub per_cred_cap: u32,
    /// Cooldown applied after a rate-limit failure
    pub cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_cred_cap: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

struct CredSlot {
    id: String,
    secret: Arc<str>,
    in_flight: u32,
    last_used_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    error_count: u64,
}

/// Point-in-time pool summary, embedded in progress snapshots
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub in_flight: u32,
}

/// Shared credential pool; all mutation goes through `acquire`/release
pub struct CredentialPool {
    slots: Mutex<Vec<CredSlot>>,
    config: PoolConfig,
    released: Notify,
}

impl CredentialPool {
    pub fn new(secrets: Vec<String>, config: PoolConfig) -> Arc<Self> {
        let slots = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| CredSlot {
                id: format!("cred-{index}"),
                secret: secret.into(),
                in_flight: 0,
                last_used_at: None,
                cooldown_until: None,
                error_count: 0,
            })
            .collect::<Vec<_>>();

        info!(
            target: "pool",
            credentials = slots.len(),
            per_cred_cap = config.per_cred_cap,
            "Credential pool initialized"
        );

        Arc::new(Self {
            slots: Mutex::new(slots),
            config,
            released: Notify::new(),
        })
    }

    /// Stable ids of every credential, in slot order.
    pub fn credential_ids(&self) -> Vec<String> {
        self.slots
            .lock()
            .expect("pool mutex poisoned")
            .iter()
            .map(|slot| slot.id.clone())
            .collect()
    }

    /// Id and secret of every credential, for per-credential uploads.
    pub fn key_list(&self) -> Vec<(String, Arc<str>)> {
        self.slots
            .lock()
            .expect("pool mutex poisoned")
            .iter()
            .map(|slot| (slot.id.clone(), Arc::clone(&slot.secret)))
            .collect()
    }

    /// Aggregate lease capacity across the pool.
    pub fn max_concurrency(&self) -> usize {
        let slots = self.slots.lock().expect("pool mutex poisoned");
        slots.len() * self.config.per_cred_cap as usize
    }

    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let slots = self.slots.lock().expect("pool mutex poisoned");
        let cooling_down = slots
            .iter()
            .filter(|slot| slot.cooldown_until.is_some_and(|until| now < until))
            .count();
        PoolStatus {
            total: slots.len(),
            available: slots.len() - cooling_down,
            cooling_down,
            in_flight: slots.iter().map(|slot| slot.in_flight).sum(),
        }
    }

    /// Lease the best available credential, waiting up to `timeout`.
    ///
    /// Selection excludes cooling-down and saturated credentials, then takes
    /// the minimum in-flight count with ties broken by oldest last use.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<CredentialLease, PoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_select() {
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(target: "pool", timeout = ?timeout, "Credential acquire timed out");
                return Err(PoolError::NoCapacity(timeout));
            }

            let wait = (deadline - now).min(ACQUIRE_POLL_INTERVAL);
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn try_select(self: &Arc<Self>) -> Option<CredentialLease> {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("pool mutex poisoned");

        let mut best: Option<usize> = None;
        for (index, slot) in slots.iter().enumerate() {
            if slot.cooldown_until.is_some_and(|until| now < until) {
                continue;
            }
            if slot.in_flight >= self.config.per_cred_cap {
                continue;
            }
            best = match best {
                None => Some(index),
                Some(current) => {
                    let cur = &slots[current];
                    if slot.in_flight < cur.in_flight
                        || (slot.in_flight == cur.in_flight
                            && slot.last_used_at < cur.last_used_at)
                    {
                        Some(index)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let index = best?;
        let slot = &mut slots[index];
        slot.in_flight += 1;
        slot.last_used_at = Some(now);

        debug!(
            target: "pool",
            credential = %slot.id,
            in_flight = slot.in_flight,
            "Credential leased"
        );

        Some(CredentialLease {
            pool: Arc::clone(self),
            slot: index,
            id: slot.id.clone(),
            secret: Arc::clone(&slot.secret),
            settled: false,
        })
    }

    fn finish(&self, slot: usize, had_error: bool, rate_limited: bool) {
        {
            let mut slots = self.slots.lock().expect("pool mutex poisoned");
            let slot = &mut slots[slot];
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if had_error {
                slot.error_count += 1;
            }
            if rate_limited {
                slot.cooldown_until = Some(Instant::now() + self.config.cooldown);
                warn!(
                    target: "pool",
                    credential = %slot.id,
                    cooldown = ?self.config.cooldown,
                    errors = slot.error_count,
                    "Credential rate limited, entering cooldown"
                );
            }
        }
        self.released.notify_waiters();
    }

    /// Drive every work unit through the pool under a shared concurrency cap.
    ///
    /// Each unit borrows one credential for its duration; results come back
    /// in task order regardless of completion order.
    pub async fn run_with_all<T, F, Fut>(
        self: &Arc<Self>,
        tasks: Vec<F>,
        max_concurrency: Option<usize>,
        acquire_timeout: Duration,
    ) -> Vec<Result<T, PoolError>>
    where
        F: FnOnce(CredentialLease) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let cap = max_concurrency
            .unwrap_or(usize::MAX)
            .min(self.max_concurrency())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let total = tasks.len();

        let mut join_set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let pool = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("pool semaphore closed");
                let lease = match pool.acquire(acquire_timeout).await {
                    Ok(lease) => lease,
                    Err(err) => return (index, Err(err)),
                };
                (index, Ok(task(lease).await))
            });
        }

        let mut results: Vec<Option<Result<T, PoolError>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => {
                    warn!(target: "pool", error = %err, "Pool work unit aborted");
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(PoolError::UnitPanicked)))
            .collect()
    }
}

/// Exclusive claim on one credential, held from `acquire` until settled.
///
/// Dropping an unsettled lease releases it cleanly; explicit `fail` records
/// the error and, for rate-limit signals, starts the cooldown.
pub struct CredentialLease {
    pool: Arc<CredentialPool>,
    slot: usize,
    id: String,
    secret: Arc<str>,
    settled: bool,
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl CredentialLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Return the credential after successful use.
    pub fn release(mut self) {
        self.settled = true;
        self.pool.finish(self.slot, false, false);
    }

    /// Return the credential after a failure.
    pub fn fail(mut self, rate_limited: bool) {
        self.settled = true;
        self.pool.finish(self.slot, true, rate_limited);
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.finish(self.slot, false, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_with(n: usize, per_cred_cap: u32, cooldown: Duration) -> Arc<CredentialPool> {
        let secrets = (0..n).map(|i| format!("secret-{i}")).collect();
        CredentialPool::new(
            secrets,
            PoolConfig {
                per_cred_cap,
                cooldown,
            },
        )
    }

    #[tokio::test]
    async fn acquire_release_leaves_counters_unchanged() {
        let pool = pool_with(2, 3, Duration::from_secs(60));
        let before = pool.status();
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.status().in_flight, 1);
        lease.release();
        let after = pool.status();
        assert_eq!(before.in_flight, after.in_flight);
        assert_eq!(after.available, 2);
    }

    #[tokio::test]
    async fn selection_prefers_least_loaded() {
        let pool = pool_with(2, 3, Duration::from_secs(60));
        let first = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let second = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_ne!(first.id(), second.id());
        first.release();
        second.release();
    }

    #[tokio::test]
    async fn tie_break_rotates_to_least_recently_used() {
        let pool = pool_with(2, 3, Duration::from_secs(60));
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lease.id(), "cred-0");
        lease.release();
        // cred-1 has never been used, so it wins the in-flight tie
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lease.id(), "cred-1");
        lease.release();
    }

    #[tokio::test]
    async fn saturated_pool_times_out() {
        let pool = pool_with(1, 1, Duration::from_secs(60));
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::NoCapacity(_)));
        held.release();
    }

    #[tokio::test]
    async fn release_wakes_blocked_acquirer() {
        let pool = pool_with(1, 1, Duration::from_secs(60));
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release();

        let lease = waiter.await.unwrap().unwrap();
        lease.release();
    }

    #[tokio::test]
    async fn rate_limited_credential_sits_out_cooldown() {
        let pool = pool_with(2, 1, Duration::from_millis(80));
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lease.id(), "cred-0");
        lease.fail(true);

        // Only cred-1 is eligible while the cooldown runs
        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(lease.id(), "cred-1");
        lease.release();
        assert_eq!(pool.status().cooling_down, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.status().cooling_down, 0);
    }

    #[tokio::test]
    async fn all_cooling_down_fails_acquire() {
        let pool = pool_with(1, 1, Duration::from_secs(60));
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        lease.fail(true);
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn dropped_lease_is_returned() {
        let pool = pool_with(1, 1, Duration::from_secs(60));
        {
            let _lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        }
        assert_eq!(pool.status().in_flight, 0);
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        lease.release();
    }

    #[tokio::test]
    async fn run_with_all_observes_concurrency_bound() {
        let pool = pool_with(3, 2, Duration::from_secs(60));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                move |lease: CredentialLease| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    lease.release();
                    1usize
                }
            })
            .collect();

        let results = pool
            .run_with_all(tasks, Some(4), Duration::from_secs(1))
            .await;

        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.status().in_flight, 0);
    }

    #[tokio::test]
    async fn run_with_all_keeps_task_order() {
        let pool = pool_with(2, 2, Duration::from_secs(60));
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                move |lease: CredentialLease| async move {
                    // Later tasks finish first to shuffle completion order
                    tokio::time::sleep(Duration::from_millis(60 - i as u64 * 10)).await;
                    lease.release();
                    i
                }
            })
            .collect();

        let results = pool
            .run_with_all(tasks, None, Duration::from_secs(1))
            .await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }
}
