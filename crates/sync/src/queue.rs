//! Job queue with idempotency keys, leases, delayed retry and a dead
//! letter list.
//!
//! Delivery is at-least-once: a dequeued job is leased, and a lease that is
//! neither acknowledged nor released before it expires is redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::clock::Clock;
use campaign_core::config::{RetryConfig, WorkerConfig};
use campaign_core::error::{CoreError, CoreResult};
use campaign_core::types::Job;

// ─── Retry Policy ───────────────────────────────────────────────────────

/// Exponential backoff with optional jitter and an attempt cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first delivery.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);
        let final_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.75..1.25)
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms as u64)
    }

    /// Backoff, but never shorter than a platform-provided hint.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        match hint {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }

    /// Whether a job that has now failed `attempts_made` times may run again.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

// ─── Queue contract ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// A job with the same idempotency key is queued, running, or finished
    /// within the retention period.
    Duplicate,
}

/// A job that exhausted its retries, with the context needed to replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub error_kind: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub leased: usize,
    pub dead_lettered: usize,
    pub tracked_keys: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> CoreResult<EnqueueOutcome>;

    /// Lease the oldest job that is due, if any.
    async fn dequeue(&self) -> CoreResult<Option<Job>>;

    /// Finish a leased job.
    async fn ack(&self, job_id: Uuid) -> CoreResult<()>;

    /// Requeue a leased job after a failed attempt, no earlier than `not_before`.
    async fn retry(&self, job_id: Uuid, not_before: DateTime<Utc>) -> CoreResult<()>;

    /// Hand a leased job back without counting an attempt.
    async fn release(&self, job_id: Uuid, not_before: DateTime<Utc>) -> CoreResult<()>;

    async fn dead_letter(&self, job_id: Uuid, error: &CoreError) -> CoreResult<()>;

    /// Health check; the scheduler stops enqueueing while this fails.
    async fn ping(&self) -> CoreResult<()>;

    /// Forget idempotency keys of jobs finished longer ago than the
    /// retention period. Returns how many were dropped.
    fn prune_keys(&self) -> usize;
}

// ─── In-memory implementation ───────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    leased: HashMap<Uuid, (Job, DateTime<Utc>)>,
    /// Idempotency key -> finish time (`None` while queued or running).
    keys: HashMap<String, Option<DateTime<Utc>>>,
    dead: Vec<DeadLetter>,
}

pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    lease: chrono::Duration,
    key_retention: chrono::Duration,
    available: AtomicBool,
    wakeup: tokio::sync::Notify,
}

impl MemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>, config: &WorkerConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            lease: chrono::Duration::seconds(config.lease_secs),
            key_retention: chrono::Duration::seconds(config.key_retention_secs),
            available: AtomicBool::new(true),
            wakeup: tokio::sync::Notify::new(),
        }
    }

    /// Simulate an outage: every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Resolves when a job is enqueued or requeued.
    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.ready.len(),
            leased: state.leased.len(),
            dead_lettered: state.dead.len(),
            tracked_keys: state.keys.len(),
        }
    }

    /// Jobs waiting or due, in queue order.
    pub fn pending(&self) -> Vec<Job> {
        self.state.lock().ready.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    fn check(&self) -> CoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::StoreUnavailable("job queue offline".to_string()))
        }
    }

    /// Return expired leases to the ready queue as failed attempts.
    fn reclaim_expired(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = state
            .leased
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((mut job, _)) = state.leased.remove(&id) {
                warn!(job_id = %id, kind = job.kind.as_str(), "lease expired, redelivering job");
                job.attempts += 1;
                state.ready.push_back(job);
            }
        }
    }

    fn take_lease(&self, state: &mut QueueState, job_id: Uuid) -> CoreResult<Job> {
        state
            .leased
            .remove(&job_id)
            .map(|(job, _)| job)
            .ok_or_else(|| CoreError::StateConflict(format!("job {job_id} is not leased")))
    }

    fn finish_key(state: &mut QueueState, key: &str, at: DateTime<Utc>) {
        state.keys.insert(key.to_string(), Some(at));
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> CoreResult<EnqueueOutcome> {
        self.check()?;
        let mut state = self.state.lock();
        if state.keys.contains_key(&job.idempotency_key) {
            debug!(key = %job.idempotency_key, "duplicate enqueue collapsed");
            return Ok(EnqueueOutcome::Duplicate);
        }
        let id = job.id;
        metrics::counter!("jobs.enqueued", "kind" => job.kind.as_str()).increment(1);
        state.keys.insert(job.idempotency_key.clone(), None);
        state.ready.push_back(job);
        drop(state);
        self.wakeup.notify_one();
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn dequeue(&self) -> CoreResult<Option<Job>> {
        self.check()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, now);
        let Some(index) = state.ready.iter().position(|j| j.not_before <= now) else {
            return Ok(None);
        };
        let Some(job) = state.ready.remove(index) else {
            return Ok(None);
        };
        state.leased.insert(job.id, (job.clone(), now + self.lease));
        Ok(Some(job))
    }

    async fn ack(&self, job_id: Uuid) -> CoreResult<()> {
        self.check()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = self.take_lease(&mut state, job_id)?;
        Self::finish_key(&mut state, &job.idempotency_key, now);
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, not_before: DateTime<Utc>) -> CoreResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        let mut job = self.take_lease(&mut state, job_id)?;
        job.attempts += 1;
        job.not_before = not_before;
        metrics::counter!("jobs.retried", "kind" => job.kind.as_str()).increment(1);
        state.ready.push_back(job);
        drop(state);
        self.wakeup.notify_one();
        Ok(())
    }

    async fn release(&self, job_id: Uuid, not_before: DateTime<Utc>) -> CoreResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        let mut job = self.take_lease(&mut state, job_id)?;
        job.not_before = not_before;
        state.ready.push_back(job);
        Ok(())
    }

    async fn dead_letter(&self, job_id: Uuid, error: &CoreError) -> CoreResult<()> {
        self.check()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut job = self.take_lease(&mut state, job_id)?;
        job.attempts += 1;
        Self::finish_key(&mut state, &job.idempotency_key, now);
        info!(job_id = %job.id, kind = job.kind.as_str(), attempts = job.attempts, "job dead-lettered");
        state.dead.push(DeadLetter {
            job,
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            failed_at: now,
        });
        Ok(())
    }

    async fn ping(&self) -> CoreResult<()> {
        self.check()
    }

    fn prune_keys(&self) -> usize {
        let cutoff = self.clock.now() - self.key_retention;
        let mut state = self.state.lock();
        let before = state.keys.len();
        state
            .keys
            .retain(|_, finished| finished.map_or(true, |at| at > cutoff));
        let pruned = before - state.keys.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished idempotency keys");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::clock::ManualClock;
    use campaign_core::types::{ConnectedAccount, Platform, SyncStatus};

    fn account() -> ConnectedAccount {
        let now = Utc::now();
        ConnectedAccount {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            platform: Platform::Google,
            external_account_id: "123".into(),
            display_name: None,
            token_expires_at: now,
            sync_status: SyncStatus::Success,
            consecutive_failures: 0,
            last_synced_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            revoked_at: None,
        }
    }

    fn queue() -> (Arc<ManualClock>, MemoryJobQueue) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryJobQueue::new(clock.clone(), &WorkerConfig::default());
        (clock, queue)
    }

    #[tokio::test]
    async fn test_same_key_collapses() {
        let (clock, queue) = queue();
        let account = account();
        let first = queue.enqueue(Job::sync(&account, "42", clock.now())).await.unwrap();
        let second = queue.enqueue(Job::sync(&account, "42", clock.now())).await.unwrap();
        let next_slot = queue.enqueue(Job::sync(&account, "43", clock.now())).await.unwrap();

        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate);
        assert!(matches!(next_slot, EnqueueOutcome::Enqueued(_)));
        assert_eq!(queue.stats().ready, 2);
    }

    #[tokio::test]
    async fn test_finished_key_still_collapses_until_pruned() {
        let (clock, queue) = queue();
        let account = account();
        queue.enqueue(Job::sync(&account, "1", clock.now())).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        queue.ack(job.id).await.unwrap();

        let again = queue.enqueue(Job::sync(&account, "1", clock.now())).await.unwrap();
        assert_eq!(again, EnqueueOutcome::Duplicate);

        clock.advance(chrono::Duration::seconds(WorkerConfig::default().key_retention_secs + 1));
        assert_eq!(queue.prune_keys(), 1);
        let again = queue.enqueue(Job::sync(&account, "1", clock.now())).await.unwrap();
        assert!(matches!(again, EnqueueOutcome::Enqueued(_)));
    }

    #[tokio::test]
    async fn test_retry_waits_for_not_before() {
        let (clock, queue) = queue();
        queue.enqueue(Job::sync(&account(), "1", clock.now())).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        queue
            .retry(job.id, clock.now() + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(30));
        let retried = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn test_unacked_lease_is_redelivered() {
        let (clock, queue) = queue();
        queue.enqueue(Job::sync(&account(), "1", clock.now())).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(WorkerConfig::default().lease_secs));
        let redelivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempts, 1);
        assert!(queue.ack(job.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_context() {
        let (clock, queue) = queue();
        queue.enqueue(Job::sync(&account(), "1", clock.now())).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        let error = CoreError::Timeout(Duration::from_secs(5));
        queue.dead_letter(job.id, &error).await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, job.id);
        assert_eq!(dead[0].error_kind, "timeout");
        assert_eq!(queue.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_offline_queue_rejects_calls() {
        let (clock, queue) = queue();
        queue.set_available(false);
        assert!(queue.ping().await.is_err());
        assert!(queue.enqueue(Job::sync(&account(), "1", clock.now())).await.is_err());
    }

    #[test]
    fn test_backoff_respects_cap_and_hint() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_for_attempt(30), Duration::from_millis(300_000));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_secs(60)
        );
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }
}
