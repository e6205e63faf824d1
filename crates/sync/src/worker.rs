//! Worker pool draining the job queue.
//!
//! Concurrency is bounded globally (number of workers), per organization and
//! per platform. Sync jobs for the same account never overlap. Failures are
//! classified into retry, terminal failure and dead letter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::clock::Clock;
use campaign_core::config::WorkerConfig;
use campaign_core::error::{CoreError, CoreResult, Disposition};
use campaign_core::event_bus::{NotificationEvent, NotificationKind, NotificationSink};
use campaign_core::types::{Job, JobPayload, Platform};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};

use crate::queue::{JobQueue, RetryPolicy};

/// Executes one job. Implementations must be idempotent: a job may be
/// delivered more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> CoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried { delay: Duration },
    DeadLettered,
    /// Terminal failure, not retried.
    Failed,
    /// Handed back untouched because a concurrency limit was reached.
    Deferred,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    retry: RetryPolicy,
    per_organization: DashMap<Uuid, Arc<Semaphore>>,
    per_platform: DashMap<Platform, Arc<Semaphore>>,
    account_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            handler,
            audit,
            notifier,
            clock,
            config,
            retry,
            per_organization: DashMap::new(),
            per_platform: DashMap::new(),
            account_locks: DashMap::new(),
        }
    }

    /// Take one due job off the queue and run it. `Ok(None)` when nothing is
    /// due; `Err` only when the queue itself fails.
    pub async fn process_next(&self) -> CoreResult<Option<JobOutcome>> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        let Some(_permits) = self.try_admit(&job) else {
            return self.defer(&job, "concurrency limit reached").await;
        };

        // A sync already running for the account keeps this one queued
        // rather than parking it on an organization slot.
        let _account_guard = match &job.payload {
            JobPayload::Sync { account_id } => {
                let lock = self
                    .account_locks
                    .entry(*account_id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone();
                match lock.try_lock_owned() {
                    Ok(guard) => Some(guard),
                    Err(_) => return self.defer(&job, "account sync in progress").await,
                }
            }
            _ => None,
        };

        let limit = Duration::from_secs(self.config.job_timeout_secs);
        let result = match tokio::time::timeout(limit, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(limit)),
        };

        let outcome = match result {
            Ok(()) => {
                self.queue.ack(job.id).await?;
                metrics::counter!("jobs.completed", "kind" => job.kind.as_str()).increment(1);
                debug!(job_id = %job.id, kind = job.kind.as_str(), "job completed");
                JobOutcome::Completed
            }
            Err(err) => self.fail(&job, err).await?,
        };
        Ok(Some(outcome))
    }

    async fn defer(&self, job: &Job, reason: &'static str) -> CoreResult<Option<JobOutcome>> {
        let not_before =
            self.clock.now() + chrono::Duration::milliseconds(self.config.poll_interval_ms as i64);
        self.queue.release(job.id, not_before).await?;
        debug!(job_id = %job.id, org = %job.organization_id, reason, "job deferred");
        Ok(Some(JobOutcome::Deferred))
    }

    /// Run `max_concurrent_jobs` workers until `shutdown` flips to true.
    /// In-flight jobs finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let workers = self.config.max_concurrent_jobs.max(1);
        info!(workers, "worker pool started");
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }
        while set.join_next().await.is_some() {}
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(Some(JobOutcome::Deferred)) | Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(err) => warn!(worker_id, error = %err, "job queue unavailable"),
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker_id, "worker exiting");
    }

    fn try_admit(&self, job: &Job) -> Option<Vec<OwnedSemaphorePermit>> {
        let mut permits = Vec::with_capacity(2);
        let org = self
            .per_organization
            .entry(job.organization_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_organization_limit.max(1))))
            .clone();
        permits.push(org.try_acquire_owned().ok()?);
        if let Some(platform) = job.platform {
            let sem = self
                .per_platform
                .entry(platform)
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_platform_limit.max(1))))
                .clone();
            permits.push(sem.try_acquire_owned().ok()?);
        }
        Some(permits)
    }

    async fn fail(&self, job: &Job, err: CoreError) -> CoreResult<JobOutcome> {
        let attempts_made = job.attempts + 1;
        let hint = match err.disposition() {
            Disposition::Retry(hint) if !err.is_auth_failure() => hint,
            _ => {
                self.queue.ack(job.id).await?;
                warn!(
                    job_id = %job.id,
                    kind = job.kind.as_str(),
                    error = %err,
                    "job failed permanently"
                );
                self.audit.append(
                    AuditEntry::new(AuditKind::JobFailed, "job", job.id)
                        .organization(job.organization_id)
                        .detail(json!({
                            "kind": job.kind.as_str(),
                            "target_id": job.target_id(),
                            "error": err.to_string(),
                            "error_kind": err.kind(),
                            "attempts": attempts_made,
                        })),
                );
                self.notifier.emit(NotificationEvent::new(
                    NotificationKind::JobFailed,
                    job.organization_id,
                    json!({ "job_id": job.id, "kind": job.kind.as_str(), "error": err.to_string() }),
                ));
                return Ok(JobOutcome::Failed);
            }
        };

        if self.retry.allows_retry(attempts_made) {
            let delay = self.retry.delay_for(job.attempts, hint);
            let not_before = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.queue.retry(job.id, not_before).await?;
            warn!(
                job_id = %job.id,
                kind = job.kind.as_str(),
                attempt = attempts_made,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "job failed, retry scheduled"
            );
            return Ok(JobOutcome::Retried { delay });
        }

        self.queue.dead_letter(job.id, &err).await?;
        metrics::counter!("jobs.dead_lettered", "kind" => job.kind.as_str()).increment(1);
        error!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            attempts = attempts_made,
            error = %err,
            "job exhausted retries, moved to dead letter queue"
        );
        let mut snapshot = serde_json::to_value(job)?;
        if let Some(obj) = snapshot.as_object_mut() {
            obj.insert("attempts".into(), json!(attempts_made));
        }
        self.audit.append(
            AuditEntry::new(AuditKind::JobDeadLettered, "job", job.id)
                .organization(job.organization_id)
                .after(snapshot)
                .detail(json!({ "error": err.to_string(), "error_kind": err.kind() })),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::JobDeadLettered,
            job.organization_id,
            json!({ "job_id": job.id, "kind": job.kind.as_str(), "error": err.to_string() }),
        ));
        Ok(JobOutcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use campaign_core::clock::ManualClock;
    use campaign_core::error::PlatformError;
    use campaign_core::event_bus::CaptureSink;
    use campaign_core::types::{ConnectedAccount, SyncStatus};
    use campaign_platform::audit::AuditLog;

    use crate::queue::MemoryJobQueue;

    #[derive(Default)]
    struct ScriptedHandler {
        results: Mutex<VecDeque<CoreResult<()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn failing(errors: Vec<CoreError>) -> Self {
            Self {
                results: Mutex::new(errors.into_iter().map(Err).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &Job) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    /// Blocks inside `handle` until the gate opens.
    struct GatedHandler {
        started: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn handle(&self, _job: &Job) -> CoreResult<()> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<MemoryJobQueue>,
        audit: Arc<AuditLog>,
        sink: Arc<CaptureSink>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        Fixture {
            queue: Arc::new(MemoryJobQueue::new(clock.clone(), &WorkerConfig::default())),
            clock,
            audit: Arc::new(AuditLog::new()),
            sink: Arc::new(CaptureSink::new()),
        }
    }

    fn pool(f: &Fixture, handler: Arc<dyn JobHandler>, config: WorkerConfig, max_attempts: u32) -> WorkerPool {
        WorkerPool::new(
            f.queue.clone(),
            handler,
            f.audit.clone(),
            f.sink.clone(),
            f.clock.clone(),
            config,
            RetryPolicy {
                max_attempts,
                jitter: false,
                ..RetryPolicy::default()
            },
        )
    }

    fn account(organization_id: Uuid) -> ConnectedAccount {
        let now = Utc::now();
        ConnectedAccount {
            id: Uuid::new_v4(),
            organization_id,
            platform: Platform::Meta,
            external_account_id: "act_1".into(),
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

    async fn enqueue_sync(f: &Fixture, organization_id: Uuid) -> Uuid {
        let job = Job::sync(&account(organization_id), "1", f.clock.now());
        let id = job.id;
        f.queue.enqueue(job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_successful_job_is_acked() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::default());
        let pool = pool(&f, handler.clone(), WorkerConfig::default(), 5);
        enqueue_sync(&f, Uuid::new_v4()).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(pool.process_next().await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_dead_letter() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::failing(vec![
            PlatformError::TransientNetwork("reset".into()).into(),
            PlatformError::TransientNetwork("reset".into()).into(),
        ]));
        let pool = pool(&f, handler, WorkerConfig::default(), 2);
        let job_id = enqueue_sync(&f, Uuid::new_v4()).await;

        let first = pool.process_next().await.unwrap();
        assert_eq!(first, Some(JobOutcome::Retried { delay: Duration::from_secs(1) }));
        // Not due yet.
        assert_eq!(pool.process_next().await.unwrap(), None);

        f.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::DeadLettered));

        let dead = f.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, job_id);
        assert_eq!(f.audit.count_kind(AuditKind::JobDeadLettered), 1);
        assert_eq!(f.sink.count_kind(NotificationKind::JobDeadLettered), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_stretches_backoff() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::failing(vec![PlatformError::RateLimited {
            retry_after: Duration::from_secs(45),
        }
        .into()]));
        let pool = pool(&f, handler, WorkerConfig::default(), 5);
        enqueue_sync(&f, Uuid::new_v4()).await;

        assert_eq!(
            pool.process_next().await.unwrap(),
            Some(JobOutcome::Retried { delay: Duration::from_secs(45) })
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::failing(vec![CoreError::NeedsReauth {
            account_id: Uuid::new_v4(),
        }]));
        let pool = pool(&f, handler.clone(), WorkerConfig::default(), 5);
        enqueue_sync(&f, Uuid::new_v4()).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::Failed));
        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(pool.process_next().await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.audit.count_kind(AuditKind::JobFailed), 1);
        assert!(f.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_organization_limit_defers_extra_jobs() {
        let f = fixture();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(GatedHandler {
            started: started.clone(),
            gate: gate.clone(),
        });
        let config = WorkerConfig {
            per_organization_limit: 1,
            ..WorkerConfig::default()
        };
        let pool = Arc::new(pool(&f, handler, config, 5));
        let org = Uuid::new_v4();
        enqueue_sync(&f, org).await;
        enqueue_sync(&f, org).await;

        let busy = pool.clone();
        let first = tokio::spawn(async move { busy.process_next().await });
        started.notified().await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::Deferred));
        assert_eq!(f.queue.stats().ready, 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), Some(JobOutcome::Completed));
    }

    #[tokio::test]
    async fn test_second_sync_of_busy_account_is_deferred_without_holding_slot() {
        let f = fixture();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(GatedHandler {
            started: started.clone(),
            gate: gate.clone(),
        });
        let config = WorkerConfig {
            per_organization_limit: 2,
            ..WorkerConfig::default()
        };
        let pool = Arc::new(pool(&f, handler, config, 5));
        let org = Uuid::new_v4();
        let shared = account(org);
        f.queue.enqueue(Job::sync(&shared, "scheduled", f.clock.now())).await.unwrap();
        f.queue.enqueue(Job::sync(&shared, "manual-1", f.clock.now())).await.unwrap();

        let busy = pool.clone();
        let first = tokio::spawn(async move { busy.process_next().await });
        started.notified().await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobOutcome::Deferred));
        assert_eq!(f.queue.stats().ready, 1);
        let org_slots = pool.per_organization.get(&org).unwrap().clone();
        assert_eq!(org_slots.available_permits(), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), Some(JobOutcome::Completed));
        assert_eq!(org_slots.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::default());
        let config = WorkerConfig {
            max_concurrent_jobs: 2,
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        };
        let pool = Arc::new(pool(&f, handler.clone(), config, 5));
        enqueue_sync(&f, Uuid::new_v4()).await;

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(pool.run(rx));
        for _ in 0..200 {
            if handler.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
