//! Periodic driver: enqueues per-account sync jobs and per-rule evaluation
//! jobs for the current schedule slot, sweeps expiring tokens and stale
//! approvals. Stops enqueueing while the queue or credential store is down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use campaign_core::clock::Clock;
use campaign_core::config::SchedulerConfig;
use campaign_core::error::CoreResult;
use campaign_core::types::{schedule_slot, Job};
use campaign_platform::credentials::CredentialStore;
use campaign_sync::queue::{EnqueueOutcome, JobQueue};
use campaign_sync::store::AccountStore;
use campaign_sync::tokens::{RefreshSweep, TokenManager};

use crate::actions::ActionExecutor;
use crate::approvals::ApprovalGate;
use crate::rules::RuleStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub syncs_enqueued: usize,
    pub evaluations_enqueued: usize,
    pub duplicates: usize,
    pub approvals_expired: usize,
    pub approvals_pruned: usize,
    /// Finished queue keys plus applied action keys.
    pub keys_pruned: usize,
    /// A dependency was unreachable; nothing (more) was enqueued.
    pub halted: bool,
}

pub struct Scheduler {
    accounts: Arc<AccountStore>,
    rules: Arc<RuleStore>,
    queue: Arc<dyn JobQueue>,
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<TokenManager>,
    approvals: Arc<ApprovalGate>,
    actions: Arc<ActionExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<AccountStore>,
        rules: Arc<RuleStore>,
        queue: Arc<dyn JobQueue>,
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<TokenManager>,
        approvals: Arc<ApprovalGate>,
        actions: Arc<ActionExecutor>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            accounts,
            rules,
            queue,
            credentials,
            tokens,
            approvals,
            actions,
            clock,
            config,
        }
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if let Err(err) = self.dependencies_up().await {
            warn!(error = %err, "dependency unavailable, scheduler not enqueueing");
            report.halted = true;
            return report;
        }

        let now = self.clock.now();
        let sync_slot = schedule_slot(now, self.config.sync_interval_secs);
        let mut jobs: Vec<Job> = self
            .accounts
            .list_active()
            .iter()
            .map(|account| Job::sync(account, &sync_slot, now))
            .collect();
        let syncs = jobs.len();
        jobs.extend(
            self.rules
                .list_enabled()
                .iter()
                .map(|rule| Job::evaluate(rule, &schedule_slot(now, rule.cadence_secs), now)),
        );

        for (index, job) in jobs.into_iter().enumerate() {
            match self.queue.enqueue(job).await {
                Ok(EnqueueOutcome::Enqueued(_)) if index < syncs => report.syncs_enqueued += 1,
                Ok(EnqueueOutcome::Enqueued(_)) => report.evaluations_enqueued += 1,
                Ok(EnqueueOutcome::Duplicate) => report.duplicates += 1,
                Err(err) => {
                    warn!(error = %err, "enqueue failed, halting this tick");
                    report.halted = true;
                    break;
                }
            }
        }

        report.approvals_expired = self.approvals.expire_stale();
        report.approvals_pruned = self.approvals.prune_resolved();
        report.keys_pruned = self.queue.prune_keys() + self.actions.prune_applied();
        if report.syncs_enqueued + report.evaluations_enqueued > 0 {
            info!(
                syncs = report.syncs_enqueued,
                evaluations = report.evaluations_enqueued,
                duplicates = report.duplicates,
                "scheduler tick enqueued jobs"
            );
        } else {
            debug!(duplicates = report.duplicates, "scheduler tick, nothing new due");
        }
        report
    }

    pub async fn refresh_tokens(&self) -> RefreshSweep {
        if let Err(err) = self.credentials.ping().await {
            warn!(error = %err, "credential store unavailable, skipping token sweep");
            return RefreshSweep::default();
        }
        self.tokens.refresh_expiring().await
    }

    /// Drive ticks and token sweeps until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps =
            tokio::time::interval(Duration::from_secs(self.config.token_refresh_interval_secs.max(1)));
        sweeps.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_secs = self.config.tick_interval_secs,
            sync_interval_secs = self.config.sync_interval_secs,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.tick().await;
                }
                _ = sweeps.tick() => {
                    self.refresh_tokens().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    async fn dependencies_up(&self) -> CoreResult<()> {
        self.queue.ping().await?;
        self.credentials.ping().await
    }
}
