//! Approval gate for actions proposed by `require_approval` rules.
//!
//! pending -> {approved, rejected, expired}. Only a human with at least the
//! configured approver role may decide. Expired actions are never applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::clock::Clock;
use campaign_core::config::AutomationConfig;
use campaign_core::error::{CoreError, CoreResult};
use campaign_core::event_bus::{NotificationEvent, NotificationKind, NotificationSink};
use campaign_core::types::{
    ActionCommand, Actor, AutomationRule, Campaign, Decision, DecisionState, Job, PendingAction,
    ProposedMutation,
};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};
use campaign_sync::queue::{EnqueueOutcome, JobQueue};
use campaign_sync::store::CampaignStore;

/// Idempotency key of the action job an approval creates.
pub fn approval_key(pending_action_id: Uuid) -> String {
    format!("action:approval:{pending_action_id}")
}

pub struct ApprovalGate {
    actions: DashMap<Uuid, PendingAction>,
    queue: Arc<dyn JobQueue>,
    campaigns: Arc<CampaignStore>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: AutomationConfig,
    /// Serializes decisions so a pending action is resolved exactly once.
    decide_lock: tokio::sync::Mutex<()>,
}

impl ApprovalGate {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        campaigns: Arc<CampaignStore>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            actions: DashMap::new(),
            queue,
            campaigns,
            audit,
            notifier,
            clock,
            config,
            decide_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Hold a proposed mutation for human review.
    pub fn create(
        &self,
        rule: &AutomationRule,
        campaign: &Campaign,
        mutation: ProposedMutation,
    ) -> PendingAction {
        let now = self.clock.now();
        let id = Uuid::new_v4();
        let pending = PendingAction {
            id,
            organization_id: rule.organization_id,
            rule_id: rule.id,
            campaign_id: campaign.id,
            mutation,
            state: DecisionState::Pending,
            idempotency_key: approval_key(id),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.approval_ttl_secs),
            decided_by: None,
            decided_at: None,
        };
        self.actions.insert(id, pending.clone());

        self.audit.append(
            AuditEntry::new(AuditKind::ApprovalRequested, "pending_action", id)
                .organization(pending.organization_id)
                .after(serde_json::to_value(&pending).unwrap_or_default()),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::ApprovalRequested,
            pending.organization_id,
            json!({
                "pending_action_id": id,
                "rule_id": rule.id,
                "rule_name": rule.name,
                "campaign_id": campaign.id,
                "campaign_name": campaign.name,
                "mutation": pending.mutation,
                "expires_at": pending.expires_at,
            }),
        ));
        info!(pending_action_id = %id, rule_id = %rule.id, campaign_id = %campaign.id, "approval requested");
        pending
    }

    pub fn get(&self, id: Uuid) -> CoreResult<PendingAction> {
        self.actions
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("pending action {id}")))
    }

    /// Pending actions of one organization, oldest first. Actions past their
    /// TTL are expired on the way.
    pub fn list_pending(&self, organization_id: Uuid) -> Vec<PendingAction> {
        self.expire_stale();
        let mut pending: Vec<PendingAction> = self
            .actions
            .iter()
            .filter(|a| a.organization_id == organization_id && a.state == DecisionState::Pending)
            .map(|a| a.value().clone())
            .collect();
        pending.sort_by_key(|a| a.created_at);
        pending
    }

    /// Resolve a pending action. Approval enqueues exactly one action job
    /// keyed by the pending action's idempotency key.
    pub async fn decide(&self, id: Uuid, decision: Decision, actor: Actor) -> CoreResult<PendingAction> {
        let decider = match actor {
            Actor::User { id, role } if role >= self.config.approver_role => id,
            Actor::User { role, .. } => {
                return Err(CoreError::Forbidden(format!(
                    "role {role:?} cannot decide pending actions"
                )))
            }
            Actor::System => {
                return Err(CoreError::Forbidden(
                    "pending actions are decided by people only".to_string(),
                ))
            }
        };

        let _guard = self.decide_lock.lock().await;
        let pending = self.get(id)?;
        if pending.state != DecisionState::Pending {
            return Err(CoreError::StateConflict(format!(
                "pending action {id} is already {:?}",
                pending.state
            )));
        }
        let now = self.clock.now();
        if now >= pending.expires_at {
            self.expire(id);
            return Err(CoreError::StateConflict(format!("pending action {id} has expired")));
        }

        let state = match decision {
            Decision::Approved => DecisionState::Approved,
            Decision::Rejected => DecisionState::Rejected,
        };
        let (before, after) = self.resolve(id, state, Some(decider))?;
        if decision == Decision::Approved {
            // The job only exists once the action is Approved; roll back if
            // it cannot be queued so the action stays decidable.
            if let Err(err) = self.enqueue_approved(&after, now).await {
                self.actions.insert(id, before);
                warn!(pending_action_id = %id, error = %err, "approved action could not be queued, left pending");
                return Err(err);
            }
        }
        let kind = match decision {
            Decision::Approved => AuditKind::ActionApproved,
            Decision::Rejected => AuditKind::ActionRejected,
        };
        self.audit.append(
            AuditEntry::new(kind, "pending_action", id)
                .organization(after.organization_id)
                .actor(actor)
                .before(json!({ "state": before.state }))
                .after(json!({ "state": after.state, "decided_by": decider })),
        );
        if decision == Decision::Rejected {
            self.notifier.emit(NotificationEvent::new(
                NotificationKind::ActionRejected,
                after.organization_id,
                json!({ "pending_action_id": id, "rule_id": after.rule_id, "decided_by": decider }),
            ));
        }
        info!(pending_action_id = %id, decision = ?decision, decided_by = %decider, "pending action decided");
        Ok(after)
    }

    async fn enqueue_approved(&self, approved: &PendingAction, now: DateTime<Utc>) -> CoreResult<()> {
        let campaign = self.campaigns.get(approved.campaign_id)?;
        let job = Job::action(
            approved.organization_id,
            campaign.platform,
            approved.idempotency_key.clone(),
            ActionCommand {
                campaign_id: approved.campaign_id,
                mutation: approved.mutation.clone(),
                rule_id: Some(approved.rule_id),
                pending_action_id: Some(approved.id),
            },
            now,
        );
        if self.queue.enqueue(job).await? == EnqueueOutcome::Duplicate {
            warn!(pending_action_id = %approved.id, "action job for approval already queued");
        }
        Ok(())
    }

    /// Fails unless the pending action exists and was approved.
    pub fn ensure_approved(&self, id: Uuid) -> CoreResult<()> {
        let action = self.get(id)?;
        if action.state != DecisionState::Approved {
            return Err(CoreError::StateConflict(format!(
                "pending action {id} is {:?}, not approved",
                action.state
            )));
        }
        Ok(())
    }

    /// Expire every pending action past its TTL. Returns how many expired.
    /// Skipped while a decision is in flight; the next sweep picks them up.
    pub fn expire_stale(&self) -> usize {
        let Ok(_guard) = self.decide_lock.try_lock() else {
            debug!("decision in flight, deferring expiry sweep");
            return 0;
        };
        let now = self.clock.now();
        let stale: Vec<Uuid> = self
            .actions
            .iter()
            .filter(|a| a.state == DecisionState::Pending && now >= a.expires_at)
            .map(|a| a.id)
            .collect();
        stale.into_iter().filter(|id| self.expire(*id)).count()
    }

    /// Drop decided and expired actions older than the retention window.
    pub fn prune_resolved(&self) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::seconds(self.config.resolved_retention_secs);
        let before = self.actions.len();
        self.actions.retain(|_, a| {
            a.state == DecisionState::Pending || a.decided_at.map_or(true, |at| at > cutoff)
        });
        let pruned = before - self.actions.len();
        if pruned > 0 {
            debug!(pruned, "pruned resolved pending actions");
        }
        pruned
    }

    fn expire(&self, id: Uuid) -> bool {
        let Ok((before, after)) = self.resolve(id, DecisionState::Expired, None) else {
            return false;
        };
        self.audit.append(
            AuditEntry::new(AuditKind::ActionExpired, "pending_action", id)
                .organization(after.organization_id)
                .before(json!({ "state": before.state }))
                .after(json!({ "state": after.state })),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::ApprovalExpired,
            after.organization_id,
            json!({ "pending_action_id": id, "rule_id": after.rule_id, "campaign_id": after.campaign_id }),
        ));
        info!(pending_action_id = %id, "pending action expired unapplied");
        true
    }

    /// Move a still-pending action to `state`.
    fn resolve(
        &self,
        id: Uuid,
        state: DecisionState,
        decided_by: Option<Uuid>,
    ) -> CoreResult<(PendingAction, PendingAction)> {
        let mut entry = self
            .actions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("pending action {id}")))?;
        if entry.state != DecisionState::Pending {
            return Err(CoreError::StateConflict(format!(
                "pending action {id} is already {:?}",
                entry.state
            )));
        }
        let before = entry.value().clone();
        entry.state = state;
        entry.decided_by = decided_by;
        entry.decided_at = Some(self.clock.now());
        Ok((before, entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use campaign_core::clock::ManualClock;
    use campaign_core::config::WorkerConfig;
    use campaign_core::event_bus::CaptureSink;
    use campaign_core::types::{
        ApprovalMode, CampaignStatus, Comparator, Metric, Platform, Role, RuleAction, RuleCondition,
        RuleScope,
    };
    use campaign_platform::audit::AuditLog;
    use campaign_sync::queue::MemoryJobQueue;

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<MemoryJobQueue>,
        audit: Arc<AuditLog>,
        sink: Arc<CaptureSink>,
        gate: ApprovalGate,
        rule: AutomationRule,
        campaign: Campaign,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(MemoryJobQueue::new(clock.clone(), &WorkerConfig::default()));
        let campaigns = Arc::new(CampaignStore::new(clock.clone()));
        let audit = Arc::new(AuditLog::new());
        let sink = Arc::new(CaptureSink::new());
        let org = Uuid::new_v4();
        let now = clock.now();
        let campaign = campaigns.insert(Campaign {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            organization_id: org,
            platform: Platform::Google,
            name: "Brand".into(),
            native_id: Some("111".into()),
            status: CampaignStatus::Active,
            budget: 100.0,
            options: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        });
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            organization_id: org,
            name: "Pause losers".into(),
            scope: RuleScope::Organization,
            condition: RuleCondition {
                metric: Metric::Roas,
                comparator: Comparator::LessThan,
                threshold: 1.0,
                window_secs: 86_400,
            },
            action: RuleAction::Pause,
            approval_mode: ApprovalMode::RequireApproval,
            enabled: true,
            cadence_secs: 900,
            last_evaluated_at: None,
            last_triggered_at: None,
        };
        let gate = ApprovalGate::new(
            queue.clone(),
            campaigns,
            audit.clone(),
            sink.clone(),
            clock.clone(),
            AutomationConfig::default(),
        );
        Fixture { clock, queue, audit, sink, gate, rule, campaign }
    }

    fn manager() -> Actor {
        Actor::User { id: Uuid::new_v4(), role: Role::Manager }
    }

    fn pause() -> ProposedMutation {
        ProposedMutation::SetStatus { target: CampaignStatus::Paused }
    }

    #[tokio::test]
    async fn test_approve_enqueues_one_job_with_stored_key() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        assert_eq!(f.sink.count_kind(NotificationKind::ApprovalRequested), 1);
        assert_eq!(f.gate.list_pending(f.rule.organization_id).len(), 1);

        let decided = f.gate.decide(pending.id, Decision::Approved, manager()).await.unwrap();
        assert_eq!(decided.state, DecisionState::Approved);

        let jobs = f.queue.pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].idempotency_key, pending.idempotency_key);

        let again = f.gate.decide(pending.id, Decision::Approved, manager()).await;
        assert!(matches!(again, Err(CoreError::StateConflict(_))));
        assert_eq!(f.queue.pending().len(), 1);
        assert_eq!(f.audit.count_kind(AuditKind::ActionApproved), 1);
    }

    #[tokio::test]
    async fn test_late_approval_of_expired_action_is_refused() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        f.clock.advance(chrono::Duration::seconds(AutomationConfig::default().approval_ttl_secs));

        let result = f.gate.decide(pending.id, Decision::Approved, manager()).await;
        assert!(matches!(result, Err(CoreError::StateConflict(_))));
        assert_eq!(f.gate.get(pending.id).unwrap().state, DecisionState::Expired);
        assert!(f.queue.pending().is_empty());
        assert_eq!(f.sink.count_kind(NotificationKind::ApprovalExpired), 1);
    }

    #[tokio::test]
    async fn test_insufficient_role_and_system_are_forbidden() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        let member = Actor::User { id: Uuid::new_v4(), role: Role::Member };

        assert!(matches!(
            f.gate.decide(pending.id, Decision::Approved, member).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            f.gate.decide(pending.id, Decision::Approved, Actor::System).await,
            Err(CoreError::Forbidden(_))
        ));
        assert_eq!(f.gate.get(pending.id).unwrap().state, DecisionState::Pending);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal_and_enqueues_nothing() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        let admin = Actor::User { id: Uuid::new_v4(), role: Role::Admin };

        let decided = f.gate.decide(pending.id, Decision::Rejected, admin).await.unwrap();
        assert_eq!(decided.state, DecisionState::Rejected);
        assert!(f.queue.pending().is_empty());
        assert!(f.gate.decide(pending.id, Decision::Approved, admin).await.is_err());
        assert_eq!(f.sink.count_kind(NotificationKind::ActionRejected), 1);
    }

    #[test]
    fn test_expire_stale_sweeps_only_overdue_actions() {
        let f = fixture();
        f.gate.create(&f.rule, &f.campaign, pause());
        f.clock.advance(chrono::Duration::hours(12));
        let fresh = f.gate.create(&f.rule, &f.campaign, pause());
        f.clock.advance(chrono::Duration::hours(13));

        assert_eq!(f.gate.expire_stale(), 1);
        let remaining = f.gate.list_pending(f.rule.organization_id);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
        assert_eq!(f.audit.count_kind(AuditKind::ActionExpired), 1);
    }

    #[tokio::test]
    async fn test_queue_outage_leaves_approval_pending() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        f.queue.set_available(false);

        let result = f.gate.decide(pending.id, Decision::Approved, manager()).await;
        assert!(matches!(result, Err(CoreError::StoreUnavailable(_))));
        assert_eq!(f.gate.get(pending.id).unwrap().state, DecisionState::Pending);
        assert!(f.gate.ensure_approved(pending.id).is_err());
        assert_eq!(f.audit.count_kind(AuditKind::ActionApproved), 0);

        f.queue.set_available(true);
        f.gate.decide(pending.id, Decision::Approved, manager()).await.unwrap();
        assert!(f.gate.ensure_approved(pending.id).is_ok());
        assert_eq!(f.queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_sweep_waits_for_in_flight_decision() {
        let f = fixture();
        let pending = f.gate.create(&f.rule, &f.campaign, pause());
        f.clock.advance(chrono::Duration::hours(25));

        let held = f.gate.decide_lock.lock().await;
        assert_eq!(f.gate.expire_stale(), 0);
        assert_eq!(f.gate.get(pending.id).unwrap().state, DecisionState::Pending);
        drop(held);

        assert_eq!(f.gate.expire_stale(), 1);
        assert_eq!(f.gate.get(pending.id).unwrap().state, DecisionState::Expired);
        assert!(matches!(
            f.gate.ensure_approved(pending.id),
            Err(CoreError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_resolved_actions_are_pruned_after_retention() {
        let f = fixture();
        let approved = f.gate.create(&f.rule, &f.campaign, pause());
        let open = f.gate.create(&f.rule, &f.campaign, pause());
        f.gate.decide(approved.id, Decision::Approved, manager()).await.unwrap();

        assert_eq!(f.gate.prune_resolved(), 0);
        f.clock.advance(chrono::Duration::seconds(
            AutomationConfig::default().resolved_retention_secs + 1,
        ));
        // The open action expires now and is kept for its own retention.
        assert_eq!(f.gate.expire_stale(), 1);
        assert_eq!(f.gate.prune_resolved(), 1);
        assert!(matches!(f.gate.get(approved.id), Err(CoreError::NotFound(_))));
        assert_eq!(f.gate.get(open.id).unwrap().state, DecisionState::Expired);
    }
}
