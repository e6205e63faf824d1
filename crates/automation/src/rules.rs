//! Automation rules: storage and evaluation.
//!
//! An evaluation reads each target campaign's normalized metrics over the
//! rule's trailing window, compares the aggregate against the threshold and
//! either enqueues an action job (auto) or opens a pending action
//! (require_approval). A rule inside its cool-down is skipped entirely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_adapters::AdapterRegistry;
use campaign_core::clock::Clock;
use campaign_core::config::AutomationConfig;
use campaign_core::error::{CoreError, CoreResult, PlatformError};
use campaign_core::types::{
    schedule_slot, ActionCommand, ApprovalMode, AutomationRule, Campaign, CampaignStatus, Job,
    ProposedMutation, RuleAction, RuleScope, TimeWindow,
};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};
use campaign_sync::metric_store::MetricStore;
use campaign_sync::queue::{EnqueueOutcome, JobQueue};
use campaign_sync::store::CampaignStore;

use crate::actions::validate_budget;
use crate::approvals::ApprovalGate;

// ─── Rule Store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RuleStore {
    rules: DashMap<Uuid, AutomationRule>,
}

/// Reject rules that can never evaluate meaningfully.
pub fn validate_rule(rule: &AutomationRule) -> CoreResult<()> {
    let invalid = |msg: String| -> CoreResult<()> { Err(PlatformError::Validation(msg).into()) };
    if rule.name.trim().is_empty() {
        return invalid("rule name must not be empty".into());
    }
    if rule.condition.window_secs <= 0 {
        return invalid(format!("evaluation window {}s must be positive", rule.condition.window_secs));
    }
    if !rule.condition.threshold.is_finite() {
        return invalid("threshold must be a finite number".into());
    }
    if rule.cadence_secs <= 0 {
        return invalid(format!("cadence {}s must be positive", rule.cadence_secs));
    }
    if let RuleAction::AdjustBudget { percent } = rule.action {
        if !percent.is_finite() || percent == 0.0 {
            return invalid(format!("budget adjustment {percent}% is not a change"));
        }
    }
    if let RuleScope::Campaigns(ids) = &rule.scope {
        if ids.is_empty() {
            return invalid("campaign scope must name at least one campaign".into());
        }
    }
    Ok(())
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule. Evaluation bookkeeping of an existing rule
    /// is kept so an edit cannot reset its cool-down.
    pub fn upsert(&self, mut rule: AutomationRule) -> CoreResult<AutomationRule> {
        validate_rule(&rule)?;
        if let Some(existing) = self.rules.get(&rule.id) {
            if existing.organization_id != rule.organization_id {
                return Err(CoreError::Forbidden(format!(
                    "rule {} belongs to another organization",
                    rule.id
                )));
            }
            rule.last_evaluated_at = existing.last_evaluated_at;
            rule.last_triggered_at = existing.last_triggered_at;
        }
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    pub fn get(&self, id: Uuid) -> CoreResult<AutomationRule> {
        self.rules
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("rule {id}")))
    }

    pub fn list_enabled(&self) -> Vec<AutomationRule> {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn list_for_organization(&self, organization_id: Uuid) -> Vec<AutomationRule> {
        self.rules
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> CoreResult<AutomationRule> {
        self.update(id, |r| r.enabled = enabled)
    }

    fn mark_evaluated(&self, id: Uuid, at: DateTime<Utc>, triggered: bool) -> CoreResult<AutomationRule> {
        self.update(id, |r| {
            r.last_evaluated_at = Some(at);
            if triggered {
                r.last_triggered_at = Some(at);
            }
        })
    }

    fn update<F>(&self, id: Uuid, apply: F) -> CoreResult<AutomationRule>
    where
        F: FnOnce(&mut AutomationRule),
    {
        let mut entry = self
            .rules
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {id}")))?;
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }
}

// ─── Rule Engine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    CoolingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub rule_id: Uuid,
    pub evaluated_at: DateTime<Utc>,
    pub skipped: Option<SkipReason>,
    pub campaigns_evaluated: usize,
    /// Campaigns whose metrics met the condition.
    pub campaigns_matched: usize,
    pub actions_enqueued: usize,
    pub approvals_requested: usize,
    /// Budget proposals refused by platform limits.
    pub validations_rejected: usize,
    pub duplicates: usize,
}

impl EvaluationReport {
    fn new(rule_id: Uuid, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            rule_id,
            evaluated_at,
            skipped: None,
            campaigns_evaluated: 0,
            campaigns_matched: 0,
            actions_enqueued: 0,
            approvals_requested: 0,
            validations_rejected: 0,
            duplicates: 0,
        }
    }

    pub fn triggered(&self) -> bool {
        self.campaigns_matched > 0
    }
}

pub struct RuleEngine {
    rules: Arc<RuleStore>,
    campaigns: Arc<CampaignStore>,
    metrics: Arc<MetricStore>,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn JobQueue>,
    approvals: Arc<ApprovalGate>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: AutomationConfig,
    campaign_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl RuleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<RuleStore>,
        campaigns: Arc<CampaignStore>,
        metrics: Arc<MetricStore>,
        registry: Arc<AdapterRegistry>,
        queue: Arc<dyn JobQueue>,
        approvals: Arc<ApprovalGate>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            rules,
            campaigns,
            metrics,
            registry,
            queue,
            approvals,
            audit,
            clock,
            config,
            campaign_locks: DashMap::new(),
        }
    }

    pub async fn evaluate(&self, rule_id: Uuid) -> CoreResult<EvaluationReport> {
        let rule = self.rules.get(rule_id)?;
        let now = self.clock.now();
        let mut report = EvaluationReport::new(rule_id, now);

        if !rule.enabled {
            debug!(rule_id = %rule_id, "rule disabled, not evaluated");
            report.skipped = Some(SkipReason::Disabled);
            return Ok(report);
        }
        if let Some(last) = rule.last_triggered_at {
            if now < last + chrono::Duration::seconds(self.config.cooldown_secs) {
                debug!(rule_id = %rule_id, last_triggered = %last, "rule cooling down");
                self.rules.mark_evaluated(rule_id, now, false)?;
                report.skipped = Some(SkipReason::CoolingDown);
                return Ok(report);
            }
        }

        let window = TimeWindow::trailing(now, rule.condition.window_secs);
        let slot = schedule_slot(now, rule.cadence_secs);
        for campaign in self.targets(&rule) {
            let lock = self
                .campaign_locks
                .entry(campaign.id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;

            // Re-read under the lock; an action may have moved it meanwhile.
            let Ok(campaign) = self.campaigns.get(campaign.id) else {
                continue;
            };
            if !is_applicable(&rule.action, &campaign) {
                continue;
            }
            report.campaigns_evaluated += 1;

            let totals = self.metrics.totals(&[campaign.id], &window);
            let Some(value) = totals.value(rule.condition.metric) else {
                continue;
            };
            if !rule.condition.comparator.compare(value, rule.condition.threshold) {
                continue;
            }
            report.campaigns_matched += 1;
            info!(
                rule_id = %rule.id,
                campaign_id = %campaign.id,
                metric = ?rule.condition.metric,
                value,
                threshold = rule.condition.threshold,
                "rule condition met"
            );

            let Some(mutation) = self.propose(&rule, &campaign, value)? else {
                report.validations_rejected += 1;
                continue;
            };
            match rule.approval_mode {
                ApprovalMode::Auto => {
                    let job = Job::action(
                        campaign.organization_id,
                        campaign.platform,
                        format!("action:{}:{}:{}", rule.id, campaign.id, slot),
                        ActionCommand {
                            campaign_id: campaign.id,
                            mutation,
                            rule_id: Some(rule.id),
                            pending_action_id: None,
                        },
                        now,
                    );
                    match self.queue.enqueue(job).await? {
                        EnqueueOutcome::Enqueued(_) => report.actions_enqueued += 1,
                        EnqueueOutcome::Duplicate => report.duplicates += 1,
                    }
                }
                ApprovalMode::RequireApproval => {
                    self.approvals.create(&rule, &campaign, mutation);
                    report.approvals_requested += 1;
                }
            }
        }

        self.rules.mark_evaluated(rule_id, now, report.triggered())?;
        if report.triggered() {
            metrics::counter!("rules.triggered").increment(1);
        }
        info!(
            rule_id = %rule_id,
            evaluated = report.campaigns_evaluated,
            matched = report.campaigns_matched,
            enqueued = report.actions_enqueued,
            approvals = report.approvals_requested,
            "rule evaluated"
        );
        Ok(report)
    }

    /// Launched campaigns in the rule's scope and organization.
    fn targets(&self, rule: &AutomationRule) -> Vec<Campaign> {
        let candidates = match &rule.scope {
            RuleScope::Organization => self.campaigns.list_for_organization(rule.organization_id),
            RuleScope::Campaigns(ids) => ids
                .iter()
                .filter_map(|id| self.campaigns.get(*id).ok())
                .collect(),
        };
        candidates
            .into_iter()
            .filter(|c| c.organization_id == rule.organization_id && c.native_id.is_some())
            .collect()
    }

    /// Build the mutation for a triggered campaign. `None` when a budget
    /// proposal breaks platform limits; that is audited here and never
    /// reaches the platform.
    fn propose(
        &self,
        rule: &AutomationRule,
        campaign: &Campaign,
        observed: f64,
    ) -> CoreResult<Option<ProposedMutation>> {
        let mutation = match &rule.action {
            RuleAction::Pause => ProposedMutation::SetStatus { target: CampaignStatus::Paused },
            RuleAction::Resume => ProposedMutation::SetStatus { target: CampaignStatus::Active },
            RuleAction::Notify { message } => ProposedMutation::Notify { message: message.clone() },
            RuleAction::AdjustBudget { percent } => {
                let proposed = campaign.budget * (1.0 + percent / 100.0);
                let limits = self.registry.get(campaign.platform)?.budget_limits();
                match validate_budget(proposed, limits) {
                    Ok(to) => ProposedMutation::SetBudget { from: campaign.budget, to },
                    Err(err) => {
                        warn!(
                            rule_id = %rule.id,
                            campaign_id = %campaign.id,
                            proposed,
                            error = %err,
                            "budget adjustment rejected"
                        );
                        self.audit.append(
                            AuditEntry::new(AuditKind::ValidationRejected, "campaign", campaign.id)
                                .organization(campaign.organization_id)
                                .detail(json!({
                                    "rule_id": rule.id,
                                    "observed": observed,
                                    "current_budget": campaign.budget,
                                    "proposed_budget": proposed,
                                    "floor": limits.floor,
                                    "reason": err.to_string(),
                                })),
                        );
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(mutation))
    }
}

/// Pause targets active campaigns, resume targets paused ones; budget and
/// notify actions apply to either.
pub fn is_applicable(action: &RuleAction, campaign: &Campaign) -> bool {
    match action {
        RuleAction::Pause => campaign.status == CampaignStatus::Active,
        RuleAction::Resume => campaign.status == CampaignStatus::Paused,
        RuleAction::AdjustBudget { .. } | RuleAction::Notify { .. } => matches!(
            campaign.status,
            CampaignStatus::Active | CampaignStatus::Paused
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{Comparator, Metric, RuleCondition};

    fn rule() -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "Scale winners".into(),
            scope: RuleScope::Organization,
            condition: RuleCondition {
                metric: Metric::Roas,
                comparator: Comparator::GreaterThan,
                threshold: 3.0,
                window_secs: 86_400,
            },
            action: RuleAction::AdjustBudget { percent: 20.0 },
            approval_mode: ApprovalMode::Auto,
            enabled: true,
            cadence_secs: 900,
            last_evaluated_at: None,
            last_triggered_at: None,
        }
    }

    #[test]
    fn test_validate_rule_rejects_degenerate_rules() {
        assert!(validate_rule(&rule()).is_ok());

        let mut no_window = rule();
        no_window.condition.window_secs = 0;
        assert!(validate_rule(&no_window).is_err());

        let mut no_change = rule();
        no_change.action = RuleAction::AdjustBudget { percent: 0.0 };
        assert!(validate_rule(&no_change).is_err());

        let mut empty_scope = rule();
        empty_scope.scope = RuleScope::Campaigns(vec![]);
        assert!(validate_rule(&empty_scope).is_err());
    }

    #[test]
    fn test_upsert_keeps_cooldown_bookkeeping() {
        let store = RuleStore::new();
        let original = store.upsert(rule()).unwrap();
        let now = Utc::now();
        store.mark_evaluated(original.id, now, true).unwrap();

        let mut edited = original.clone();
        edited.condition.threshold = 4.0;
        let saved = store.upsert(edited).unwrap();
        assert_eq!(saved.last_triggered_at, Some(now));
        assert_eq!(saved.condition.threshold, 4.0);

        let mut foreign = original;
        foreign.organization_id = Uuid::new_v4();
        assert!(matches!(store.upsert(foreign), Err(CoreError::Forbidden(_))));
    }

    #[test]
    fn test_set_enabled_filters_enabled_listing() {
        let store = RuleStore::new();
        let saved = store.upsert(rule()).unwrap();
        assert_eq!(store.list_enabled().len(), 1);
        store.set_enabled(saved.id, false).unwrap();
        assert!(store.list_enabled().is_empty());
        assert_eq!(store.list_for_organization(saved.organization_id).len(), 1);
    }

    #[test]
    fn test_applicability_follows_action() {
        let now = Utc::now();
        let mut campaign = Campaign {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            platform: campaign_core::types::Platform::Meta,
            name: "c".into(),
            native_id: Some("m-1".into()),
            status: CampaignStatus::Active,
            budget: 10.0,
            options: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        assert!(is_applicable(&RuleAction::Pause, &campaign));
        assert!(!is_applicable(&RuleAction::Resume, &campaign));
        campaign.status = CampaignStatus::Paused;
        assert!(is_applicable(&RuleAction::Resume, &campaign));
        assert!(is_applicable(&RuleAction::AdjustBudget { percent: 10.0 }, &campaign));
        campaign.status = CampaignStatus::Archived;
        assert!(!is_applicable(&RuleAction::Notify { message: "x".into() }, &campaign));
    }
}
