//! Executes action jobs: the remote mutation through the owning adapter,
//! then the local change and its audit record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use campaign_adapters::{AdapterRegistry, BudgetLimits, CampaignRef, CampaignUpdate, Capability, StatusAck};
use campaign_core::clock::Clock;
use campaign_core::error::{CoreError, CoreResult, PlatformError};
use campaign_core::event_bus::{NotificationEvent, NotificationKind, NotificationSink};
use campaign_core::types::{ActionCommand, Campaign, CampaignStatus, ProposedMutation, RemoteStatus};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};
use campaign_sync::store::{AccountStore, CampaignStore};
use campaign_sync::sync_engine::bounded;
use campaign_sync::tokens::TokenManager;

use crate::approvals::ApprovalGate;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Remote and local state were changed.
    Applied,
    /// The remote platform already had the requested state.
    AlreadyInState,
    /// The action's key was applied before; nothing was done.
    AlreadyApplied,
    Notified,
}

/// Re-check a proposed budget against platform limits: clamp to the
/// ceiling, refuse zero or anything under the floor.
pub fn validate_budget(proposed: f64, limits: BudgetLimits) -> Result<f64, PlatformError> {
    if !proposed.is_finite() || proposed <= 0.0 {
        return Err(PlatformError::Validation(format!(
            "budget {proposed:.2} must be positive"
        )));
    }
    if proposed < limits.floor {
        return Err(PlatformError::Validation(format!(
            "budget {proposed:.2} is below the platform floor {:.2}",
            limits.floor
        )));
    }
    Ok(proposed.min(limits.ceiling))
}

pub struct ActionExecutor {
    accounts: Arc<AccountStore>,
    campaigns: Arc<CampaignStore>,
    tokens: Arc<TokenManager>,
    registry: Arc<AdapterRegistry>,
    approvals: Arc<ApprovalGate>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    key_retention: Duration,
    /// Idempotency keys already applied, with the time they were applied.
    applied: DashMap<String, DateTime<Utc>>,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<AccountStore>,
        campaigns: Arc<CampaignStore>,
        tokens: Arc<TokenManager>,
        registry: Arc<AdapterRegistry>,
        approvals: Arc<ApprovalGate>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
        key_retention: Duration,
    ) -> Self {
        Self {
            accounts,
            campaigns,
            tokens,
            registry,
            approvals,
            audit,
            notifier,
            clock,
            call_timeout,
            key_retention,
            applied: DashMap::new(),
        }
    }

    pub fn was_applied(&self, key: &str) -> bool {
        self.applied.contains_key(key)
    }

    pub async fn execute(&self, key: &str, command: &ActionCommand) -> CoreResult<ActionOutcome> {
        if self.was_applied(key) {
            debug!(key, "action already applied, skipping");
            self.record_skip(key, command, &ActionOutcome::AlreadyApplied);
            return Ok(ActionOutcome::AlreadyApplied);
        }
        if let Some(pending_action_id) = command.pending_action_id {
            self.approvals.ensure_approved(pending_action_id)?;
        }
        let campaign = self.campaigns.get(command.campaign_id)?;
        let outcome = match &command.mutation {
            ProposedMutation::Notify { message } => self.notify(&campaign, command, message),
            ProposedMutation::SetStatus { target } => self.set_status(&campaign, command, *target).await?,
            ProposedMutation::SetBudget { to, .. } => self.set_budget(&campaign, command, *to).await?,
        };
        self.applied.insert(key.to_string(), self.clock.now());
        if outcome == ActionOutcome::AlreadyInState {
            self.record_skip(key, command, &outcome);
        }
        Ok(outcome)
    }

    /// Forget applied keys older than the retention window.
    pub fn prune_applied(&self) -> usize {
        let retention = chrono::Duration::seconds(self.key_retention.as_secs() as i64);
        let cutoff = self.clock.now() - retention;
        let before = self.applied.len();
        self.applied.retain(|_, at| *at > cutoff);
        before - self.applied.len()
    }

    fn record_skip(&self, key: &str, command: &ActionCommand, outcome: &ActionOutcome) {
        let mut entry = AuditEntry::new(AuditKind::ActionSkipped, "campaign", command.campaign_id)
            .detail(json!({
                "idempotency_key": key,
                "outcome": format!("{outcome:?}"),
                "rule_id": command.rule_id,
                "pending_action_id": command.pending_action_id,
            }));
        if let Ok(campaign) = self.campaigns.get(command.campaign_id) {
            entry = entry.organization(campaign.organization_id);
        }
        self.audit.append(entry);
    }

    fn notify(&self, campaign: &Campaign, command: &ActionCommand, message: &str) -> ActionOutcome {
        self.audit.append(
            AuditEntry::new(AuditKind::RuleNotified, "campaign", campaign.id)
                .organization(campaign.organization_id)
                .detail(json!({ "rule_id": command.rule_id, "message": message })),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::RuleNotification,
            campaign.organization_id,
            json!({
                "rule_id": command.rule_id,
                "campaign_id": campaign.id,
                "campaign_name": campaign.name,
                "message": message,
            }),
        ));
        ActionOutcome::Notified
    }

    async fn set_status(
        &self,
        campaign: &Campaign,
        command: &ActionCommand,
        target: CampaignStatus,
    ) -> CoreResult<ActionOutcome> {
        let remote_target = match target {
            CampaignStatus::Active => RemoteStatus::Active,
            CampaignStatus::Paused => RemoteStatus::Paused,
            other => {
                return Err(CoreError::StateConflict(format!(
                    "{other:?} cannot be pushed to a platform"
                )))
            }
        };
        if campaign.status != target && !campaign.status.can_transition_to(target) {
            return Err(CoreError::StateConflict(format!(
                "campaign {} cannot move from {:?} to {:?}",
                campaign.id, campaign.status, target
            )));
        }
        let native_id = Self::native_id(campaign)?;
        let account = self.accounts.get(campaign.account_id)?;
        if account.is_revoked() {
            return Err(CoreError::StateConflict(format!("account {} is disconnected", account.id)));
        }

        let token = self.tokens.get_valid_token(account.id).await?;
        let adapter = self.registry.require(campaign.platform, Capability::SetCampaignStatus)?;
        let ack = bounded(
            self.call_timeout,
            adapter.set_campaign_status(
                &token,
                CampaignRef {
                    account_id: &account.external_account_id,
                    native_id,
                },
                remote_target,
            ),
        )
        .await?;

        if campaign.status != target {
            let (before, after) = self.campaigns.transition(campaign.id, target)?;
            self.audit.append(
                AuditEntry::new(AuditKind::CampaignStatusChanged, "campaign", campaign.id)
                    .organization(campaign.organization_id)
                    .before(json!({ "status": before.status }))
                    .after(json!({ "status": after.status }))
                    .detail(json!({
                        "source": "automation",
                        "rule_id": command.rule_id,
                        "pending_action_id": command.pending_action_id,
                        "remote_ack": format!("{ack:?}"),
                    })),
            );
        }
        info!(
            campaign_id = %campaign.id,
            target = ?target,
            ack = ?ack,
            "campaign status action executed"
        );
        Ok(match ack {
            StatusAck::Applied => ActionOutcome::Applied,
            StatusAck::AlreadyInState => ActionOutcome::AlreadyInState,
        })
    }

    async fn set_budget(
        &self,
        campaign: &Campaign,
        command: &ActionCommand,
        proposed: f64,
    ) -> CoreResult<ActionOutcome> {
        let native_id = Self::native_id(campaign)?;
        let adapter = self.registry.require(campaign.platform, Capability::UpdateCampaign)?;
        let budget = match validate_budget(proposed, adapter.budget_limits()) {
            Ok(budget) => budget,
            Err(err) => {
                warn!(campaign_id = %campaign.id, error = %err, "budget action failed validation");
                self.audit.append(
                    AuditEntry::new(AuditKind::ValidationRejected, "campaign", campaign.id)
                        .organization(campaign.organization_id)
                        .detail(json!({
                            "rule_id": command.rule_id,
                            "proposed_budget": proposed,
                            "reason": err.to_string(),
                        })),
                );
                return Err(err.into());
            }
        };
        let account = self.accounts.get(campaign.account_id)?;
        if account.is_revoked() {
            return Err(CoreError::StateConflict(format!("account {} is disconnected", account.id)));
        }

        let token = self.tokens.get_valid_token(account.id).await?;
        let update = CampaignUpdate {
            budget: Some(budget),
            options: campaign.options.clone(),
            ..CampaignUpdate::default()
        };
        bounded(
            self.call_timeout,
            adapter.update_campaign(
                &token,
                CampaignRef {
                    account_id: &account.external_account_id,
                    native_id,
                },
                &update,
            ),
        )
        .await?;

        let (before, after) = self.campaigns.set_budget(campaign.id, budget)?;
        self.audit.append(
            AuditEntry::new(AuditKind::CampaignBudgetChanged, "campaign", campaign.id)
                .organization(campaign.organization_id)
                .before(json!({ "budget": before.budget }))
                .after(json!({ "budget": after.budget }))
                .detail(json!({
                    "source": "automation",
                    "rule_id": command.rule_id,
                    "pending_action_id": command.pending_action_id,
                })),
        );
        info!(campaign_id = %campaign.id, from = before.budget, to = after.budget, "campaign budget action executed");
        Ok(ActionOutcome::Applied)
    }

    fn native_id(campaign: &Campaign) -> CoreResult<&str> {
        campaign.native_id.as_deref().ok_or_else(|| {
            CoreError::StateConflict(format!("campaign {} has not been launched", campaign.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_clamped_to_ceiling() {
        let limits = BudgetLimits { floor: 5.0, ceiling: 500.0 };
        assert_eq!(validate_budget(120.0, limits), Ok(120.0));
        assert_eq!(validate_budget(900.0, limits), Ok(500.0));
    }

    #[test]
    fn test_budget_below_floor_or_zero_is_refused() {
        let limits = BudgetLimits { floor: 5.0, ceiling: 500.0 };
        assert!(matches!(validate_budget(4.99, limits), Err(PlatformError::Validation(_))));
        assert!(matches!(validate_budget(0.0, limits), Err(PlatformError::Validation(_))));
        assert!(matches!(validate_budget(-10.0, limits), Err(PlatformError::Validation(_))));
        assert!(validate_budget(f64::NAN, limits).is_err());
    }
}
