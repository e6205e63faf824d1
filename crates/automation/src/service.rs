//! Operations exposed to the rest of the platform: on-demand sync, the
//! approval inbox, immediate rule evaluation, account connection and rule
//! management.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use campaign_adapters::{AdapterRegistry, Capability};
use campaign_core::clock::Clock;
use campaign_core::config::AutomationConfig;
use campaign_core::error::{CoreError, CoreResult};
use campaign_core::types::{
    Actor, AutomationRule, ConnectedAccount, Decision, Job, PendingAction, Platform, SyncStatus,
};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};
use campaign_platform::credentials::{CredentialSecrets, CredentialStore};
use campaign_sync::queue::{EnqueueOutcome, JobQueue};
use campaign_sync::store::AccountStore;
use campaign_sync::sync_engine::bounded;

use crate::approvals::ApprovalGate;
use crate::rules::{EvaluationReport, RuleEngine, RuleStore};

pub struct Autopilot {
    accounts: Arc<AccountStore>,
    rules: Arc<RuleStore>,
    engine: Arc<RuleEngine>,
    approvals: Arc<ApprovalGate>,
    queue: Arc<dyn JobQueue>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<AdapterRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: AutomationConfig,
    call_timeout: Duration,
}

impl Autopilot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<AccountStore>,
        rules: Arc<RuleStore>,
        engine: Arc<RuleEngine>,
        approvals: Arc<ApprovalGate>,
        queue: Arc<dyn JobQueue>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<AdapterRegistry>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: AutomationConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            accounts,
            rules,
            engine,
            approvals,
            queue,
            credentials,
            registry,
            audit,
            clock,
            config,
            call_timeout,
        }
    }

    /// Enqueue a sync for one account outside the schedule.
    pub async fn request_sync(&self, account_id: Uuid) -> CoreResult<EnqueueOutcome> {
        let account = self.accounts.get(account_id)?;
        if account.is_revoked() {
            return Err(CoreError::StateConflict(format!("account {account_id} is disconnected")));
        }
        if account.sync_status == SyncStatus::AuthError {
            return Err(CoreError::NeedsReauth { account_id });
        }
        let slot = format!("manual-{}", Uuid::new_v4());
        let outcome = self
            .queue
            .enqueue(Job::sync(&account, &slot, self.clock.now()))
            .await?;
        info!(account_id = %account_id, "on-demand sync requested");
        Ok(outcome)
    }

    pub fn list_pending_actions(&self, organization_id: Uuid) -> Vec<PendingAction> {
        self.approvals.list_pending(organization_id)
    }

    pub async fn decide_action(
        &self,
        pending_action_id: Uuid,
        decision: Decision,
        actor: Actor,
    ) -> CoreResult<PendingAction> {
        self.approvals.decide(pending_action_id, decision, actor).await
    }

    pub async fn evaluate_rule_now(&self, rule_id: Uuid) -> CoreResult<EvaluationReport> {
        self.engine.evaluate(rule_id).await
    }

    /// OAuth callback: exchange the code, then create (or reconnect) one
    /// account per ad account the grant can see.
    pub async fn connect_accounts(
        &self,
        organization_id: Uuid,
        platform: Platform,
        auth_code: &str,
        redirect_uri: &str,
        actor: Actor,
    ) -> CoreResult<Vec<ConnectedAccount>> {
        let adapter = self.registry.require(platform, Capability::Connect)?;
        let grant = bounded(self.call_timeout, adapter.connect(auth_code, redirect_uri)).await?;
        let remote_accounts =
            bounded(self.call_timeout, adapter.list_accounts(&grant.access_token)).await?;

        let mut connected = Vec::with_capacity(remote_accounts.len());
        for remote in remote_accounts {
            let (account, created) = self.accounts.connect(
                organization_id,
                platform,
                &remote.external_id,
                remote.name.clone(),
                grant.expires_at,
            );
            let version = self
                .credentials
                .put(
                    account.id,
                    CredentialSecrets {
                        access_token: grant.access_token.clone(),
                        refresh_token: grant.refresh_token.clone(),
                        expires_at: grant.expires_at,
                    },
                )
                .await?;
            self.audit.append(
                AuditEntry::new(AuditKind::AccountConnected, "connected_account", account.id)
                    .organization(organization_id)
                    .actor(actor)
                    .after(serde_json::to_value(&account)?)
                    .detail(json!({ "reconnected": !created, "credential_version": version })),
            );
            info!(
                account_id = %account.id,
                platform = %platform,
                external_id = %remote.external_id,
                created,
                "ad account connected"
            );
            connected.push(account);
        }
        Ok(connected)
    }

    /// Soft-delete the account and drop its credentials.
    pub async fn disconnect_account(&self, account_id: Uuid, actor: Actor) -> CoreResult<ConnectedAccount> {
        let before = self.accounts.get(account_id)?;
        let after = self.accounts.revoke(account_id)?;
        self.credentials.delete(account_id).await?;
        self.audit.append(
            AuditEntry::new(AuditKind::AccountDisconnected, "connected_account", account_id)
                .organization(after.organization_id)
                .actor(actor)
                .before(json!({ "revoked_at": before.revoked_at }))
                .after(json!({ "revoked_at": after.revoked_at })),
        );
        info!(account_id = %account_id, "ad account disconnected");
        Ok(after)
    }

    pub fn upsert_rule(&self, mut rule: AutomationRule, actor: Actor) -> CoreResult<AutomationRule> {
        if rule.cadence_secs <= 0 {
            rule.cadence_secs = self.config.default_rule_cadence_secs;
        }
        let before = self.rules.get(rule.id).ok();
        let saved = self.rules.upsert(rule)?;
        let mut entry = AuditEntry::new(AuditKind::RuleUpserted, "automation_rule", saved.id)
            .organization(saved.organization_id)
            .actor(actor)
            .after(serde_json::to_value(&saved)?);
        if let Some(before) = before {
            entry = entry.before(serde_json::to_value(&before)?);
        }
        self.audit.append(entry);
        Ok(saved)
    }

    pub fn set_rule_enabled(&self, rule_id: Uuid, enabled: bool, actor: Actor) -> CoreResult<AutomationRule> {
        let before = self.rules.get(rule_id)?;
        let after = self.rules.set_enabled(rule_id, enabled)?;
        self.audit.append(
            AuditEntry::new(AuditKind::RuleUpserted, "automation_rule", rule_id)
                .organization(after.organization_id)
                .actor(actor)
                .before(json!({ "enabled": before.enabled }))
                .after(json!({ "enabled": after.enabled })),
        );
        Ok(after)
    }
}
