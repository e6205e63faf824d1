//! Token lifecycle manager.
//!
//! Hands out a valid access token for an account or a definitive
//! `NeedsReauth`. Refreshes are serialized per account and persisted with a
//! compare-and-swap on the credential version.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_adapters::{AdapterRegistry, Capability};
use campaign_core::clock::Clock;
use campaign_core::config::TokenConfig;
use campaign_core::error::{CoreError, CoreResult, PlatformError};
use campaign_core::event_bus::{NotificationEvent, NotificationKind, NotificationSink};
use campaign_core::types::{ConnectedAccount, SyncStatus};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};
use campaign_platform::credentials::{CredentialSecrets, CredentialStore, StoredCredential};

use crate::store::AccountStore;

/// Outcome of one proactive refresh sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSweep {
    pub examined: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Accounts skipped because a backoff hint has not yet passed.
    pub backing_off: usize,
}

pub struct TokenManager {
    accounts: Arc<AccountStore>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<AdapterRegistry>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
    refresh_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    backoff_until: DashMap<Uuid, DateTime<Utc>>,
}

impl TokenManager {
    pub fn new(
        accounts: Arc<AccountStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<AdapterRegistry>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            accounts,
            credentials,
            registry,
            audit,
            notifier,
            clock,
            config,
            refresh_locks: DashMap::new(),
            backoff_until: DashMap::new(),
        }
    }

    /// Return an access token that is valid for at least the safety margin,
    /// refreshing it first when needed.
    pub async fn get_valid_token(&self, account_id: Uuid) -> CoreResult<String> {
        self.token_with_margin(account_id, self.config.safety_margin_secs)
            .await
    }

    /// Refresh every active account whose token expires within the proactive
    /// window. Accounts with a pending backoff hint are left alone.
    pub async fn refresh_expiring(&self) -> RefreshSweep {
        let now = self.clock.now();
        let horizon = now + chrono::Duration::seconds(self.config.proactive_window_secs);
        let mut sweep = RefreshSweep::default();

        for account in self.accounts.list_active() {
            if account.token_expires_at > horizon {
                continue;
            }
            sweep.examined += 1;
            if self.in_backoff(account.id, now) {
                sweep.backing_off += 1;
                continue;
            }
            match self
                .token_with_margin(account.id, self.config.proactive_window_secs)
                .await
            {
                Ok(_) => sweep.refreshed += 1,
                Err(err) => {
                    sweep.failed += 1;
                    warn!(account_id = %account.id, error = %err, "proactive token refresh failed");
                }
            }
        }

        if sweep.examined > 0 {
            info!(
                examined = sweep.examined,
                refreshed = sweep.refreshed,
                failed = sweep.failed,
                "token refresh sweep finished"
            );
        }
        sweep
    }

    /// Earliest time the proactive sweep will retry this account, if a
    /// transient failure left a hint.
    pub fn backoff_hint(&self, account_id: Uuid) -> Option<DateTime<Utc>> {
        self.backoff_until.get(&account_id).map(|h| *h.value())
    }

    async fn token_with_margin(&self, account_id: Uuid, margin_secs: i64) -> CoreResult<String> {
        let account = self.usable_account(account_id)?;
        let credential = self.load(account_id).await?;
        if self.is_fresh(&credential, margin_secs) {
            return Ok(credential.access_token);
        }

        let lock = self.refresh_locks.entry(account_id).or_default().clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited.
        let account = self.usable_account(account.id)?;
        let credential = self.load(account_id).await?;
        if self.is_fresh(&credential, margin_secs) {
            return Ok(credential.access_token);
        }
        self.refresh(&account, credential).await
    }

    async fn refresh(&self, account: &ConnectedAccount, credential: StoredCredential) -> CoreResult<String> {
        let adapter = self
            .registry
            .require(account.platform, Capability::RefreshToken)?;
        let limit = Duration::from_millis(self.config.refresh_timeout_ms);

        let grant = match tokio::time::timeout(limit, adapter.refresh_token(&credential.refresh_token)).await {
            Err(_) => {
                self.set_backoff(account.id, None);
                return Err(CoreError::Timeout(limit));
            }
            Ok(Err(PlatformError::AuthExpired(reason))) => {
                return Err(self.on_auth_expired(account, reason));
            }
            Ok(Err(err)) => {
                if err.is_retryable() {
                    let hint = match &err {
                        PlatformError::RateLimited { retry_after } => Some(*retry_after),
                        _ => None,
                    };
                    self.set_backoff(account.id, hint);
                }
                return Err(err.into());
            }
            Ok(Ok(grant)) => grant,
        };

        let now = self.clock.now();
        if grant.expires_at <= now {
            self.set_backoff(account.id, None);
            return Err(PlatformError::TransientNetwork(
                "platform issued an already-expired access token".to_string(),
            )
            .into());
        }

        let secrets = CredentialSecrets {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
        };
        match self
            .credentials
            .compare_and_swap(account.id, credential.version, secrets)
            .await
        {
            Ok(version) => {
                self.accounts.record_refresh(account.id, grant.expires_at)?;
                self.backoff_until.remove(&account.id);
                metrics::counter!("tokens.refreshed", "platform" => account.platform.slug()).increment(1);
                info!(
                    account_id = %account.id,
                    platform = %account.platform,
                    version,
                    expires_at = %grant.expires_at,
                    "access token refreshed"
                );
                Ok(grant.access_token)
            }
            Err(CoreError::CredentialConflict { .. }) => {
                // A concurrent writer committed first; use theirs if it is valid.
                let current = self.load(account.id).await?;
                if current.expires_at > self.clock.now() {
                    self.accounts.record_refresh(account.id, current.expires_at)?;
                    Ok(current.access_token)
                } else {
                    Err(CoreError::CredentialConflict {
                        account_id: account.id,
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    fn on_auth_expired(&self, account: &ConnectedAccount, reason: String) -> CoreError {
        let failures = match self.accounts.record_auth_failure(account.id, &reason) {
            Ok(count) => count,
            Err(err) => return err,
        };
        warn!(
            account_id = %account.id,
            failures,
            threshold = self.config.failure_threshold,
            "token refresh rejected by platform"
        );
        if failures < self.config.failure_threshold {
            return PlatformError::AuthExpired(reason).into();
        }

        if let Err(err) = self
            .accounts
            .set_sync_status(account.id, SyncStatus::AuthError, Some(reason.clone()))
        {
            return err;
        }
        self.backoff_until.remove(&account.id);
        self.audit.append(
            AuditEntry::new(AuditKind::AccountNeedsReauth, "connected_account", account.id)
                .organization(account.organization_id)
                .before(serde_json::json!({ "sync_status": account.sync_status }))
                .after(serde_json::json!({ "sync_status": SyncStatus::AuthError }))
                .detail(serde_json::json!({ "consecutive_failures": failures, "reason": reason })),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::AccountNeedsReauth,
            account.organization_id,
            serde_json::json!({
                "account_id": account.id,
                "platform": account.platform,
                "external_account_id": account.external_account_id,
            }),
        ));
        CoreError::NeedsReauth {
            account_id: account.id,
        }
    }

    /// Accounts that are revoked or awaiting re-auth never reach the platform.
    fn usable_account(&self, account_id: Uuid) -> CoreResult<ConnectedAccount> {
        let account = self.accounts.get(account_id)?;
        if account.is_revoked() {
            return Err(CoreError::StateConflict(format!(
                "account {account_id} has been disconnected"
            )));
        }
        if account.sync_status == SyncStatus::AuthError {
            return Err(CoreError::NeedsReauth { account_id });
        }
        Ok(account)
    }

    async fn load(&self, account_id: Uuid) -> CoreResult<StoredCredential> {
        self.credentials
            .get(account_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("credentials for account {account_id}")))
    }

    fn is_fresh(&self, credential: &StoredCredential, margin_secs: i64) -> bool {
        credential.expires_at > self.clock.now() + chrono::Duration::seconds(margin_secs)
    }

    fn in_backoff(&self, account_id: Uuid, now: DateTime<Utc>) -> bool {
        self.backoff_until
            .get(&account_id)
            .is_some_and(|until| *until.value() > now)
    }

    fn set_backoff(&self, account_id: Uuid, hint: Option<Duration>) {
        let wait = hint
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(|| chrono::Duration::seconds(self.config.transient_backoff_secs));
        self.backoff_until
            .insert(account_id, self.clock.now() + wait);
    }
}
