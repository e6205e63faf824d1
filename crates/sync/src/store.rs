//! In-memory account and campaign stores backed by DashMap.
//!
//! Production swaps these for the campaign-management database; the API
//! surface stays the same.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use campaign_core::clock::Clock;
use campaign_core::error::{CoreError, CoreResult};
use campaign_core::types::{Campaign, CampaignStatus, ConnectedAccount, Platform, SyncStatus};

type ExternalKey = (Uuid, Platform, String);

pub struct AccountStore {
    accounts: DashMap<Uuid, ConnectedAccount>,
    /// (organization, platform, external id) of every non-revoked account.
    active_index: DashMap<ExternalKey, Uuid>,
    clock: Arc<dyn Clock>,
}

impl AccountStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: DashMap::new(),
            active_index: DashMap::new(),
            clock,
        }
    }

    /// Create the account, or reconnect the existing non-revoked one for the
    /// same external account. Returns the account and whether it was new.
    pub fn connect(
        &self,
        organization_id: Uuid,
        platform: Platform,
        external_account_id: &str,
        display_name: Option<String>,
        token_expires_at: DateTime<Utc>,
    ) -> (ConnectedAccount, bool) {
        let now = self.clock.now();
        let key = (organization_id, platform, external_account_id.to_string());
        match self.active_index.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let mut account = self
                    .accounts
                    .get(&id)
                    .map(|a| a.value().clone())
                    .unwrap_or_else(|| new_account(id, organization_id, platform, external_account_id, now));
                account.display_name = display_name.or(account.display_name.take());
                account.token_expires_at = token_expires_at;
                account.sync_status = SyncStatus::Pending;
                account.consecutive_failures = 0;
                account.last_error = None;
                account.updated_at = now;
                self.accounts.insert(id, account.clone());
                info!(account_id = %id, platform = %platform, "account reconnected");
                (account, false)
            }
            Entry::Vacant(slot) => {
                let mut account =
                    new_account(Uuid::new_v4(), organization_id, platform, external_account_id, now);
                account.display_name = display_name;
                account.token_expires_at = token_expires_at;
                self.accounts.insert(account.id, account.clone());
                slot.insert(account.id);
                info!(account_id = %account.id, platform = %platform, "account connected");
                (account, true)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> CoreResult<ConnectedAccount> {
        self.accounts
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("account {id}")))
    }

    /// Accounts eligible for scheduled work, oldest first.
    pub fn list_active(&self) -> Vec<ConnectedAccount> {
        let mut accounts: Vec<ConnectedAccount> = self
            .accounts
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.value().clone())
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    pub fn list_for_organization(&self, organization_id: Uuid) -> Vec<ConnectedAccount> {
        self.accounts
            .iter()
            .filter(|a| a.organization_id == organization_id)
            .map(|a| a.value().clone())
            .collect()
    }

    /// Soft-delete. Revoking twice is a no-op.
    pub fn revoke(&self, id: Uuid) -> CoreResult<ConnectedAccount> {
        let now = self.clock.now();
        let account = self.update(id, |a| {
            if a.revoked_at.is_none() {
                a.revoked_at = Some(now);
            }
        })?;
        self.active_index.remove_if(
            &(account.organization_id, account.platform, account.external_account_id.clone()),
            |_, indexed| *indexed == id,
        );
        Ok(account)
    }

    pub fn set_sync_status(&self, id: Uuid, status: SyncStatus, error: Option<String>) -> CoreResult<ConnectedAccount> {
        self.update(id, |a| {
            a.sync_status = status;
            if error.is_some() {
                a.last_error = error;
            }
        })
    }

    pub fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<ConnectedAccount> {
        self.update(id, |a| {
            a.sync_status = SyncStatus::Success;
            a.last_synced_at = Some(at);
            a.last_error = None;
        })
    }

    /// Count one more consecutive auth failure and return the new count.
    pub fn record_auth_failure(&self, id: Uuid, error: &str) -> CoreResult<u32> {
        let account = self.update(id, |a| {
            a.consecutive_failures += 1;
            a.last_error = Some(error.to_string());
        })?;
        Ok(account.consecutive_failures)
    }

    /// Persist a freshly refreshed token's expiry and clear the failure streak.
    pub fn record_refresh(&self, id: Uuid, expires_at: DateTime<Utc>) -> CoreResult<ConnectedAccount> {
        self.update(id, |a| {
            a.token_expires_at = expires_at;
            a.consecutive_failures = 0;
        })
    }

    fn update<F>(&self, id: Uuid, apply: F) -> CoreResult<ConnectedAccount>
    where
        F: FnOnce(&mut ConnectedAccount),
    {
        let now = self.clock.now();
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("account {id}")))?;
        apply(entry.value_mut());
        entry.updated_at = now;
        Ok(entry.value().clone())
    }
}

fn new_account(
    id: Uuid,
    organization_id: Uuid,
    platform: Platform,
    external_account_id: &str,
    now: DateTime<Utc>,
) -> ConnectedAccount {
    ConnectedAccount {
        id,
        organization_id,
        platform,
        external_account_id: external_account_id.to_string(),
        display_name: None,
        token_expires_at: now,
        sync_status: SyncStatus::Pending,
        consecutive_failures: 0,
        last_synced_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        revoked_at: None,
    }
}

pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    /// Native ids are only unique within one connected account.
    by_native: DashMap<(Uuid, String), Uuid>,
    clock: Arc<dyn Clock>,
}

impl CampaignStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            campaigns: DashMap::new(),
            by_native: DashMap::new(),
            clock,
        }
    }

    pub fn insert(&self, campaign: Campaign) -> Campaign {
        if let Some(native_id) = &campaign.native_id {
            self.by_native
                .insert((campaign.account_id, native_id.clone()), campaign.id);
        }
        self.campaigns.insert(campaign.id, campaign.clone());
        campaign
    }

    pub fn get(&self, id: Uuid) -> CoreResult<Campaign> {
        self.campaigns
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("campaign {id}")))
    }

    pub fn find_by_native(&self, account_id: Uuid, native_id: &str) -> Option<Campaign> {
        let id = *self.by_native.get(&(account_id, native_id.to_string()))?;
        self.get(id).ok()
    }

    pub fn list_for_account(&self, account_id: Uuid) -> Vec<Campaign> {
        self.collect(|c| c.account_id == account_id)
    }

    pub fn list_for_organization(&self, organization_id: Uuid) -> Vec<Campaign> {
        self.collect(|c| c.organization_id == organization_id)
    }

    /// Apply a lifecycle transition. Returns (before, after).
    pub fn transition(&self, id: Uuid, next: CampaignStatus) -> CoreResult<(Campaign, Campaign)> {
        let now = self.clock.now();
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("campaign {id}")))?;
        let before = entry.value().clone();
        entry.value_mut().transition(next, now)?;
        Ok((before, entry.value().clone()))
    }

    /// Set the daily budget. Returns (before, after).
    pub fn set_budget(&self, id: Uuid, budget: f64) -> CoreResult<(Campaign, Campaign)> {
        let now = self.clock.now();
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("campaign {id}")))?;
        let before = entry.value().clone();
        entry.budget = budget;
        entry.updated_at = now;
        Ok((before, entry.value().clone()))
    }

    pub fn set_native_id(&self, id: Uuid, native_id: &str) -> CoreResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("campaign {id}")))?;
        if let Some(existing) = &entry.native_id {
            if existing != native_id {
                return Err(CoreError::StateConflict(format!(
                    "campaign {id} is already linked to {existing}"
                )));
            }
        }
        entry.native_id = Some(native_id.to_string());
        self.by_native
            .insert((entry.account_id, native_id.to_string()), id);
        Ok(entry.value().clone())
    }

    fn collect<F>(&self, keep: F) -> Vec<Campaign>
    where
        F: Fn(&Campaign) -> bool,
    {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| keep(c.value()))
            .map(|c| c.value().clone())
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        campaigns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::clock::ManualClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    #[test]
    fn test_reconnect_reuses_active_account() {
        let store = AccountStore::new(clock());
        let org = Uuid::new_v4();
        let expiry = Utc::now();
        let (first, created) = store.connect(org, Platform::Google, "123", None, expiry);
        assert!(created);
        store.record_auth_failure(first.id, "invalid_grant").unwrap();
        store.set_sync_status(first.id, SyncStatus::AuthError, None).unwrap();

        let (second, created) = store.connect(org, Platform::Google, "123", None, expiry);
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.consecutive_failures, 0);
        assert_eq!(second.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_revoked_account_frees_the_external_id() {
        let store = AccountStore::new(clock());
        let org = Uuid::new_v4();
        let (first, _) = store.connect(org, Platform::Meta, "act_1", None, Utc::now());
        let revoked = store.revoke(first.id).unwrap();
        assert!(revoked.is_revoked());
        assert!(store.list_active().is_empty());

        let (second, created) = store.connect(org, Platform::Meta, "act_1", None, Utc::now());
        assert!(created);
        assert_ne!(second.id, first.id);
        // Revoked rows are kept.
        assert_eq!(store.list_for_organization(org).len(), 2);
    }

    #[test]
    fn test_transition_rejects_draft_after_launch() {
        let store = CampaignStore::new(clock());
        let now = Utc::now();
        let campaign = store.insert(Campaign {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            platform: Platform::Tiktok,
            name: "Launch".into(),
            native_id: Some("t-1".into()),
            status: CampaignStatus::Active,
            budget: 50.0,
            options: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        });

        assert!(store.transition(campaign.id, CampaignStatus::Draft).is_err());
        let (before, after) = store.transition(campaign.id, CampaignStatus::Paused).unwrap();
        assert_eq!(before.status, CampaignStatus::Active);
        assert_eq!(after.status, CampaignStatus::Paused);
        assert_eq!(
            store.find_by_native(campaign.account_id, "t-1").unwrap().id,
            campaign.id
        );
    }
}
