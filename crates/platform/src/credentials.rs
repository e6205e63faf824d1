//! Credential store collaborator: get/put of token pairs with optimistic
//! versioning. Encryption at rest is the store implementation's concern.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::error::{CoreError, CoreResult};

/// Token pair for one connected account.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Incremented by every successful write.
    pub version: u64,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .finish()
    }
}

/// Secrets to write; the store assigns the version.
#[derive(Clone)]
pub struct CredentialSecrets {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, account_id: Uuid) -> CoreResult<Option<StoredCredential>>;

    /// Unconditional write, used when an account is (re)connected.
    async fn put(&self, account_id: Uuid, secrets: CredentialSecrets) -> CoreResult<u64>;

    /// Write only if the stored version still equals `expected_version`.
    /// Returns the new version, or `CredentialConflict` when another writer won.
    async fn compare_and_swap(
        &self,
        account_id: Uuid,
        expected_version: u64,
        secrets: CredentialSecrets,
    ) -> CoreResult<u64>;

    async fn delete(&self, account_id: Uuid) -> CoreResult<()>;

    /// Health check; the scheduler stops enqueueing while this fails.
    async fn ping(&self) -> CoreResult<()>;
}

/// DashMap-backed store for tests and single-node runs.
pub struct MemoryCredentialStore {
    entries: DashMap<Uuid, StoredCredential>,
    available: AtomicBool,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> CoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::StoreUnavailable("credential store offline".to_string()))
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, account_id: Uuid) -> CoreResult<Option<StoredCredential>> {
        self.check()?;
        Ok(self.entries.get(&account_id).map(|e| e.value().clone()))
    }

    async fn put(&self, account_id: Uuid, secrets: CredentialSecrets) -> CoreResult<u64> {
        self.check()?;
        let mut entry = self.entries.entry(account_id).or_insert_with(|| StoredCredential {
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: secrets.expires_at,
            version: 0,
        });
        entry.access_token = secrets.access_token;
        entry.refresh_token = secrets.refresh_token;
        entry.expires_at = secrets.expires_at;
        entry.version += 1;
        Ok(entry.version)
    }

    async fn compare_and_swap(
        &self,
        account_id: Uuid,
        expected_version: u64,
        secrets: CredentialSecrets,
    ) -> CoreResult<u64> {
        self.check()?;
        let mut entry = self
            .entries
            .get_mut(&account_id)
            .ok_or_else(|| CoreError::NotFound(format!("credentials for account {account_id}")))?;
        if entry.version != expected_version {
            return Err(CoreError::CredentialConflict { account_id });
        }
        entry.access_token = secrets.access_token;
        entry.refresh_token = secrets.refresh_token;
        entry.expires_at = secrets.expires_at;
        entry.version += 1;
        Ok(entry.version)
    }

    async fn delete(&self, account_id: Uuid) -> CoreResult<()> {
        self.check()?;
        self.entries.remove(&account_id);
        Ok(())
    }

    async fn ping(&self) -> CoreResult<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(access: &str) -> CredentialSecrets {
        CredentialSecrets {
            access_token: access.to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryCredentialStore::new();
        let account = Uuid::new_v4();
        let v1 = store.put(account, secrets("a1")).await.unwrap();

        let v2 = store.compare_and_swap(account, v1, secrets("a2")).await.unwrap();
        assert_eq!(v2, v1 + 1);

        let err = store.compare_and_swap(account, v1, secrets("a3")).await.unwrap_err();
        assert!(matches!(err, CoreError::CredentialConflict { .. }));
        let stored = store.get(account).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "a2");
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryCredentialStore::new();
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(CoreError::StoreUnavailable(_))));
        assert!(store.get(Uuid::new_v4()).await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = StoredCredential {
            access_token: "secret-access".into(),
            refresh_token: "secret-refresh".into(),
            expires_at: Utc::now(),
            version: 1,
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("secret"));
    }
}
