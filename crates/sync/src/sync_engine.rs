//! Sync engine: pulls campaigns and metrics for one connected account,
//! reconciles statuses and persists normalized samples.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_adapters::{AdapterRegistry, Capability};
use campaign_core::clock::Clock;
use campaign_core::config::SyncConfig;
use campaign_core::error::{CoreError, CoreResult, PlatformResult};
use campaign_core::event_bus::NotificationSink;
use campaign_core::types::{SyncStatus, TimeWindow};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};

use crate::metric_store::{normalize, MetricStore};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::store::{AccountStore, CampaignStore};
use crate::tokens::TokenManager;

/// Run a platform call under a hard deadline. An elapsed deadline is a
/// transient `Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> CoreResult<T>
where
    F: Future<Output = PlatformResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(CoreError::from),
        Err(_) => Err(CoreError::Timeout(limit)),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub account_id: Uuid,
    pub window: Option<TimeWindow>,
    pub campaigns_seen: usize,
    pub campaigns_imported: usize,
    pub campaigns_transitioned: usize,
    pub campaigns_diverged: usize,
    pub samples_ingested: usize,
    pub samples_duplicate: usize,
    pub samples_rejected: usize,
    /// Rows for campaigns that are unknown locally.
    pub samples_unmatched: usize,
    /// Account was revoked; nothing was fetched.
    pub skipped: bool,
}

pub struct SyncEngine {
    accounts: Arc<AccountStore>,
    campaigns: Arc<CampaignStore>,
    metrics: Arc<MetricStore>,
    tokens: Arc<TokenManager>,
    registry: Arc<AdapterRegistry>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<AccountStore>,
        campaigns: Arc<CampaignStore>,
        metrics: Arc<MetricStore>,
        tokens: Arc<TokenManager>,
        registry: Arc<AdapterRegistry>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            accounts,
            campaigns,
            metrics,
            tokens,
            registry,
            audit,
            notifier,
            clock,
            config,
        }
    }

    /// Sync one account. The account's sync status tracks the outcome.
    pub async fn sync_account(&self, account_id: Uuid) -> CoreResult<SyncReport> {
        let account = self.accounts.get(account_id)?;
        if account.is_revoked() {
            debug!(account_id = %account_id, "skipping sync of disconnected account");
            return Ok(SyncReport {
                account_id,
                skipped: true,
                ..SyncReport::default()
            });
        }

        self.accounts
            .set_sync_status(account_id, SyncStatus::Syncing, None)?;
        match self.run(account_id).await {
            Ok(report) => {
                self.accounts
                    .record_sync_success(account_id, self.clock.now())?;
                self.audit.append(
                    AuditEntry::new(AuditKind::SyncCompleted, "connected_account", account_id)
                        .organization(account.organization_id)
                        .detail(serde_json::to_value(&report)?),
                );
                info!(
                    account_id = %account_id,
                    platform = %account.platform,
                    campaigns = report.campaigns_seen,
                    samples = report.samples_ingested,
                    duplicates = report.samples_duplicate,
                    "account sync completed"
                );
                Ok(report)
            }
            Err(err) => {
                let status = if matches!(err, CoreError::NeedsReauth { .. }) {
                    SyncStatus::AuthError
                } else {
                    SyncStatus::Error
                };
                warn!(account_id = %account_id, error = %err, "account sync failed");
                self.accounts
                    .set_sync_status(account_id, status, Some(err.to_string()))?;
                Err(err)
            }
        }
    }

    async fn run(&self, account_id: Uuid) -> CoreResult<SyncReport> {
        let account = self.accounts.get(account_id)?;
        let token = self.tokens.get_valid_token(account_id).await?;
        let adapter = self
            .registry
            .require(account.platform, Capability::FetchMetrics)?;
        let limit = Duration::from_millis(self.config.call_timeout_ms);
        let now = self.clock.now();

        let window_start = match account.last_synced_at {
            Some(last) => last - chrono::Duration::hours(self.config.overlap_hours),
            None => now - chrono::Duration::hours(self.config.initial_lookback_hours),
        };
        let window = TimeWindow::new(window_start, now);
        let mut report = SyncReport {
            account_id,
            window: Some(window),
            ..SyncReport::default()
        };

        if adapter.supports(Capability::FetchCampaigns) {
            let remote_campaigns = bounded(
                limit,
                adapter.fetch_campaigns(&token, &account.external_account_id),
            )
            .await?;
            let reconciler = Reconciler {
                campaigns: &self.campaigns,
                audit: self.audit.as_ref(),
                notifier: self.notifier.as_ref(),
            };
            for remote in &remote_campaigns {
                report.campaigns_seen += 1;
                match reconciler.reconcile(&account, remote, now)? {
                    ReconcileOutcome::Imported(_) => report.campaigns_imported += 1,
                    ReconcileOutcome::Transitioned { .. } => report.campaigns_transitioned += 1,
                    ReconcileOutcome::Diverged { .. } => report.campaigns_diverged += 1,
                    ReconcileOutcome::Unchanged | ReconcileOutcome::Ignored => {}
                }
            }
        }

        let rows = bounded(
            limit,
            adapter.fetch_metrics(&token, &account.external_account_id, &window),
        )
        .await?;
        for raw in &rows {
            let Some(campaign) = self
                .campaigns
                .find_by_native(account.id, &raw.native_campaign_id)
            else {
                report.samples_unmatched += 1;
                continue;
            };
            match normalize(raw, campaign.id) {
                Ok(sample) => {
                    if self.metrics.ingest(sample) {
                        report.samples_ingested += 1;
                    } else {
                        report.samples_duplicate += 1;
                    }
                }
                Err(err) => {
                    report.samples_rejected += 1;
                    warn!(
                        campaign_id = %campaign.id,
                        error = %err,
                        "metrics row rejected by normalizer"
                    );
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_adapters::{parse_day, DailyTotals, MockAdapter};
    use campaign_core::clock::ManualClock;
    use campaign_core::config::TokenConfig;
    use campaign_core::error::PlatformError;
    use campaign_core::event_bus::CaptureSink;
    use campaign_core::types::{CampaignStatus, Platform, RemoteStatus};
    use campaign_platform::audit::AuditLog;
    use campaign_platform::credentials::{CredentialSecrets, CredentialStore, MemoryCredentialStore};

    struct Fixture {
        clock: Arc<ManualClock>,
        accounts: Arc<AccountStore>,
        campaigns: Arc<CampaignStore>,
        metrics: Arc<MetricStore>,
        adapter: Arc<MockAdapter>,
        credentials: Arc<MemoryCredentialStore>,
        audit: Arc<AuditLog>,
        engine: SyncEngine,
        account_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(parse_day("2024-05-04").unwrap()));
        let accounts = Arc::new(AccountStore::new(clock.clone()));
        let campaigns = Arc::new(CampaignStore::new(clock.clone()));
        let metrics = Arc::new(MetricStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let adapter = Arc::new(MockAdapter::new(Platform::Tiktok).with_clock(clock.clone()));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let registry = Arc::new(registry);
        let audit_log = Arc::new(AuditLog::new());
        let audit: Arc<dyn AuditSink> = audit_log.clone();
        let sink: Arc<dyn NotificationSink> = Arc::new(CaptureSink::new());
        let tokens = Arc::new(TokenManager::new(
            accounts.clone(),
            credentials.clone(),
            registry.clone(),
            audit.clone(),
            sink.clone(),
            clock.clone(),
            TokenConfig::default(),
        ));

        let expires_at = clock.now() + chrono::Duration::hours(1);
        let (account, _) = accounts.connect(Uuid::new_v4(), Platform::Tiktok, "adv-1", None, expires_at);
        credentials
            .put(
                account.id,
                CredentialSecrets {
                    access_token: "tok".into(),
                    refresh_token: "ref".into(),
                    expires_at,
                },
            )
            .await
            .unwrap();

        let engine = SyncEngine::new(
            accounts.clone(),
            campaigns.clone(),
            metrics.clone(),
            tokens,
            registry,
            audit,
            sink,
            clock.clone(),
            SyncConfig::default(),
        );
        Fixture {
            clock,
            accounts,
            campaigns,
            metrics,
            adapter,
            credentials,
            audit: audit_log,
            engine,
            account_id: account.id,
        }
    }

    async fn connect_other_org(f: &Fixture, external_id: &str) -> Uuid {
        let expires_at = f.clock.now() + chrono::Duration::hours(1);
        let (account, created) =
            f.accounts.connect(Uuid::new_v4(), Platform::Tiktok, external_id, None, expires_at);
        assert!(created);
        f.credentials
            .put(
                account.id,
                CredentialSecrets {
                    access_token: "tok-b".into(),
                    refresh_token: "ref-b".into(),
                    expires_at,
                },
            )
            .await
            .unwrap();
        account.id
    }

    #[tokio::test]
    async fn test_shared_external_account_stays_separate_per_organization() {
        let f = fixture().await;
        f.adapter.add_campaign("t-1", "Prospecting", RemoteStatus::Active, 40.0);
        let day = parse_day("2024-05-03").unwrap();
        f.adapter.add_metrics("t-1", day, DailyTotals { impressions: 500, clicks: 10, spend: 20.0, ..DailyTotals::default() });
        let other = connect_other_org(&f, "adv-1").await;

        let first = f.engine.sync_account(f.account_id).await.unwrap();
        let second = f.engine.sync_account(other).await.unwrap();
        assert_eq!(first.campaigns_imported, 1);
        assert_eq!(second.campaigns_imported, 1);
        assert_eq!(second.samples_ingested, 1);
        assert_eq!(second.samples_duplicate, 0);

        let mine = f.campaigns.find_by_native(f.account_id, "t-1").unwrap();
        let theirs = f.campaigns.find_by_native(other, "t-1").unwrap();
        assert_ne!(mine.id, theirs.id);
        assert_ne!(mine.organization_id, theirs.organization_id);
        assert_eq!(f.campaigns.list_for_account(other).len(), 1);
        assert_eq!(f.metrics.len(), 2);
    }

    #[tokio::test]
    async fn test_every_successful_sync_is_audited() {
        let f = fixture().await;
        f.adapter.add_campaign("t-1", "Prospecting", RemoteStatus::Active, 40.0);
        f.engine.sync_account(f.account_id).await.unwrap();
        assert_eq!(f.audit.count_kind(AuditKind::SyncCompleted), 1);

        // Nothing changed remotely; the run is still recorded.
        f.clock.advance(chrono::Duration::minutes(15));
        let report = f.engine.sync_account(f.account_id).await.unwrap();
        assert_eq!(report.campaigns_imported + report.campaigns_transitioned, 0);
        assert_eq!(f.audit.count_kind(AuditKind::SyncCompleted), 2);

        let records = f.audit.query(&campaign_platform::audit::AuditQuery {
            kind: Some(AuditKind::SyncCompleted),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(records[0].subject_id, f.account_id.to_string());
        assert_eq!(records[0].detail["campaigns_seen"], 1);
        assert!(f.audit.verify_chain().chain_intact);

        f.adapter.fail_next(
            Capability::FetchMetrics,
            PlatformError::TransientNetwork("connection reset".into()),
        );
        assert!(f.engine.sync_account(f.account_id).await.is_err());
        assert_eq!(f.audit.count_kind(AuditKind::SyncCompleted), 2);
    }

    #[tokio::test]
    async fn test_sync_imports_campaigns_and_ingests_metrics() {
        let f = fixture().await;
        f.adapter.add_campaign("t-1", "Prospecting", RemoteStatus::Active, 40.0);
        let day = parse_day("2024-05-03").unwrap();
        f.adapter.add_metrics("t-1", day, DailyTotals { impressions: 500, clicks: 10, spend: 20.0, ..DailyTotals::default() });
        f.adapter.add_metrics("t-unknown", day, DailyTotals::default());

        let report = f.engine.sync_account(f.account_id).await.unwrap();
        assert_eq!(report.campaigns_imported, 1);
        assert_eq!(report.samples_ingested, 1);
        assert_eq!(report.samples_unmatched, 1);

        let campaign = f.campaigns.find_by_native(f.account_id, "t-1").unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(f.metrics.len(), 1);

        let account = f.accounts.get(f.account_id).unwrap();
        assert_eq!(account.sync_status, SyncStatus::Success);
        assert_eq!(account.last_synced_at, Some(f.clock.now()));

        // The overlap window re-reads the same day; it is not stored twice.
        f.clock.advance(chrono::Duration::hours(1));
        let report = f.engine.sync_account(f.account_id).await.unwrap();
        assert_eq!(report.samples_ingested, 0);
        assert_eq!(report.samples_duplicate, 1);
        assert_eq!(f.metrics.len(), 1);
    }

    #[tokio::test]
    async fn test_platform_failure_marks_account_error() {
        let f = fixture().await;
        f.adapter.fail_next(
            Capability::FetchMetrics,
            PlatformError::TransientNetwork("connection reset".into()),
        );

        let err = f.engine.sync_account(f.account_id).await.unwrap_err();
        assert!(matches!(err.disposition(), campaign_core::error::Disposition::Retry(None)));
        let account = f.accounts.get(f.account_id).unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);
        assert!(account.last_error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_revoked_account_is_skipped() {
        let f = fixture().await;
        f.accounts.revoke(f.account_id).unwrap();

        let report = f.engine.sync_account(f.account_id).await.unwrap();
        assert!(report.skipped);
        assert_eq!(f.adapter.fetch_metrics_calls(), 0);
    }
}
