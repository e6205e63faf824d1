//! Remote-status reconciliation.
//!
//! Moves local campaigns to follow their remote delivery status without
//! ever walking the lifecycle backwards. Statuses the lifecycle cannot
//! express archive the campaign and record the divergence.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_adapters::RemoteCampaign;
use campaign_core::error::CoreResult;
use campaign_core::event_bus::{NotificationEvent, NotificationKind, NotificationSink};
use campaign_core::types::{Campaign, CampaignStatus, ConnectedAccount, RemoteStatus};
use campaign_platform::audit::{AuditEntry, AuditKind, AuditSink};

use crate::store::CampaignStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Unchanged,
    Transitioned {
        from: CampaignStatus,
        to: CampaignStatus,
    },
    /// Archived because the remote status has no lifecycle counterpart.
    Diverged {
        from: CampaignStatus,
        remote: String,
    },
    Imported(Uuid),
    /// Removed remotely and unknown locally; nothing to track.
    Ignored,
}

pub struct Reconciler<'a> {
    pub campaigns: &'a CampaignStore,
    pub audit: &'a dyn AuditSink,
    pub notifier: &'a dyn NotificationSink,
}

impl Reconciler<'_> {
    pub fn reconcile(
        &self,
        account: &ConnectedAccount,
        remote: &RemoteCampaign,
        now: DateTime<Utc>,
    ) -> CoreResult<ReconcileOutcome> {
        let Some(local) = self.campaigns.find_by_native(account.id, &remote.native_id) else {
            return Ok(self.import(account, remote, now));
        };
        if !local.status.is_remotely_reconciled() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let target = match &remote.status {
            RemoteStatus::Active => CampaignStatus::Active,
            RemoteStatus::Paused => CampaignStatus::Paused,
            // Still in platform review; keep whatever we have.
            RemoteStatus::Pending => return Ok(ReconcileOutcome::Unchanged),
            RemoteStatus::Removed | RemoteStatus::Unknown(_) => {
                return self.diverge(&local, remote);
            }
        };
        if target == local.status {
            return Ok(ReconcileOutcome::Unchanged);
        }
        if !local.status.can_transition_to(target) {
            return self.diverge(&local, remote);
        }

        let (before, after) = self.campaigns.transition(local.id, target)?;
        self.audit.append(
            AuditEntry::new(AuditKind::CampaignStatusChanged, "campaign", local.id)
                .organization(local.organization_id)
                .before(json!({ "status": before.status }))
                .after(json!({ "status": after.status }))
                .detail(json!({ "source": "remote_sync", "remote_status": remote.raw_status })),
        );
        info!(
            campaign_id = %local.id,
            from = ?before.status,
            to = ?after.status,
            "campaign status reconciled from platform"
        );
        Ok(ReconcileOutcome::Transitioned {
            from: before.status,
            to: after.status,
        })
    }

    fn diverge(&self, local: &Campaign, remote: &RemoteCampaign) -> CoreResult<ReconcileOutcome> {
        let (before, after) = self.campaigns.transition(local.id, CampaignStatus::Archived)?;
        warn!(
            campaign_id = %local.id,
            remote_status = %remote.raw_status,
            "remote status diverged from lifecycle, archiving"
        );
        self.audit.append(
            AuditEntry::new(AuditKind::CampaignDiverged, "campaign", local.id)
                .organization(local.organization_id)
                .before(json!({ "status": before.status }))
                .after(json!({ "status": after.status }))
                .detail(json!({
                    "native_id": remote.native_id,
                    "remote_status": remote.raw_status,
                    "reason": "remote status has no lifecycle counterpart",
                })),
        );
        self.notifier.emit(NotificationEvent::new(
            NotificationKind::CampaignDiverged,
            local.organization_id,
            json!({
                "campaign_id": local.id,
                "native_id": remote.native_id,
                "remote_status": remote.raw_status,
            }),
        ));
        Ok(ReconcileOutcome::Diverged {
            from: before.status,
            remote: remote.raw_status.clone(),
        })
    }

    fn import(&self, account: &ConnectedAccount, remote: &RemoteCampaign, now: DateTime<Utc>) -> ReconcileOutcome {
        let status = match remote.status {
            RemoteStatus::Active => CampaignStatus::Active,
            RemoteStatus::Paused => CampaignStatus::Paused,
            RemoteStatus::Pending => CampaignStatus::Approved,
            RemoteStatus::Removed | RemoteStatus::Unknown(_) => return ReconcileOutcome::Ignored,
        };
        let campaign = self.campaigns.insert(Campaign {
            id: Uuid::new_v4(),
            account_id: account.id,
            organization_id: account.organization_id,
            platform: account.platform,
            name: remote.name.clone(),
            native_id: Some(remote.native_id.clone()),
            status,
            budget: remote.daily_budget.unwrap_or(0.0),
            options: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        });
        self.audit.append(
            AuditEntry::new(AuditKind::CampaignImported, "campaign", campaign.id)
                .organization(campaign.organization_id)
                .after(serde_json::to_value(&campaign).unwrap_or_default()),
        );
        info!(campaign_id = %campaign.id, native_id = %remote.native_id, "remote campaign imported");
        ReconcileOutcome::Imported(campaign.id)
    }
}
