//! Audit log: tamper-evident, append-only record of every mutation with
//! SHA-256 hash chaining and filtered queries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use campaign_core::types::Actor;

const GENESIS: &str = "genesis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AccountConnected,
    AccountDisconnected,
    AccountNeedsReauth,
    CampaignImported,
    CampaignStatusChanged,
    CampaignBudgetChanged,
    /// Remote status moved a campaign somewhere the lifecycle does not allow.
    CampaignDiverged,
    ValidationRejected,
    SyncCompleted,
    /// Action job resolved without a remote call.
    ActionSkipped,
    RuleUpserted,
    RuleNotified,
    ApprovalRequested,
    ActionApproved,
    ActionRejected,
    ActionExpired,
    JobFailed,
    JobDeadLettered,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::AccountConnected => "account_connected",
            AuditKind::AccountDisconnected => "account_disconnected",
            AuditKind::AccountNeedsReauth => "account_needs_reauth",
            AuditKind::CampaignImported => "campaign_imported",
            AuditKind::CampaignStatusChanged => "campaign_status_changed",
            AuditKind::CampaignBudgetChanged => "campaign_budget_changed",
            AuditKind::CampaignDiverged => "campaign_diverged",
            AuditKind::ValidationRejected => "validation_rejected",
            AuditKind::SyncCompleted => "sync_completed",
            AuditKind::ActionSkipped => "action_skipped",
            AuditKind::RuleUpserted => "rule_upserted",
            AuditKind::RuleNotified => "rule_notified",
            AuditKind::ApprovalRequested => "approval_requested",
            AuditKind::ActionApproved => "action_approved",
            AuditKind::ActionRejected => "action_rejected",
            AuditKind::ActionExpired => "action_expired",
            AuditKind::JobFailed => "job_failed",
            AuditKind::JobDeadLettered => "job_dead_lettered",
        }
    }
}

/// What a caller hands to the audit sink. Sequence, timestamp and hashes
/// are assigned on append.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub organization_id: Option<Uuid>,
    pub kind: AuditKind,
    pub actor: Actor,
    pub subject_type: &'static str,
    pub subject_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, subject_type: &'static str, subject_id: impl ToString) -> Self {
        Self {
            organization_id: None,
            kind,
            actor: Actor::System,
            subject_type,
            subject_id: subject_id.to_string(),
            before: None,
            after: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn before(mut self, snapshot: serde_json::Value) -> Self {
        self.before = Some(snapshot);
        self
    }

    pub fn after(mut self, snapshot: serde_json::Value) -> Self {
        self.after = Some(snapshot);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// An immutable audit record with tamper-evident hash chaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub organization_id: Option<Uuid>,
    pub kind: AuditKind,
    pub actor: Actor,
    pub subject_type: String,
    pub subject_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of this record's content.
    pub event_hash: String,
    /// Hash of the previous record in the chain (`genesis` for the first).
    pub previous_hash: String,
}

/// Append-only audit store collaborator.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> AuditRecord;
}

/// In-process hash-chained audit log.
pub struct AuditLog {
    records: DashMap<Uuid, AuditRecord>,
    /// Sequence counter and last hash, advanced together.
    head: parking_lot::Mutex<(u64, String)>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            head: parking_lot::Mutex::new((0, GENESIS.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Verify the integrity of the audit chain.
    pub fn verify_chain(&self) -> ChainVerification {
        let records = self.ordered();
        let total = records.len();
        let mut valid = 0;
        let mut tampered = Vec::new();
        let mut expected_prev = GENESIS.to_string();

        for record in &records {
            if record.previous_hash == expected_prev && content_hash(record) == record.event_hash {
                valid += 1;
            } else {
                tampered.push(record.sequence);
            }
            expected_prev = record.event_hash.clone();
        }

        ChainVerification {
            total_events: total,
            valid_events: valid,
            tampered_sequences: tampered,
            chain_intact: valid == total,
        }
    }

    /// Query records, newest first.
    pub fn query(&self, filter: &AuditQuery) -> Vec<AuditRecord> {
        let mut results: Vec<AuditRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        results.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn count_kind(&self, kind: AuditKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    fn ordered(&self) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    #[cfg(test)]
    fn tamper<F>(&self, sequence: u64, edit: F)
    where
        F: Fn(&mut AuditRecord),
    {
        for mut record in self.records.iter_mut() {
            if record.sequence == sequence {
                edit(record.value_mut());
            }
        }
    }
}

impl AuditSink for AuditLog {
    fn append(&self, entry: AuditEntry) -> AuditRecord {
        let mut head = self.head.lock();
        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            sequence: head.0 + 1,
            organization_id: entry.organization_id,
            kind: entry.kind,
            actor: entry.actor,
            subject_type: entry.subject_type.to_string(),
            subject_id: entry.subject_id,
            before: entry.before,
            after: entry.after,
            detail: entry.detail,
            timestamp: Utc::now(),
            event_hash: String::new(),
            previous_hash: head.1.clone(),
        };
        record.event_hash = content_hash(&record);
        *head = (record.sequence, record.event_hash.clone());
        self.records.insert(record.id, record.clone());
        drop(head);

        info!(
            audit_id = %record.id,
            sequence = record.sequence,
            kind = record.kind.as_str(),
            subject = %record.subject_id,
            "audit record appended"
        );
        record
    }
}

/// Filter for [`AuditLog::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub organization_id: Option<Uuid>,
    pub kind: Option<AuditKind>,
    pub subject_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, record: &AuditRecord) -> bool {
        if self.organization_id.is_some() && record.organization_id != self.organization_id {
            return false;
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(subject) = &self.subject_id {
            if &record.subject_id != subject {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_events: usize,
    pub valid_events: usize,
    pub tampered_sequences: Vec<u64>,
    pub chain_intact: bool,
}

fn content_hash(record: &AuditRecord) -> String {
    let content = format!(
        "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
        record.sequence,
        record.organization_id.map(|id| id.to_string()).unwrap_or_default(),
        record.kind.as_str(),
        record.subject_type,
        record.subject_id,
        serde_json::to_string(&record.actor).unwrap_or_default(),
        record.before.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        record.after.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        record.timestamp.to_rfc3339(),
        record.previous_hash,
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(record.detail.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::Role;

    fn entry(kind: AuditKind, org: Uuid) -> AuditEntry {
        AuditEntry::new(kind, "campaign", Uuid::new_v4()).organization(org)
    }

    #[test]
    fn test_chain_links_records() {
        let log = AuditLog::new();
        let org = Uuid::new_v4();
        let first = log.append(entry(AuditKind::CampaignStatusChanged, org));
        let second = log.append(entry(AuditKind::CampaignBudgetChanged, org));

        assert_eq!(first.sequence, 1);
        assert_eq!(first.previous_hash, GENESIS);
        assert_eq!(second.previous_hash, first.event_hash);

        let verification = log.verify_chain();
        assert!(verification.chain_intact);
        assert_eq!(verification.total_events, 2);
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = AuditLog::new();
        let org = Uuid::new_v4();
        for _ in 0..3 {
            log.append(entry(AuditKind::JobFailed, org).detail(serde_json::json!({"attempts": 1})));
        }
        log.tamper(2, |r| r.detail = serde_json::json!({"attempts": 99}));

        let verification = log.verify_chain();
        assert!(!verification.chain_intact);
        assert_eq!(verification.tampered_sequences, vec![2]);
    }

    #[test]
    fn test_moving_a_record_to_another_tenant_is_detected() {
        let log = AuditLog::new();
        let org = Uuid::new_v4();
        log.append(entry(AuditKind::CampaignStatusChanged, org));
        log.append(entry(AuditKind::CampaignStatusChanged, org));
        log.tamper(1, |r| r.organization_id = Some(Uuid::new_v4()));

        let verification = log.verify_chain();
        assert!(!verification.chain_intact);
        assert_eq!(verification.tampered_sequences, vec![1]);

        let unscoped = AuditLog::new();
        unscoped.append(AuditEntry::new(AuditKind::JobFailed, "job", Uuid::new_v4()));
        unscoped.tamper(1, |r| r.organization_id = Some(org));
        assert!(!unscoped.verify_chain().chain_intact);
    }

    #[test]
    fn test_query_filters_by_org_and_kind() {
        let log = AuditLog::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        log.append(entry(AuditKind::ActionApproved, org_a).actor(Actor::User {
            id: Uuid::new_v4(),
            role: Role::Manager,
        }));
        log.append(entry(AuditKind::ActionRejected, org_a));
        log.append(entry(AuditKind::ActionApproved, org_b));

        let approved_a = log.query(&AuditQuery {
            organization_id: Some(org_a),
            kind: Some(AuditKind::ActionApproved),
            ..AuditQuery::default()
        });
        assert_eq!(approved_a.len(), 1);
        assert!(matches!(approved_a[0].actor, Actor::User { .. }));
        assert_eq!(log.count_kind(AuditKind::ActionApproved), 2);

        let newest = log.query(&AuditQuery { limit: Some(1), ..AuditQuery::default() });
        assert_eq!(newest[0].sequence, 3);
    }
}
