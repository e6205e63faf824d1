//! Normalized domain model shared by every layer of the autopilot core.
//!
//! Platform-specific shapes never appear here: adapters translate into these
//! types and the scheduler, token manager and rule engine only ever see them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// ─── Platform ───────────────────────────────────────────────────────────────

/// Supported advertising platforms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Google,
    Meta,
    Tiktok,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Google, Platform::Meta, Platform::Tiktok];

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Google => "Google Ads",
            Platform::Meta => "Meta Ads",
            Platform::Tiktok => "TikTok Ads",
        }
    }

    /// Stable lowercase identifier used in idempotency keys and metric labels.
    pub fn slug(&self) -> &'static str {
        match self {
            Platform::Google => "google",
            Platform::Meta => "meta",
            Platform::Tiktok => "tiktok",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

// ─── Connected Account ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Success,
    Error,
    AuthError,
}

/// One OAuth-linked ad account on one platform for one organization.
///
/// Tokens are held by the credential store; `token_expires_at` mirrors the
/// expiry of the currently stored access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub platform: Platform,
    pub external_account_id: String,
    pub display_name: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub consecutive_failures: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on disconnect. Revoked accounts are kept for audit continuity.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConnectedAccount {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Accounts the scheduler should sync: not revoked and not waiting on re-auth.
    pub fn is_active(&self) -> bool {
        !self.is_revoked() && self.sync_status != SyncStatus::AuthError
    }
}

// ─── Campaign ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    PendingReview,
    Approved,
    Active,
    Paused,
    Archived,
    Rejected,
}

impl CampaignStatus {
    /// Whether `self -> next` is an edge of the campaign lifecycle.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, PendingReview)
                | (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (Approved, Active)
                | (Approved, Paused)
                | (Active, Paused)
                | (Paused, Active)
                | (Approved, Archived)
                | (Active, Archived)
                | (Paused, Archived)
        )
    }

    /// Statuses remote reconciliation is allowed to move a campaign out of.
    pub fn is_remotely_reconciled(self) -> bool {
        matches!(
            self,
            CampaignStatus::Approved | CampaignStatus::Active | CampaignStatus::Paused
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Archived | CampaignStatus::Rejected)
    }
}

/// Platform-neutral representation of one advertising campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub account_id: Uuid,
    pub organization_id: Uuid,
    pub platform: Platform,
    pub name: String,
    /// Platform-native id, `None` until first launch.
    pub native_id: Option<String>,
    pub status: CampaignStatus,
    /// Daily budget in account currency.
    pub budget: f64,
    /// Platform-specific options, validated only by the owning adapter.
    #[serde(default)]
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Move the campaign to `next`, enforcing the lifecycle graph.
    pub fn transition(&mut self, next: CampaignStatus, at: DateTime<Utc>) -> CoreResult<()> {
        if self.status == next {
            return Ok(());
        }
        if self.native_id.is_some() && next == CampaignStatus::Draft {
            return Err(CoreError::StateConflict(format!(
                "campaign {} has a native id and cannot return to draft",
                self.id
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::StateConflict(format!(
                "campaign {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

/// Status as reported by (or requested from) a remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    Paused,
    /// Still under platform review or otherwise not yet delivering.
    Pending,
    Removed,
    Unknown(String),
}

// ─── Metrics ────────────────────────────────────────────────────────────────

/// One normalized measurement. Append-only; unique per (campaign, timestamp, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub campaign_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub conversions: f64,
    pub conversion_value: f64,
    pub source: Platform,
}

/// Closed-open time range `[start, end)` for metric queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `secs` seconds ending at `end`.
    pub fn trailing(end: DateTime<Utc>, secs: i64) -> Self {
        Self {
            start: end - chrono::Duration::seconds(secs),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

// ─── Automation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Impressions,
    Clicks,
    Spend,
    Conversions,
    ConversionValue,
    Ctr,
    Cpc,
    Cpa,
    Roas,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::LessThan => value < threshold,
            Comparator::LessOrEqual => value <= threshold,
            Comparator::GreaterThan => value > threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCondition {
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Trailing evaluation window in seconds.
    pub window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Pause,
    Resume,
    AdjustBudget { percent: f64 },
    Notify { message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Auto,
    RequireApproval,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "campaign_ids", rename_all = "snake_case")]
pub enum RuleScope {
    Organization,
    Campaigns(Vec<Uuid>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub scope: RuleScope,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub approval_mode: ApprovalMode,
    pub enabled: bool,
    pub cadence_secs: i64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// A concrete remote change proposed by a rule or a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedMutation {
    SetStatus { target: CampaignStatus },
    SetBudget { from: f64, to: f64 },
    Notify { message: String },
}

impl ProposedMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            ProposedMutation::SetStatus { .. } => "set_status",
            ProposedMutation::SetBudget { .. } => "set_budget",
            ProposedMutation::Notify { .. } => "notify",
        }
    }
}

// ─── Approval ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// An action held at the human-in-the-loop gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub rule_id: Uuid,
    pub campaign_id: Uuid,
    pub mutation: ProposedMutation,
    pub state: DecisionState,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ─── Actors ─────────────────────────────────────────────────────────────────

/// Organization role asserted by the RBAC collaborator for a human actor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Member,
    Manager,
    Admin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    System,
    User { id: Uuid, role: Role },
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::System => None,
            Actor::User { id, .. } => Some(*id),
        }
    }
}

// ─── Jobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Evaluate,
    Action,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Evaluate => "evaluate",
            JobKind::Action => "action",
        }
    }
}

/// Remote mutation to apply to one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub campaign_id: Uuid,
    pub mutation: ProposedMutation,
    pub rule_id: Option<Uuid>,
    pub pending_action_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Sync { account_id: Uuid },
    Evaluate { rule_id: Uuid },
    Action(ActionCommand),
}

/// A unit of work carried by the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub organization_id: Uuid,
    pub platform: Option<Platform>,
    pub idempotency_key: String,
    pub payload: JobPayload,
    /// Attempts already made (0 on first delivery).
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be delivered.
    pub not_before: DateTime<Utc>,
}

impl Job {
    fn build(
        kind: JobKind,
        organization_id: Uuid,
        platform: Option<Platform>,
        idempotency_key: String,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            organization_id,
            platform,
            idempotency_key,
            payload,
            attempts: 0,
            enqueued_at: now,
            not_before: now,
        }
    }

    /// Scheduled sync for one account in schedule slot `slot`.
    pub fn sync(account: &ConnectedAccount, slot: &str, now: DateTime<Utc>) -> Self {
        Self::build(
            JobKind::Sync,
            account.organization_id,
            Some(account.platform),
            idempotency_key(JobKind::Sync, account.id, slot),
            JobPayload::Sync {
                account_id: account.id,
            },
            now,
        )
    }

    pub fn evaluate(rule: &AutomationRule, slot: &str, now: DateTime<Utc>) -> Self {
        Self::build(
            JobKind::Evaluate,
            rule.organization_id,
            None,
            idempotency_key(JobKind::Evaluate, rule.id, slot),
            JobPayload::Evaluate { rule_id: rule.id },
            now,
        )
    }

    pub fn action(
        organization_id: Uuid,
        platform: Platform,
        idempotency_key: String,
        command: ActionCommand,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            JobKind::Action,
            organization_id,
            Some(platform),
            idempotency_key,
            JobPayload::Action(command),
            now,
        )
    }

    /// Id of the object the job works on (account, rule or campaign).
    pub fn target_id(&self) -> Uuid {
        match &self.payload {
            JobPayload::Sync { account_id } => *account_id,
            JobPayload::Evaluate { rule_id } => *rule_id,
            JobPayload::Action(cmd) => cmd.campaign_id,
        }
    }
}

/// Deterministic key `(kind, target, slot)` collapsing duplicate enqueues.
pub fn idempotency_key(kind: JobKind, target: Uuid, slot: &str) -> String {
    format!("{}:{}:{}", kind.as_str(), target, slot)
}

/// Schedule slot index of `at` for a cadence of `cadence_secs`.
pub fn schedule_slot(at: DateTime<Utc>, cadence_secs: i64) -> String {
    let cadence = cadence_secs.max(1);
    at.timestamp().div_euclid(cadence).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(status: CampaignStatus, native: Option<&str>) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            platform: Platform::Google,
            name: "Spring Sale".to_string(),
            native_id: native.map(String::from),
            status,
            budget: 50.0,
            options: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(PendingReview));
        assert!(PendingReview.can_transition_to(Rejected));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Active.can_transition_to(Draft));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Archived.can_transition_to(Active));
        assert!(!PendingReview.can_transition_to(Active));
    }

    #[test]
    fn test_native_id_blocks_draft() {
        let mut c = campaign(CampaignStatus::Paused, Some("123"));
        let err = c.transition(CampaignStatus::Draft, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::StateConflict(_)));
        assert_eq!(c.status, CampaignStatus::Paused);

        c.transition(CampaignStatus::Active, Utc::now()).unwrap();
        assert_eq!(c.status, CampaignStatus::Active);
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::LessThan.compare(0.8, 1.0));
        assert!(!Comparator::LessThan.compare(1.0, 1.0));
        assert!(Comparator::LessOrEqual.compare(1.0, 1.0));
        assert!(Comparator::GreaterThan.compare(2.0, 1.0));
        assert!(Comparator::Equal.compare(1.0, 1.0));
    }

    #[test]
    fn test_schedule_slot_and_keys() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:07:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = at + chrono::Duration::minutes(5);
        assert_eq!(schedule_slot(at, 900), schedule_slot(later, 900));
        assert_ne!(
            schedule_slot(at, 900),
            schedule_slot(at + chrono::Duration::minutes(15), 900)
        );

        let target = Uuid::new_v4();
        let key = idempotency_key(JobKind::Sync, target, "42");
        assert_eq!(key, format!("sync:{}:42", target));
    }

    #[test]
    fn test_comparator_serde_symbols() {
        let json = serde_json::to_string(&Comparator::LessThan).unwrap();
        assert_eq!(json, "\"<\"");
        let parsed: Comparator = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(parsed, Comparator::GreaterOrEqual);
    }
}
