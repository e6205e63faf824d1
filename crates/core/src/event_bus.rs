//! Notification bus: abstract events handed to the notification module.
//!
//! Components accept an `Arc<dyn NotificationSink>`; the notification
//! collaborator owns fan-out to email, chat and messaging channels.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AccountNeedsReauth,
    ApprovalRequested,
    ApprovalExpired,
    RuleNotification,
    ActionRejected,
    JobFailed,
    JobDeadLettered,
    CampaignDiverged,
}

/// `{type, organizationId, payload}` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub organization_id: Uuid,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, organization_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            organization_id,
            payload,
            emitted_at: Utc::now(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: NotificationEvent);
}

/// No-op sink for tests and deployments without a notification module.
pub struct NoOpSink;

impl NotificationSink for NoOpSink {
    fn emit(&self, _event: NotificationEvent) {}
}

/// Sink that logs every event through `tracing`.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, event: NotificationEvent) {
        tracing::info!(
            kind = ?event.kind,
            organization_id = %event.organization_id,
            payload = %event.payload,
            "notification emitted"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: NotificationKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl NotificationSink for CaptureSink {
    fn emit(&self, event: NotificationEvent) {
        self.events.lock().push(event);
    }
}
