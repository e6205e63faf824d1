//! The uniform operation set every ad platform adapter implements.

use std::collections::HashMap;

use async_trait::async_trait;
use campaign_core::error::{PlatformError, PlatformResult};
use campaign_core::types::{Platform, RemoteStatus, TimeWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Connect,
    ListAccounts,
    FetchCampaigns,
    CreateCampaign,
    UpdateCampaign,
    SetCampaignStatus,
    FetchMetrics,
    RefreshToken,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Connect,
        Capability::ListAccounts,
        Capability::FetchCampaigns,
        Capability::CreateCampaign,
        Capability::UpdateCampaign,
        Capability::SetCampaignStatus,
        Capability::FetchMetrics,
        Capability::RefreshToken,
    ];
}

/// Access/refresh token pair returned by an authorization or refresh flow.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub external_id: String,
    pub name: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCampaign {
    pub native_id: String,
    pub name: String,
    pub status: RemoteStatus,
    /// Status string exactly as the platform reported it.
    pub raw_status: String,
    pub daily_budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDraft {
    pub name: String,
    pub budget: f64,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignUpdate {
    pub name: Option<String>,
    pub budget: Option<f64>,
    /// The campaign's current options blob, for adapters whose update
    /// semantics depend on it.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// One metrics row in the platform's own shape. The metrics normalizer
/// owns the conversion of `fields` into the unified schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricSample {
    pub platform: Platform,
    pub native_campaign_id: String,
    pub period_start: DateTime<Utc>,
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAck {
    Applied,
    /// Remote status already matched; no mutation was issued.
    AlreadyInState,
}

/// Daily budget bounds a platform accepts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub floor: f64,
    pub ceiling: f64,
}

/// Identifies a remote campaign within its ad account.
#[derive(Debug, Clone, Copy)]
pub struct CampaignRef<'a> {
    pub account_id: &'a str,
    pub native_id: &'a str,
}

/// Platform-specific implementation of the uniform ad-operations contract.
///
/// Implementations hold no per-account state and are safe to call
/// concurrently for different accounts. Errors are always expressed in the
/// core taxonomy.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn capabilities(&self) -> &[Capability] {
        &Capability::ALL
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn budget_limits(&self) -> BudgetLimits;

    /// Validate a campaign options blob for this platform.
    fn validate_options(&self, _options: &serde_json::Value) -> PlatformResult<()> {
        Ok(())
    }

    /// Exchange an OAuth authorization code for a token pair.
    async fn connect(&self, auth_code: &str, redirect_uri: &str) -> PlatformResult<TokenGrant>;

    async fn list_accounts(&self, access_token: &str) -> PlatformResult<Vec<RemoteAccount>>;

    async fn fetch_campaigns(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> PlatformResult<Vec<RemoteCampaign>>;

    /// Create a campaign remotely and return its native id.
    async fn create_campaign(
        &self,
        access_token: &str,
        account_id: &str,
        draft: &CampaignDraft,
    ) -> PlatformResult<String>;

    async fn update_campaign(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        update: &CampaignUpdate,
    ) -> PlatformResult<()>;

    /// Set the delivery status. Calling twice with the same target issues
    /// at most one remote mutation.
    async fn set_campaign_status(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        status: RemoteStatus,
    ) -> PlatformResult<StatusAck>;

    /// Fetch every metrics row in `window`, following pagination, with
    /// duplicates removed.
    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        window: &TimeWindow,
    ) -> PlatformResult<Vec<RawMetricSample>>;

    async fn refresh_token(&self, refresh_token: &str) -> PlatformResult<TokenGrant>;
}

/// Keep the last row seen per (campaign, period). Pagination can repeat rows
/// when the platform's result set shifts between page requests.
pub fn dedupe_samples(samples: Vec<RawMetricSample>) -> Vec<RawMetricSample> {
    let mut order: Vec<(String, DateTime<Utc>)> = Vec::new();
    let mut latest: HashMap<(String, DateTime<Utc>), RawMetricSample> = HashMap::new();
    for sample in samples {
        let key = (sample.native_campaign_id.clone(), sample.period_start);
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, sample);
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

/// Inclusive `(first_day, last_day)` covering a closed-open window, in the
/// `YYYY-MM-DD` form every platform's reporting API accepts.
pub fn report_days(window: &TimeWindow) -> (String, String) {
    let last = if window.end > window.start {
        window.end - chrono::Duration::seconds(1)
    } else {
        window.start
    };
    (
        window.start.format("%Y-%m-%d").to_string(),
        last.format("%Y-%m-%d").to_string(),
    )
}

/// Parse a `YYYY-MM-DD` (optionally followed by a time) day into midnight UTC.
pub fn parse_day(value: &str) -> PlatformResult<DateTime<Utc>> {
    let day = value.get(..10).unwrap_or(value);
    chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| PlatformError::Validation(format!("unparseable report date '{value}'")))
}

/// Reject a status the platforms cannot be asked to move into.
pub(crate) fn ensure_settable(platform: Platform, status: &RemoteStatus) -> PlatformResult<()> {
    match status {
        RemoteStatus::Active | RemoteStatus::Paused | RemoteStatus::Removed => Ok(()),
        other => Err(PlatformError::PlatformIncompatibility {
            platform,
            operation: format!("set status {other:?}"),
        }),
    }
}

/// Read a string or number JSON value as `f64`. Platforms disagree on
/// whether numeric report fields are strings.
pub(crate) fn json_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_str(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, day: &str, clicks: u64) -> RawMetricSample {
        RawMetricSample {
            platform: Platform::Meta,
            native_campaign_id: id.to_string(),
            period_start: parse_day(day).unwrap(),
            fields: serde_json::json!({ "clicks": clicks }),
        }
    }

    #[test]
    fn test_dedupe_keeps_last_and_order() {
        let rows = vec![
            sample("a", "2024-05-01", 1),
            sample("b", "2024-05-01", 2),
            sample("a", "2024-05-01", 3),
        ];
        let deduped = dedupe_samples(rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].native_campaign_id, "a");
        assert_eq!(deduped[0].fields["clicks"], 3);
    }

    #[test]
    fn test_report_days_end_is_exclusive() {
        let start = parse_day("2024-05-01").unwrap();
        let end = parse_day("2024-05-03").unwrap();
        let (from, to) = report_days(&TimeWindow::new(start, end));
        assert_eq!(from, "2024-05-01");
        assert_eq!(to, "2024-05-02");
    }

    #[test]
    fn test_parse_day_accepts_datetime_suffix() {
        let day = parse_day("2024-05-01 00:00:00").unwrap();
        assert_eq!(day, parse_day("2024-05-01").unwrap());
        assert!(parse_day("yesterday").is_err());
    }

    #[test]
    fn test_json_numbers_from_strings() {
        let v = serde_json::json!({"a": "12.5", "b": 3, "c": null});
        assert_eq!(json_f64(v.get("a")), Some(12.5));
        assert_eq!(json_f64(v.get("b")), Some(3.0));
        assert_eq!(json_f64(v.get("c")), None);
    }
}
