//! Google Ads adapter.
//!
//! OAuth2 refresh grants, GAQL search with `nextPageToken` pagination and
//! `:mutate` endpoints. Money fields are in micros.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campaign_core::clock::{Clock, SystemClock};
use campaign_core::config::PlatformSettings;
use campaign_core::error::{PlatformError, PlatformResult};
use campaign_core::types::{Platform, RemoteStatus, TimeWindow};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::*;
use crate::transport::{ApiRequest, ApiResponse, ApiTransport};

const DEFAULT_BASE_URL: &str = "https://googleads.googleapis.com/v17";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);
const MAX_PAGES: usize = 1_000;

pub struct GoogleAdsAdapter {
    transport: Arc<dyn ApiTransport>,
    settings: PlatformSettings,
    clock: Arc<dyn Clock>,
}

impl GoogleAdsAdapter {
    pub fn new(transport: Arc<dyn ApiTransport>, settings: PlatformSettings) -> Self {
        Self {
            transport,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Compute token expiries against `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn base_url(&self) -> &str {
        if self.settings.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            &self.settings.base_url
        }
    }

    fn token_url(&self) -> &str {
        if self.settings.auth_url.is_empty() {
            DEFAULT_TOKEN_URL
        } else {
            &self.settings.auth_url
        }
    }

    fn authorized(&self, request: ApiRequest, access_token: &str) -> ApiRequest {
        request
            .bearer(access_token)
            .header("developer-token", self.settings.developer_token.clone())
    }

    async fn call(&self, request: ApiRequest) -> PlatformResult<Value> {
        metrics::counter!("adapter.requests", "platform" => "google").increment(1);
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(response.body)
        } else {
            Err(map_error(&response))
        }
    }

    /// Run a GAQL query, following `nextPageToken` until exhausted.
    async fn search(&self, access_token: &str, customer_id: &str, query: &str) -> PlatformResult<Vec<Value>> {
        let url = format!("{}/customers/{}/googleAds:search", self.base_url(), customer_id);
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut body = json!({ "query": query });
            if let Some(token) = &page_token {
                body["pageToken"] = Value::String(token.clone());
            }
            let page = self
                .call(self.authorized(ApiRequest::post(&url), access_token).json(body))
                .await?;
            if let Some(results) = page.get("results").and_then(Value::as_array) {
                rows.extend(results.iter().cloned());
            }
            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(String::from);
            if page_token.is_none() {
                return Ok(rows);
            }
        }
        Err(PlatformError::TransientNetwork(
            "google search pagination did not terminate".to_string(),
        ))
    }

    async fn mutate(
        &self,
        access_token: &str,
        customer_id: &str,
        resource: &str,
        operations: Value,
    ) -> PlatformResult<Value> {
        let url = format!("{}/customers/{}/{}:mutate", self.base_url(), customer_id, resource);
        self.call(
            self.authorized(ApiRequest::post(url), access_token)
                .json(json!({ "operations": operations })),
        )
        .await
    }

    fn grant_from(&self, body: &Value, previous_refresh: Option<&str>) -> PlatformResult<TokenGrant> {
        let access_token = json_str(body.get("access_token"))
            .ok_or_else(|| PlatformError::TransientNetwork("token response missing access_token".into()))?;
        // Google only rotates the refresh token on the authorization-code grant.
        let refresh_token = json_str(body.get("refresh_token"))
            .or_else(|| previous_refresh.map(String::from))
            .ok_or_else(|| {
                PlatformError::Validation("no refresh token granted; offline access is required".into())
            })?;
        let expires_in = json_f64(body.get("expires_in")).unwrap_or(3600.0) as i64;
        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(expires_in),
        })
    }

    async fn token_request(&self, form: Vec<(String, String)>) -> PlatformResult<Value> {
        metrics::counter!("adapter.requests", "platform" => "google").increment(1);
        let response = self
            .transport
            .send(ApiRequest::post(self.token_url()).form(form))
            .await?;
        if response.is_success() {
            return Ok(response.body);
        }
        let oauth_error = response.body.get("error").and_then(Value::as_str).unwrap_or("");
        if matches!(oauth_error, "invalid_grant" | "unauthorized_client" | "invalid_client") {
            return Err(PlatformError::AuthExpired(format!("google oauth: {oauth_error}")));
        }
        Err(map_error(&response))
    }

    async fn remote_status(&self, access_token: &str, campaign: CampaignRef<'_>) -> PlatformResult<String> {
        let customer = customer_id(campaign.account_id);
        let query = format!(
            "SELECT campaign.status FROM campaign WHERE campaign.resource_name = '{}'",
            campaign.native_id
        );
        let rows = self.search(access_token, &customer, &query).await?;
        rows.first()
            .and_then(|r| r.pointer("/campaign/status"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| PlatformError::Validation(format!("campaign {} not found", campaign.native_id)))
    }
}

#[async_trait]
impl PlatformAdapter for GoogleAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::Google
    }

    fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            floor: self.settings.min_daily_budget,
            ceiling: self.settings.max_daily_budget,
        }
    }

    fn validate_options(&self, options: &Value) -> PlatformResult<()> {
        match options.get("advertising_channel_type").and_then(Value::as_str) {
            Some("SEARCH" | "DISPLAY" | "SHOPPING" | "VIDEO" | "PERFORMANCE_MAX") => Ok(()),
            Some(other) => Err(PlatformError::Validation(format!(
                "unsupported advertising_channel_type '{other}'"
            ))),
            None => Err(PlatformError::Validation(
                "advertising_channel_type is required".to_string(),
            )),
        }
    }

    async fn connect(&self, auth_code: &str, redirect_uri: &str) -> PlatformResult<TokenGrant> {
        let body = self
            .token_request(vec![
                ("grant_type".into(), "authorization_code".into()),
                ("code".into(), auth_code.into()),
                ("redirect_uri".into(), redirect_uri.into()),
                ("client_id".into(), self.settings.client_id.clone()),
                ("client_secret".into(), self.settings.client_secret.clone()),
            ])
            .await?;
        self.grant_from(&body, None)
    }

    async fn list_accounts(&self, access_token: &str) -> PlatformResult<Vec<RemoteAccount>> {
        let url = format!("{}/customers:listAccessibleCustomers", self.base_url());
        let body = self
            .call(self.authorized(ApiRequest::get(url), access_token))
            .await?;
        let accounts = body
            .get("resourceNames")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|name| RemoteAccount {
                        external_id: name.trim_start_matches("customers/").to_string(),
                        name: None,
                        currency: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(accounts)
    }

    async fn fetch_campaigns(&self, access_token: &str, account_id: &str) -> PlatformResult<Vec<RemoteCampaign>> {
        let query = "SELECT campaign.resource_name, campaign.name, campaign.status, \
                     campaign_budget.amount_micros FROM campaign";
        let rows = self.search(access_token, &customer_id(account_id), query).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let native_id = json_str(row.pointer("/campaign/resourceName"))?;
                let raw_status = json_str(row.pointer("/campaign/status")).unwrap_or_default();
                Some(RemoteCampaign {
                    native_id,
                    name: json_str(row.pointer("/campaign/name")).unwrap_or_default(),
                    status: status_from_google(&raw_status),
                    raw_status,
                    daily_budget: json_f64(row.pointer("/campaignBudget/amountMicros"))
                        .map(|micros| micros / 1_000_000.0),
                })
            })
            .collect())
    }

    async fn create_campaign(
        &self,
        access_token: &str,
        account_id: &str,
        draft: &CampaignDraft,
    ) -> PlatformResult<String> {
        self.validate_options(&draft.options)?;
        let customer = customer_id(account_id);
        let budget = self
            .mutate(
                access_token,
                &customer,
                "campaignBudgets",
                json!([{ "create": {
                    "name": format!("{} budget", draft.name),
                    "amountMicros": to_micros(draft.budget),
                    "deliveryMethod": "STANDARD",
                }}]),
            )
            .await?;
        let budget_resource = json_str(budget.pointer("/results/0/resourceName"))
            .ok_or_else(|| PlatformError::TransientNetwork("budget create returned no resource".into()))?;

        let created = self
            .mutate(
                access_token,
                &customer,
                "campaigns",
                json!([{ "create": {
                    "name": draft.name,
                    "status": "PAUSED",
                    "advertisingChannelType": draft.options.get("advertising_channel_type"),
                    "campaignBudget": budget_resource,
                    "manualCpc": {},
                }}]),
            )
            .await?;
        json_str(created.pointer("/results/0/resourceName"))
            .ok_or_else(|| PlatformError::TransientNetwork("campaign create returned no resource".into()))
    }

    async fn update_campaign(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        update: &CampaignUpdate,
    ) -> PlatformResult<()> {
        let customer = customer_id(campaign.account_id);
        if let Some(name) = &update.name {
            self.mutate(
                access_token,
                &customer,
                "campaigns",
                json!([{ "update": { "resourceName": campaign.native_id, "name": name }, "updateMask": "name" }]),
            )
            .await?;
        }
        if let Some(budget) = update.budget {
            // Budgets are their own resource; resolve it from the campaign.
            let query = format!(
                "SELECT campaign.campaign_budget FROM campaign WHERE campaign.resource_name = '{}'",
                campaign.native_id
            );
            let rows = self.search(access_token, &customer, &query).await?;
            let budget_resource = rows
                .first()
                .and_then(|r| json_str(r.pointer("/campaign/campaignBudget")))
                .ok_or_else(|| {
                    PlatformError::Validation(format!("campaign {} has no budget", campaign.native_id))
                })?;
            self.mutate(
                access_token,
                &customer,
                "campaignBudgets",
                json!([{ "update": { "resourceName": budget_resource, "amountMicros": to_micros(budget) }, "updateMask": "amount_micros" }]),
            )
            .await?;
        }
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        status: RemoteStatus,
    ) -> PlatformResult<StatusAck> {
        ensure_settable(Platform::Google, &status)?;
        let current = self.remote_status(access_token, campaign).await?;
        if status_from_google(&current) == status {
            debug!(campaign = campaign.native_id, status = %current, "google status already matches");
            return Ok(StatusAck::AlreadyInState);
        }

        let customer = customer_id(campaign.account_id);
        let operation = if status == RemoteStatus::Removed {
            json!([{ "remove": campaign.native_id }])
        } else {
            json!([{ "update": { "resourceName": campaign.native_id, "status": google_status(&status) }, "updateMask": "status" }])
        };
        self.mutate(access_token, &customer, "campaigns", operation).await?;
        Ok(StatusAck::Applied)
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        window: &TimeWindow,
    ) -> PlatformResult<Vec<RawMetricSample>> {
        let (from, to) = report_days(window);
        let query = format!(
            "SELECT campaign.resource_name, segments.date, metrics.impressions, metrics.clicks, \
             metrics.cost_micros, metrics.conversions, metrics.conversions_value FROM campaign \
             WHERE segments.date BETWEEN '{from}' AND '{to}'"
        );
        let rows = self.search(access_token, &customer_id(account_id), &query).await?;
        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(native_campaign_id) = json_str(row.pointer("/campaign/resourceName")) else {
                continue;
            };
            let day = json_str(row.pointer("/segments/date")).unwrap_or_default();
            samples.push(RawMetricSample {
                platform: Platform::Google,
                native_campaign_id,
                period_start: parse_day(&day)?,
                fields: row.get("metrics").cloned().unwrap_or(Value::Null),
            });
        }
        Ok(dedupe_samples(samples))
    }

    async fn refresh_token(&self, refresh_token: &str) -> PlatformResult<TokenGrant> {
        let body = self
            .token_request(vec![
                ("grant_type".into(), "refresh_token".into()),
                ("refresh_token".into(), refresh_token.into()),
                ("client_id".into(), self.settings.client_id.clone()),
                ("client_secret".into(), self.settings.client_secret.clone()),
            ])
            .await?;
        self.grant_from(&body, Some(refresh_token))
    }
}

/// Customer ids are accepted with or without dashes, or as a resource name.
fn customer_id(account_id: &str) -> String {
    let id = account_id
        .strip_prefix("customers/")
        .map(|rest| rest.split('/').next().unwrap_or(rest))
        .unwrap_or(account_id);
    id.replace('-', "")
}

fn to_micros(amount: f64) -> i64 {
    (amount * 1_000_000.0).round() as i64
}

fn status_from_google(raw: &str) -> RemoteStatus {
    match raw {
        "ENABLED" => RemoteStatus::Active,
        "PAUSED" => RemoteStatus::Paused,
        "REMOVED" => RemoteStatus::Removed,
        other => RemoteStatus::Unknown(other.to_string()),
    }
}

fn google_status(status: &RemoteStatus) -> &'static str {
    match status {
        RemoteStatus::Active => "ENABLED",
        RemoteStatus::Removed => "REMOVED",
        _ => "PAUSED",
    }
}

fn map_error(response: &ApiResponse) -> PlatformError {
    let error = response.body.get("error");
    let status = error
        .and_then(|e| e.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("google ads request failed")
        .to_string();

    if response.status == 401 || status == "UNAUTHENTICATED" {
        PlatformError::AuthExpired(message)
    } else if response.status == 429 || status == "RESOURCE_EXHAUSTED" {
        PlatformError::RateLimited {
            retry_after: response.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
        }
    } else if response.status >= 500 || status == "UNAVAILABLE" || status == "DEADLINE_EXCEEDED" {
        PlatformError::TransientNetwork(message)
    } else {
        PlatformError::Validation(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use campaign_core::clock::ManualClock;

    fn adapter(transport: Arc<ScriptedTransport>) -> GoogleAdsAdapter {
        GoogleAdsAdapter::new(
            transport,
            PlatformSettings {
                client_id: "client".into(),
                client_secret: "secret".into(),
                developer_token: "dev".into(),
                min_daily_budget: 1.0,
                ..PlatformSettings::default()
            },
        )
    }

    const NATIVE: &str = "customers/1234567890/campaigns/42";

    #[tokio::test]
    async fn test_metrics_follow_page_tokens_and_dedupe() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_ok(json!({
                "results": [
                    {"campaign": {"resourceName": NATIVE}, "segments": {"date": "2024-05-01"},
                     "metrics": {"impressions": "100", "clicks": "5", "costMicros": "2500000"}},
                ],
                "nextPageToken": "page-2"
            }))
            .push_ok(json!({
                "results": [
                    {"campaign": {"resourceName": NATIVE}, "segments": {"date": "2024-05-01"},
                     "metrics": {"impressions": "110", "clicks": "6", "costMicros": "2600000"}},
                    {"campaign": {"resourceName": NATIVE}, "segments": {"date": "2024-05-02"},
                     "metrics": {"impressions": "90", "clicks": "4", "costMicros": "2000000"}},
                ]
            }));
        let google = adapter(transport.clone());

        let window = TimeWindow::new(parse_day("2024-05-01").unwrap(), parse_day("2024-05-03").unwrap());
        let samples = google.fetch_metrics("tok", "123-456-7890", &window).await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].fields["impressions"], "110");
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.ends_with("/customers/1234567890/googleAds:search"));
        assert_eq!(requests[1].json.as_ref().unwrap()["pageToken"], "page-2");
    }

    #[tokio::test]
    async fn test_set_status_reads_before_writing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(json!({"results": [{"campaign": {"status": "PAUSED"}}]}));
        let google = adapter(transport.clone());
        let campaign = CampaignRef { account_id: "1234567890", native_id: NATIVE };

        let ack = google
            .set_campaign_status("tok", campaign, RemoteStatus::Paused)
            .await
            .unwrap();
        assert_eq!(ack, StatusAck::AlreadyInState);
        assert_eq!(transport.requests().len(), 1);

        transport
            .push_ok(json!({"results": [{"campaign": {"status": "PAUSED"}}]}))
            .push_ok(json!({"results": [{"resourceName": NATIVE}]}));
        let ack = google
            .set_campaign_status("tok", campaign, RemoteStatus::Active)
            .await
            .unwrap();
        assert_eq!(ack, StatusAck::Applied);
        let requests = transport.requests();
        let mutate = requests.last().unwrap();
        assert!(mutate.url.ends_with("/campaigns:mutate"));
        assert_eq!(mutate.json.as_ref().unwrap()["operations"][0]["update"]["status"], "ENABLED");
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant_is_auth_expired() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(ApiResponse::with_status(400, json!({"error": "invalid_grant"})));
        let google = adapter(transport.clone());

        let err = google.refresh_token("revoked").await.unwrap_err();
        assert!(matches!(err, PlatformError::AuthExpired(_)));
        assert_eq!(transport.requests()[0].form_value("grant_type"), Some("refresh_token"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(json!({"access_token": "new-access", "expires_in": 3599}));
        let clock = Arc::new(ManualClock::new(parse_day("2024-05-01").unwrap()));
        let google = adapter(transport).with_clock(clock.clone());

        let grant = google.refresh_token("long-lived").await.unwrap();
        assert_eq!(grant.access_token, "new-access");
        assert_eq!(grant.refresh_token, "long-lived");
        assert_eq!(grant.expires_at, clock.now() + chrono::Duration::seconds(3599));
    }

    #[test]
    fn test_error_mapping() {
        let mut limited = ApiResponse::with_status(429, json!({"error": {"status": "RESOURCE_EXHAUSTED"}}));
        limited.retry_after = Some(Duration::from_secs(12));
        assert_eq!(
            map_error(&limited),
            PlatformError::RateLimited { retry_after: Duration::from_secs(12) }
        );
        assert!(matches!(
            map_error(&ApiResponse::with_status(401, json!({}))),
            PlatformError::AuthExpired(_)
        ));
        assert!(matches!(
            map_error(&ApiResponse::with_status(503, json!({}))),
            PlatformError::TransientNetwork(_)
        ));
        assert!(matches!(
            map_error(&ApiResponse::with_status(400, json!({"error": {"message": "bad budget"}}))),
            PlatformError::Validation(_)
        ));
    }

    #[test]
    fn test_customer_id_normalization() {
        assert_eq!(customer_id("123-456-7890"), "1234567890");
        assert_eq!(customer_id(NATIVE), "1234567890");
    }
}
