//! TikTok Business API adapter.
//!
//! Every response is an envelope `{code, message, data}` with HTTP 200 even
//! on failure; the envelope code is authoritative. Paging uses
//! `page_info.total_page`.

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

const DEFAULT_BASE_URL: &str = "https://business-api.tiktok.com/open_api/v1.3";
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 1_000;
const INFINITE_BUDGET: &str = "BUDGET_MODE_INFINITE";

pub struct TikTokAdsAdapter {
    transport: Arc<dyn ApiTransport>,
    settings: PlatformSettings,
    clock: Arc<dyn Clock>,
}

impl TikTokAdsAdapter {
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

    fn url(&self, path: &str) -> String {
        let base = if self.settings.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            self.settings.base_url.trim_end_matches('/')
        };
        format!("{base}/{path}")
    }

    fn auth_url(&self, path: &str) -> String {
        if self.settings.auth_url.is_empty() {
            self.url(&format!("oauth2/{path}"))
        } else {
            format!("{}/{path}", self.settings.auth_url.trim_end_matches('/'))
        }
    }

    /// Send a request and unwrap the envelope's `data`.
    async fn call(&self, request: ApiRequest) -> PlatformResult<Value> {
        metrics::counter!("adapter.requests", "platform" => "tiktok").increment(1);
        let response = self.transport.send(request).await?;
        let code = response.body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if response.is_success() && code == 0 {
            Ok(response.body.get("data").cloned().unwrap_or(Value::Null))
        } else {
            Err(map_error(&response))
        }
    }

    /// Fetch every page of a list endpoint; `build` receives the page number.
    async fn paged<F>(&self, build: F) -> PlatformResult<Vec<Value>>
    where
        F: Fn(u32) -> ApiRequest + Send + Sync,
    {
        let mut items = Vec::new();
        let mut page = 1;
        while page <= MAX_PAGES {
            let data = self.call(build(page)).await?;
            if let Some(list) = data.get("list").and_then(Value::as_array) {
                items.extend(list.iter().cloned());
            }
            let total_pages = data
                .pointer("/page_info/total_page")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            if page >= total_pages {
                return Ok(items);
            }
            page += 1;
        }
        Err(PlatformError::TransientNetwork(
            "tiktok pagination did not terminate".to_string(),
        ))
    }

    async fn find_campaign(&self, access_token: &str, campaign: CampaignRef<'_>) -> PlatformResult<Value> {
        let data = self
            .call(
                ApiRequest::get(self.url("campaign/get/"))
                    .header("Access-Token", access_token)
                    .query("advertiser_id", campaign.account_id)
                    .query(
                        "filtering",
                        json!({ "campaign_ids": [campaign.native_id] }).to_string(),
                    ),
            )
            .await?;
        data.get("list")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| PlatformError::Validation(format!("campaign {} not found", campaign.native_id)))
    }

    fn grant_from(&self, data: &Value) -> PlatformResult<TokenGrant> {
        let access_token = json_str(data.get("access_token"))
            .ok_or_else(|| PlatformError::TransientNetwork("token response missing access_token".into()))?;
        let refresh_token = json_str(data.get("refresh_token")).unwrap_or_else(|| access_token.clone());
        let expires_in = json_f64(data.get("expires_in")).unwrap_or(86_400.0) as i64;
        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            floor: self.settings.min_daily_budget,
            ceiling: self.settings.max_daily_budget,
        }
    }

    fn validate_options(&self, options: &Value) -> PlatformResult<()> {
        if options.get("objective_type").and_then(Value::as_str).is_none() {
            return Err(PlatformError::Validation("objective_type is required".to_string()));
        }
        Ok(())
    }

    async fn connect(&self, auth_code: &str, _redirect_uri: &str) -> PlatformResult<TokenGrant> {
        let data = self
            .call(ApiRequest::post(self.auth_url("access_token/")).json(json!({
                "app_id": self.settings.client_id,
                "secret": self.settings.client_secret,
                "auth_code": auth_code,
            })))
            .await?;
        self.grant_from(&data)
    }

    async fn list_accounts(&self, access_token: &str) -> PlatformResult<Vec<RemoteAccount>> {
        let data = self
            .call(
                ApiRequest::get(self.auth_url("advertiser/get/"))
                    .header("Access-Token", access_token)
                    .query("app_id", self.settings.client_id.clone())
                    .query("secret", self.settings.client_secret.clone()),
            )
            .await?;
        Ok(data
            .get("list")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|row| {
                        Some(RemoteAccount {
                            external_id: json_str(row.get("advertiser_id"))?,
                            name: json_str(row.get("advertiser_name")),
                            currency: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_campaigns(&self, access_token: &str, account_id: &str) -> PlatformResult<Vec<RemoteCampaign>> {
        let url = self.url("campaign/get/");
        let rows = self
            .paged(|page| {
                ApiRequest::get(url.clone())
                    .header("Access-Token", access_token)
                    .query("advertiser_id", account_id)
                    .query("page", page.to_string())
                    .query("page_size", PAGE_SIZE.to_string())
            })
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let raw_status = json_str(row.get("operation_status")).unwrap_or_default();
                Some(RemoteCampaign {
                    native_id: json_str(row.get("campaign_id"))?,
                    name: json_str(row.get("campaign_name")).unwrap_or_default(),
                    status: status_from_tiktok(&raw_status),
                    raw_status,
                    daily_budget: json_f64(row.get("budget")),
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
        let data = self
            .call(
                ApiRequest::post(self.url("campaign/create/"))
                    .header("Access-Token", access_token)
                    .json(json!({
                        "advertiser_id": account_id,
                        "campaign_name": draft.name,
                        "objective_type": draft.options.get("objective_type"),
                        "budget_mode": "BUDGET_MODE_DAY",
                        "budget": draft.budget,
                        "operation_status": "DISABLE",
                    })),
            )
            .await?;
        json_str(data.get("campaign_id"))
            .ok_or_else(|| PlatformError::TransientNetwork("campaign create returned no id".into()))
    }

    async fn update_campaign(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        update: &CampaignUpdate,
    ) -> PlatformResult<()> {
        if update.budget.is_some()
            && update.options.get("budget_mode").and_then(Value::as_str) == Some(INFINITE_BUDGET)
        {
            return Err(PlatformError::PlatformIncompatibility {
                platform: Platform::Tiktok,
                operation: "set budget on an unlimited-budget campaign".to_string(),
            });
        }
        let mut body = json!({
            "advertiser_id": campaign.account_id,
            "campaign_id": campaign.native_id,
        });
        if let Some(name) = &update.name {
            body["campaign_name"] = Value::String(name.clone());
        }
        if let Some(budget) = update.budget {
            body["budget"] = json!(budget);
        }
        self.call(
            ApiRequest::post(self.url("campaign/update/"))
                .header("Access-Token", access_token)
                .json(body),
        )
        .await?;
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        status: RemoteStatus,
    ) -> PlatformResult<StatusAck> {
        ensure_settable(Platform::Tiktok, &status)?;
        let current = self.find_campaign(access_token, campaign).await?;
        let current = json_str(current.get("operation_status")).unwrap_or_default();
        if status_from_tiktok(&current) == status {
            debug!(campaign = campaign.native_id, status = %current, "tiktok status already matches");
            return Ok(StatusAck::AlreadyInState);
        }

        self.call(
            ApiRequest::post(self.url("campaign/status/update/"))
                .header("Access-Token", access_token)
                .json(json!({
                    "advertiser_id": campaign.account_id,
                    "campaign_ids": [campaign.native_id],
                    "operation_status": tiktok_status(&status),
                })),
        )
        .await?;
        Ok(StatusAck::Applied)
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        window: &TimeWindow,
    ) -> PlatformResult<Vec<RawMetricSample>> {
        let (start_date, end_date) = report_days(window);
        let url = self.url("report/integrated/get/");
        let dimensions = json!(["campaign_id", "stat_time_day"]).to_string();
        let metrics =
            json!(["spend", "impressions", "clicks", "conversion", "total_purchase_value"]).to_string();
        let rows = self
            .paged(|page| {
                ApiRequest::get(url.clone())
                    .header("Access-Token", access_token)
                    .query("advertiser_id", account_id)
                    .query("report_type", "BASIC")
                    .query("data_level", "AUCTION_CAMPAIGN")
                    .query("dimensions", dimensions.clone())
                    .query("metrics", metrics.clone())
                    .query("start_date", start_date.clone())
                    .query("end_date", end_date.clone())
                    .query("page", page.to_string())
                    .query("page_size", PAGE_SIZE.to_string())
            })
            .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(native_campaign_id) = json_str(row.pointer("/dimensions/campaign_id")) else {
                continue;
            };
            let day = json_str(row.pointer("/dimensions/stat_time_day")).unwrap_or_default();
            samples.push(RawMetricSample {
                platform: Platform::Tiktok,
                native_campaign_id,
                period_start: parse_day(&day)?,
                fields: row.get("metrics").cloned().unwrap_or(Value::Null),
            });
        }
        Ok(dedupe_samples(samples))
    }

    async fn refresh_token(&self, refresh_token: &str) -> PlatformResult<TokenGrant> {
        let data = self
            .call(ApiRequest::post(self.auth_url("refresh_token/")).json(json!({
                "app_id": self.settings.client_id,
                "secret": self.settings.client_secret,
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            })))
            .await?;
        self.grant_from(&data)
    }
}

fn status_from_tiktok(raw: &str) -> RemoteStatus {
    match raw {
        "ENABLE" | "CAMPAIGN_STATUS_ENABLE" => RemoteStatus::Active,
        "DISABLE" | "CAMPAIGN_STATUS_DISABLE" => RemoteStatus::Paused,
        "DELETE" | "CAMPAIGN_STATUS_DELETE" => RemoteStatus::Removed,
        other => RemoteStatus::Unknown(other.to_string()),
    }
}

fn tiktok_status(status: &RemoteStatus) -> &'static str {
    match status {
        RemoteStatus::Active => "ENABLE",
        RemoteStatus::Removed => "DELETE",
        _ => "DISABLE",
    }
}

fn map_error(response: &ApiResponse) -> PlatformError {
    let code = response.body.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let message = response
        .body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("tiktok request failed")
        .to_string();
    let rate_limited = || PlatformError::RateLimited {
        retry_after: response.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
    };

    match code {
        40001 | 40102 | 40104 | 40105 => PlatformError::AuthExpired(message),
        40100 => rate_limited(),
        50000..=59999 => PlatformError::TransientNetwork(message),
        _ if response.status == 401 => PlatformError::AuthExpired(message),
        _ if response.status == 429 => rate_limited(),
        _ if response.status >= 500 => PlatformError::TransientNetwork(message),
        _ => PlatformError::Validation(format!("{message} (code {code})")),
    }
}
