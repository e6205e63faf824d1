//! Meta (Facebook) Marketing API adapter.
//!
//! Graph API with cursor pagination. Meta has no refresh-token grant: a
//! long-lived user token is re-exchanged via `fb_exchange_token`, so the
//! stored "refresh token" is the long-lived access token itself.

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

const DEFAULT_BASE_URL: &str = "https://graph.facebook.com/v19.0";
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
/// Long-lived tokens last about sixty days when the response omits expiry.
const DEFAULT_LONG_LIVED_SECS: i64 = 60 * 24 * 3600;
const MAX_PAGES: usize = 1_000;
const PURCHASE_ACTIONS: [&str; 2] = ["purchase", "offsite_conversion.fb_pixel_purchase"];

pub struct MetaAdsAdapter {
    transport: Arc<dyn ApiTransport>,
    settings: PlatformSettings,
    clock: Arc<dyn Clock>,
}

impl MetaAdsAdapter {
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

    async fn call(&self, request: ApiRequest) -> PlatformResult<Value> {
        metrics::counter!("adapter.requests", "platform" => "meta").increment(1);
        let response = self.transport.send(request).await?;
        if response.is_success() && response.body.get("error").is_none() {
            Ok(response.body)
        } else {
            Err(map_error(&response))
        }
    }

    /// Follow `paging.next` cursors and collect every `data` element.
    async fn paged(&self, first: ApiRequest) -> PlatformResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut request = first;
        for _ in 0..MAX_PAGES {
            let page = self.call(request.clone()).await?;
            if let Some(data) = page.get("data").and_then(Value::as_array) {
                items.extend(data.iter().cloned());
            }
            let after = page
                .pointer("/paging/cursors/after")
                .and_then(Value::as_str)
                .map(String::from);
            let has_next = page.pointer("/paging/next").is_some();
            match after {
                Some(cursor) if has_next => {
                    request.query.retain(|(k, _)| k != "after");
                    request = request.query("after", cursor);
                }
                _ => return Ok(items),
            }
        }
        Err(PlatformError::TransientNetwork(
            "meta pagination did not terminate".to_string(),
        ))
    }

    async fn exchange(&self, short_lived: &str) -> PlatformResult<TokenGrant> {
        let body = self
            .call(
                ApiRequest::get(self.url("oauth/access_token"))
                    .query("grant_type", "fb_exchange_token")
                    .query("client_id", self.settings.client_id.clone())
                    .query("client_secret", self.settings.client_secret.clone())
                    .query("fb_exchange_token", short_lived),
            )
            .await?;
        let access_token = json_str(body.get("access_token"))
            .ok_or_else(|| PlatformError::TransientNetwork("token response missing access_token".into()))?;
        let expires_in = json_f64(body.get("expires_in"))
            .map(|s| s as i64)
            .unwrap_or(DEFAULT_LONG_LIVED_SECS);
        Ok(TokenGrant {
            refresh_token: access_token.clone(),
            access_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[async_trait]
impl PlatformAdapter for MetaAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            floor: self.settings.min_daily_budget,
            ceiling: self.settings.max_daily_budget,
        }
    }

    fn validate_options(&self, options: &Value) -> PlatformResult<()> {
        match options.get("objective").and_then(Value::as_str) {
            Some(objective) if objective.starts_with("OUTCOME_") => Ok(()),
            Some(other) => Err(PlatformError::Validation(format!(
                "unsupported objective '{other}'"
            ))),
            None => Err(PlatformError::Validation("objective is required".to_string())),
        }
    }

    async fn connect(&self, auth_code: &str, redirect_uri: &str) -> PlatformResult<TokenGrant> {
        let body = self
            .call(
                ApiRequest::get(self.url("oauth/access_token"))
                    .query("client_id", self.settings.client_id.clone())
                    .query("client_secret", self.settings.client_secret.clone())
                    .query("redirect_uri", redirect_uri)
                    .query("code", auth_code),
            )
            .await?;
        let short_lived = json_str(body.get("access_token"))
            .ok_or_else(|| PlatformError::TransientNetwork("token response missing access_token".into()))?;
        self.exchange(&short_lived).await
    }

    async fn list_accounts(&self, access_token: &str) -> PlatformResult<Vec<RemoteAccount>> {
        let rows = self
            .paged(
                ApiRequest::get(self.url("me/adaccounts"))
                    .bearer(access_token)
                    .query("fields", "account_id,name,currency")
                    .query("limit", "100"),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(RemoteAccount {
                    external_id: json_str(row.get("account_id"))?,
                    name: json_str(row.get("name")),
                    currency: json_str(row.get("currency")),
                })
            })
            .collect())
    }

    async fn fetch_campaigns(&self, access_token: &str, account_id: &str) -> PlatformResult<Vec<RemoteCampaign>> {
        let rows = self
            .paged(
                ApiRequest::get(self.url(&format!("act_{}/campaigns", ad_account(account_id))))
                    .bearer(access_token)
                    .query("fields", "id,name,status,daily_budget")
                    .query("limit", "100"),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let raw_status = json_str(row.get("status")).unwrap_or_default();
                Some(RemoteCampaign {
                    native_id: json_str(row.get("id"))?,
                    name: json_str(row.get("name")).unwrap_or_default(),
                    status: status_from_meta(&raw_status),
                    raw_status,
                    daily_budget: json_f64(row.get("daily_budget")).map(|cents| cents / 100.0),
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
        let objective = json_str(draft.options.get("objective")).unwrap_or_default();
        let body = self
            .call(
                ApiRequest::post(self.url(&format!("act_{}/campaigns", ad_account(account_id))))
                    .bearer(access_token)
                    .form(vec![
                        ("name".into(), draft.name.clone()),
                        ("objective".into(), objective),
                        ("status".into(), "PAUSED".into()),
                        ("daily_budget".into(), to_cents(draft.budget)),
                        ("special_ad_categories".into(), "[]".into()),
                    ]),
            )
            .await?;
        json_str(body.get("id"))
            .ok_or_else(|| PlatformError::TransientNetwork("campaign create returned no id".into()))
    }

    async fn update_campaign(
        &self,
        access_token: &str,
        campaign: CampaignRef<'_>,
        update: &CampaignUpdate,
    ) -> PlatformResult<()> {
        let mut form = Vec::new();
        if let Some(name) = &update.name {
            form.push(("name".to_string(), name.clone()));
        }
        if let Some(budget) = update.budget {
            form.push(("daily_budget".to_string(), to_cents(budget)));
        }
        if form.is_empty() {
            return Ok(());
        }
        self.call(
            ApiRequest::post(self.url(campaign.native_id))
                .bearer(access_token)
                .form(form),
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
        ensure_settable(Platform::Meta, &status)?;
        let current = self
            .call(
                ApiRequest::get(self.url(campaign.native_id))
                    .bearer(access_token)
                    .query("fields", "status"),
            )
            .await?;
        let current = json_str(current.get("status")).unwrap_or_default();
        if status_from_meta(&current) == status {
            debug!(campaign = campaign.native_id, status = %current, "meta status already matches");
            return Ok(StatusAck::AlreadyInState);
        }

        self.call(
            ApiRequest::post(self.url(campaign.native_id))
                .bearer(access_token)
                .form(vec![("status".into(), meta_status(&status).into())]),
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
        let (since, until) = report_days(window);
        let rows = self
            .paged(
                ApiRequest::get(self.url(&format!("act_{}/insights", ad_account(account_id))))
                    .bearer(access_token)
                    .query("level", "campaign")
                    .query("time_increment", "1")
                    .query("time_range", json!({ "since": since, "until": until }).to_string())
                    .query(
                        "fields",
                        "campaign_id,impressions,clicks,spend,actions,action_values,date_start",
                    )
                    .query("limit", "500"),
            )
            .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(native_campaign_id) = json_str(row.get("campaign_id")) else {
                continue;
            };
            let day = json_str(row.get("date_start")).unwrap_or_default();
            samples.push(RawMetricSample {
                platform: Platform::Meta,
                native_campaign_id,
                period_start: parse_day(&day)?,
                fields: row,
            });
        }
        Ok(dedupe_samples(samples))
    }

    async fn refresh_token(&self, refresh_token: &str) -> PlatformResult<TokenGrant> {
        self.exchange(refresh_token).await
    }
}

/// Sum the purchase entries of a Meta `actions`/`action_values` list.
pub fn purchase_total(list: Option<&Value>) -> f64 {
    list.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| {
                    e.get("action_type")
                        .and_then(Value::as_str)
                        .is_some_and(|t| PURCHASE_ACTIONS.contains(&t))
                })
                .filter_map(|e| json_f64(e.get("value")))
                .sum()
        })
        .unwrap_or(0.0)
}

fn ad_account(account_id: &str) -> &str {
    account_id.strip_prefix("act_").unwrap_or(account_id)
}

fn to_cents(amount: f64) -> String {
    ((amount * 100.0).round() as i64).to_string()
}

fn status_from_meta(raw: &str) -> RemoteStatus {
    match raw {
        "ACTIVE" => RemoteStatus::Active,
        "PAUSED" => RemoteStatus::Paused,
        "DELETED" | "ARCHIVED" => RemoteStatus::Removed,
        "IN_PROCESS" | "WITH_ISSUES" => RemoteStatus::Pending,
        other => RemoteStatus::Unknown(other.to_string()),
    }
}

fn meta_status(status: &RemoteStatus) -> &'static str {
    match status {
        RemoteStatus::Active => "ACTIVE",
        RemoteStatus::Removed => "DELETED",
        _ => "PAUSED",
    }
}

fn map_error(response: &ApiResponse) -> PlatformError {
    let error = response.body.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("meta graph request failed")
        .to_string();

    match code {
        190 | 102 => PlatformError::AuthExpired(message),
        4 | 17 | 32 | 613 | 80004 => PlatformError::RateLimited {
            retry_after: response.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
        },
        1 | 2 => PlatformError::TransientNetwork(message),
        _ if response.status == 401 => PlatformError::AuthExpired(message),
        _ if response.status == 429 => PlatformError::RateLimited {
            retry_after: response.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
        },
        _ if response.status >= 500 => PlatformError::TransientNetwork(message),
        _ => PlatformError::Validation(message),
    }
}
