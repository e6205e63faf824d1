//! In-memory adapter for tests and local runs without platform credentials.
//!
//! Holds remote campaigns and metrics rows, scripts refresh outcomes and
//! injected failures, and counts the calls that matter for idempotency.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campaign_core::clock::{Clock, SystemClock};
use campaign_core::error::{PlatformError, PlatformResult};
use campaign_core::types::{Platform, RemoteStatus, TimeWindow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::adapter::*;

/// One day of delivery for one campaign, in unified units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyTotals {
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub conversions: f64,
    pub conversion_value: f64,
}

/// Render totals in the native report shape of `platform`.
pub fn native_metric_fields(platform: Platform, totals: &DailyTotals) -> Value {
    match platform {
        Platform::Google => json!({
            "impressions": totals.impressions.to_string(),
            "clicks": totals.clicks.to_string(),
            "costMicros": ((totals.spend * 1_000_000.0).round() as i64).to_string(),
            "conversions": totals.conversions,
            "conversionsValue": totals.conversion_value,
        }),
        Platform::Meta => json!({
            "impressions": totals.impressions.to_string(),
            "clicks": totals.clicks.to_string(),
            "spend": format!("{:.2}", totals.spend),
            "actions": [{"action_type": "purchase", "value": totals.conversions.to_string()}],
            "action_values": [{"action_type": "purchase", "value": totals.conversion_value.to_string()}],
        }),
        Platform::Tiktok => json!({
            "impressions": totals.impressions.to_string(),
            "clicks": totals.clicks.to_string(),
            "spend": totals.spend.to_string(),
            "conversion": totals.conversions.to_string(),
            "total_purchase_value": totals.conversion_value.to_string(),
        }),
    }
}

#[derive(Default)]
struct MockState {
    accounts: Vec<RemoteAccount>,
    campaigns: Vec<RemoteCampaign>,
    metrics: Vec<RawMetricSample>,
    refresh_results: VecDeque<PlatformResult<TokenGrant>>,
    failures: HashMap<Capability, VecDeque<PlatformError>>,
    refresh_calls: u32,
    status_mutations: u32,
    budget_updates: u32,
    fetch_metrics_calls: u32,
    created: u32,
}

pub struct MockAdapter {
    platform: Platform,
    capabilities: Vec<Capability>,
    limits: BudgetLimits,
    token_ttl: chrono::Duration,
    refresh_delay: Mutex<Option<Duration>>,
    clock: Arc<dyn Clock>,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            capabilities: Capability::ALL.to_vec(),
            limits: BudgetLimits {
                floor: 1.0,
                ceiling: 10_000.0,
            },
            token_ttl: chrono::Duration::hours(1),
            refresh_delay: Mutex::new(None),
            clock: Arc::new(SystemClock),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_budget_limits(mut self, floor: f64, ceiling: f64) -> Self {
        self.limits = BudgetLimits { floor, ceiling };
        self
    }

    /// Issue token expiries relative to `clock` instead of wall time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn add_account(&self, external_id: &str, name: &str) {
        self.state.lock().accounts.push(RemoteAccount {
            external_id: external_id.to_string(),
            name: Some(name.to_string()),
            currency: Some("USD".to_string()),
        });
    }

    pub fn add_campaign(&self, native_id: &str, name: &str, status: RemoteStatus, budget: f64) {
        let mut state = self.state.lock();
        state.campaigns.retain(|c| c.native_id != native_id);
        state.campaigns.push(RemoteCampaign {
            native_id: native_id.to_string(),
            name: name.to_string(),
            raw_status: format!("{status:?}").to_uppercase(),
            status,
            daily_budget: Some(budget),
        });
    }

    /// Change a campaign's status remotely, as if done in the platform's UI.
    pub fn set_remote_status(&self, native_id: &str, status: RemoteStatus) {
        let mut state = self.state.lock();
        if let Some(campaign) = state.campaigns.iter_mut().find(|c| c.native_id == native_id) {
            campaign.raw_status = format!("{status:?}").to_uppercase();
            campaign.status = status;
        }
    }

    pub fn remote_campaign(&self, native_id: &str) -> Option<RemoteCampaign> {
        self.state
            .lock()
            .campaigns
            .iter()
            .find(|c| c.native_id == native_id)
            .cloned()
    }

    pub fn add_metrics(&self, native_id: &str, period_start: DateTime<Utc>, totals: DailyTotals) {
        self.state.lock().metrics.push(RawMetricSample {
            platform: self.platform,
            native_campaign_id: native_id.to_string(),
            period_start,
            fields: native_metric_fields(self.platform, &totals),
        });
    }

    pub fn push_refresh_result(&self, result: PlatformResult<TokenGrant>) {
        self.state.lock().refresh_results.push_back(result);
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: Capability, error: PlatformError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Delay every refresh by `delay`, to exercise timeouts and overlap.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = Some(delay);
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.lock().refresh_calls
    }

    pub fn status_mutations(&self) -> u32 {
        self.state.lock().status_mutations
    }

    pub fn budget_updates(&self) -> u32 {
        self.state.lock().budget_updates
    }

    pub fn fetch_metrics_calls(&self) -> u32 {
        self.state.lock().fetch_metrics_calls
    }

    fn take_failure(&self, operation: Capability) -> PlatformResult<()> {
        let mut state = self.state.lock();
        match state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn grant(&self, refresh_token: &str, sequence: u32) -> TokenGrant {
        TokenGrant {
            access_token: format!("{}-access-{sequence}", self.platform.slug()),
            refresh_token: refresh_token.to_string(),
            expires_at: self.clock.now() + self.token_ttl,
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn budget_limits(&self) -> BudgetLimits {
        self.limits
    }

    async fn connect(&self, auth_code: &str, _redirect_uri: &str) -> PlatformResult<TokenGrant> {
        self.take_failure(Capability::Connect)?;
        Ok(self.grant(&format!("{}-refresh-{auth_code}", self.platform.slug()), 0))
    }

    async fn list_accounts(&self, _access_token: &str) -> PlatformResult<Vec<RemoteAccount>> {
        self.take_failure(Capability::ListAccounts)?;
        Ok(self.state.lock().accounts.clone())
    }

    async fn fetch_campaigns(&self, _access_token: &str, _account_id: &str) -> PlatformResult<Vec<RemoteCampaign>> {
        self.take_failure(Capability::FetchCampaigns)?;
        Ok(self.state.lock().campaigns.clone())
    }

    async fn create_campaign(
        &self,
        _access_token: &str,
        _account_id: &str,
        draft: &CampaignDraft,
    ) -> PlatformResult<String> {
        self.take_failure(Capability::CreateCampaign)?;
        self.validate_options(&draft.options)?;
        let native_id = {
            let mut state = self.state.lock();
            state.created += 1;
            format!("{}-campaign-{}", self.platform.slug(), state.created)
        };
        self.add_campaign(&native_id, &draft.name, RemoteStatus::Paused, draft.budget);
        Ok(native_id)
    }

    async fn update_campaign(
        &self,
        _access_token: &str,
        campaign: CampaignRef<'_>,
        update: &CampaignUpdate,
    ) -> PlatformResult<()> {
        self.take_failure(Capability::UpdateCampaign)?;
        let mut state = self.state.lock();
        let Some(remote) = state
            .campaigns
            .iter_mut()
            .find(|c| c.native_id == campaign.native_id)
        else {
            return Err(PlatformError::Validation(format!(
                "campaign {} not found",
                campaign.native_id
            )));
        };
        if let Some(name) = &update.name {
            remote.name = name.clone();
        }
        if let Some(budget) = update.budget {
            remote.daily_budget = Some(budget);
            state.budget_updates += 1;
        }
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        _access_token: &str,
        campaign: CampaignRef<'_>,
        status: RemoteStatus,
    ) -> PlatformResult<StatusAck> {
        self.take_failure(Capability::SetCampaignStatus)?;
        ensure_settable(self.platform, &status)?;
        let mut state = self.state.lock();
        let Some(remote) = state
            .campaigns
            .iter_mut()
            .find(|c| c.native_id == campaign.native_id)
        else {
            return Err(PlatformError::Validation(format!(
                "campaign {} not found",
                campaign.native_id
            )));
        };
        if remote.status == status {
            return Ok(StatusAck::AlreadyInState);
        }
        remote.raw_status = format!("{status:?}").to_uppercase();
        remote.status = status;
        state.status_mutations += 1;
        Ok(StatusAck::Applied)
    }

    async fn fetch_metrics(
        &self,
        _access_token: &str,
        _account_id: &str,
        window: &TimeWindow,
    ) -> PlatformResult<Vec<RawMetricSample>> {
        self.state.lock().fetch_metrics_calls += 1;
        self.take_failure(Capability::FetchMetrics)?;
        let rows = self
            .state
            .lock()
            .metrics
            .iter()
            .filter(|s| window.contains(s.period_start))
            .cloned()
            .collect();
        Ok(dedupe_samples(rows))
    }

    async fn refresh_token(&self, refresh_token: &str) -> PlatformResult<TokenGrant> {
        let delay = *self.refresh_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (sequence, scripted) = {
            let mut state = self.state.lock();
            state.refresh_calls += 1;
            (state.refresh_calls, state.refresh_results.pop_front())
        };
        self.take_failure(Capability::RefreshToken)?;
        match scripted {
            Some(result) => result,
            None => Ok(self.grant(refresh_token, sequence)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "tok";

    #[tokio::test]
    async fn test_status_change_counts_only_real_mutations() {
        let mock = MockAdapter::new(Platform::Google);
        mock.add_campaign("g-1", "Brand", RemoteStatus::Active, 50.0);
        let campaign = CampaignRef { account_id: "acct", native_id: "g-1" };

        let first = mock.set_campaign_status(TOKEN, campaign, RemoteStatus::Paused).await.unwrap();
        let second = mock.set_campaign_status(TOKEN, campaign, RemoteStatus::Paused).await.unwrap();

        assert_eq!(first, StatusAck::Applied);
        assert_eq!(second, StatusAck::AlreadyInState);
        assert_eq!(mock.status_mutations(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let mock = MockAdapter::new(Platform::Meta);
        mock.fail_next(
            Capability::FetchCampaigns,
            PlatformError::TransientNetwork("reset".into()),
        );

        assert!(mock.fetch_campaigns(TOKEN, "acct").await.is_err());
        assert!(mock.fetch_campaigns(TOKEN, "acct").await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_filtered_by_window() {
        let mock = MockAdapter::new(Platform::Tiktok);
        let day = parse_day("2024-05-01").unwrap();
        mock.add_metrics("t-1", day, DailyTotals { clicks: 3, ..DailyTotals::default() });
        mock.add_metrics("t-1", day + chrono::Duration::days(5), DailyTotals::default());

        let window = TimeWindow::new(day, day + chrono::Duration::days(1));
        let rows = mock.fetch_metrics(TOKEN, "acct", &window).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["clicks"], "3");
        assert_eq!(mock.fetch_metrics_calls(), 1);
    }

    #[test]
    fn test_native_fields_per_platform() {
        let totals = DailyTotals {
            impressions: 1000,
            clicks: 20,
            spend: 12.5,
            conversions: 2.0,
            conversion_value: 80.0,
        };
        assert_eq!(native_metric_fields(Platform::Google, &totals)["costMicros"], "12500000");
        assert_eq!(native_metric_fields(Platform::Meta, &totals)["spend"], "12.50");
        assert_eq!(native_metric_fields(Platform::Tiktok, &totals)["conversion"], "2");
    }
}
