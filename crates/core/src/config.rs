use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CAMPAIGN_AUTOPILOT__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of scheduled account syncs.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: i64,
    /// How often the scheduler wakes to enqueue due work.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_token_refresh_interval_secs")]
    pub token_refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Tokens expiring sooner than this are refreshed before use.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: i64,
    /// Consecutive auth failures before an account is parked in `auth_error`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// The proactive sweep refreshes tokens expiring within this window.
    #[serde(default = "default_proactive_window_secs")]
    pub proactive_window_secs: i64,
    #[serde(default = "default_transient_backoff_secs")]
    pub transient_backoff_secs: i64,
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_per_organization_limit")]
    pub per_organization_limit: usize,
    #[serde(default = "default_per_platform_limit")]
    pub per_platform_limit: usize,
    /// Hard wall-clock limit for a single job.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Jobs not acknowledged within the lease are redelivered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retention of finished idempotency keys.
    #[serde(default = "default_key_retention_secs")]
    pub key_retention_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: i64,
    /// Lowest role allowed to approve or reject a pending action.
    #[serde(default = "default_approver_role")]
    pub approver_role: crate::types::Role,
    #[serde(default = "default_rule_cadence_secs")]
    pub default_rule_cadence_secs: i64,
    /// How long decided or expired pending actions are kept before removal.
    #[serde(default = "default_resolved_retention_secs")]
    pub resolved_retention_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Metric window fetched on an account's first sync.
    #[serde(default = "default_initial_lookback_hours")]
    pub initial_lookback_hours: i64,
    /// Overlap re-fetched before the last sync to pick up late attribution.
    #[serde(default = "default_overlap_hours")]
    pub overlap_hours: i64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Google Ads developer token; unused by other platforms.
    #[serde(default)]
    pub developer_token: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default = "default_platform_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub min_daily_budget: f64,
    #[serde(default = "default_max_daily_budget")]
    pub max_daily_budget: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default = "default_google_settings")]
    pub google: PlatformSettings,
    #[serde(default = "default_meta_settings")]
    pub meta: PlatformSettings,
    #[serde(default = "default_tiktok_settings")]
    pub tiktok: PlatformSettings,
}

// Default functions
fn default_node_id() -> String {
    "autopilot-01".to_string()
}
fn default_sync_interval_secs() -> i64 {
    900
}
fn default_tick_interval_secs() -> u64 {
    30
}
fn default_token_refresh_interval_secs() -> u64 {
    300
}
fn default_safety_margin_secs() -> i64 {
    300
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_proactive_window_secs() -> i64 {
    900
}
fn default_transient_backoff_secs() -> i64 {
    60
}
fn default_refresh_timeout_ms() -> u64 {
    10_000
}
fn default_max_concurrent_jobs() -> usize {
    32
}
fn default_per_organization_limit() -> usize {
    4
}
fn default_per_platform_limit() -> usize {
    8
}
fn default_job_timeout_secs() -> u64 {
    120
}
fn default_lease_secs() -> i64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_key_retention_secs() -> i64 {
    86_400
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}
fn default_cooldown_secs() -> i64 {
    3_600
}
fn default_approval_ttl_secs() -> i64 {
    86_400
}
fn default_approver_role() -> crate::types::Role {
    crate::types::Role::Manager
}
fn default_rule_cadence_secs() -> i64 {
    900
}
fn default_resolved_retention_secs() -> i64 {
    7 * 86_400
}
fn default_initial_lookback_hours() -> i64 {
    72
}
fn default_overlap_hours() -> i64 {
    24
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_platform_timeout_ms() -> u64 {
    15_000
}
fn default_max_daily_budget() -> f64 {
    1_000_000.0
}

fn default_google_settings() -> PlatformSettings {
    PlatformSettings {
        base_url: "https://googleads.googleapis.com/v17".to_string(),
        auth_url: "https://oauth2.googleapis.com/token".to_string(),
        min_daily_budget: 1.0,
        ..PlatformSettings::default()
    }
}
fn default_meta_settings() -> PlatformSettings {
    PlatformSettings {
        base_url: "https://graph.facebook.com/v19.0".to_string(),
        auth_url: "https://graph.facebook.com/v19.0/oauth/access_token".to_string(),
        min_daily_budget: 1.0,
        ..PlatformSettings::default()
    }
}
fn default_tiktok_settings() -> PlatformSettings {
    PlatformSettings {
        base_url: "https://business-api.tiktok.com/open_api/v1.3".to_string(),
        auth_url: "https://business-api.tiktok.com/open_api/v1.3/oauth2".to_string(),
        min_daily_budget: 20.0,
        ..PlatformSettings::default()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            token_refresh_interval_secs: default_token_refresh_interval_secs(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            failure_threshold: default_failure_threshold(),
            proactive_window_secs: default_proactive_window_secs(),
            transient_backoff_secs: default_transient_backoff_secs(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            per_organization_limit: default_per_organization_limit(),
            per_platform_limit: default_per_platform_limit(),
            job_timeout_secs: default_job_timeout_secs(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            key_retention_secs: default_key_retention_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            approval_ttl_secs: default_approval_ttl_secs(),
            approver_role: default_approver_role(),
            default_rule_cadence_secs: default_rule_cadence_secs(),
            resolved_retention_secs: default_resolved_retention_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_lookback_hours: default_initial_lookback_hours(),
            overlap_hours: default_overlap_hours(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            developer_token: String::new(),
            base_url: String::new(),
            auth_url: String::new(),
            timeout_ms: default_platform_timeout_ms(),
            min_daily_budget: 0.0,
            max_daily_budget: default_max_daily_budget(),
        }
    }
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            google: default_google_settings(),
            meta: default_meta_settings(),
            tiktok: default_tiktok_settings(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            tokens: TokenConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            automation: AutomationConfig::default(),
            sync: SyncConfig::default(),
            metrics: MetricsConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file and environment variables.
    /// Environment values win over file values.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_AUTOPILOT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduler.sync_interval_secs, 900);
        assert_eq!(cfg.tokens.safety_margin_secs, 300);
        assert_eq!(cfg.tokens.failure_threshold, 3);
        assert_eq!(cfg.automation.approval_ttl_secs, 86_400);
        assert_eq!(cfg.automation.approver_role, crate::types::Role::Manager);
        assert_eq!(cfg.platforms.tiktok.min_daily_budget, 20.0);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "automation": { "cooldown_secs": 120 },
            "platforms": { "meta": { "client_id": "app-1" } }
        }))
        .unwrap();
        assert_eq!(cfg.automation.cooldown_secs, 120);
        assert_eq!(cfg.automation.approval_ttl_secs, 86_400);
        assert_eq!(cfg.platforms.meta.client_id, "app-1");
        assert_eq!(cfg.platforms.meta.timeout_ms, 15_000);
        assert_eq!(cfg.platforms.google.min_daily_budget, 1.0);
    }
}
