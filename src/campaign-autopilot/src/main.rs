//! Campaign Autopilot: keeps connected ad accounts in sync and runs
//! automation rules against their campaigns.
//!
//! Main entry point that wires the stores, engines and background loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use campaign_adapters::{AdapterRegistry, ApiTransport, HttpTransport};
use campaign_automation::{
    ActionExecutor, ApprovalGate, CoreJobHandler, RuleEngine, RuleStore, Scheduler,
};
use campaign_core::clock::{Clock, SystemClock};
use campaign_core::config::AppConfig;
use campaign_core::event_bus::{NotificationSink, TracingSink};
use campaign_platform::{AuditLog, AuditSink, CredentialStore, MemoryCredentialStore};
use campaign_sync::{
    AccountStore, CampaignStore, JobQueue, MemoryJobQueue, MetricStore, RetryPolicy, SyncEngine,
    TokenManager, WorkerPool,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-autopilot")]
#[command(about = "Ad account sync and campaign automation service")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, env = "CAMPAIGN_AUTOPILOT_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOPILOT__NODE_ID")]
    node_id: Option<String>,

    /// Worker count (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOPILOT__WORKERS__MAX_CONCURRENT_JOBS")]
    workers: Option<usize>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOPILOT__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Run the workers without the scheduler
    #[arg(long, default_value_t = false)]
    workers_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_autopilot=info,campaign_sync=info,campaign_automation=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Autopilot starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.workers.max_concurrent_jobs = workers;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        workers = config.workers.max_concurrent_jobs,
        sync_interval_secs = config.scheduler.sync_interval_secs,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(config.metrics.port) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let call_timeout = Duration::from_millis(config.sync.call_timeout_ms);
    let transport: Arc<dyn ApiTransport> = Arc::new(HttpTransport::new(call_timeout)?);
    let registry = Arc::new(AdapterRegistry::from_config(
        &config.platforms,
        transport,
        clock.clone(),
    ));

    let audit: Arc<dyn AuditSink> = Arc::new(AuditLog::new());
    let notifier: Arc<dyn NotificationSink> = Arc::new(TracingSink);
    let credentials: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new(clock.clone(), &config.workers));

    let accounts = Arc::new(AccountStore::new(clock.clone()));
    let campaigns = Arc::new(CampaignStore::new(clock.clone()));
    let metric_store = Arc::new(MetricStore::new());
    let rules = Arc::new(RuleStore::default());

    let tokens = Arc::new(TokenManager::new(
        accounts.clone(),
        credentials.clone(),
        registry.clone(),
        audit.clone(),
        notifier.clone(),
        clock.clone(),
        config.tokens.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
        accounts.clone(),
        campaigns.clone(),
        metric_store.clone(),
        tokens.clone(),
        registry.clone(),
        audit.clone(),
        notifier.clone(),
        clock.clone(),
        config.sync.clone(),
    ));
    let approvals = Arc::new(ApprovalGate::new(
        queue.clone(),
        campaigns.clone(),
        audit.clone(),
        notifier.clone(),
        clock.clone(),
        config.automation.clone(),
    ));
    let engine = Arc::new(RuleEngine::new(
        rules.clone(),
        campaigns.clone(),
        metric_store,
        registry.clone(),
        queue.clone(),
        approvals.clone(),
        audit.clone(),
        clock.clone(),
        config.automation.clone(),
    ));
    let key_retention = Duration::from_secs(config.workers.key_retention_secs.max(0) as u64);
    let actions = Arc::new(ActionExecutor::new(
        accounts.clone(),
        campaigns,
        tokens.clone(),
        registry.clone(),
        approvals.clone(),
        audit.clone(),
        notifier.clone(),
        clock.clone(),
        call_timeout,
        key_retention,
    ));

    let handler = Arc::new(CoreJobHandler::new(sync, engine, actions.clone()));
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        handler,
        audit,
        notifier,
        clock.clone(),
        config.workers.clone(),
        RetryPolicy::from(&config.retry),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(pool.run(shutdown_rx.clone()));
    if cli.workers_only {
        info!("Running workers only (scheduler disabled)");
    } else {
        let scheduler = Arc::new(Scheduler::new(
            accounts,
            rules,
            queue,
            credentials,
            tokens,
            approvals,
            actions,
            clock,
            config.scheduler.clone(),
        ));
        tasks.spawn(scheduler.run(shutdown_rx));
    }

    info!(platforms = ?registry.platforms(), "Campaign Autopilot is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background task panicked");
        }
    }

    info!("Campaign Autopilot stopped");
    Ok(())
}

fn start_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;
    info!(port, "Metrics exporter started");
    Ok(())
}
