//! Routes queued jobs to the component that executes them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use campaign_core::error::CoreResult;
use campaign_core::types::{Job, JobPayload};
use campaign_sync::sync_engine::SyncEngine;
use campaign_sync::worker::JobHandler;

use crate::actions::ActionExecutor;
use crate::rules::RuleEngine;

pub struct CoreJobHandler {
    sync: Arc<SyncEngine>,
    rules: Arc<RuleEngine>,
    actions: Arc<ActionExecutor>,
}

impl CoreJobHandler {
    pub fn new(sync: Arc<SyncEngine>, rules: Arc<RuleEngine>, actions: Arc<ActionExecutor>) -> Self {
        Self { sync, rules, actions }
    }
}

#[async_trait]
impl JobHandler for CoreJobHandler {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        debug!(job_id = %job.id, kind = job.kind.as_str(), attempt = job.attempts + 1, "dispatching job");
        match &job.payload {
            JobPayload::Sync { account_id } => {
                self.sync.sync_account(*account_id).await?;
            }
            JobPayload::Evaluate { rule_id } => {
                self.rules.evaluate(*rule_id).await?;
            }
            JobPayload::Action(command) => {
                self.actions.execute(&job.idempotency_key, command).await?;
            }
        }
        Ok(())
    }
}
