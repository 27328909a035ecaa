use async_trait::async_trait;
use serde_json::json;

use super::{Orchestrator, OrchestratorError, RunOutcome};
use crate::cleanup::non_fatal;
use crate::db::search_repo;
use crate::queue::{ClaimedJob, JobHandler, JobOutcome};

pub const ORCHESTRATE_JOB_TYPE: &str = "orchestrate_search";

/// Runs `orchestrate_search` jobs. The payload carries `search_id`.
pub struct OrchestrateHandler {
    orchestrator: Orchestrator,
}

impl OrchestrateHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for OrchestrateHandler {
    fn job_type(&self) -> &'static str {
        ORCHESTRATE_JOB_TYPE
    }

    async fn execute(&self, claimed: &ClaimedJob) -> JobOutcome {
        let job = &claimed.job;
        let Some(search_id) = job.payload_str("search_id") else {
            return JobOutcome::Failed("payload has no search_id".to_string());
        };

        // Transient stage errors defer to a later attempt unless this is the
        // last one, in which case the search is failed here.
        let can_retry = !job.is_last_attempt();

        match self.orchestrator.drive(search_id, can_retry).await {
            Ok(RunOutcome::Completed) => {
                JobOutcome::Completed(Some(json!({ "search_id": search_id, "outcome": "completed" })))
            }
            Ok(RunOutcome::Cancelled) => {
                JobOutcome::Completed(Some(json!({ "search_id": search_id, "outcome": "cancelled" })))
            }
            Ok(RunOutcome::Failed { error, .. }) => JobOutcome::Failed(error),
            Ok(RunOutcome::Deferred { error, .. }) => JobOutcome::Retry(error),
            Err(OrchestratorError::NotFound(id)) => {
                JobOutcome::Failed(format!("search {} not found", id))
            }
            Err(e) => {
                log::error!("Orchestration of search {} errored: {}", search_id, e);
                if job.is_last_attempt() {
                    non_fatal("final failure write", || {
                        search_repo::force_failed(self.orchestrator.database(), search_id)
                    });
                }
                JobOutcome::Retry(e.to_string())
            }
        }
    }
}
