//! Entry points used by the server: request intake, triggering, cancel,
//! retry, progress and maintenance.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::cancel::{CancelError, Cancelled, CancellationHandler};
use crate::cleanup::non_fatal;
use crate::config::PolicyConfig;
use crate::db::{search_repo, Database, DatabaseError};
use crate::idempotency::{orchestrate_key, retry_key, IdempotencyCache, Reservation};
use crate::orchestrator::{OrchestrateHandler, Orchestrator, StageSet, ORCHESTRATE_JOB_TYPE};
use crate::progress::{ProgressReporter, ProgressSnapshot, SearchEventBroadcaster, SearchSubscription};
use crate::queue::worker::settle;
use crate::queue::{Exclusive, Job, JobFilter, JobHandler, JobStore, NewJob};
use crate::reaper::{Reaper, ReaperReport};
use crate::search::{NewSearch, Search, SearchPhase, SearchStatus};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Search not found: {0}")]
    NotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Search {search_id} is {status}: {message}")]
    InvalidState {
        search_id: String,
        status: SearchStatus,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

impl From<CancelError> for ServiceError {
    fn from(e: CancelError) -> Self {
        match e {
            CancelError::NotFound(id) => ServiceError::NotFound(id),
            CancelError::AlreadyCompleted(id) => ServiceError::InvalidState {
                search_id: id,
                status: SearchStatus::Completed,
                message: "a completed search cannot be cancelled".to_string(),
            },
            CancelError::Store(e) => ServiceError::Store(e),
        }
    }
}

/// Where a triggered run executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Enqueue a job for the worker pool and return immediately.
    #[default]
    Background,
    /// Run in the caller's task and return the final snapshot.
    Foreground,
}

/// Result of a start or retry trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A background job was enqueued.
    Accepted { job_id: String },
    /// An earlier trigger is still live; nothing new was started.
    Duplicate {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// The run finished (foreground) or the search was already settled.
    Finished { snapshot: ProgressSnapshot },
}

/// One page of jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

/// Facade over every orchestration component, sharing one database handle.
#[derive(Clone)]
pub struct SearchService {
    db: Database,
    store: JobStore,
    cache: IdempotencyCache,
    handler: Arc<OrchestrateHandler>,
    cancellation: CancellationHandler,
    reporter: ProgressReporter,
    reaper: Reaper,
    events: SearchEventBroadcaster,
}

impl SearchService {
    pub fn new(db: Database, policy: &PolicyConfig, stages: StageSet) -> Self {
        let events = SearchEventBroadcaster::default();
        let cache = IdempotencyCache::new(db.clone(), policy.idempotency_ttl());
        Self {
            store: JobStore::new(db.clone(), policy),
            handler: Arc::new(OrchestrateHandler::new(Orchestrator::new(
                db.clone(),
                events.clone(),
                stages,
            ))),
            cancellation: CancellationHandler::new(db.clone(), events.clone()),
            reporter: ProgressReporter::new(db.clone(), events.clone()),
            reaper: Reaper::new(db.clone(), cache.clone(), policy.stuck_task_threshold()),
            cache,
            events,
            db,
        }
    }

    pub fn job_store(&self) -> &JobStore {
        &self.store
    }

    pub fn events(&self) -> &SearchEventBroadcaster {
        &self.events
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Handlers to register with the worker pool.
    pub fn job_handlers(&self) -> Vec<Arc<dyn JobHandler>> {
        vec![Arc::clone(&self.handler) as Arc<dyn JobHandler>]
    }

    /// Validates and stores a new search in its initial state.
    pub fn create_search(&self, request: NewSearch) -> Result<Search, ServiceError> {
        let request = request.normalized().map_err(ServiceError::InvalidRequest)?;
        let search = request.into_search(Utc::now());
        search_repo::insert(&self.db, &search)?;
        log::info!("Created search {} for owner {}", search.id, search.owner_id);
        Ok(search)
    }

    pub fn get_search(&self, search_id: &str) -> Result<Search, ServiceError> {
        search_repo::find_by_id(&self.db, search_id)?
            .ok_or_else(|| ServiceError::NotFound(search_id.to_string()))
    }

    pub fn list_searches(
        &self,
        owner_id: &str,
        status: Option<SearchStatus>,
    ) -> Result<Vec<Search>, ServiceError> {
        Ok(search_repo::list_by_owner(&self.db, owner_id, status)?)
    }

    /// Triggers orchestration of an in-progress search.
    ///
    /// Duplicate triggers within the idempotency window, and any trigger
    /// while an orchestration job for the search is still live, start nothing.
    /// A search that already settled is reported as finished.
    pub async fn start_orchestration(
        &self,
        search_id: &str,
        user_id: &str,
        mode: RunMode,
    ) -> Result<StartOutcome, ServiceError> {
        let search = self.owned_search(search_id, user_id)?;
        if search.status.is_terminal() {
            return Ok(StartOutcome::Finished {
                snapshot: self.get_progress(search_id)?,
            });
        }

        let key = orchestrate_key(search_id);
        if let Reservation::AlreadyReserved { outcome } = self.cache.reserve(&key)? {
            log::info!("Duplicate trigger for search {} suppressed", search_id);
            return Ok(duplicate(outcome));
        }

        self.dispatch(&key, search_id, user_id, mode).await
    }

    /// Puts a failed or completed search back in progress and runs it again.
    ///
    /// A failed search resumes after its last successful phase. A completed
    /// search re-runs market insights.
    pub async fn retry(
        &self,
        search_id: &str,
        user_id: &str,
        mode: RunMode,
    ) -> Result<StartOutcome, ServiceError> {
        let search = self.owned_search(search_id, user_id)?;
        let resume_at = match search.status {
            SearchStatus::Failed => search.phase,
            SearchStatus::Completed => SearchPhase::DecisionMakers,
            status => {
                return Err(ServiceError::InvalidState {
                    search_id: search_id.to_string(),
                    status,
                    message: "only failed or completed searches can be retried".to_string(),
                })
            }
        };

        let key = retry_key(search_id);
        if let Reservation::AlreadyReserved { outcome } = self.cache.reserve(&key)? {
            log::info!("Duplicate retry for search {} suppressed", search_id);
            return Ok(duplicate(outcome));
        }

        let reopened = search_repo::reopen(
            &self.db,
            search_id,
            resume_at,
            resume_at.progress_pct(),
            Utc::now(),
        );
        match reopened {
            Ok(true) => {}
            Ok(false) => {
                non_fatal("release retry key", || self.cache.release(&key));
                let current = self.get_search(search_id)?;
                return Err(ServiceError::InvalidState {
                    search_id: search_id.to_string(),
                    status: current.status,
                    message: "search changed state before the retry applied".to_string(),
                });
            }
            Err(e) => {
                non_fatal("release retry key", || self.cache.release(&key));
                return Err(e.into());
            }
        }
        log::info!("Search {} reopened at phase {}", search_id, resume_at);

        // The start trigger's window must not swallow the retried run.
        non_fatal("release start key", || self.cache.release(&orchestrate_key(search_id)));

        self.dispatch(&key, search_id, user_id, mode).await
    }

    pub fn cancel(&self, search_id: &str) -> Result<Cancelled, ServiceError> {
        Ok(self.cancellation.cancel(search_id)?)
    }

    pub fn get_progress(&self, search_id: &str) -> Result<ProgressSnapshot, ServiceError> {
        self.reporter
            .get_progress(search_id)?
            .ok_or_else(|| ServiceError::NotFound(search_id.to_string()))
    }

    /// Subscribes to the search's events. The search must exist.
    pub fn subscribe(&self, search_id: &str) -> Result<SearchSubscription, ServiceError> {
        self.get_search(search_id)?;
        Ok(self.reporter.subscribe(search_id))
    }

    /// Runs one reaper sweep now.
    pub fn reap(&self) -> ReaperReport {
        self.reaper.sweep(Utc::now())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, ServiceError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, ServiceError> {
        let (jobs, total) = self.store.list(filter)?;
        Ok(JobPage { jobs, total })
    }

    fn owned_search(&self, search_id: &str, user_id: &str) -> Result<Search, ServiceError> {
        let search = self.get_search(search_id)?;
        if search.owner_id != user_id {
            // Not revealing other owners' searches.
            return Err(ServiceError::NotFound(search_id.to_string()));
        }
        Ok(search)
    }

    /// Runs or enqueues the orchestration once `key` has been reserved. The
    /// reservation is released if nothing was started.
    ///
    /// Both modes go through the job store, so a search never has more than
    /// one live orchestration job whichever way it was triggered.
    async fn dispatch(
        &self,
        key: &str,
        search_id: &str,
        user_id: &str,
        mode: RunMode,
    ) -> Result<StartOutcome, ServiceError> {
        let payload = json!({ "search_id": search_id, "user_id": user_id });

        match mode {
            RunMode::Background => {
                let job = NewJob::new(ORCHESTRATE_JOB_TYPE, payload);
                let job_id = match self.store.enqueue_exclusive(job) {
                    Ok(Exclusive::Inserted(id)) => id,
                    Ok(Exclusive::Existing(job)) => {
                        return Ok(self.already_running(key, search_id, job))
                    }
                    Err(e) => {
                        non_fatal("release idempotency key", || self.cache.release(key));
                        return Err(e.into());
                    }
                };
                non_fatal("record trigger outcome", || {
                    self.cache.record_outcome(key, &json!({ "job_id": job_id }))
                });
                Ok(StartOutcome::Accepted { job_id })
            }
            RunMode::Foreground => {
                // A single attempt: foreground runs fail rather than defer.
                let job = NewJob::new(ORCHESTRATE_JOB_TYPE, payload).max_attempts(1);
                let claimed = match self.store.start_exclusive(job) {
                    Ok(Exclusive::Inserted(claimed)) => claimed,
                    Ok(Exclusive::Existing(job)) => {
                        return Ok(self.already_running(key, search_id, job))
                    }
                    Err(e) => {
                        non_fatal("release idempotency key", || self.cache.release(key));
                        return Err(e.into());
                    }
                };

                let outcome = self.handler.execute(&claimed).await;
                settle(&self.store, &claimed, outcome);

                let snapshot = self.get_progress(search_id)?;
                non_fatal("record trigger outcome", || {
                    self.cache.record_outcome(
                        key,
                        &json!({ "job_id": claimed.job.id, "status": snapshot.status }),
                    )
                });
                Ok(StartOutcome::Finished { snapshot })
            }
        }
    }

    fn already_running(&self, key: &str, search_id: &str, job: Job) -> StartOutcome {
        log::info!(
            "Search {} already has live job {}, not starting another",
            search_id,
            job.id
        );
        non_fatal("record trigger outcome", || {
            self.cache.record_outcome(key, &json!({ "job_id": job.id }))
        });
        StartOutcome::Duplicate {
            job_id: Some(job.id),
        }
    }
}

fn duplicate(outcome: Option<serde_json::Value>) -> StartOutcome {
    let job_id = outcome
        .as_ref()
        .and_then(|v| v.get("job_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    StartOutcome::Duplicate { job_id }
}
