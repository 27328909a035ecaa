//! Durable job store backed by the `jobs` and `job_tasks` tables.

use chrono::{DateTime, Duration, Utc};

use super::job::{ClaimedJob, Exclusive, Job, JobFilter, JobStatus, JobTask, NewJob};
use crate::config::PolicyConfig;
use crate::db::{job_repo, Database, DatabaseError};

/// Enqueue, claim and settle jobs.
///
/// Cloning is cheap; every clone shares the same database handle.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    default_max_attempts: u32,
    retry_backoff: Duration,
}

impl JobStore {
    pub fn new(db: Database, policy: &PolicyConfig) -> Self {
        Self {
            db,
            default_max_attempts: policy.max_attempts.max(1),
            retry_backoff: policy.retry_backoff(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn build(&self, new_job: NewJob, now: DateTime<Utc>) -> Job {
        let search_id = new_job
            .payload
            .get("search_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: new_job.job_type,
            payload: new_job.payload,
            search_id,
            run_at: new_job.run_at.unwrap_or(now),
            attempt_count: 0,
            max_attempts: new_job.max_attempts.unwrap_or(self.default_max_attempts).max(1),
            status: JobStatus::Queued,
            last_error: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inserts a `queued` job and returns its id. Never waits for execution.
    pub fn enqueue(&self, new_job: NewJob) -> Result<String, DatabaseError> {
        let job = self.build(new_job, Utc::now());
        job_repo::insert(&self.db, &job)?;
        log::info!("Enqueued job {} ({})", job.id, job.job_type);
        Ok(job.id)
    }

    /// Enqueues a job unless one of the same type is already queued or
    /// running for the payload's `search_id`.
    pub fn enqueue_exclusive(&self, new_job: NewJob) -> Result<Exclusive<String>, DatabaseError> {
        let now = Utc::now();
        let job = self.build(new_job, now);
        match job_repo::insert_exclusive(&self.db, &job, false, now)? {
            Exclusive::Inserted(_) => {
                log::info!("Enqueued job {} ({})", job.id, job.job_type);
                Ok(Exclusive::Inserted(job.id))
            }
            Exclusive::Existing(existing) => Ok(Exclusive::Existing(existing)),
        }
    }

    /// Like [`enqueue_exclusive`](Self::enqueue_exclusive), but the new job is
    /// claimed by the caller straight away instead of waiting for a worker.
    pub fn start_exclusive(
        &self,
        new_job: NewJob,
    ) -> Result<Exclusive<ClaimedJob>, DatabaseError> {
        let now = Utc::now();
        let job = self.build(new_job, now);
        match job_repo::insert_exclusive(&self.db, &job, true, now)? {
            Exclusive::Inserted(Some(task)) => {
                log::info!("Started job {} ({}) in the caller", job.id, job.job_type);
                let job = job_repo::find_by_id(&self.db, &job.id)?.ok_or_else(|| {
                    DatabaseError::InvalidValue {
                        field: "job_id",
                        reason: format!("started job {} disappeared", job.id),
                    }
                })?;
                Ok(Exclusive::Inserted(ClaimedJob { job, task }))
            }
            Exclusive::Inserted(None) => Err(DatabaseError::InvalidValue {
                field: "job_tasks",
                reason: format!("no task opened for started job {}", job.id),
            }),
            Exclusive::Existing(existing) => Ok(Exclusive::Existing(existing)),
        }
    }

    /// Claims one eligible job of the given types, or `None` if there is none
    /// or another claimant won the race.
    pub fn claim(&self, job_types: &[&str]) -> Result<Option<ClaimedJob>, DatabaseError> {
        self.claim_at(job_types, Utc::now())
    }

    pub fn claim_at(
        &self,
        job_types: &[&str],
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, DatabaseError> {
        job_repo::claim_next(&self.db, job_types, now)
    }

    /// Marks the job done. A no-op (returns `false`) on a terminal job.
    pub fn complete(
        &self,
        job_id: &str,
        outcome: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError> {
        job_repo::complete(&self.db, job_id, outcome, Utc::now())
    }

    /// Records a retryable failure: requeued with backoff while attempts
    /// remain, `failed` afterwards.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<Option<JobStatus>, DatabaseError> {
        job_repo::record_failure(
            &self.db,
            job_id,
            error,
            self.retry_backoff,
            false,
            Utc::now(),
        )
    }

    /// Records a failure that must not be retried.
    pub fn fail_permanently(
        &self,
        job_id: &str,
        error: &str,
    ) -> Result<Option<JobStatus>, DatabaseError> {
        job_repo::record_failure(&self.db, job_id, error, Duration::zero(), true, Utc::now())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, DatabaseError> {
        job_repo::find_by_id(&self.db, job_id)
    }

    pub fn find_active_for_search(
        &self,
        search_id: &str,
        job_type: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        job_repo::find_active_for_search(&self.db, search_id, job_type)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
        job_repo::query(&self.db, filter)
    }

    pub fn tasks_for_job(&self, job_id: &str) -> Result<Vec<JobTask>, DatabaseError> {
        job_repo::tasks_for_job(&self.db, job_id)
    }
}
