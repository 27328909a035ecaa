//! Job repository: the `jobs` and `job_tasks` tables.
//!
//! State changes that must be exclusive (claim, failure accounting, reaper
//! resets, cancellation sweeps) run inside [`Database::with_tx`] and use
//! compare-and-swap style `UPDATE ... WHERE status = ...` statements.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    format_timestamp, json_column, optional_json_column, optional_timestamp_column, parse_column,
    timestamp_column, Database, DatabaseError,
};
use crate::queue::job::{ClaimedJob, Exclusive, Job, JobFilter, JobStatus, JobTask};

fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    Ok(Job {
        id: row.get("id")?,
        job_type: row.get("job_type")?,
        payload: json_column(row, "payload")?,
        search_id: row.get("search_id")?,
        run_at: timestamp_column(row, "run_at")?,
        attempt_count: row.get("attempt_count")?,
        max_attempts: row.get("max_attempts")?,
        status: parse_column(row, "status")?,
        last_error: row.get("last_error")?,
        outcome: optional_json_column(row, "outcome")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn task_from_row(row: &Row<'_>) -> Result<JobTask, rusqlite::Error> {
    Ok(JobTask {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        status: parse_column(row, "status")?,
        started_at: optional_timestamp_column(row, "started_at")?,
        finished_at: optional_timestamp_column(row, "finished_at")?,
        error: row.get("error")?,
    })
}

fn validate(job: &Job) -> Result<(), DatabaseError> {
    if !job.payload.is_object() {
        return Err(DatabaseError::InvalidValue {
            field: "payload",
            reason: "job payload must be a JSON object".to_string(),
        });
    }
    if job.attempt_count > job.max_attempts {
        return Err(DatabaseError::InvalidValue {
            field: "attempt_count",
            reason: format!(
                "attempt_count {} exceeds max_attempts {}",
                job.attempt_count, job.max_attempts
            ),
        });
    }
    Ok(())
}

fn insert_row(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(&job.payload)?;
    let outcome = job.outcome.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO jobs (id, job_type, payload, search_id, run_at, attempt_count,
         max_attempts, status, last_error, outcome, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            job.id,
            job.job_type,
            payload,
            job.search_id,
            format_timestamp(job.run_at),
            job.attempt_count,
            job.max_attempts,
            job.status.as_str(),
            job.last_error,
            outcome,
            format_timestamp(job.created_at),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

fn active_for_search(
    conn: &Connection,
    search_id: &str,
    job_type: &str,
) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row(
            "SELECT * FROM jobs WHERE search_id = ?1 AND job_type = ?2
             AND status IN ('queued', 'running')
             ORDER BY created_at ASC LIMIT 1",
            params![search_id, job_type],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    validate(job)?;
    db.with_conn(|conn| insert_row(conn, job))
}

/// Inserts `job` unless a non-terminal job of the same type already exists
/// for its search. The check and the insert share one transaction, so two
/// callers racing for the same search get exactly one new job.
///
/// With `claim`, the job is written `running` with an open task, for callers
/// that execute it themselves. Such a job is never handed to a worker, but the
/// reaper requeues it like any other if its task goes stale.
pub fn insert_exclusive(
    db: &Database,
    job: &Job,
    claim: bool,
    now: DateTime<Utc>,
) -> Result<Exclusive<Option<JobTask>>, DatabaseError> {
    validate(job)?;
    let Some(search_id) = job.search_id.as_deref() else {
        return Err(DatabaseError::InvalidValue {
            field: "search_id",
            reason: "exclusive jobs must carry a search_id".to_string(),
        });
    };

    db.with_tx(|tx| {
        if let Some(existing) = active_for_search(tx, search_id, &job.job_type)? {
            return Ok(Exclusive::Existing(existing));
        }

        if !claim {
            insert_row(tx, job)?;
            return Ok(Exclusive::Inserted(None));
        }

        let mut running = job.clone();
        running.status = JobStatus::Running;
        insert_row(tx, &running)?;
        let task_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO job_tasks (id, job_id, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![task_id, running.id, format_timestamp(now)],
        )?;
        let task = tx.query_row(
            "SELECT * FROM job_tasks WHERE id = ?1",
            params![task_id],
            task_from_row,
        )?;
        Ok(Exclusive::Inserted(Some(task)))
    })
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
        .optional()?;
    Ok(job)
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| load_job(conn, id))
}

/// Atomically claims the oldest eligible queued job.
///
/// A job is eligible when it is `queued`, its `run_at` has passed and its
/// type is in `job_types` (an empty slice accepts every type). The job moves
/// to `running` and a task is opened for it; a `queued` task left behind by a
/// reaper reset is reused instead of opening a second one.
pub fn claim_next(
    db: &Database,
    job_types: &[&str],
    now: DateTime<Utc>,
) -> Result<Option<ClaimedJob>, DatabaseError> {
    let now_str = format_timestamp(now);

    db.with_tx(|tx| {
        let mut sql = String::from("SELECT id FROM jobs WHERE status = 'queued' AND run_at <= ?1");
        let mut values: Vec<&dyn ToSql> = vec![&now_str];
        if !job_types.is_empty() {
            let placeholders: Vec<String> =
                (0..job_types.len()).map(|i| format!("?{}", i + 2)).collect();
            sql.push_str(&format!(" AND job_type IN ({})", placeholders.join(", ")));
            for job_type in job_types {
                values.push(job_type);
            }
        }
        sql.push_str(" ORDER BY run_at ASC, created_at ASC LIMIT 1");

        let candidate: Option<String> = tx
            .query_row(&sql, values.as_slice(), |r| r.get(0))
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let swapped = tx.execute(
            "UPDATE jobs SET status = 'running', updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![job_id, now_str],
        )?;
        if swapped != 1 {
            return Ok(None);
        }

        let reusable: Option<String> = tx
            .query_row(
                "SELECT id FROM job_tasks WHERE job_id = ?1 AND status = 'queued' LIMIT 1",
                params![job_id],
                |r| r.get(0),
            )
            .optional()?;

        let task_id = match reusable {
            Some(task_id) => {
                tx.execute(
                    "UPDATE job_tasks SET status = 'running', started_at = ?2,
                     finished_at = NULL, error = NULL WHERE id = ?1",
                    params![task_id, now_str],
                )?;
                task_id
            }
            None => {
                let task_id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO job_tasks (id, job_id, status, started_at)
                     VALUES (?1, ?2, 'running', ?3)",
                    params![task_id, job_id, now_str],
                )?;
                task_id
            }
        };

        let job = load_job(tx, &job_id)?.ok_or_else(|| DatabaseError::InvalidValue {
            field: "job_id",
            reason: format!("claimed job {} disappeared", job_id),
        })?;
        let task = tx.query_row(
            "SELECT * FROM job_tasks WHERE id = ?1",
            params![task_id],
            task_from_row,
        )?;

        log::debug!("Claimed job {} ({}) with task {}", job.id, job.job_type, task.id);
        Ok(Some(ClaimedJob { job, task }))
    })
}

/// Marks a job `done` and its open task `succeeded`.
///
/// Returns `false` when the job is already terminal.
pub fn complete(
    db: &Database,
    job_id: &str,
    outcome: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let outcome = outcome.map(serde_json::to_string).transpose()?;
    let now_str = format_timestamp(now);

    db.with_tx(|tx| {
        let changed = tx.execute(
            "UPDATE jobs SET status = 'done', outcome = ?2, last_error = NULL, updated_at = ?3
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![job_id, outcome, now_str],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE job_tasks SET status = 'succeeded', finished_at = ?2
             WHERE job_id = ?1 AND status IN ('queued', 'running')",
            params![job_id, now_str],
        )?;
        Ok(true)
    })
}

/// Records a failed attempt.
///
/// The attempt counter is incremented. While attempts remain (and the failure
/// is not `permanent`) the job returns to `queued` with `run_at = now + backoff`;
/// otherwise it becomes `failed`. The open task is closed as `failed` either
/// way. Returns the job's new status, or `None` when it was already terminal.
pub fn record_failure(
    db: &Database,
    job_id: &str,
    error: &str,
    backoff: Duration,
    permanent: bool,
    now: DateTime<Utc>,
) -> Result<Option<JobStatus>, DatabaseError> {
    let now_str = format_timestamp(now);

    db.with_tx(|tx| {
        let Some(job) = load_job(tx, job_id)? else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }

        let attempts = (job.attempt_count + 1).min(job.max_attempts);
        let next_status = if permanent || attempts >= job.max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        };
        let run_at = match next_status {
            JobStatus::Queued => format_timestamp(now + backoff),
            _ => format_timestamp(job.run_at),
        };

        tx.execute(
            "UPDATE jobs SET status = ?2, attempt_count = ?3, run_at = ?4, last_error = ?5,
             updated_at = ?6 WHERE id = ?1",
            params![
                job_id,
                next_status.as_str(),
                attempts,
                run_at,
                error,
                now_str
            ],
        )?;
        tx.execute(
            "UPDATE job_tasks SET status = 'failed', finished_at = ?2, error = ?3
             WHERE job_id = ?1 AND status IN ('queued', 'running')",
            params![job_id, now_str, error],
        )?;

        if next_status == JobStatus::Failed {
            log::warn!(
                "Job {} failed after {}/{} attempts: {}",
                job_id,
                attempts,
                job.max_attempts,
                error
            );
        } else {
            log::info!(
                "Job {} requeued (attempt {}/{}): {}",
                job_id,
                attempts,
                job.max_attempts,
                error
            );
        }
        Ok(Some(next_status))
    })
}

/// Finds a non-terminal job of `job_type` correlated with `search_id`.
pub fn find_active_for_search(
    db: &Database,
    search_id: &str,
    job_type: &str,
) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| active_for_search(conn, search_id, job_type))
}

/// Fails every non-terminal job of a search and its open tasks with `reason`.
///
/// Returns `(jobs, tasks)` affected.
pub fn cancel_for_search(
    db: &Database,
    search_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(usize, usize), DatabaseError> {
    let now_str = format_timestamp(now);

    db.with_tx(|tx| {
        let tasks = tx.execute(
            "UPDATE job_tasks SET status = 'failed', finished_at = ?2, error = ?3
             WHERE status IN ('queued', 'running') AND job_id IN (
                 SELECT id FROM jobs WHERE search_id = ?1 AND status IN ('queued', 'running'))",
            params![search_id, now_str, reason],
        )?;
        let jobs = tx.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?3, updated_at = ?2
             WHERE search_id = ?1 AND status IN ('queued', 'running')",
            params![search_id, now_str, reason],
        )?;
        Ok((jobs, tasks))
    })
}

/// Resets tasks that have been `running` since before `cutoff` back to
/// `queued`, and their jobs with them, so another worker can claim them.
///
/// The attempt counter is left untouched. Returns the number of tasks reset.
pub fn reset_stuck_tasks(
    db: &Database,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let cutoff_str = format_timestamp(cutoff);
    let now_str = format_timestamp(now);

    db.with_tx(|tx| {
        let stuck: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, job_id FROM job_tasks
                 WHERE status = 'running' AND started_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff_str], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (task_id, job_id) in &stuck {
            tx.execute(
                "UPDATE job_tasks SET status = 'queued', started_at = NULL WHERE id = ?1",
                params![task_id],
            )?;
            tx.execute(
                "UPDATE jobs SET status = 'queued', run_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![job_id, now_str],
            )?;
            log::warn!("Reset stuck task {} of job {}", task_id, job_id);
        }

        Ok(stuck.len())
    })
}

/// Lists the tasks of a job, oldest first.
pub fn tasks_for_job(db: &Database, job_id: &str) -> Result<Vec<JobTask>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_tasks WHERE job_id = ?1
             ORDER BY COALESCE(started_at, finished_at) ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(ref job_type) = filter.job_type {
            conditions.push(format!("job_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(job_type.clone()));
        }
        if let Some(ref search_id) = filter.search_id {
            conditions.push(format!("search_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(search_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<Job> = stmt
            .query_map(params_ref.as_slice(), job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}
