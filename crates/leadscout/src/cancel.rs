//! Search cancellation.
//!
//! Cancellation is advisory. The search row is flipped to `cancelled` and
//! outstanding jobs are failed; a stage that is already running finishes,
//! but the orchestrator's next conditional phase write no-ops and the run
//! stops there.

use chrono::Utc;
use thiserror::Error;

use crate::cleanup::non_fatal;
use crate::db::{job_repo, search_repo, Database, DatabaseError};
use crate::progress::SearchEventBroadcaster;
use crate::search::SearchStatus;

/// Error recorded on jobs and tasks swept by a cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("Search not found: {0}")]
    NotFound(String),

    #[error("Search {0} already completed")]
    AlreadyCompleted(String),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result of a successful cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// This call cancelled the search.
    Now,
    /// The search was cancelled earlier.
    Already,
}

#[derive(Clone)]
pub struct CancellationHandler {
    db: Database,
    events: SearchEventBroadcaster,
}

impl CancellationHandler {
    pub fn new(db: Database, events: SearchEventBroadcaster) -> Self {
        Self { db, events }
    }

    /// Cancels the search. Only the primary status write can fail the call;
    /// sweeping the search's jobs is best-effort.
    pub fn cancel(&self, search_id: &str) -> Result<Cancelled, CancelError> {
        let now = Utc::now();

        if !search_repo::mark_cancelled(&self.db, search_id, now)? {
            let search = search_repo::find_by_id(&self.db, search_id)?
                .ok_or_else(|| CancelError::NotFound(search_id.to_string()))?;
            return match search.status {
                SearchStatus::Cancelled => Ok(Cancelled::Already),
                _ => Err(CancelError::AlreadyCompleted(search_id.to_string())),
            };
        }

        log::info!("Cancelled search {}", search_id);

        if let Some((jobs, tasks)) = non_fatal("cancel outstanding jobs", || {
            job_repo::cancel_for_search(&self.db, search_id, CANCELLED_REASON, now)
        }) {
            if jobs > 0 || tasks > 0 {
                log::debug!(
                    "Failed {} jobs and {} tasks of cancelled search {}",
                    jobs,
                    tasks,
                    search_id
                );
            }
        }

        self.events.tracker(search_id).cancelled();
        Ok(Cancelled::Now)
    }
}
