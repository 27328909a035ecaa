use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;

use super::{ResultRecord, StageError, StageKind, StageRecord};
use crate::db::{result_repo, Database};
use crate::progress::SearchProgressTracker;

/// Stores a stage's records one at a time and announces each on the
/// search's event stream.
pub struct RecordSink {
    db: Database,
    stage: StageKind,
    tracker: SearchProgressTracker,
    written: AtomicUsize,
}

impl RecordSink {
    pub fn new(db: Database, stage: StageKind, tracker: SearchProgressTracker) -> Self {
        Self {
            db,
            stage,
            tracker,
            written: AtomicUsize::new(0),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn search_id(&self) -> &str {
        self.tracker.search_id()
    }

    pub fn persist(&self, record: StageRecord) -> Result<ResultRecord, StageError> {
        let stored = result_repo::insert(
            &self.db,
            self.tracker.search_id(),
            self.stage,
            &record,
            Utc::now(),
        )
        .map_err(|source| StageError::Store {
            stage: self.stage,
            source,
        })?;
        self.written.fetch_add(1, Ordering::Relaxed);
        self.tracker.record_inserted(stored.clone());
        Ok(stored)
    }

    pub fn persist_all<I>(&self, records: I) -> Result<usize, StageError>
    where
        I: IntoIterator<Item = StageRecord>,
    {
        let mut count = 0;
        for record in records {
            self.persist(record)?;
            count += 1;
        }
        Ok(count)
    }

    /// Records written through this sink so far.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}
