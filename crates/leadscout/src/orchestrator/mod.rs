//! Stage sequencer.
//!
//! Drives a search through `starting → personas → businesses →
//! decision_makers → market_insights → completed`. Every phase write is
//! conditional on the search still being in progress, so a cancellation
//! that lands while a stage runs turns the next write into a no-op and the
//! run stops there.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, Instrument};

use crate::cleanup::non_fatal;
use crate::db::{search_repo, Database, DatabaseError};
use crate::progress::{SearchEventBroadcaster, SearchProgressTracker};
use crate::search::{Search, SearchPhase, SearchStatus};
use crate::stage::{StageError, StageInvoker, StageKind, StageRunner};

pub mod handler;

pub use handler::{OrchestrateHandler, ORCHESTRATE_JOB_TYPE};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Search not found: {0}")]
    NotFound(String),

    #[error("No runner registered for stage {0}")]
    MissingStage(StageKind),

    #[error("Search {search_id} is in progress but phase {phase} could not be written")]
    PhaseConflict {
        search_id: String,
        phase: SearchPhase,
    },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The search failed; `phase` is the last phase that succeeded.
    Failed { phase: SearchPhase, error: String },
    Cancelled,
    /// A transient stage error left the search in progress for a later
    /// attempt to resume.
    Deferred { phase: SearchPhase, error: String },
}

/// The runners used for each stage.
#[derive(Clone, Default)]
pub struct StageSet {
    runners: HashMap<StageKind, Arc<dyn StageRunner>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `runner` for its stage, replacing any earlier one.
    pub fn with(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.runners.insert(runner.kind(), runner);
        self
    }

    pub fn from_runners<I>(runners: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn StageRunner>>,
    {
        runners.into_iter().fold(Self::new(), Self::with)
    }

    pub fn get(&self, kind: StageKind) -> Result<&Arc<dyn StageRunner>, OrchestratorError> {
        self.runners
            .get(&kind)
            .ok_or(OrchestratorError::MissingStage(kind))
    }

    /// Stages without a runner.
    pub fn missing(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| !self.runners.contains_key(kind))
            .collect()
    }
}

/// Runs searches through their stages.
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    invoker: StageInvoker,
    events: SearchEventBroadcaster,
    stages: Arc<StageSet>,
}

impl Orchestrator {
    pub fn new(db: Database, events: SearchEventBroadcaster, stages: StageSet) -> Self {
        Self {
            invoker: StageInvoker::new(db.clone(), events.clone()),
            db,
            events,
            stages: Arc::new(stages),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Drives the search from its current phase until it completes, fails,
    /// is cancelled, or (when `can_retry`) hits a transient stage error.
    ///
    /// Completed stages are never re-run: a second call on an in-progress
    /// search resumes where the last one stopped.
    pub async fn drive(
        &self,
        search_id: &str,
        can_retry: bool,
    ) -> Result<RunOutcome, OrchestratorError> {
        let span = info_span!("orchestrate", search_id = %search_id, can_retry);
        self.drive_inner(search_id, can_retry).instrument(span).await
    }

    async fn drive_inner(
        &self,
        search_id: &str,
        can_retry: bool,
    ) -> Result<RunOutcome, OrchestratorError> {
        let tracker = self.events.tracker(search_id);

        loop {
            let search = self.load(search_id)?;
            if search.status != SearchStatus::InProgress {
                return Ok(settled_outcome(&search));
            }

            let phase = search.phase;
            let step = match phase {
                SearchPhase::Starting => {
                    if !self.write_phase(&search, SearchPhase::Starting, &tracker)? {
                        return self.stopped(search_id, SearchPhase::Starting);
                    }
                    self.run_personas(&search).await
                }
                SearchPhase::Personas => self.run_stage(StageKind::BusinessDiscovery, &search).await,
                SearchPhase::Businesses => {
                    self.run_stage(StageKind::DecisionMakerDiscovery, &search).await
                }
                SearchPhase::DecisionMakers => {
                    self.run_stage(StageKind::MarketInsights, &search).await
                }
                // Insights were written but completion was not recorded.
                SearchPhase::MarketInsights => Ok(()),
                SearchPhase::Completed | SearchPhase::Failed | SearchPhase::Cancelled => {
                    return Ok(settled_outcome(&search));
                }
            };

            if let Err(e) = step {
                return self.handle_stage_error(&search, e, can_retry, &tracker);
            }

            let Some(next) = phase.next() else {
                return Ok(settled_outcome(&search));
            };
            // Completion is its own write.
            if next != SearchPhase::Completed && !self.write_phase(&search, next, &tracker)? {
                return self.stopped(search_id, next);
            }

            if matches!(next, SearchPhase::MarketInsights | SearchPhase::Completed) {
                if !search_repo::mark_completed(&self.db, search_id, Utc::now())? {
                    return self.stopped(search_id, SearchPhase::Completed);
                }
                tracker.completed();
                tracing::info!("Search completed");
                return Ok(RunOutcome::Completed);
            }
        }
    }

    fn load(&self, search_id: &str) -> Result<Search, OrchestratorError> {
        search_repo::find_by_id(&self.db, search_id)?
            .ok_or_else(|| OrchestratorError::NotFound(search_id.to_string()))
    }

    /// Writes `phase` with its progress. `false` means the search left
    /// `in_progress` meanwhile.
    fn write_phase(
        &self,
        search: &Search,
        phase: SearchPhase,
        tracker: &SearchProgressTracker,
    ) -> Result<bool, OrchestratorError> {
        let pct = phase.progress_pct();
        let written = search_repo::advance_phase(&self.db, &search.id, phase, pct, Utc::now())?;
        if written {
            tracing::debug!(phase = %phase, progress_pct = pct, "Phase written");
            tracker.phase_changed(phase, pct);
        }
        Ok(written)
    }

    /// Called when a conditional write did not apply. Reports why.
    fn stopped(&self, search_id: &str, phase: SearchPhase) -> Result<RunOutcome, OrchestratorError> {
        let search = self.load(search_id)?;
        if search.status == SearchStatus::InProgress {
            return Err(OrchestratorError::PhaseConflict {
                search_id: search_id.to_string(),
                phase,
            });
        }
        tracing::info!(status = %search.status, "Run stopped: search no longer in progress");
        Ok(settled_outcome(&search))
    }

    /// Runs one stage. A panicking runner is reported as a terminal stage
    /// error so the failure still lands on the search row.
    async fn run_stage(&self, kind: StageKind, search: &Search) -> Result<(), StageError> {
        let runner = self.stages.get(kind).map_err(|e| StageError::terminal(kind, e.to_string()))?;
        match AssertUnwindSafe(self.invoker.invoke(runner.as_ref(), search))
            .catch_unwind()
            .await
        {
            Ok(report) => {
                report?;
                Ok(())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(stage = %kind, "Stage panicked: {}", message);
                Err(StageError::terminal(kind, format!("panicked: {}", message)))
            }
        }
    }

    /// Runs both persona stages concurrently. Both must succeed; when both
    /// fail, a terminal error wins over a transient one.
    async fn run_personas(&self, search: &Search) -> Result<(), StageError> {
        let (business, decision_makers) = tokio::join!(
            self.run_stage(StageKind::BusinessPersonas, search),
            self.run_stage(StageKind::DecisionMakerPersonas, search),
        );
        match (business, decision_makers) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(if a.is_transient() { b } else { a }),
        }
    }

    fn handle_stage_error(
        &self,
        search: &Search,
        error: StageError,
        can_retry: bool,
        tracker: &SearchProgressTracker,
    ) -> Result<RunOutcome, OrchestratorError> {
        let phase = search.phase;
        let message = error.to_string();

        if can_retry && error.is_transient() {
            tracing::warn!(phase = %phase, "Transient stage error, leaving search for retry: {}", message);
            return Ok(RunOutcome::Deferred {
                phase,
                error: message,
            });
        }

        match search_repo::mark_failed(&self.db, &search.id, &message, Utc::now()) {
            Ok(true) => {}
            Ok(false) => return self.stopped(&search.id, SearchPhase::Failed),
            Err(e) => {
                tracing::error!("Failed to record search failure: {}", e);
                non_fatal("secondary search failure write", || {
                    search_repo::force_failed(&self.db, &search.id)
                });
            }
        }

        tracing::warn!(phase = %phase, "Search failed: {}", message);
        tracker.failed(phase, &message);
        Ok(RunOutcome::Failed {
            phase,
            error: message,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn settled_outcome(search: &Search) -> RunOutcome {
    match search.status {
        SearchStatus::Completed => RunOutcome::Completed,
        SearchStatus::Cancelled => RunOutcome::Cancelled,
        SearchStatus::Failed | SearchStatus::InProgress => RunOutcome::Failed {
            phase: search.phase,
            error: search.error.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::result_repo;
    use crate::progress::SearchEventKind;
    use crate::search::{NewSearch, Orientation};
    use crate::stage::{EntityKind, RecordSink, StageContext, StageRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake {
        kind: StageKind,
        fail: Option<bool>,
        runs: AtomicUsize,
    }

    impl Fake {
        fn ok(kind: StageKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail: None,
                runs: AtomicUsize::new(0),
            })
        }

        /// `transient` selects the error class.
        fn failing(kind: StageKind, transient: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail: Some(transient),
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StageRunner for Fake {
        fn kind(&self) -> StageKind {
            self.kind
        }

        async fn run(&self, _ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(true) => Err(StageError::transient(self.kind, "503 from provider")),
                Some(false) => Err(StageError::terminal(self.kind, "400 from provider")),
                None => {
                    sink.persist(StageRecord::new(self.kind.as_str(), serde_json::json!({})))?;
                    Ok(())
                }
            }
        }
    }

    struct Panicking(StageKind);

    #[async_trait]
    impl StageRunner for Panicking {
        fn kind(&self) -> StageKind {
            self.0
        }

        async fn run(&self, _ctx: &StageContext, _sink: &RecordSink) -> Result<(), StageError> {
            panic!("provider client bug");
        }
    }

    fn stage_set(overrides: Vec<Arc<Fake>>) -> StageSet {
        let mut set = StageSet::new();
        for kind in StageKind::ALL {
            set = set.with(Fake::ok(kind));
        }
        for fake in overrides {
            set = set.with(fake);
        }
        set
    }

    fn setup(stages: StageSet) -> (Database, Orchestrator, String) {
        let db = Database::open_in_memory().unwrap();
        let search = NewSearch {
            owner_id: "u1".to_string(),
            orientation: Orientation::Customer,
            product: "CRM software".to_string(),
            industries: vec!["Technology".to_string()],
            countries: vec!["United States".to_string()],
        }
        .into_search(Utc::now());
        search_repo::insert(&db, &search).unwrap();
        let orchestrator = Orchestrator::new(db.clone(), SearchEventBroadcaster::default(), stages);
        (db, orchestrator, search.id)
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let (db, orchestrator, id) = setup(stage_set(vec![]));
        let outcome = orchestrator.drive(&id, false).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Completed);
        assert_eq!(search.phase, SearchPhase::Completed);
        assert_eq!(search.progress_pct, 100);
        for entity in EntityKind::ALL {
            assert!(result_repo::count(&db, &id, entity).unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_terminal_error_fails_search_at_last_phase() {
        let (db, orchestrator, id) = setup(stage_set(vec![Fake::failing(
            StageKind::BusinessDiscovery,
            false,
        )]));
        let outcome = orchestrator.drive(&id, true).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                phase: SearchPhase::Personas,
                ..
            }
        ));

        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Failed);
        assert_eq!(search.phase, SearchPhase::Personas);
        assert_eq!(search.progress_pct, 0);
    }

    #[tokio::test]
    async fn test_transient_error_defers_when_retry_allowed() {
        let (db, orchestrator, id) = setup(stage_set(vec![Fake::failing(
            StageKind::DecisionMakerDiscovery,
            true,
        )]));
        let outcome = orchestrator.drive(&id, true).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Deferred {
                phase: SearchPhase::Businesses,
                ..
            }
        ));
        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::InProgress);
        assert_eq!(search.progress_pct, 60);
    }

    #[tokio::test]
    async fn test_transient_error_on_last_attempt_fails() {
        let (db, orchestrator, id) = setup(stage_set(vec![Fake::failing(
            StageKind::MarketInsights,
            true,
        )]));
        let outcome = orchestrator.drive(&id, false).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                phase: SearchPhase::DecisionMakers,
                ..
            }
        ));
        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_stages() {
        let personas = Fake::ok(StageKind::BusinessPersonas);
        let (db, orchestrator, id) = setup(stage_set(vec![personas.clone()]));

        // Pretend an earlier run got as far as businesses.
        search_repo::advance_phase(&db, &id, SearchPhase::Businesses, 60, Utc::now()).unwrap();
        result_repo::insert(
            &db,
            &id,
            StageKind::BusinessDiscovery,
            &StageRecord::new("Acme", serde_json::json!({})),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(orchestrator.drive(&id, false).await.unwrap(), RunOutcome::Completed);
        assert_eq!(personas.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drive_on_cancelled_search_does_nothing() {
        let personas = Fake::ok(StageKind::BusinessPersonas);
        let (db, orchestrator, id) = setup(stage_set(vec![personas.clone()]));
        search_repo::mark_cancelled(&db, &id, Utc::now()).unwrap();

        assert_eq!(orchestrator.drive(&id, false).await.unwrap(), RunOutcome::Cancelled);
        assert_eq!(personas.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persona_failure_prefers_terminal_error() {
        let (db, orchestrator, id) = setup(stage_set(vec![
            Fake::failing(StageKind::BusinessPersonas, true),
            Fake::failing(StageKind::DecisionMakerPersonas, false),
        ]));
        let outcome = orchestrator.drive(&id, true).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                phase: SearchPhase::Starting,
                ..
            }
        ));
        assert_eq!(
            search_repo::find_by_id(&db, &id).unwrap().unwrap().status,
            SearchStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_search() {
        let stages = stage_set(vec![]).with(Arc::new(Panicking(StageKind::BusinessDiscovery)));
        let (db, orchestrator, id) = setup(stages);

        // Retry is allowed, but a panic is never worth retrying.
        let outcome = orchestrator.drive(&id, true).await.unwrap();
        let RunOutcome::Failed { phase, error } = outcome else {
            panic!("expected a failed run, got {:?}", outcome);
        };
        assert_eq!(phase, SearchPhase::Personas);
        assert!(error.contains("provider client bug"));

        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Failed);
        assert_eq!(search.phase, SearchPhase::Personas);
        assert_eq!(search.progress_pct, 0);
    }

    #[tokio::test]
    async fn test_secondary_failure_write_when_primary_errors() {
        let (db, orchestrator, id) = setup(stage_set(vec![Fake::failing(
            StageKind::DecisionMakerDiscovery,
            false,
        )]));
        let events = orchestrator.events.clone();
        let mut sub = events.subscribe(&id);
        // Reject any write of the error column so the primary failure write errors.
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_error_write BEFORE UPDATE OF error ON searches
                 WHEN NEW.error IS NOT NULL
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let outcome = orchestrator.drive(&id, false).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                phase: SearchPhase::Businesses,
                ..
            }
        ));

        let search = search_repo::find_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Failed);
        assert_eq!(search.phase, SearchPhase::Businesses);
        assert_eq!(search.progress_pct, 0);
        assert!(search.error.is_none());

        let mut saw_failed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            if matches!(event.kind, SearchEventKind::Failed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_missing_search() {
        let (_db, orchestrator, _id) = setup(stage_set(vec![]));
        assert!(matches!(
            orchestrator.drive("nope", false).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[test]
    fn test_stage_set_reports_missing() {
        let set = StageSet::new().with(Fake::ok(StageKind::MarketInsights));
        assert_eq!(set.missing().len(), 4);
        assert!(set.get(StageKind::BusinessPersonas).is_err());
    }
}
