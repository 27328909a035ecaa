use std::time::{Duration, Instant};

use tracing::{info_span, Instrument};

use super::{EntityKind, RecordSink, StageContext, StageError, StageKind, StageRunner};
use crate::db::{result_repo, Database};
use crate::progress::SearchEventBroadcaster;
use crate::search::Search;

/// Summary of one successful stage run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: StageKind,
    pub records: usize,
    pub elapsed: Duration,
}

/// Runs stages under a uniform contract:
///
/// 1. rows written by an earlier run of the same stage are cleared,
/// 2. the context is assembled from the search and upstream result sets,
/// 3. the run is timed inside a tracing span,
/// 4. errors come back classified as [`StageError`].
#[derive(Clone)]
pub struct StageInvoker {
    db: Database,
    events: SearchEventBroadcaster,
}

impl StageInvoker {
    pub fn new(db: Database, events: SearchEventBroadcaster) -> Self {
        Self { db, events }
    }

    pub async fn invoke(
        &self,
        runner: &dyn StageRunner,
        search: &Search,
    ) -> Result<StageReport, StageError> {
        let stage = runner.kind();
        let ctx = self.build_context(search, stage)?;

        result_repo::delete_by_stage(&self.db, &search.id, stage)
            .map_err(|source| StageError::Store { stage, source })?;

        let sink = RecordSink::new(self.db.clone(), stage, self.events.tracker(&search.id));
        let span = info_span!("stage", search_id = %search.id, stage = %stage);
        let started = Instant::now();

        let result = runner.run(&ctx, &sink).instrument(span).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                tracing::info!(
                    search_id = %search.id,
                    stage = %stage,
                    records = sink.written(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stage finished"
                );
                Ok(StageReport {
                    stage,
                    records: sink.written(),
                    elapsed,
                })
            }
            Err(e) => {
                tracing::warn!(
                    search_id = %search.id,
                    stage = %stage,
                    transient = e.is_transient(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stage failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Builds the stage's view of the search. Discovery stages refuse to run
    /// on an empty upstream set.
    pub fn build_context(&self, search: &Search, stage: StageKind) -> Result<StageContext, StageError> {
        let load = |entity: EntityKind, only: Option<StageKind>| {
            result_repo::list(&self.db, &search.id, entity, only)
                .map_err(|source| StageError::Store { stage, source })
        };

        let mut ctx = StageContext {
            search_id: search.id.clone(),
            stage,
            orientation: search.orientation,
            product: search.product.clone(),
            industries: search.industries.clone(),
            countries: search.countries.clone(),
            business_personas: Vec::new(),
            decision_maker_personas: Vec::new(),
            businesses: Vec::new(),
            decision_makers: Vec::new(),
        };

        match stage {
            StageKind::BusinessPersonas | StageKind::DecisionMakerPersonas => {}
            StageKind::BusinessDiscovery => {
                ctx.business_personas =
                    load(EntityKind::Persona, Some(StageKind::BusinessPersonas))?;
                ctx.decision_maker_personas =
                    load(EntityKind::Persona, Some(StageKind::DecisionMakerPersonas))?;
                if ctx.business_personas.is_empty() {
                    return Err(StageError::MissingInput {
                        stage,
                        what: "no business personas".to_string(),
                    });
                }
            }
            StageKind::DecisionMakerDiscovery => {
                ctx.decision_maker_personas =
                    load(EntityKind::Persona, Some(StageKind::DecisionMakerPersonas))?;
                ctx.businesses = load(EntityKind::Business, None)?;
                if ctx.businesses.is_empty() {
                    return Err(StageError::MissingInput {
                        stage,
                        what: "no businesses".to_string(),
                    });
                }
            }
            StageKind::MarketInsights => {
                ctx.business_personas =
                    load(EntityKind::Persona, Some(StageKind::BusinessPersonas))?;
                ctx.decision_maker_personas =
                    load(EntityKind::Persona, Some(StageKind::DecisionMakerPersonas))?;
                ctx.businesses = load(EntityKind::Business, None)?;
                ctx.decision_makers = load(EntityKind::DecisionMaker, None)?;
            }
        }

        Ok(ctx)
    }
}
