use serde::{Deserialize, Serialize};

use super::events::{SearchEventBroadcaster, SearchSubscription};
use crate::db::{result_repo, search_repo, Database, DatabaseError};
use crate::search::{SearchPhase, SearchStatus};
use crate::stage::{EntityKind, StageKind};

/// Row counts per result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounts {
    pub personas: u64,
    pub business_personas: u64,
    pub decision_maker_personas: u64,
    pub businesses: u64,
    pub decision_makers: u64,
    pub market_insights: u64,
}

/// Point-in-time view of a search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub search_id: String,
    pub phase: SearchPhase,
    pub progress_pct: u8,
    pub status: SearchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub counts: ProgressCounts,
}

/// Answers snapshot queries from the store and hands out event subscriptions.
#[derive(Clone)]
pub struct ProgressReporter {
    db: Database,
    events: SearchEventBroadcaster,
}

impl ProgressReporter {
    pub fn new(db: Database, events: SearchEventBroadcaster) -> Self {
        Self { db, events }
    }

    /// Returns `None` when the search does not exist.
    pub fn get_progress(&self, search_id: &str) -> Result<Option<ProgressSnapshot>, DatabaseError> {
        let Some(search) = search_repo::find_by_id(&self.db, search_id)? else {
            return Ok(None);
        };

        let counts = ProgressCounts {
            personas: result_repo::count(&self.db, search_id, EntityKind::Persona)?,
            business_personas: result_repo::count_by_stage(
                &self.db,
                search_id,
                StageKind::BusinessPersonas,
            )?,
            decision_maker_personas: result_repo::count_by_stage(
                &self.db,
                search_id,
                StageKind::DecisionMakerPersonas,
            )?,
            businesses: result_repo::count(&self.db, search_id, EntityKind::Business)?,
            decision_makers: result_repo::count(&self.db, search_id, EntityKind::DecisionMaker)?,
            market_insights: result_repo::count(&self.db, search_id, EntityKind::MarketInsight)?,
        };

        Ok(Some(ProgressSnapshot {
            search_id: search.id,
            phase: search.phase,
            progress_pct: search.progress_pct,
            status: search.status,
            error: search.error,
            counts,
        }))
    }

    pub fn subscribe(&self, search_id: &str) -> SearchSubscription {
        self.events.subscribe(search_id)
    }
}
