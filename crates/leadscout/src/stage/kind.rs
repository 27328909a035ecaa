use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

/// The generation stages a search runs through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    BusinessPersonas,
    DecisionMakerPersonas,
    BusinessDiscovery,
    DecisionMakerDiscovery,
    MarketInsights,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::BusinessPersonas,
        StageKind::DecisionMakerPersonas,
        StageKind::BusinessDiscovery,
        StageKind::DecisionMakerDiscovery,
        StageKind::MarketInsights,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::BusinessPersonas => "business_personas",
            StageKind::DecisionMakerPersonas => "decision_maker_personas",
            StageKind::BusinessDiscovery => "business_discovery",
            StageKind::DecisionMakerDiscovery => "decision_maker_discovery",
            StageKind::MarketInsights => "market_insights",
        }
    }

    /// The result set this stage writes into.
    pub fn entity(self) -> EntityKind {
        match self {
            StageKind::BusinessPersonas | StageKind::DecisionMakerPersonas => EntityKind::Persona,
            StageKind::BusinessDiscovery => EntityKind::Business,
            StageKind::DecisionMakerDiscovery => EntityKind::DecisionMaker,
            StageKind::MarketInsights => EntityKind::MarketInsight,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("stage", s))
    }
}

/// A stage result set, one table each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Persona,
    Business,
    DecisionMaker,
    MarketInsight,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Persona,
        EntityKind::Business,
        EntityKind::DecisionMaker,
        EntityKind::MarketInsight,
    ];

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Persona => "personas",
            EntityKind::Business => "businesses",
            EntityKind::DecisionMaker => "decision_makers",
            EntityKind::MarketInsight => "market_insights",
        }
    }
}
