use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kind::{EntityKind, StageKind};

/// A record produced by a stage, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub title: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StageRecord {
    pub fn new(title: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            data,
        }
    }
}

/// A stored row from one of the result-set tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub search_id: String,
    pub entity: EntityKind,
    pub stage: StageKind,
    pub title: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
