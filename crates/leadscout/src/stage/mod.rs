//! Generation stages.
//!
//! A stage is an opaque asynchronous operation that reads the search and the
//! results of earlier stages, and writes records of its own through a
//! [`RecordSink`]. [`StageInvoker`] wraps every run with the same contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DatabaseError;
use crate::search::Orientation;

pub mod http;
pub mod invoker;
pub mod kind;
pub mod record;
pub mod sink;

pub use http::HttpStageRunner;
pub use invoker::{StageInvoker, StageReport};
pub use kind::{EntityKind, StageKind};
pub use record::{ResultRecord, StageRecord};
pub use sink::RecordSink;

#[derive(Error, Debug)]
pub enum StageError {
    /// Worth retrying: network trouble, provider overload, timeouts.
    #[error("{stage} failed transiently: {message}")]
    Transient { stage: StageKind, message: String },

    /// Retrying will not help.
    #[error("{stage} failed: {message}")]
    Terminal { stage: StageKind, message: String },

    /// An upstream result set the stage depends on is empty.
    #[error("{stage} cannot run: {what}")]
    MissingInput { stage: StageKind, what: String },

    #[error("{stage} could not store its results: {source}")]
    Store {
        stage: StageKind,
        #[source]
        source: DatabaseError,
    },
}

impl StageError {
    pub fn transient(stage: StageKind, message: impl Into<String>) -> Self {
        StageError::Transient {
            stage,
            message: message.into(),
        }
    }

    pub fn terminal(stage: StageKind, message: impl Into<String>) -> Self {
        StageError::Terminal {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Transient { stage, .. }
            | StageError::Terminal { stage, .. }
            | StageError::MissingInput { stage, .. }
            | StageError::Store { stage, .. } => *stage,
        }
    }

    /// Whether a later attempt might succeed. Store errors count as
    /// transient since they are usually lock contention.
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient { .. } | StageError::Store { .. })
    }
}

/// Everything a stage may read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageContext {
    pub search_id: String,
    pub stage: StageKind,
    pub orientation: Orientation,
    pub product: String,
    pub industries: Vec<String>,
    pub countries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub business_personas: Vec<ResultRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_maker_personas: Vec<ResultRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub businesses: Vec<ResultRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_makers: Vec<ResultRecord>,
}

/// One generation stage.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Produces this stage's records. Each record must go through `sink`
    /// as soon as it exists so observers see it immediately.
    async fn run(&self, ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError>;
}
