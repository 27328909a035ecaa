use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeadscoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Stage error: {0}")]
    Stage(#[from] crate::stage::StageError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),

    #[error("Cancellation error: {0}")]
    Cancel(#[from] crate::cancel::CancelError),

    #[error("Service error: {0}")]
    Service(#[from] crate::service::ServiceError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Worker pool has no job handlers registered")]
    NoHandlers,

    #[error("Duplicate handler for job type '{0}'")]
    DuplicateHandler(String),

    #[error("Worker task failed: {0}")]
    Join(String),
}

/// Returned when a stored enum column holds a value this build does not know.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LeadscoutError>;
