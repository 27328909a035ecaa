pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod reaper;
pub mod search;
pub mod service;
pub mod stage;

pub use cancel::{CancelError, Cancelled, CancellationHandler};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, LeadscoutError, Result, WorkerError};
pub use idempotency::{IdempotencyCache, Reservation};
pub use orchestrator::{OrchestrateHandler, Orchestrator, OrchestratorError, RunOutcome, StageSet};
pub use progress::{ProgressReporter, ProgressSnapshot, SearchEvent, SearchEventBroadcaster};
pub use queue::{JobHandler, JobOutcome, JobStore, WorkerPool};
pub use reaper::{Reaper, ReaperReport, ReaperScheduler};
pub use search::{NewSearch, Orientation, Search, SearchPhase, SearchStatus};
pub use service::{JobPage, RunMode, SearchService, ServiceError, StartOutcome};
pub use stage::{HttpStageRunner, StageError, StageKind, StageRunner};
