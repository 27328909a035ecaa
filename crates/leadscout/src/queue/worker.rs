use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::job::ClaimedJob;
use super::store::JobStore;
use crate::config::WorkersConfig;
use crate::error::WorkerError;

/// How a handler finished with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Work done; the optional value is stored on the job.
    Completed(Option<serde_json::Value>),
    /// Try again later, if attempts remain.
    Retry(String),
    /// Give up now.
    Failed(String),
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn execute(&self, claimed: &ClaimedJob) -> JobOutcome;
}

type HandlerMap = HashMap<&'static str, Arc<dyn JobHandler>>;

/// A fixed set of async workers polling the job store.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.count` workers on the current tokio runtime.
    pub fn start(
        store: JobStore,
        handlers: Vec<Arc<dyn JobHandler>>,
        config: &WorkersConfig,
    ) -> Result<Self, WorkerError> {
        if config.count == 0 {
            return Err(WorkerError::NoWorkers);
        }
        if handlers.is_empty() {
            return Err(WorkerError::NoHandlers);
        }

        let mut map: HandlerMap = HashMap::new();
        for handler in handlers {
            let job_type = handler.job_type();
            if map.insert(job_type, handler).is_some() {
                return Err(WorkerError::DuplicateHandler(job_type.to_string()));
            }
        }
        let handlers = Arc::new(map);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let poll_interval = config.poll_interval();

        let workers = (0..config.count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    store.clone(),
                    Arc::clone(&handlers),
                    poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!("Started {} workers", config.count);

        Ok(Self { shutdown, workers })
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Waits for every worker to stop. Call [`WorkerPool::shutdown`] first.
    pub async fn wait(self) -> Result<(), WorkerError> {
        let mut first_error = None;
        for (i, worker) in self.workers.into_iter().enumerate() {
            match worker.await {
                Ok(()) => debug!("Worker {} finished", i),
                Err(e) => {
                    error!("Worker {} panicked: {}", i, e);
                    first_error.get_or_insert(WorkerError::Join(e.to_string()));
                }
            }
        }

        info!("All workers have stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_worker(
    worker_id: usize,
    store: JobStore,
    handlers: Arc<HandlerMap>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} started", worker_id);
    let job_types: Vec<&str> = handlers.keys().copied().collect();

    loop {
        if *shutdown.borrow() {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let claimed = match store.claim(&job_types) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("Worker {} failed to claim a job: {}", worker_id, e);
                None
            }
        };

        let Some(claimed) = claimed else {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        let Some(handler) = handlers.get(claimed.job.job_type.as_str()) else {
            // Unreachable while claims are filtered by the handler map.
            warn!("No handler for job type {}", claimed.job.job_type);
            continue;
        };

        debug!(
            "Worker {} processing job {} ({})",
            worker_id, claimed.job.id, claimed.job.job_type
        );
        let outcome = AssertUnwindSafe(handler.execute(&claimed))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| JobOutcome::Retry("job handler panicked".to_string()));

        settle(&store, &claimed, outcome);
    }

    debug!("Worker {} stopped", worker_id);
}

/// Writes a handler's outcome back to the store.
pub fn settle(store: &JobStore, claimed: &ClaimedJob, outcome: JobOutcome) {
    let job_id = &claimed.job.id;
    let result = match outcome {
        JobOutcome::Completed(value) => store.complete(job_id, value.as_ref()).map(|_| ()),
        JobOutcome::Retry(error) => store.fail(job_id, &error).map(|_| ()),
        JobOutcome::Failed(error) => store.fail_permanently(job_id, &error).map(|_| ()),
    };
    if let Err(e) = result {
        error!("Failed to record outcome of job {}: {}", job_id, e);
    }
}
