mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use leadscout::config::{load_config, Config};
use leadscout::{
    logging, Database, HttpStageRunner, LeadscoutError, ReaperScheduler, SearchService, StageRunner,
    StageSet, WorkerPool,
};
use log::{error, info};
use thiserror::Error;
use tokio::sync::broadcast;

use state::AppState;

const CONFIG_ENV: &str = "LEADSCOUT_CONFIG";

#[derive(Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Leadscout(#[from] LeadscoutError),

    #[error("No database path configured and no home directory to default to")]
    NoDatabasePath,

    #[error("Invalid bind address '{0}'")]
    InvalidBind(String),

    #[error("Failed to build provider client: {0}")]
    ProviderClient(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Config file from the first argument, then `LEADSCOUT_CONFIG`.
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn load() -> Result<Config, LeadscoutError> {
    match config_path() {
        Some(path) => Ok(load_config(path)?),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("leadscout-server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("leadscout-server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    info!("Starting leadscout-server v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config
        .resolved_database_path()
        .ok_or(StartupError::NoDatabasePath)?;
    info!("Using database at {:?}", db_path);
    let db = Database::open(&db_path).map_err(LeadscoutError::from)?;

    let runners = HttpStageRunner::all_from_config(&config.providers)
        .map_err(|e| StartupError::ProviderClient(e.to_string()))?;
    let stages = StageSet::from_runners(
        runners
            .into_iter()
            .map(|runner| Arc::new(runner) as Arc<dyn StageRunner>),
    );
    let service = SearchService::new(db, &config.policy, stages);

    let pool = WorkerPool::start(
        service.job_store().clone(),
        service.job_handlers(),
        &config.workers,
    )
    .map_err(LeadscoutError::from)?;

    let scheduler = ReaperScheduler::new(service.reaper().clone(), config.reaper.interval());
    // Keep the sender alive so the scheduler's trigger channel stays open.
    let (_reap_trigger, reap_rx) = broadcast::channel::<()>(4);
    let reaper_handle = scheduler.start(reap_rx);

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|_| StartupError::InvalidBind(config.server.bind.clone()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("leadscout-server listening on http://{}", addr);

    let app = routes::router(AppState::new(service));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop();
    if let Err(e) = reaper_handle.await {
        error!("Reaper scheduler task failed: {}", e);
    }
    pool.shutdown();
    pool.wait().await.map_err(LeadscoutError::from)?;

    served?;
    info!("leadscout-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
