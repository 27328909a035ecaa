use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes tracing output.
///
/// - Filter: `RUST_LOG` if set, otherwise `config.filter`
/// - Output: human-readable by default, JSON lines when `config.json` is set
/// - `log` records from store code are forwarded into tracing
///
/// Safe to call more than once; later calls are ignored.
pub fn init(config: &LoggingConfig) {
    // Fails only if a logger is already installed.
    let _ = tracing_log::LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_target(true).with_current_span(true)),
        )
    } else {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(true).compact()),
        )
    };

    if result.is_ok() {
        tracing::debug!("Tracing initialized");
    }
}
