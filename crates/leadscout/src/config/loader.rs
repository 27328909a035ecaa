use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    let policy = &config.policy;
    if policy.max_attempts == 0 {
        return Err(invalid("policy.max_attempts must be at least 1"));
    }
    if policy.stuck_task_threshold_secs == 0 {
        return Err(invalid("policy.stuck_task_threshold_secs must be positive"));
    }
    if policy.idempotency_ttl_secs == 0 {
        return Err(invalid("policy.idempotency_ttl_secs must be positive"));
    }

    if config.workers.count == 0 {
        return Err(invalid("workers.count must be at least 1"));
    }
    if config.workers.poll_interval_ms == 0 {
        return Err(invalid("workers.poll_interval_ms must be positive"));
    }
    if config.reaper.interval_secs == 0 {
        return Err(invalid("reaper.interval_secs must be positive"));
    }

    if config
        .server
        .bind
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        return Err(invalid(format!(
            "server.bind is not a socket address: {}",
            config.server.bind
        )));
    }

    let base_url = &config.providers.base_url;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(invalid(format!(
            "providers.base_url must be an http(s) URL: {}",
            base_url
        )));
    }
    if config.providers.timeout_secs == 0 {
        return Err(invalid("providers.timeout_secs must be positive"));
    }

    Ok(())
}
