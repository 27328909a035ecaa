pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, validate_config};
pub use schema::{
    Config, LoggingConfig, PolicyConfig, ProvidersConfig, ReaperConfig, ServerConfig,
    WorkersConfig,
};

impl Config {
    /// The configured database path, or the platform default.
    pub fn resolved_database_path(&self) -> Option<std::path::PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}
