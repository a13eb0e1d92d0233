pub mod coordinator;

pub use coordinator::{
    parse_config, validate_config, AddressEntry, ClusterEntry, CoordinatorConfig,
    CoordinatorConfigError, DriverConfig, NetworkEntry, SeededBackends, ServerConfig,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Coordinator(#[from] CoordinatorConfigError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a coordinator config file from disk.
pub fn load_config_file(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = CoordinatorConfig::from_str(&content)?;
    Ok(config)
}
