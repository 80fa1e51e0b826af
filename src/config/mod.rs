// Configuration module for segment-relay
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Allow environment variables to override config values
pub fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(url) = std::env::var("RELAY_API_URL") {
        config.upload.api.url = url;
    }

    if let Ok(token) = std::env::var("RELAY_API_TOKEN") {
        config.upload.api.api_token = Some(token);
    }

    if let Ok(tag) = std::env::var("RELAY_CONTEXT_TAG") {
        config.upload.context_tag = tag;
    }

    if let Ok(path) = std::env::var("RELAY_LEDGER_PATH") {
        config.ledger.path = path;
    }
}
