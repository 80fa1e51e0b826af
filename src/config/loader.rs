// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<RelayConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: RelayConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${RELAY_API_URL:-http://localhost:8080} -> http://localhost:8080 (if unset)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    pub fn validate(config: &RelayConfig) -> Result<()> {
        let recorder = &config.recorder;
        if recorder.segment_duration_ms == 0 {
            bail!("recorder.segment_duration_ms must be > 0");
        }

        if recorder.overlap_ms >= recorder.segment_duration_ms {
            bail!("recorder.overlap_ms must be smaller than recorder.segment_duration_ms");
        }

        if recorder.content_type.is_empty() {
            bail!("recorder.content_type cannot be empty");
        }

        match config.storage.backend.as_str() {
            "auto" | "filesystem" | "sqlite" | "memory" => {}
            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: auto, filesystem, sqlite, memory",
                unknown
            ),
        }

        if config.storage.max_bytes == Some(0) {
            bail!("storage.max_bytes must be > 0 when set");
        }

        if config.ledger.stale_after_ms <= 0 {
            bail!("ledger.stale_after_ms must be > 0");
        }

        let upload = &config.upload;
        if upload.base_delay_ms == 0 {
            bail!("upload.base_delay_ms must be > 0");
        }

        if upload.max_delay_ms < upload.base_delay_ms {
            bail!("upload.max_delay_ms must be >= upload.base_delay_ms");
        }

        if upload.heartbeat_ms == 0 || upload.heartbeat_ms as i64 >= config.ledger.stale_after_ms {
            bail!("upload.heartbeat_ms must be > 0 and shorter than ledger.stale_after_ms");
        }

        if upload.chunk_size_bytes == 0 {
            bail!("upload.chunk_size_bytes must be > 0");
        }

        if upload.context_tag.is_empty() {
            bail!("upload.context_tag cannot be empty");
        }

        let share = config.network.upload_bandwidth_share;
        if !(share > 0.0 && share <= 1.0) {
            bail!("network.upload_bandwidth_share must be in (0, 1]");
        }

        Ok(())
    }
}
