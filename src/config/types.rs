// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Configuration types for segment-relay

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub recorder: RecorderSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Segment timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    /// Core window length D
    #[serde(default = "default_segment_duration")]
    pub segment_duration_ms: u64,

    /// Overlap O added at each cut boundary
    #[serde(default = "default_overlap")]
    pub overlap_ms: u64,

    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            segment_duration_ms: default_segment_duration(),
            overlap_ms: default_overlap(),
            content_type: default_content_type(),
        }
    }
}

impl RecorderSettings {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn overlap(&self) -> Duration {
        Duration::from_millis(self.overlap_ms)
    }
}

/// Segment store configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "auto", "filesystem", "sqlite", "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Explicit byte budget; derived from the storage quota when absent
    #[serde(default)]
    pub max_bytes: Option<u64>,

    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_bytes: None,
            filesystem: FilesystemConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: String,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: "/var/lib/segment-relay/segments".to_string(),
            file_extension: default_file_extension(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteConfig {
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/segment-relay/segments.db".to_string(),
        }
    }
}

/// Durable upload ledger shared by every execution context
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,

    /// Lease expiry for `processing` records
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: i64,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            stale_after_ms: default_stale_after(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Identifies this execution context as a lease owner
    #[serde(default = "default_context_tag")]
    pub context_tag: String,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Interval of `segment-processing` events and lease renewal
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    /// Transfer body chunk size, each chunk draws from the token bucket
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            context_tag: default_context_tag(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_retries(),
            heartbeat_ms: default_heartbeat(),
            chunk_size_bytes: default_chunk_size(),
            api: ApiConfig::default(),
        }
    }
}

impl UploadConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/api/v1".to_string(),
            api_token: None,
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Share of the conservative bandwidth estimate granted to uploads
    /// while the interactive stream is active
    #[serde(default = "default_bandwidth_share")]
    pub upload_bandwidth_share: f64,

    /// Allowance when no estimate is available; unthrottled when absent
    #[serde(default)]
    pub default_rate_bps: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval(),
            upload_bandwidth_share: default_bandwidth_share(),
            default_rate_bps: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_segment_duration() -> u64 { 10_000 }
fn default_overlap() -> u64 { 1_000 }
fn default_content_type() -> String { "video/webm".to_string() }
fn default_backend() -> String { "auto".to_string() }
fn default_file_extension() -> String { "seg".to_string() }
fn default_ledger_path() -> String { "/var/lib/segment-relay/ledger.db".to_string() }
fn default_stale_after() -> i64 { 60_000 }
fn default_busy_timeout() -> u64 { 5_000 }
fn default_context_tag() -> String { format!("ctx-{}", std::process::id()) }
fn default_base_delay() -> u64 { 1_000 }
fn default_max_delay() -> u64 { 4_000 }
fn default_retries() -> u32 { 3 }
fn default_heartbeat() -> u64 { 10_000 }
fn default_chunk_size() -> usize { 64 * 1024 }
fn default_timeout() -> u64 { 300 }
fn default_sample_interval() -> u64 { 2_000 }
fn default_bandwidth_share() -> f64 { 0.25 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
