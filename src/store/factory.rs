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

// Backend factory for creating segment store backends from configuration

use super::backend::StoreBackend;
use super::filesystem::FilesystemBackend;
use super::memory::MemoryBackend;
use super::sqlite::SqliteBackend;
use crate::config::StorageConfig;
use anyhow::{bail, Result};
use tracing::{info, warn};

pub struct BackendFactory;

impl BackendFactory {
    /// Create a store backend from configuration.
    ///
    /// `auto` prefers the filesystem, then SQLite, then memory.
    pub async fn create(config: &StorageConfig) -> Result<StoreBackend> {
        match config.backend.as_str() {
            "filesystem" => {
                let backend = FilesystemBackend::new(config.filesystem.clone())?;
                Ok(StoreBackend::Filesystem(backend))
            }

            "sqlite" => {
                let backend = SqliteBackend::new(config.sqlite.clone())?;
                Ok(StoreBackend::Sqlite(backend))
            }

            "memory" => Ok(StoreBackend::Memory(MemoryBackend::new())),

            "auto" => Ok(Self::probe(config).await),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: auto, filesystem, sqlite, memory",
                unknown
            ),
        }
    }

    async fn probe(config: &StorageConfig) -> StoreBackend {
        match FilesystemBackend::new(config.filesystem.clone()) {
            Ok(backend) => {
                let usable = match backend.initialize().await {
                    Ok(()) => backend.health_check().await.unwrap_or(false),
                    Err(e) => {
                        warn!("Filesystem segment store unavailable: {}", e);
                        false
                    }
                };
                if usable {
                    info!("Selected filesystem segment store");
                    return StoreBackend::Filesystem(backend);
                }
            }
            Err(e) => warn!("Filesystem segment store unavailable: {}", e),
        }

        match SqliteBackend::new(config.sqlite.clone()) {
            Ok(backend) => {
                info!("Selected SQLite segment store");
                return StoreBackend::Sqlite(backend);
            }
            Err(e) => warn!("SQLite segment store unavailable: {}", e),
        }

        warn!("Falling back to volatile in-memory segment store");
        StoreBackend::Memory(MemoryBackend::new())
    }
}
