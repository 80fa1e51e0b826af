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

// Filesystem backend implementation
//
// Layout:
//   <base>/<session_id>/<segment_id>.<ext>        segment bytes
//   <base>/<session_id>/<segment_id>.meta.json    StoreRecord

use super::backend::{SegmentMeta, StoreRecord};
use crate::config::FilesystemConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";

/// File-handle backend writing one file per segment
pub struct FilesystemBackend {
    base_path: PathBuf,
    file_extension: String,
}

impl FilesystemBackend {
    pub fn new(config: FilesystemConfig) -> Result<Self> {
        let base_path = PathBuf::from(&config.base_path);

        info!(
            "Initializing filesystem segment store at: {}",
            base_path.display()
        );

        Ok(Self {
            base_path,
            file_extension: config.file_extension,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Ensure base directory exists
    pub async fn initialize(&self) -> Result<()> {
        if !self.base_path.exists() {
            info!("Creating base directory: {}", self.base_path.display());
            fs::create_dir_all(&self.base_path)
                .await
                .context("Failed to create base directory")?;
        }
        Ok(())
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(escape(session_id))
    }

    /// Get the file path for a given segment
    pub fn data_path(&self, session_id: &str, segment_id: &str) -> PathBuf {
        let filename = format!("{}.{}", escape(segment_id), self.file_extension);
        self.session_dir(session_id).join(filename)
    }

    /// Get metadata file path for storing the record
    fn meta_path(&self, session_id: &str, segment_id: &str) -> PathBuf {
        let filename = format!("{}{}", escape(segment_id), META_SUFFIX);
        self.session_dir(session_id).join(filename)
    }

    /// Ensure session directory exists
    pub async fn ensure_session_directory(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            debug!("Creating session directory: {}", dir.display());
            fs::create_dir_all(&dir)
                .await
                .context("Failed to create session directory")?;
        }
        Ok(())
    }

    pub async fn load_index(&self) -> Result<Vec<StoreRecord>> {
        let mut records = Vec::new();
        if !self.base_path.exists() {
            return Ok(records);
        }

        let mut sessions = fs::read_dir(&self.base_path)
            .await
            .context("Failed to list segment store")?;
        while let Some(session) = sessions.next_entry().await? {
            if !session.file_type().await?.is_dir() {
                continue;
            }

            let mut entries = fs::read_dir(session.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_meta = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(META_SUFFIX));
                if !is_meta {
                    continue;
                }

                match Self::read_meta_file(&path).await {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unreadable segment record {}: {}", path.display(), e),
                }
            }
        }

        Ok(records)
    }

    /// Read one committed record straight from disk
    pub async fn lookup(&self, session_id: &str, segment_id: &str) -> Result<Option<StoreRecord>> {
        let path = self.meta_path(session_id, segment_id);
        match fs::try_exists(&path).await {
            Ok(true) => Self::read_meta_file(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e).context(format!("Failed to stat {}", path.display())),
        }
    }

    async fn read_meta_file(path: &Path) -> Result<StoreRecord> {
        let content = fs::read_to_string(path).await?;
        let record: StoreRecord =
            serde_json::from_str(&content).context("Failed to parse segment record")?;
        Ok(record)
    }

    pub async fn write(&self, record: &StoreRecord, data: &Bytes) -> Result<()> {
        self.ensure_session_directory(&record.meta.session_id).await?;

        let file_path = self.data_path(&record.meta.session_id, &record.meta.segment_id);
        debug!("Writing {} bytes to {}", data.len(), file_path.display());

        let mut file = fs::File::create(&file_path)
            .await
            .context(format!("Failed to create file: {}", file_path.display()))?;
        file.write_all(data).await.context("Failed to write data")?;
        file.flush().await.context("Failed to flush data")?;

        self.write_record(record).await
    }

    pub async fn write_record(&self, record: &StoreRecord) -> Result<()> {
        let metadata_path = self.meta_path(&record.meta.session_id, &record.meta.segment_id);
        let metadata_json =
            serde_json::to_vec_pretty(record).context("Failed to serialize segment record")?;

        // Write-then-rename so a crash never leaves a torn record behind
        let tmp_path = metadata_path.with_extension("json.tmp");
        fs::write(&tmp_path, &metadata_json).await.context(format!(
            "Failed to write metadata file: {}",
            tmp_path.display()
        ))?;
        fs::rename(&tmp_path, &metadata_path)
            .await
            .context("Failed to commit metadata file")?;
        Ok(())
    }

    pub async fn read(&self, record: &StoreRecord) -> Result<Option<Bytes>> {
        let path = self.data_path(&record.meta.session_id, &record.meta.segment_id);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read {}", path.display())),
        }
    }

    pub async fn remove(&self, meta: &SegmentMeta) -> Result<()> {
        for path in [
            self.meta_path(&meta.session_id, &meta.segment_id),
            self.data_path(&meta.session_id, &meta.segment_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(format!("Failed to remove {}", path.display())),
            }
        }

        // Drop the session directory once it is empty
        let _ = fs::remove_dir(self.session_dir(&meta.session_id)).await;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        if self.base_path.exists() {
            fs::remove_dir_all(&self.base_path)
                .await
                .context("Failed to clear segment store")?;
        }
        self.initialize().await
    }

    /// Free space on the volume holding the store
    pub fn quota_bytes(&self) -> Option<u64> {
        match fs2::available_space(&self.base_path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(
                    "Cannot query free space of {}: {}",
                    self.base_path.display(),
                    e
                );
                None
            }
        }
    }

    /// Check that the base directory is accessible and writable
    pub async fn health_check(&self) -> Result<bool> {
        match fs::metadata(&self.base_path).await {
            Ok(metadata) if metadata.is_dir() => {
                let test_file = self.base_path.join(".health_check_test");
                match fs::File::create(&test_file).await {
                    Ok(mut f) => {
                        if let Err(e) = f.write_all(b"test").await {
                            warn!("Health check failed - cannot write: {}", e);
                            return Ok(false);
                        }
                        let _ = fs::remove_file(&test_file).await;
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot create file: {}", e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!(
                    "Health check failed - base path is not a directory: {}",
                    self.base_path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access base path {}: {}",
                    self.base_path.display(),
                    e
                );
                Ok(false)
            }
        }
    }
}

/// Percent-encode an id into a single path component.
///
/// Distinct ids always map to distinct names. `.` is encoded as well so no
/// id can become `.` or `..`.
fn escape(id: &str) -> String {
    urlencoding::encode(id).replace('.', "%2E")
}
