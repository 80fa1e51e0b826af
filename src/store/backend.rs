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

// Storage strategy shared by every segment store backend
//
// The strategy is picked once when the store is built and never changes,
// so it is a closed enum rather than a trait object.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::filesystem::FilesystemBackend;
use super::memory::MemoryBackend;
use super::sqlite::SqliteBackend;
use crate::protocol::{Segment, SegmentWindow};

/// Composite store key `sessionId:segmentId`
pub fn store_key(session_id: &str, segment_id: &str) -> String {
    format!("{}:{}", session_id, segment_id)
}

/// Segment metadata persisted next to the bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub session_id: String,
    pub segment_id: String,
    #[serde(flatten)]
    pub window: SegmentWindow,
    pub content_type: String,
    pub created_at_ms: i64,
}

impl SegmentMeta {
    pub fn from_segment(segment: &Segment, created_at_ms: i64) -> Self {
        Self {
            session_id: segment.session_id.clone(),
            segment_id: segment.id.clone(),
            window: segment.window,
            content_type: segment.content_type.clone(),
            created_at_ms,
        }
    }

    pub fn key(&self) -> String {
        store_key(&self.session_id, &self.segment_id)
    }
}

/// Index entry of one stored segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub key: String,
    pub meta: SegmentMeta,
    /// Backend-specific location of the bytes
    pub payload: String,
    pub file_size: u64,
    pub last_accessed_ms: i64,
}

/// A segment read back from the store
#[derive(Debug, Clone)]
pub struct StoredSegment {
    pub meta: SegmentMeta,
    pub data: Bytes,
}

pub enum StoreBackend {
    Filesystem(FilesystemBackend),
    Sqlite(SqliteBackend),
    Memory(MemoryBackend),
}

impl StoreBackend {
    pub fn backend_type(&self) -> &'static str {
        match self {
            StoreBackend::Filesystem(_) => "filesystem",
            StoreBackend::Sqlite(_) => "sqlite",
            StoreBackend::Memory(_) => "memory",
        }
    }

    /// Whether stored segments survive a restart
    pub fn is_durable(&self) -> bool {
        !matches!(self, StoreBackend::Memory(_))
    }

    pub async fn initialize(&self) -> Result<()> {
        match self {
            StoreBackend::Filesystem(b) => b.initialize().await,
            StoreBackend::Sqlite(b) => on_sqlite(b, |b| b.initialize()).await,
            StoreBackend::Memory(_) => Ok(()),
        }
    }

    /// Every record currently persisted
    pub async fn load_index(&self) -> Result<Vec<StoreRecord>> {
        match self {
            StoreBackend::Filesystem(b) => b.load_index().await,
            StoreBackend::Sqlite(b) => on_sqlite(b, |b| b.load_index()).await,
            StoreBackend::Memory(b) => Ok(b.load_index()),
        }
    }

    /// Record of one segment as persisted, whether or not this process wrote it
    pub async fn lookup(&self, session_id: &str, segment_id: &str) -> Result<Option<StoreRecord>> {
        match self {
            StoreBackend::Filesystem(b) => b.lookup(session_id, segment_id).await,
            StoreBackend::Sqlite(b) => {
                let key = store_key(session_id, segment_id);
                on_sqlite(b, move |b| b.lookup(&key)).await
            }
            StoreBackend::Memory(b) => Ok(b.lookup(&store_key(session_id, segment_id))),
        }
    }

    /// Location of the bytes for `meta`
    pub fn payload_for(&self, meta: &SegmentMeta) -> String {
        match self {
            StoreBackend::Filesystem(b) => b
                .data_path(&meta.session_id, &meta.segment_id)
                .to_string_lossy()
                .to_string(),
            StoreBackend::Sqlite(_) => format!("sqlite:{}", meta.key()),
            StoreBackend::Memory(_) => format!("memory:{}", meta.key()),
        }
    }

    /// Persist bytes and record together
    pub async fn write(&self, record: &StoreRecord, data: &Bytes) -> Result<()> {
        match self {
            StoreBackend::Filesystem(b) => b.write(record, data).await,
            StoreBackend::Sqlite(b) => {
                let (record, data) = (record.clone(), data.clone());
                on_sqlite(b, move |b| b.write(&record, &data)).await
            }
            StoreBackend::Memory(b) => {
                b.write(record, data);
                Ok(())
            }
        }
    }

    /// Persist the record only; the bytes are already in place
    pub async fn write_record(&self, record: &StoreRecord) -> Result<()> {
        match self {
            StoreBackend::Filesystem(b) => b.write_record(record).await,
            StoreBackend::Sqlite(b) => {
                let record = record.clone();
                on_sqlite(b, move |b| b.write_record(&record)).await
            }
            StoreBackend::Memory(b) => b.write_record(record),
        }
    }

    pub async fn read(&self, record: &StoreRecord) -> Result<Option<Bytes>> {
        match self {
            StoreBackend::Filesystem(b) => b.read(record).await,
            StoreBackend::Sqlite(b) => {
                let key = record.key.clone();
                on_sqlite(b, move |b| b.read(&key)).await
            }
            StoreBackend::Memory(b) => Ok(b.read(&record.key)),
        }
    }

    pub async fn remove(&self, meta: &SegmentMeta) -> Result<()> {
        match self {
            StoreBackend::Filesystem(b) => b.remove(meta).await,
            StoreBackend::Sqlite(b) => {
                let key = meta.key();
                on_sqlite(b, move |b| b.remove(&key)).await
            }
            StoreBackend::Memory(b) => {
                b.remove(&meta.key());
                Ok(())
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match self {
            StoreBackend::Filesystem(b) => b.clear().await,
            StoreBackend::Sqlite(b) => on_sqlite(b, |b| b.clear()).await,
            StoreBackend::Memory(b) => {
                b.clear();
                Ok(())
            }
        }
    }

    /// Storage quota reported by the runtime, if it reports one
    pub fn quota_bytes(&self) -> Option<u64> {
        match self {
            StoreBackend::Filesystem(b) => b.quota_bytes(),
            StoreBackend::Sqlite(b) => b.quota_bytes(),
            StoreBackend::Memory(_) => None,
        }
    }

    pub async fn open_writer(&self, session_id: &str, segment_id: &str) -> Result<SegmentWriter> {
        let sink = match self {
            StoreBackend::Filesystem(b) => {
                b.ensure_session_directory(session_id).await?;
                let path = b.data_path(session_id, segment_id);
                let file = tokio::fs::File::create(&path)
                    .await
                    .context(format!("Failed to create file: {}", path.display()))?;
                WriterSink::File(file)
            }
            StoreBackend::Sqlite(_) | StoreBackend::Memory(_) => WriterSink::Buffer(Vec::new()),
        };

        Ok(SegmentWriter {
            key: store_key(session_id, segment_id),
            sink,
            written: 0,
        })
    }
}

/// Run a SQLite call on the blocking pool so a locked database never parks
/// a runtime thread
async fn on_sqlite<T, F>(backend: &SqliteBackend, op: F) -> Result<T>
where
    F: FnOnce(&SqliteBackend) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || op(&backend))
        .await
        .context("Segment database task failed")?
}

enum WriterSink {
    File(tokio::fs::File),
    Buffer(Vec<u8>),
}

/// Incremental writer for large segments.
///
/// Bytes written here do not count against the budget until the segment is
/// admitted with `SegmentStore::save_segment_meta`.
pub struct SegmentWriter {
    key: String,
    sink: WriterSink,
    written: u64,
}

impl SegmentWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.sink {
            WriterSink::File(file) => file
                .write_all(chunk)
                .await
                .context("Failed to write segment chunk")?,
            WriterSink::Buffer(buf) => buf.extend_from_slice(chunk),
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn close(self) -> Result<ClosedSegment> {
        let staged = match self.sink {
            WriterSink::File(mut file) => {
                file.flush().await.context("Failed to flush segment file")?;
                None
            }
            WriterSink::Buffer(buf) => Some(Bytes::from(buf)),
        };

        Ok(ClosedSegment {
            key: self.key,
            size: self.written,
            staged,
        })
    }
}

/// A fully written segment waiting for its metadata
pub struct ClosedSegment {
    pub(crate) key: String,
    pub(crate) size: u64,
    /// Bytes not yet handed to the backend
    pub(crate) staged: Option<Bytes>,
}

impl ClosedSegment {
    pub fn size(&self) -> u64 {
        self.size
    }
}
