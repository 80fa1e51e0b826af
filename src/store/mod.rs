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

// Segment store module
//
// Persists segment bytes and metadata under a byte budget. The backend
// (filesystem, SQLite or memory) is chosen once at construction. Before new
// bytes are admitted, least-recently-accessed segments are evicted until
// the budget holds, and the evicted segment ids are announced to listeners.

pub mod backend;
pub mod factory;
pub mod filesystem;
pub mod memory;
pub mod sqlite;

pub use backend::{
    store_key, ClosedSegment, SegmentMeta, SegmentWriter, StoreBackend, StoreRecord,
    StoredSegment,
};
pub use factory::BackendFactory;
pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use anyhow::{bail, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::listeners::{Listeners, Subscription};

/// Share of the reported storage quota used when no budget is configured
pub const QUOTA_FRACTION: f64 = 0.5;

/// Budget used when the runtime reports no quota
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

/// Resolve the byte budget from configuration and the reported quota
pub fn resolve_budget(configured: Option<u64>, quota: Option<u64>) -> u64 {
    match (configured, quota) {
        (Some(bytes), _) => bytes,
        (None, Some(quota)) => ((quota as f64) * QUOTA_FRACTION) as u64,
        (None, None) => DEFAULT_MAX_BYTES,
    }
}

pub struct SegmentStore {
    backend: StoreBackend,
    budget_bytes: u64,
    clock: Arc<dyn Clock>,
    // Held across check-evict-write so admissions are atomic
    index: Mutex<HashMap<String, StoreRecord>>,
    evictions: Listeners<Vec<String>>,
}

impl SegmentStore {
    /// Build a store from configuration
    pub async fn from_config(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let backend = BackendFactory::create(config).await?;
        Self::open(backend, config.max_bytes, clock).await
    }

    /// Open a store over `backend`, loading whatever it already holds
    pub async fn open(
        backend: StoreBackend,
        max_bytes: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        backend.initialize().await?;

        let records = backend.load_index().await?;
        let usage: u64 = records.iter().map(|r| r.file_size).sum();
        let quota = backend.quota_bytes().map(|free| free + usage);
        let budget_bytes = resolve_budget(max_bytes, quota);

        info!(
            "Segment store ready: backend={} (durable={}), {} segments, {} / {} bytes",
            backend.backend_type(),
            backend.is_durable(),
            records.len(),
            usage,
            budget_bytes
        );

        let store = Self {
            backend,
            budget_bytes,
            clock,
            index: Mutex::new(records.into_iter().map(|r| (r.key.clone(), r)).collect()),
            evictions: Listeners::new(),
        };

        // A smaller budget than last run still has to hold
        let evicted = {
            let mut index = store.index.lock().await;
            store.make_room(&mut index, 0, None).await
        };
        store.announce(evicted);

        Ok(store)
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Register for the segment ids removed by each eviction pass
    pub fn on_evicted<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<String>) + Send + Sync + 'static,
    {
        self.evictions.subscribe(listener)
    }

    /// Store a complete segment
    pub async fn save_segment(&self, meta: SegmentMeta, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        self.check_fits(&meta, size)?;

        let key = meta.key();
        let (evicted, written) = {
            let mut index = self.index.lock().await;
            let evicted = self.make_room(&mut index, size, Some(&key)).await;

            let record = StoreRecord {
                payload: self.backend.payload_for(&meta),
                key: key.clone(),
                meta,
                file_size: size,
                last_accessed_ms: self.clock.now_ms(),
            };
            let written = self.backend.write(&record, &data).await;
            if written.is_ok() {
                index.insert(key, record);
            }
            (evicted, written)
        };

        // Evicted segments are gone whether or not the write landed
        self.announce(evicted);
        written
    }

    /// Start streaming a large segment
    pub async fn open_segment_writer(
        &self,
        session_id: &str,
        segment_id: &str,
    ) -> Result<SegmentWriter> {
        self.backend.open_writer(session_id, segment_id).await
    }

    /// Admit a segment written through `open_segment_writer`
    pub async fn save_segment_meta(&self, meta: SegmentMeta, closed: ClosedSegment) -> Result<()> {
        let key = meta.key();
        if closed.key != key {
            bail!(
                "writer for '{}' cannot be committed as '{}'",
                closed.key,
                key
            );
        }

        if let Err(e) = self.check_fits(&meta, closed.size) {
            if let Err(cleanup) = self.backend.remove(&meta).await {
                warn!("Failed to discard oversized segment '{}': {}", key, cleanup);
            }
            return Err(e);
        }

        let (evicted, written) = {
            let mut index = self.index.lock().await;
            let evicted = self.make_room(&mut index, closed.size, Some(&key)).await;

            let record = StoreRecord {
                payload: self.backend.payload_for(&meta),
                key: key.clone(),
                meta,
                file_size: closed.size,
                last_accessed_ms: self.clock.now_ms(),
            };
            let written = match &closed.staged {
                Some(data) => self.backend.write(&record, data).await,
                None => self.backend.write_record(&record).await,
            };
            if written.is_ok() {
                index.insert(key, record);
            }
            (evicted, written)
        };

        self.announce(evicted);
        written
    }

    /// Read a segment and mark it as recently used.
    ///
    /// Segments saved by another store over the same backend after this one
    /// opened are found on the backend and adopted into the index.
    pub async fn get_segment(
        &self,
        session_id: &str,
        segment_id: &str,
    ) -> Result<Option<StoredSegment>> {
        let key = store_key(session_id, segment_id);
        let mut index = self.index.lock().await;

        let (record, adopted) = match index.get(&key).cloned() {
            Some(record) => (record, false),
            None => match self.backend.lookup(session_id, segment_id).await? {
                Some(record) => {
                    debug!("Adopting segment '{}' written by another store", key);
                    (record, true)
                }
                None => return Ok(None),
            },
        };

        let Some(data) = self.backend.read(&record).await? else {
            warn!("Segment '{}' lost its bytes, dropping record", key);
            index.remove(&key);
            if let Err(e) = self.backend.remove(&record.meta).await {
                warn!("Failed to drop orphaned record '{}': {}", key, e);
            }
            return Ok(None);
        };

        let mut touched = record;
        touched.last_accessed_ms = self.clock.now_ms();
        if let Err(e) = self.backend.write_record(&touched).await {
            warn!("Failed to persist access time of '{}': {}", key, e);
        }
        let meta = touched.meta.clone();
        index.insert(key.clone(), touched);

        let evicted = if adopted {
            self.make_room(&mut index, 0, Some(&key)).await
        } else {
            Vec::new()
        };
        drop(index);
        self.announce(evicted);

        Ok(Some(StoredSegment { meta, data }))
    }

    /// Remove a segment; returns whether it was stored
    pub async fn delete_segment(&self, session_id: &str, segment_id: &str) -> Result<bool> {
        let key = store_key(session_id, segment_id);
        let mut index = self.index.lock().await;
        match index.remove(&key) {
            Some(record) => {
                self.backend.remove(&record.meta).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every stored segment, ordered by start time
    pub async fn list_segments(&self) -> Vec<SegmentMeta> {
        let index = self.index.lock().await;
        let mut metas: Vec<SegmentMeta> = index.values().map(|r| r.meta.clone()).collect();
        metas.sort_by(|a, b| {
            (a.window.record_start_ms, &a.session_id, a.window.sequence).cmp(&(
                b.window.record_start_ms,
                &b.session_id,
                b.window.sequence,
            ))
        });
        metas
    }

    pub async fn contains(&self, session_id: &str, segment_id: &str) -> bool {
        self.index
            .lock()
            .await
            .contains_key(&store_key(session_id, segment_id))
    }

    pub async fn clear(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        self.backend.clear().await?;
        index.clear();
        info!("Segment store cleared");
        Ok(())
    }

    pub async fn usage_bytes(&self) -> u64 {
        self.index.lock().await.values().map(|r| r.file_size).sum()
    }

    fn check_fits(&self, meta: &SegmentMeta, size: u64) -> Result<()> {
        if size > self.budget_bytes {
            bail!(
                "segment '{}' ({} bytes) exceeds the store budget of {} bytes",
                meta.segment_id,
                size,
                self.budget_bytes
            );
        }
        Ok(())
    }

    /// Evict least-recently-accessed records until `incoming` more bytes fit.
    ///
    /// `replacing` is the key about to be overwritten; its current size is
    /// not counted and it is never evicted.
    async fn make_room(
        &self,
        index: &mut HashMap<String, StoreRecord>,
        incoming: u64,
        replacing: Option<&str>,
    ) -> Vec<String> {
        let mut usage: u64 = index
            .values()
            .filter(|r| Some(r.key.as_str()) != replacing)
            .map(|r| r.file_size)
            .sum();
        if usage + incoming <= self.budget_bytes {
            return Vec::new();
        }

        let mut candidates: Vec<(i64, i64, String)> = index
            .values()
            .filter(|r| Some(r.key.as_str()) != replacing)
            .map(|r| (r.last_accessed_ms, r.meta.created_at_ms, r.key.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, _, key) in candidates {
            if usage + incoming <= self.budget_bytes {
                break;
            }
            let Some(record) = index.remove(&key) else {
                continue;
            };
            if let Err(e) = self.backend.remove(&record.meta).await {
                warn!("Failed to evict segment '{}': {}", key, e);
            }
            usage -= record.file_size;
            debug!(
                "Evicted segment '{}' ({} bytes, last accessed {})",
                key, record.file_size, record.last_accessed_ms
            );
            evicted.push(record.meta.segment_id);
        }

        evicted
    }

    fn announce(&self, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        info!("Evicted {} segments to stay within budget", evicted.len());
        self.evictions.emit(&evicted);
    }
}
