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

// Structured-record backend: one SQLite row per segment, bytes in a BLOB column

use super::backend::{SegmentMeta, StoreRecord};
use crate::config::SqliteConfig;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS segments (
    key              TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    segment_id       TEXT NOT NULL,
    meta_json        TEXT NOT NULL,
    data             BLOB NOT NULL,
    file_size        INTEGER NOT NULL,
    last_accessed_ms INTEGER NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteBackend {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn new(config: SqliteConfig) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        info!("Opening SQLite segment store at: {}", path.display());
        let conn = Connection::open(&path)
            .context(format!("Failed to open segment database {}", path.display()))?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL")?;

        Ok(Self {
            path: Some(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("segment database connection poisoned"))
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn()?
            .execute_batch(SCHEMA)
            .context("Failed to create segments table")?;
        Ok(())
    }

    pub fn load_index(&self) -> Result<Vec<StoreRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, meta_json, file_size, last_accessed_ms FROM segments",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, meta_json, file_size, last_accessed_ms) = row?;
            match to_record(key.clone(), &meta_json, file_size, last_accessed_ms) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable segment row '{}': {}", key, e),
            }
        }
        Ok(records)
    }

    /// Read one row's record without its bytes
    pub fn lookup(&self, key: &str) -> Result<Option<StoreRecord>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT meta_json, file_size, last_accessed_ms FROM segments WHERE key = ?1",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((meta_json, file_size, last_accessed_ms)) => {
                to_record(key.to_string(), &meta_json, file_size, last_accessed_ms).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn write(&self, record: &StoreRecord, data: &Bytes) -> Result<()> {
        let meta_json = serde_json::to_string(&record.meta)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO segments
                    (key, session_id, segment_id, meta_json, data, file_size, last_accessed_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.key,
                    record.meta.session_id,
                    record.meta.segment_id,
                    meta_json,
                    data.as_ref(),
                    record.file_size as i64,
                    record.last_accessed_ms,
                ],
            )
            .context("Failed to write segment row")?;
        Ok(())
    }

    pub fn write_record(&self, record: &StoreRecord) -> Result<()> {
        let meta_json = serde_json::to_string(&record.meta)?;
        let changed = self.conn()?.execute(
            "UPDATE segments SET meta_json = ?2, file_size = ?3, last_accessed_ms = ?4
             WHERE key = ?1",
            params![
                record.key,
                meta_json,
                record.file_size as i64,
                record.last_accessed_ms
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("segment row '{}' does not exist", record.key));
        }
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Option<Bytes>> {
        let data: Option<Vec<u8>> = self
            .conn()?
            .query_row("SELECT data FROM segments WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(data.map(Bytes::from))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM segments WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.conn()?.execute("DELETE FROM segments", [])?;
        Ok(())
    }

    /// Free space on the volume holding the database
    pub fn quota_bytes(&self) -> Option<u64> {
        let dir = self
            .path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(dir).ok()
    }
}

fn to_record(
    key: String,
    meta_json: &str,
    file_size: i64,
    last_accessed_ms: i64,
) -> Result<StoreRecord> {
    let meta: SegmentMeta =
        serde_json::from_str(meta_json).context("Failed to parse segment row metadata")?;
    Ok(StoreRecord {
        payload: format!("sqlite:{}", key),
        key,
        meta,
        file_size: file_size.max(0) as u64,
        last_accessed_ms,
    })
}
