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

// Upload ledger
//
// Durable record of segments still needing remote delivery. Every execution
// context opens its own connection to the same SQLite file; the claim
// transaction is the only place that needs mutual exclusion across them.

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::protocol::InputLogEvent;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_uploads (
    segment_id            TEXT PRIMARY KEY,
    session_id            TEXT NOT NULL,
    sequence              INTEGER NOT NULL,
    start_ms              INTEGER NOT NULL,
    end_ms                INTEGER NOT NULL,
    content_type          TEXT NOT NULL,
    logs_json             TEXT NOT NULL DEFAULT '[]',
    status                TEXT NOT NULL,
    owner                 TEXT,
    processing_started_at INTEGER,
    updated_at            INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_uploads_status
    ON pending_uploads(status, processing_started_at);
";

const COLUMNS: &str = "segment_id, session_id, sequence, start_ms, end_ms, content_type, \
                       logs_json, status, owner, processing_started_at, updated_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Processing,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Processing => "processing",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(LedgerStatus::Pending),
            "processing" => Some(LedgerStatus::Processing),
            _ => None,
        }
    }
}

/// One segment awaiting remote delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingUploadRecord {
    pub segment_id: String,
    pub session_id: String,
    pub sequence: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub content_type: String,
    pub logs: Vec<InputLogEvent>,
    pub status: LedgerStatus,
    pub owner: Option<String>,
    pub processing_started_at: Option<i64>,
    pub updated_at: i64,
}

impl PendingUploadRecord {
    /// A fresh pending record
    pub fn pending(
        segment_id: impl Into<String>,
        session_id: impl Into<String>,
        sequence: u64,
        start_ms: u64,
        end_ms: u64,
        content_type: impl Into<String>,
        logs: Vec<InputLogEvent>,
    ) -> Self {
        Self {
            segment_id: segment_id.into(),
            session_id: session_id.into(),
            sequence,
            start_ms,
            end_ms,
            content_type: content_type.into(),
            logs,
            status: LedgerStatus::Pending,
            owner: None,
            processing_started_at: None,
            updated_at: 0,
        }
    }

    /// Pending, or processing under a lease older than `stale_after_ms`
    pub fn is_claimable(&self, now_ms: i64, stale_after_ms: i64) -> bool {
        match self.status {
            LedgerStatus::Pending => true,
            LedgerStatus::Processing => match self.processing_started_at {
                Some(started) => now_ms - started > stale_after_ms,
                None => true,
            },
        }
    }
}

pub struct Ledger {
    conn: Mutex<Connection>,
    stale_after_ms: i64,
}

impl Ledger {
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let path = Path::new(&config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }

        let conn = Connection::open(path)
            .context(format!("Failed to open upload ledger {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .context("Failed to set ledger busy timeout")?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL on ledger")?;

        let ledger = Self::with_connection(conn, config.stale_after_ms)?;
        info!(
            "Upload ledger opened at {} (lease expires after {}ms)",
            path.display(),
            config.stale_after_ms
        );
        Ok(ledger)
    }

    pub fn open_in_memory(stale_after_ms: i64) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        Self::with_connection(conn, stale_after_ms)
    }

    fn with_connection(conn: Connection, stale_after_ms: i64) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create ledger schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            stale_after_ms,
        })
    }

    pub fn stale_after_ms(&self) -> i64 {
        self.stale_after_ms
    }

    /// Run `op` on the blocking pool.
    ///
    /// Every call may wait up to the busy timeout on another process's
    /// write lock; async callers go through here.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&ledger))
            .await
            .context("Ledger task failed")?
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("ledger connection poisoned"))
    }

    /// Create a pending record, or merge `record.logs` into the existing one.
    ///
    /// An existing record keeps its status and lease.
    pub fn upsert(&self, record: &PendingUploadRecord, now_ms: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT logs_json FROM pending_uploads WHERE segment_id = ?1",
                [&record.segment_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(logs_json) => {
                let mut logs: Vec<InputLogEvent> = serde_json::from_str(&logs_json)
                    .context("Corrupt log batch in ledger")?;
                logs.extend(record.logs.iter().cloned());
                tx.execute(
                    "UPDATE pending_uploads SET logs_json = ?2, updated_at = ?3
                     WHERE segment_id = ?1",
                    params![record.segment_id, serde_json::to_string(&logs)?, now_ms],
                )?;
                debug!(
                    "Merged {} log events into ledger record {}",
                    record.logs.len(),
                    record.segment_id
                );
            }
            None => {
                tx.execute(
                    "INSERT INTO pending_uploads
                        (segment_id, session_id, sequence, start_ms, end_ms, content_type,
                         logs_json, status, owner, processing_started_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', NULL, NULL, ?8)",
                    params![
                        record.segment_id,
                        record.session_id,
                        record.sequence as i64,
                        record.start_ms as i64,
                        record.end_ms as i64,
                        record.content_type,
                        serde_json::to_string(&record.logs)?,
                        now_ms,
                    ],
                )?;
                debug!("Ledger record created for {}", record.segment_id);
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, segment_id: &str) -> Result<Option<PendingUploadRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_uploads WHERE segment_id = ?1"),
                [segment_id],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Remove a record; returns whether it existed
    pub fn delete(&self, segment_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM pending_uploads WHERE segment_id = ?1", [segment_id])?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> Result<Vec<PendingUploadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM pending_uploads ORDER BY updated_at, session_id, sequence"
        ))?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Atomically take the lease on a record.
    ///
    /// Returns the claimed record, or `None` when it does not exist or is
    /// held by a lease that has not expired yet.
    pub fn claim(
        &self,
        segment_id: &str,
        owner: &str,
        now_ms: i64,
    ) -> Result<Option<PendingUploadRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_uploads WHERE segment_id = ?1"),
                [segment_id],
                read_record,
            )
            .optional()?;

        let Some(mut record) = current else {
            return Ok(None);
        };
        if !record.is_claimable(now_ms, self.stale_after_ms) {
            debug!(
                "Ledger record {} is leased by {:?}",
                segment_id, record.owner
            );
            return Ok(None);
        }
        if record.status == LedgerStatus::Processing {
            info!(
                "Taking over stale lease on {} from {:?}",
                segment_id, record.owner
            );
        }

        tx.execute(
            "UPDATE pending_uploads
             SET status = 'processing', owner = ?2, processing_started_at = ?3, updated_at = ?3
             WHERE segment_id = ?1",
            params![segment_id, owner, now_ms],
        )?;
        tx.commit()?;

        record.status = LedgerStatus::Processing;
        record.owner = Some(owner.to_string());
        record.processing_started_at = Some(now_ms);
        record.updated_at = now_ms;
        Ok(Some(record))
    }

    /// Hand a claimed record back to `pending`; only its owner may do so
    pub fn release(&self, segment_id: &str, owner: &str, now_ms: i64) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE pending_uploads
             SET status = 'pending', owner = NULL, processing_started_at = NULL, updated_at = ?3
             WHERE segment_id = ?1 AND owner = ?2 AND status = 'processing'",
            params![segment_id, owner, now_ms],
        )?;
        Ok(changed > 0)
    }

    /// Renew the lease held by `owner`
    pub fn heartbeat(&self, segment_id: &str, owner: &str, now_ms: i64) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE pending_uploads
             SET processing_started_at = ?3, updated_at = ?3
             WHERE segment_id = ?1 AND owner = ?2 AND status = 'processing'",
            params![segment_id, owner, now_ms],
        )?;
        Ok(changed > 0)
    }

    /// Add events to an existing record's batch; returns whether it exists
    pub fn append_logs(
        &self,
        segment_id: &str,
        logs: &[InputLogEvent],
        now_ms: i64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT logs_json FROM pending_uploads WHERE segment_id = ?1",
                [segment_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(logs_json) = existing else {
            return Ok(false);
        };

        let mut merged: Vec<InputLogEvent> =
            serde_json::from_str(&logs_json).context("Corrupt log batch in ledger")?;
        merged.extend_from_slice(logs);
        tx.execute(
            "UPDATE pending_uploads SET logs_json = ?2, updated_at = ?3 WHERE segment_id = ?1",
            params![segment_id, serde_json::to_string(&merged)?, now_ms],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Replace the buffered log batch
    pub fn set_logs(&self, segment_id: &str, logs: &[InputLogEvent], now_ms: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE pending_uploads SET logs_json = ?2, updated_at = ?3 WHERE segment_id = ?1",
            params![segment_id, serde_json::to_string(logs)?, now_ms],
        )?;
        Ok(())
    }

    /// Records a sweep may try to claim right now
    pub fn sweep_candidates(&self, now_ms: i64) -> Result<Vec<PendingUploadRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.is_claimable(now_ms, self.stale_after_ms))
            .collect())
    }
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<PendingUploadRecord> {
    let logs_json: String = row.get(6)?;
    let logs = serde_json::from_str(&logs_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    let status_text: String = row.get(7)?;
    let status = LedgerStatus::parse(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            Type::Text,
            format!("unknown ledger status '{}'", status_text).into(),
        )
    })?;

    Ok(PendingUploadRecord {
        segment_id: row.get(0)?,
        session_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        start_ms: row.get::<_, i64>(3)? as u64,
        end_ms: row.get::<_, i64>(4)? as u64,
        content_type: row.get(5)?,
        logs,
        status,
        owner: row.get(8)?,
        processing_started_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
