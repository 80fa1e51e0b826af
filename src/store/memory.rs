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

// Volatile fallback backend; contents are lost when the process exits

use super::backend::StoreRecord;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, (StoreRecord, Bytes)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_index(&self) -> Vec<StoreRecord> {
        self.entries
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    pub fn write(&self, record: &StoreRecord, data: &Bytes) {
        self.entries
            .insert(record.key.clone(), (record.clone(), data.clone()));
    }

    pub fn write_record(&self, record: &StoreRecord) -> Result<()> {
        match self.entries.get_mut(&record.key) {
            Some(mut entry) => {
                entry.0 = record.clone();
                Ok(())
            }
            None => Err(anyhow!("segment '{}' is not stored", record.key)),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<StoreRecord> {
        self.entries.get(key).map(|entry| entry.0.clone())
    }

    pub fn read(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.1.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
