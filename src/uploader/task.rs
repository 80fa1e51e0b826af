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

use bytes::Bytes;

use crate::api::{DestinationRequest, UploadDestination};
use crate::ledger::PendingUploadRecord;
use crate::protocol::{InputLogEvent, SegmentWindow};

/// Steps of the delivery protocol already completed for a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadProgress {
    pub destination: Option<UploadDestination>,
    pub destination_obtained_at: Option<i64>,
    pub bytes_uploaded: bool,
    pub completion_notified: bool,
}

impl UploadProgress {
    /// Whether the presigned destination can no longer be used at `now_ms`
    pub fn destination_expired(&self, now_ms: i64) -> bool {
        match (&self.destination, self.destination_obtained_at) {
            (Some(destination), Some(obtained_at)) => match destination.expires_in {
                Some(secs) => now_ms >= obtained_at + (secs as i64).saturating_mul(1000),
                None => false,
            },
            _ => false,
        }
    }
}

/// One segment's delivery state, carried as the queue payload
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub segment_id: String,
    pub session_id: String,
    pub sequence: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub content_type: String,
    /// Bytes handed over in-process; read from the segment store otherwise
    pub blob: Option<Bytes>,
    pub logs: Vec<InputLogEvent>,
    pub progress: UploadProgress,
    /// Ships late log events for a segment whose media is already delivered
    pub follow_up: bool,
}

impl UploadTask {
    pub fn new(
        session_id: impl Into<String>,
        segment_id: impl Into<String>,
        window: &SegmentWindow,
        content_type: impl Into<String>,
        blob: Option<Bytes>,
        logs: Vec<InputLogEvent>,
    ) -> Self {
        Self {
            segment_id: segment_id.into(),
            session_id: session_id.into(),
            sequence: window.sequence,
            start_ms: window.record_start_ms,
            end_ms: window.record_end_ms,
            content_type: content_type.into(),
            blob,
            logs,
            progress: UploadProgress::default(),
            follow_up: false,
        }
    }

    /// Rebuild a task from a ledger record found by a sweep
    pub fn from_record(record: &PendingUploadRecord) -> Self {
        Self {
            segment_id: record.segment_id.clone(),
            session_id: record.session_id.clone(),
            sequence: record.sequence,
            start_ms: record.start_ms,
            end_ms: record.end_ms,
            content_type: record.content_type.clone(),
            blob: None,
            logs: record.logs.clone(),
            progress: UploadProgress::default(),
            follow_up: false,
        }
    }

    /// Carry only `logs`; media, destination and completion are done
    pub fn logs_follow_up(&self, logs: Vec<InputLogEvent>) -> Self {
        Self {
            blob: None,
            logs,
            follow_up: true,
            ..self.clone()
        }
    }

    pub fn to_record(&self) -> PendingUploadRecord {
        PendingUploadRecord::pending(
            self.segment_id.clone(),
            self.session_id.clone(),
            self.sequence,
            self.start_ms,
            self.end_ms,
            self.content_type.clone(),
            self.logs.clone(),
        )
    }

    pub fn destination_request(&self) -> DestinationRequest {
        DestinationRequest {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            content_type: self.content_type.clone(),
        }
    }

    /// Queue merge: a later enqueue of the same segment adds its logs and
    /// fills in bytes this task does not have yet
    pub fn absorb(&mut self, other: UploadTask) {
        self.logs.extend(other.logs);
        if self.blob.is_none() {
            self.blob = other.blob;
        }
    }
}
