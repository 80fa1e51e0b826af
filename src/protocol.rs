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
use serde::{Deserialize, Serialize};

use crate::network::NetworkHealth;

/// Upload lifecycle of a recorded segment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    #[default]
    LocalOnly,
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// Time bounds of one segment, in milliseconds relative to the session start.
///
/// The core window tiles the session timeline without gaps; the recorded
/// window extends it by the overlap on each side (trailing side only for
/// the first segment).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentWindow {
    pub sequence: u64,
    pub core_start_ms: u64,
    pub core_end_ms: u64,
    pub record_start_ms: u64,
    pub record_end_ms: u64,
    pub overlap_ms: u64,
}

impl SegmentWindow {
    /// Half-open containment on the recorded window
    pub fn contains(&self, t_ms: u64) -> bool {
        self.record_start_ms <= t_ms && t_ms < self.record_end_ms
    }

    pub fn record_len_ms(&self) -> u64 {
        self.record_end_ms - self.record_start_ms
    }
}

/// A bounded slice of recorded media plus its timing metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub window: SegmentWindow,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub status: SegmentStatus,
}

/// One user input event captured alongside the media
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputLogEvent {
    /// Milliseconds since session start
    pub timestamp_ms: u64,
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Segment reference carried by `enqueue-segment`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDescriptor {
    pub id: String,
    #[serde(flatten)]
    pub window: SegmentWindow,
}

/// Commands accepted by an upload execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerCommand {
    #[serde(rename_all = "camelCase")]
    EnqueueSegment {
        session_id: String,
        sequence: u64,
        segment: SegmentDescriptor,
        content_type: String,
        /// Segment bytes when handed over in-process; loaded from the
        /// segment store otherwise.
        #[serde(skip)]
        blob: Option<Bytes>,
        #[serde(default)]
        logs: Vec<InputLogEvent>,
    },
    #[serde(rename_all = "camelCase")]
    SetNetworkStatus {
        status: NetworkHealth,
        #[serde(default)]
        rate_bps: Option<u64>,
        streaming_active: bool,
    },
    Flush,
    Reset,
    ProcessUploads,
}

/// Events emitted by an upload execution context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    SegmentProcessing {
        local_segment_id: String,
        started_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    SegmentUploaded {
        local_segment_id: String,
        remote_segment_id: String,
        destination_url: String,
    },
    #[serde(rename_all = "camelCase")]
    SegmentFailed {
        local_segment_id: String,
        reason: String,
    },
    QueueSize {
        size: usize,
    },
    Error {
        message: String,
    },
}

impl UploadEvent {
    pub fn error(message: impl Into<String>) -> Self {
        UploadEvent::Error {
            message: message.into(),
        }
    }

    /// Segment id the event refers to, if any
    pub fn segment_id(&self) -> Option<&str> {
        match self {
            UploadEvent::SegmentProcessing {
                local_segment_id, ..
            }
            | UploadEvent::SegmentUploaded {
                local_segment_id, ..
            }
            | UploadEvent::SegmentFailed {
                local_segment_id, ..
            } => Some(local_segment_id),
            UploadEvent::QueueSize { .. } | UploadEvent::Error { .. } => None,
        }
    }
}
