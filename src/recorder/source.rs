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

// Seams between the recorder and the live stream it slices

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::Segment;

/// A live media stream that can run several independent encoders at once.
///
/// Overlapping segments need two captures of the same stream to be active
/// during every overlap window.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Whether an encoder for `content_type` is available
    fn supports(&self, content_type: &str) -> bool;

    /// Start a new encoder on the live stream
    async fn begin_capture(&self, content_type: &str) -> Result<Box<dyn Capture>>;
}

/// One running encoder
#[async_trait]
pub trait Capture: Send {
    /// Stop the encoder and flush its output
    async fn finish(self: Box<Self>) -> Result<Bytes>;
}

/// A finished segment and its encoded bytes
#[derive(Debug, Clone)]
pub struct RecordedSegment {
    pub segment: Segment,
    pub data: Bytes,
}

/// Receives recorder output
#[async_trait]
pub trait SegmentHandler: Send + Sync {
    /// Called once per flushed segment. The recorder's `finalize` waits for
    /// this to return.
    async fn on_segment(&self, recorded: RecordedSegment);

    /// Called once when the source cannot record the configured content type
    fn on_unsupported(&self, reason: &str);
}
