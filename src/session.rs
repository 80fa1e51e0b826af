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

// Recording session
//
// Wires one recorder to the segment store and an upload worker, and
// attributes user input events to every segment whose recorded window
// covers them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RecorderSettings;
use crate::listeners::Subscription;
use crate::protocol::InputLogEvent;
use crate::recorder::{
    MediaSource, RecordedSegment, RecorderState, SegmentHandler, SegmentPhase, SegmentRecorder,
};
use crate::store::{SegmentMeta, SegmentStore};
use crate::uploader::{UploadTask, UploadWorker};

/// Per-segment input buffer
enum LogBuffer {
    Buffering(Vec<InputLogEvent>),
    /// The segment went to the uploader; later events are attached there
    HandedOver { record_end_ms: u64 },
}

type LogBuffers = Arc<DashMap<String, LogBuffer>>;

struct SessionInner {
    session_id: String,
    store: Arc<SegmentStore>,
    worker: Arc<UploadWorker>,
    clock: Arc<dyn Clock>,
    logs: LogBuffers,
    unsupported: AtomicBool,
    segments_handed_over: AtomicU64,
}

#[async_trait]
impl SegmentHandler for SessionInner {
    async fn on_segment(&self, recorded: RecordedSegment) {
        let RecordedSegment { segment, data } = recorded;

        let meta = SegmentMeta::from_segment(&segment, self.clock.now_ms());
        if let Err(e) = self.store.save_segment(meta, data.clone()).await {
            warn!(
                "Failed to persist segment {} locally, uploading from memory: {}",
                segment.id, e
            );
        }

        let handed_over = LogBuffer::HandedOver {
            record_end_ms: segment.window.record_end_ms,
        };
        let logs = match self.logs.insert(segment.id.clone(), handed_over) {
            Some(LogBuffer::Buffering(logs)) => logs,
            _ => Vec::new(),
        };

        debug!(
            "Handing segment {} of session {} to uploader with {} input events",
            segment.window.sequence,
            self.session_id,
            logs.len()
        );
        let task = UploadTask::new(
            self.session_id.clone(),
            segment.id.clone(),
            &segment.window,
            segment.content_type.clone(),
            Some(data),
            logs,
        );
        self.worker.enqueue(task).await;
        self.segments_handed_over.fetch_add(1, Ordering::Relaxed);
    }

    fn on_unsupported(&self, reason: &str) {
        warn!(
            "Recording unavailable for session {}: {}",
            self.session_id, reason
        );
        self.unsupported.store(true, Ordering::Relaxed);
    }
}

pub struct RecordingSession {
    recorder: SegmentRecorder,
    inner: Arc<SessionInner>,
    _evictions: Subscription,
}

impl RecordingSession {
    pub fn new(
        session_id: impl Into<String>,
        settings: RecorderSettings,
        source: Arc<dyn MediaSource>,
        store: Arc<SegmentStore>,
        worker: Arc<UploadWorker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session_id = session_id.into();
        let logs: LogBuffers = Arc::new(DashMap::new());

        // Evicted segments will never be read back, so their buffers go too
        let buffers = logs.clone();
        let evictions = store.on_evicted(move |ids| {
            for id in ids {
                buffers.remove(id);
            }
        });

        let inner = Arc::new(SessionInner {
            session_id: session_id.clone(),
            store,
            worker,
            clock,
            logs,
            unsupported: AtomicBool::new(false),
            segments_handed_over: AtomicU64::new(0),
        });
        let recorder = SegmentRecorder::new(session_id, settings, source, inner.clone());

        Self {
            recorder,
            inner,
            _evictions: evictions,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn recorder(&self) -> &SegmentRecorder {
        &self.recorder
    }

    pub async fn start(&self) -> RecorderState {
        self.recorder.start().await
    }

    /// Whether the media source could record this session
    pub fn is_recording_supported(&self) -> bool {
        !self.inner.unsupported.load(Ordering::Relaxed)
    }

    pub fn segments_handed_over(&self) -> u64 {
        self.inner.segments_handed_over.load(Ordering::Relaxed)
    }

    /// Attribute an input event to every segment covering its timestamp.
    ///
    /// Returns the ids it was attributed to.
    pub async fn record_input(&self, event: InputLogEvent) -> Vec<String> {
        let ids = self
            .recorder
            .get_active_segment_ids(event.timestamp_ms)
            .await;

        let mut late = Vec::new();
        for id in &ids {
            // A completed segment without a buffer was handed over and pruned
            let pruned = !self.inner.logs.contains_key(id)
                && self.recorder.segment_phase(id).await == Some(SegmentPhase::Complete);
            if pruned {
                late.push(id.clone());
                continue;
            }

            let mut buffer = self
                .inner
                .logs
                .entry(id.clone())
                .or_insert_with(|| LogBuffer::Buffering(Vec::new()));
            match buffer.value_mut() {
                LogBuffer::Buffering(logs) => logs.push(event.clone()),
                LogBuffer::HandedOver { .. } => late.push(id.clone()),
            }
        }

        for id in late {
            self.inner.worker.attach_logs(&id, vec![event.clone()]).await;
        }

        self.prune_handed_over(event.timestamp_ms).await;
        ids
    }

    /// Number of per-segment buffers still held
    pub fn buffered_segments(&self) -> usize {
        self.inner.logs.len()
    }

    /// Forget handed-over segments whose window ended before `now_ms`
    async fn prune_handed_over(&self, now_ms: u64) {
        let ended: Vec<String> = self
            .inner
            .logs
            .iter()
            .filter(|entry| match entry.value() {
                LogBuffer::HandedOver { record_end_ms } => *record_end_ms < now_ms,
                LogBuffer::Buffering(_) => false,
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in ended {
            // Only once the handler has returned, so no event slips in between
            if self.recorder.segment_phase(&id).await == Some(SegmentPhase::Complete) {
                self.inner.logs.remove(&id);
            }
        }
    }

    /// Graceful end: flush every in-flight segment to the store and the
    /// uploader before returning
    pub async fn finish(&self) {
        self.recorder.finalize().await;
        info!(
            "Session {} finished, {} segments handed to the uploader",
            self.inner.session_id,
            self.segments_handed_over()
        );
    }

    /// Immediate end: discard unflushed segments and abort this session's
    /// transfers. Ledger records stay for a later sweep.
    pub async fn cancel(&self) {
        self.recorder.stop().await;
        self.inner.worker.cancel_session(&self.inner.session_id).await;
        info!("Session {} cancelled", self.inner.session_id);
    }
}
