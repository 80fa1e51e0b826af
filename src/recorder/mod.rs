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

// Segment recorder
//
// Slices a live stream into overlapping, time-bounded segments:
// - A schedule task starts a new capture at every planned record start
// - Each capture runs in its own task until its record end, then flushes
// - Flushed segments are handed to a SegmentHandler
// - finalize() stops the schedule, cuts in-flight captures short and waits
//   for every handler call to return

pub mod source;
pub mod timing;

pub use source::{Capture, MediaSource, RecordedSegment, SegmentHandler};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RecorderSettings;
use crate::protocol::{Segment, SegmentStatus, SegmentWindow};
use timing::{active_ids, plan_window, truncate_window};

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    /// The source cannot encode the configured content type; nothing is recorded
    Unsupported,
    Finalizing,
    Stopped,
}

/// Lifecycle of a single segment capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Recording,
    Flushing,
    Complete,
    Discarded,
}

struct InFlightSegment {
    finish_now: CancellationToken,
    handle: JoinHandle<()>,
}

struct RecorderShared {
    session_id: String,
    settings: RecorderSettings,
    source: Arc<dyn MediaSource>,
    handler: Arc<dyn SegmentHandler>,

    state: RwLock<RecorderState>,
    started_at: RwLock<Option<Instant>>,
    stop_scheduling: CancellationToken,
    schedule: Mutex<Option<JoinHandle<()>>>,

    // Recorded windows of every non-discarded segment, keyed by segment id
    windows: RwLock<HashMap<String, SegmentWindow>>,
    phases: RwLock<HashMap<String, SegmentPhase>>,
    in_flight: Mutex<HashMap<String, InFlightSegment>>,
}

/// Records one session into overlapping segments
pub struct SegmentRecorder {
    shared: Arc<RecorderShared>,
}

impl SegmentRecorder {
    pub fn new(
        session_id: String,
        settings: RecorderSettings,
        source: Arc<dyn MediaSource>,
        handler: Arc<dyn SegmentHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(RecorderShared {
                session_id,
                settings,
                source,
                handler,
                state: RwLock::new(RecorderState::Idle),
                started_at: RwLock::new(None),
                stop_scheduling: CancellationToken::new(),
                schedule: Mutex::new(None),
                windows: RwLock::new(HashMap::new()),
                phases: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin capture.
    ///
    /// An unsupported content type is reported to the handler and leaves the
    /// recorder in `Unsupported`; it is not an error.
    pub async fn start(&self) -> RecorderState {
        let shared = &self.shared;
        let mut state = shared.state.write().await;
        if *state != RecorderState::Idle {
            warn!(
                "Recorder for session '{}' already started ({:?})",
                shared.session_id, *state
            );
            return *state;
        }

        let content_type = &shared.settings.content_type;
        if !shared.source.supports(content_type) {
            info!(
                "Media capture of '{}' unsupported, recording disabled for session '{}'",
                content_type, shared.session_id
            );
            shared
                .handler
                .on_unsupported(&format!("content type '{}' is not supported", content_type));
            *state = RecorderState::Unsupported;
            return *state;
        }

        let start = Instant::now();
        *shared.started_at.write().await = Some(start);
        *state = RecorderState::Recording;
        drop(state);

        let handle = tokio::spawn(run_schedule(shared.clone(), start));
        *shared.schedule.lock().await = Some(handle);

        info!(
            "Recording session '{}' ({} ms segments, {} ms overlap)",
            shared.session_id, shared.settings.segment_duration_ms, shared.settings.overlap_ms
        );
        RecorderState::Recording
    }

    /// Terminate immediately, discarding segments that have not been flushed
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.stop_scheduling.cancel();
        if let Some(handle) = shared.schedule.lock().await.take() {
            handle.abort();
        }

        let in_flight: Vec<(String, InFlightSegment)> =
            shared.in_flight.lock().await.drain().collect();
        for (id, segment) in in_flight {
            segment.handle.abort();
            shared.windows.write().await.remove(&id);
            shared
                .phases
                .write()
                .await
                .insert(id.clone(), SegmentPhase::Discarded);
            debug!("Discarded in-flight segment '{}'", id);
        }

        let mut state = shared.state.write().await;
        if *state != RecorderState::Unsupported {
            *state = RecorderState::Stopped;
        }
        info!("Recorder for session '{}' stopped", shared.session_id);
    }

    /// Stop scheduling new segments and wait until every in-flight segment
    /// has been flushed and handed to the handler
    pub async fn finalize(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.write().await;
            if *state != RecorderState::Recording {
                return;
            }
            *state = RecorderState::Finalizing;
        }

        shared.stop_scheduling.cancel();
        // Let a capture that is being started register itself first
        let schedule = shared.schedule.lock().await.take();
        if let Some(handle) = schedule {
            if let Err(e) = handle.await {
                warn!("Segment schedule task ended abnormally: {}", e);
            }
        }

        let in_flight: Vec<(String, InFlightSegment)> =
            shared.in_flight.lock().await.drain().collect();
        let count = in_flight.len();
        for (_, segment) in &in_flight {
            segment.finish_now.cancel();
        }
        for (id, segment) in in_flight {
            if let Err(e) = segment.handle.await {
                warn!("Segment '{}' task ended abnormally: {}", id, e);
            }
        }

        *shared.state.write().await = RecorderState::Stopped;
        info!(
            "Recorder for session '{}' finalized ({} segments flushed at shutdown)",
            shared.session_id, count
        );
    }

    /// Segments whose recorded window contains `t_ms`, by ascending record start
    pub async fn get_active_segment_ids(&self, t_ms: u64) -> Vec<String> {
        let windows = self.shared.windows.read().await;
        active_ids(windows.iter(), t_ms)
    }

    /// Milliseconds since capture started
    pub async fn elapsed_ms(&self) -> Option<u64> {
        self.shared
            .started_at
            .read()
            .await
            .map(|start| start.elapsed().as_millis() as u64)
    }

    pub async fn state(&self) -> RecorderState {
        *self.shared.state.read().await
    }

    pub async fn segment_phase(&self, segment_id: &str) -> Option<SegmentPhase> {
        self.shared.phases.read().await.get(segment_id).copied()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().await.len()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }
}

/// Start captures at their planned record starts until told to stop.
///
/// Each start is computed from the session start rather than the previous
/// start, so scheduling latency never accumulates.
async fn run_schedule(shared: Arc<RecorderShared>, start: Instant) {
    let duration_ms = shared.settings.segment_duration_ms;
    let overlap_ms = shared.settings.overlap_ms;
    let mut sequence: u64 = 0;

    loop {
        let window = plan_window(sequence, duration_ms, overlap_ms);
        let begin_at = start + Duration::from_millis(window.record_start_ms);

        tokio::select! {
            _ = shared.stop_scheduling.cancelled() => break,
            _ = tokio::time::sleep_until(begin_at) => {}
        }

        match shared
            .source
            .begin_capture(&shared.settings.content_type)
            .await
        {
            Ok(capture) => {
                let id = uuid::Uuid::new_v4().to_string();
                let finish_now = CancellationToken::new();

                shared.windows.write().await.insert(id.clone(), window);
                shared
                    .phases
                    .write()
                    .await
                    .insert(id.clone(), SegmentPhase::Recording);

                // Held across the spawn so the task cannot deregister before it is registered
                let mut in_flight = shared.in_flight.lock().await;
                let handle = tokio::spawn(run_segment(
                    shared.clone(),
                    capture,
                    id.clone(),
                    window,
                    start,
                    finish_now.clone(),
                ));
                in_flight.insert(id.clone(), InFlightSegment { finish_now, handle });
                drop(in_flight);

                debug!(
                    "Segment {} ('{}') recording [{}, {}) ms",
                    sequence, id, window.record_start_ms, window.record_end_ms
                );
            }
            Err(e) => {
                warn!(
                    "Failed to start capture for segment {} of session '{}': {}",
                    sequence, shared.session_id, e
                );
            }
        }

        sequence += 1;
    }
}

/// Drive one capture through Recording -> Flushing -> Complete | Discarded
async fn run_segment(
    shared: Arc<RecorderShared>,
    capture: Box<dyn Capture>,
    id: String,
    window: SegmentWindow,
    start: Instant,
    finish_now: CancellationToken,
) {
    let record_end = start + Duration::from_millis(window.record_end_ms);
    let cut_short = tokio::select! {
        _ = tokio::time::sleep_until(record_end) => false,
        _ = finish_now.cancelled() => true,
    };

    let window = if cut_short {
        let cut = truncate_window(window, start.elapsed().as_millis() as u64);
        shared.windows.write().await.insert(id.clone(), cut);
        cut
    } else {
        window
    };

    shared
        .phases
        .write()
        .await
        .insert(id.clone(), SegmentPhase::Flushing);

    match capture.finish().await {
        Ok(data) => {
            let segment = Segment {
                id: id.clone(),
                session_id: shared.session_id.clone(),
                window,
                content_type: shared.settings.content_type.clone(),
                size_bytes: data.len() as u64,
                status: SegmentStatus::LocalOnly,
            };
            debug!(
                "Segment {} ('{}') flushed: {} bytes",
                window.sequence,
                id,
                data.len()
            );
            shared
                .handler
                .on_segment(RecordedSegment { segment, data })
                .await;
            shared
                .phases
                .write()
                .await
                .insert(id.clone(), SegmentPhase::Complete);
        }
        Err(e) => {
            warn!("Segment {} ('{}') failed to flush: {}", window.sequence, id, e);
            shared.windows.write().await.remove(&id);
            shared
                .phases
                .write()
                .await
                .insert(id.clone(), SegmentPhase::Discarded);
        }
    }

    shared.in_flight.lock().await.remove(&id);
}
