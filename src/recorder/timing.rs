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

//! Overlapping segment schedule.
//!
//! With core duration `D` and overlap `O`:
//!
//! ```text
//! seg 0   |=====core=====|--O--|
//!         0              D     D+O
//! seg 1               |--O--|=====core=====|--O--|
//!                     D-O   D              2D    2D+O
//! seg 2                                 |--O--|=====core=====|--O--|
//!                                       2D-O  2D             3D    3D+O
//! ```
//!
//! Core windows tile the timeline exactly. Every cut point is covered by
//! `2O` of recording shared by both neighbours.

use crate::protocol::SegmentWindow;

/// Planned windows for segment `sequence`
pub fn plan_window(sequence: u64, duration_ms: u64, overlap_ms: u64) -> SegmentWindow {
    let core_start_ms = sequence * duration_ms;
    let core_end_ms = core_start_ms + duration_ms;
    let record_start_ms = if sequence == 0 {
        0
    } else {
        core_start_ms - overlap_ms
    };

    SegmentWindow {
        sequence,
        core_start_ms,
        core_end_ms,
        record_start_ms,
        record_end_ms: core_end_ms + overlap_ms,
        overlap_ms,
    }
}

/// Window of a segment whose capture was cut short at `stopped_at_ms`
pub fn truncate_window(window: SegmentWindow, stopped_at_ms: u64) -> SegmentWindow {
    let record_end_ms = stopped_at_ms.clamp(window.record_start_ms, window.record_end_ms);
    SegmentWindow {
        record_end_ms,
        core_end_ms: window.core_end_ms.min(record_end_ms.max(window.core_start_ms)),
        ..window
    }
}

/// Ids of the windows containing `t_ms`, ordered by ascending record start
pub fn active_ids<'a, I>(windows: I, t_ms: u64) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a SegmentWindow)>,
{
    let mut hits: Vec<(&SegmentWindow, &String)> = windows
        .into_iter()
        .filter(|(_, w)| w.contains(t_ms))
        .map(|(id, w)| (w, id))
        .collect();
    hits.sort_by_key(|(w, _)| (w.record_start_ms, w.sequence));
    hits.into_iter().map(|(_, id)| id.clone()).collect()
}
