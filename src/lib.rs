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

// Resilient segmented-media upload pipeline
//
// Records a live stream into overlapping time-bounded segments, keeps them
// in a local store under a byte budget, and delivers them to remote object
// storage at least once:
// - Overlapping segment schedule so no input event near a cut is lost
// - Filesystem, SQLite or in-memory segment store with LRU eviction
// - Durable SQLite ledger with lease-based claiming shared by all contexts
// - Per-context retry queue with capped exponential backoff
// - Network-health admission and token-bucket throttling of transfers

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod listeners;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod rate_limiter;
pub mod recorder;
pub mod session;
pub mod store;
pub mod uploader;

// Re-export main types
pub use api::{HttpUploadApi, UploadApi, UploadDestination};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, load_config_with_env, RelayConfig};
pub use error::{UploadError, UploadResult};
pub use hub::{HubEvent, UploadHub};
pub use ledger::{Ledger, LedgerStatus, PendingUploadRecord};
pub use listeners::{Listeners, Subscription};
pub use network::{evaluate_health, NetworkHealth, NetworkMonitor, NetworkStatus};
pub use protocol::{
    InputLogEvent, Segment, SegmentDescriptor, SegmentStatus, SegmentWindow, UploadEvent,
    WorkerCommand,
};
pub use queue::{EnqueueOutcome, RetryPolicy, UploadQueue};
pub use rate_limiter::TokenBucket;
pub use recorder::{RecorderState, SegmentRecorder};
pub use session::RecordingSession;
pub use store::{SegmentMeta, SegmentStore};
pub use uploader::{UploadTask, UploadWorker, WorkerDeps};
