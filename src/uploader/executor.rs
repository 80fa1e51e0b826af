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

// Four-step delivery of one segment
//
//   1. request a presigned destination
//   2. PUT the bytes, throttled and abortable
//   3. notify completion
//   4. ship buffered input logs
//
// Each completed step is recorded on the task, so an attempt that fails
// part way resumes from the first incomplete step.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::task::UploadTask;
use crate::api::{UploadApi, UploadDestination};
use crate::clock::Clock;
use crate::error::{UploadError, UploadResult};
use crate::ledger::Ledger;
use crate::network::{wait_for_pause, NetworkStatus};
use crate::rate_limiter::throttled_body;
use crate::store::SegmentStore;

pub struct UploadExecutor {
    api: Arc<dyn UploadApi>,
    ledger: Arc<Ledger>,
    store: Option<Arc<SegmentStore>>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
}

impl UploadExecutor {
    pub fn new(
        api: Arc<dyn UploadApi>,
        ledger: Arc<Ledger>,
        store: Option<Arc<SegmentStore>>,
        clock: Arc<dyn Clock>,
        chunk_size: usize,
    ) -> Self {
        Self {
            api,
            ledger,
            store,
            clock,
            chunk_size,
        }
    }

    /// Run every step not yet recorded on `task`
    pub async fn execute(
        &self,
        task: &mut UploadTask,
        mut status: watch::Receiver<NetworkStatus>,
    ) -> UploadResult<UploadDestination> {
        let now = self.clock.now_ms();
        if !task.progress.bytes_uploaded && task.progress.destination_expired(now) {
            debug!("Destination for {} expired, requesting a new one", task.segment_id);
            task.progress.destination = None;
            task.progress.destination_obtained_at = None;
        }

        let destination = match &task.progress.destination {
            Some(destination) => destination.clone(),
            None => {
                let destination = self
                    .api
                    .request_upload_destination(&task.destination_request())
                    .await?;
                task.progress.destination = Some(destination.clone());
                task.progress.destination_obtained_at = Some(self.clock.now_ms());
                destination
            }
        };

        if !task.progress.bytes_uploaded {
            if let Err(e) = self.transfer(task, &destination, &mut status).await {
                if matches!(e, UploadError::Rejected { .. }) {
                    // Most likely an expired or revoked presigned URL
                    task.progress.destination = None;
                    task.progress.destination_obtained_at = None;
                }
                return Err(e);
            }
            task.progress.bytes_uploaded = true;
            debug!("Uploaded bytes of {}", task.segment_id);
        }

        if !task.progress.completion_notified {
            self.api
                .notify_upload_complete(&task.session_id, &destination.remote_segment_id)
                .await?;
            task.progress.completion_notified = true;
        }

        if !task.logs.is_empty() {
            self.api
                .upload_input_logs(
                    &task.session_id,
                    &destination.remote_segment_id,
                    &destination.destination_url,
                    &task.logs,
                )
                .await?;
            debug!(
                "Uploaded {} input events for {}",
                task.logs.len(),
                task.segment_id
            );
            task.logs.clear();
            let (id, now) = (task.segment_id.clone(), self.clock.now_ms());
            if let Err(e) = self
                .ledger
                .blocking(move |l| l.set_logs(&id, &[], now))
                .await
            {
                warn!("Failed to clear ledger logs of {}: {}", task.segment_id, e);
            }
        }

        Ok(destination)
    }

    async fn transfer(
        &self,
        task: &UploadTask,
        destination: &UploadDestination,
        status: &mut watch::Receiver<NetworkStatus>,
    ) -> UploadResult<()> {
        let data = self.load_bytes(task).await?;

        if status.borrow().uploads_paused() {
            return Err(UploadError::PolicyPaused);
        }

        let content_length = data.len() as u64;
        let body = throttled_body(data, self.chunk_size, status.clone());
        tokio::select! {
            result = self.api.put_bytes(
                &destination.destination_url,
                &task.content_type,
                content_length,
                body,
            ) => result,
            _ = wait_for_pause(status) => {
                debug!("Aborting transfer of {}: network unstable", task.segment_id);
                Err(UploadError::PolicyPaused)
            }
        }
    }

    async fn load_bytes(&self, task: &UploadTask) -> UploadResult<Bytes> {
        if let Some(blob) = &task.blob {
            return Ok(blob.clone());
        }

        let Some(store) = &self.store else {
            return Err(UploadError::MissingBytes(task.segment_id.clone()));
        };
        match store.get_segment(&task.session_id, &task.segment_id).await? {
            Some(stored) => Ok(stored.data),
            None => Err(UploadError::MissingBytes(task.segment_id.clone())),
        }
    }
}
