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

// Upload execution context
//
// One worker owns one in-memory queue and drains it one segment at a time.
// Every attempt is bracketed by a ledger claim and either a delete (done) or
// a release (try again later), so other contexts sharing the ledger can pick
// up whatever this one leaves behind.

pub mod executor;
pub mod task;

pub use executor::UploadExecutor;
pub use task::{UploadProgress, UploadTask};

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{UploadApi, UploadDestination};
use crate::clock::Clock;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::ledger::Ledger;
use crate::listeners::{Listeners, Subscription};
use crate::network::{wait_for_resume, NetworkMonitor, NetworkStatus};
use crate::protocol::{InputLogEvent, UploadEvent, WorkerCommand};
use crate::queue::{EnqueueOutcome, RetryPolicy, UploadQueue};
use crate::store::SegmentStore;

/// Counters for one worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    attempts: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
    retries_scheduled: AtomicU64,
    policy_pauses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    pub attempts: u64,
    pub uploaded: u64,
    pub failed: u64,
    pub retries_scheduled: u64,
    pub policy_pauses: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            policy_pauses: self.policy_pauses.load(Ordering::Relaxed),
        }
    }
}

/// Shared collaborators of a worker
pub struct WorkerDeps {
    pub api: Arc<dyn UploadApi>,
    pub ledger: Arc<Ledger>,
    pub store: Option<Arc<SegmentStore>>,
    pub network: Arc<NetworkMonitor>,
    pub clock: Arc<dyn Clock>,
}

struct WorkerInner {
    context_tag: String,
    heartbeat: Duration,
    executor: UploadExecutor,
    ledger: Arc<Ledger>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    queue: Mutex<UploadQueue<UploadTask>>,
    // Logs that arrived while their segment was in flight
    deferred_logs: Mutex<HashMap<String, Vec<InputLogEvent>>>,
    sessions: DashMap<String, CancellationToken>,
    // Replaced on every reset so in-flight work from before is aborted
    generation: std::sync::Mutex<CancellationToken>,
    wake: Notify,
    events: Listeners<UploadEvent>,
    stats: WorkerStats,
    shutdown: CancellationToken,
}

pub struct UploadWorker {
    inner: Arc<WorkerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

enum Idle {
    Empty,
    Paused,
}

impl UploadWorker {
    pub fn new(config: &UploadConfig, deps: WorkerDeps) -> Self {
        let policy = RetryPolicy {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            max_retries: config.max_retries,
        };
        let executor = UploadExecutor::new(
            deps.api,
            deps.ledger.clone(),
            deps.store,
            deps.clock.clone(),
            config.chunk_size_bytes,
        );

        Self {
            inner: Arc::new(WorkerInner {
                context_tag: config.context_tag.clone(),
                heartbeat: config.heartbeat(),
                executor,
                ledger: deps.ledger,
                network: deps.network,
                clock: deps.clock,
                queue: Mutex::new(UploadQueue::new(policy)),
                deferred_logs: Mutex::new(HashMap::new()),
                sessions: DashMap::new(),
                generation: std::sync::Mutex::new(CancellationToken::new()),
                wake: Notify::new(),
                events: Listeners::new(),
                stats: WorkerStats::default(),
                shutdown: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn context_tag(&self) -> &str {
        &self.inner.context_tag
    }

    /// Start draining the queue in the background
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        info!("Upload worker '{}' started", self.inner.context_tag);
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Stop the drain loop, aborting any in-flight attempt
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Upload worker task ended abnormally: {}", e);
            }
        }
        info!("Upload worker '{}' stopped", self.inner.context_tag);
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.inner.network
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.queue.lock().await.in_flight_count()
    }

    pub async fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::EnqueueSegment {
                session_id,
                segment,
                content_type,
                blob,
                logs,
                ..
            } => {
                let task = UploadTask::new(
                    session_id,
                    segment.id,
                    &segment.window,
                    content_type,
                    blob,
                    logs,
                );
                self.enqueue(task).await;
            }
            WorkerCommand::SetNetworkStatus {
                status,
                rate_bps,
                streaming_active,
            } => {
                self.inner.network.set_status(NetworkStatus {
                    health: status,
                    rate_bps,
                    streaming_active,
                });
                self.inner.wake.notify_one();
            }
            WorkerCommand::Flush => self.flush().await,
            WorkerCommand::Reset => self.reset().await,
            WorkerCommand::ProcessUploads => {
                self.sweep().await;
            }
        }
    }

    /// Record the segment in the ledger and queue it here
    pub async fn enqueue(&self, task: UploadTask) {
        let inner = &self.inner;
        let now = inner.clock.now_ms();

        let record = task.to_record();
        if let Err(e) = inner.ledger.blocking(move |l| l.upsert(&record, now)).await {
            warn!("Failed to record {} in upload ledger: {}", task.segment_id, e);
        }

        let key = task.segment_id.clone();
        let outcome = inner
            .queue
            .lock()
            .await
            .enqueue(&key, task, now, UploadTask::absorb);
        match outcome {
            EnqueueOutcome::Inserted => debug!("Queued segment {}", key),
            EnqueueOutcome::Merged => debug!("Merged into queued segment {}", key),
            EnqueueOutcome::Busy(task) => {
                debug!(
                    "Segment {} is in flight, deferring {} log events",
                    key,
                    task.logs.len()
                );
                inner
                    .deferred_logs
                    .lock()
                    .await
                    .entry(key)
                    .or_default()
                    .extend(task.logs);
            }
        }

        inner.emit_queue_size().await;
        inner.wake.notify_one();
    }

    /// Attach late input events to a segment already handed to the uploader.
    ///
    /// Returns `false` when no context still holds the segment, i.e. it has
    /// been fully delivered and the events are dropped.
    pub async fn attach_logs(&self, segment_id: &str, logs: Vec<InputLogEvent>) -> bool {
        let inner = &self.inner;
        if logs.is_empty() {
            return true;
        }

        {
            let mut queue = inner.queue.lock().await;
            match queue.get(segment_id).map(|item| item.in_flight) {
                Some(false) => {
                    queue.update(segment_id, |task| task.logs.extend(logs.iter().cloned()));
                    drop(queue);
                    self.persist_logs(segment_id, &logs).await;
                    return true;
                }
                Some(true) => {
                    drop(queue);
                    self.persist_logs(segment_id, &logs).await;
                    inner
                        .deferred_logs
                        .lock()
                        .await
                        .entry(segment_id.to_string())
                        .or_default()
                        .extend(logs);
                    return true;
                }
                None => {}
            }
        }

        // Not queued here; another context may still be delivering it
        let count = logs.len();
        let (id, now) = (segment_id.to_string(), inner.clock.now_ms());
        match inner
            .ledger
            .blocking(move |l| l.append_logs(&id, &logs, now))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    "Dropping {} late input events for delivered segment {}",
                    count, segment_id
                );
                false
            }
            Err(e) => {
                warn!("Failed to store late input events of {}: {}", segment_id, e);
                false
            }
        }
    }

    async fn persist_logs(&self, segment_id: &str, logs: &[InputLogEvent]) {
        let inner = &self.inner;
        let (id, logs, now) = (segment_id.to_string(), logs.to_vec(), inner.clock.now_ms());
        if let Err(e) = inner
            .ledger
            .blocking(move |l| l.append_logs(&id, &logs, now).map(|_| ()))
            .await
        {
            warn!("Failed to store input events of {}: {}", segment_id, e);
        }
    }

    /// Make every queued segment due now
    pub async fn flush(&self) {
        let now = self.inner.clock.now_ms();
        self.inner.queue.lock().await.make_all_ready(now);
        self.inner.wake.notify_one();
    }

    /// Drop this context's queue and abort in-flight work. Ledger records
    /// are left for a later sweep.
    pub async fn reset(&self) {
        let inner = &self.inner;
        if let Ok(mut generation) = inner.generation.lock() {
            generation.cancel();
            *generation = CancellationToken::new();
        }
        inner.queue.lock().await.clear();
        inner.deferred_logs.lock().await.clear();
        info!("Upload worker '{}' reset", inner.context_tag);
        inner.emit_queue_size().await;
    }

    /// Abort in-flight work for a session and forget its queued segments
    pub async fn cancel_session(&self, session_id: &str) {
        let inner = &self.inner;
        if let Some((_, token)) = inner.sessions.remove(session_id) {
            token.cancel();
        }

        let mut queue = inner.queue.lock().await;
        let mut dropped = 0;
        for key in queue.keys_where(|task| task.session_id == session_id) {
            if queue.get(&key).is_some_and(|item| !item.in_flight) {
                queue.complete(&key);
                dropped += 1;
            }
        }
        drop(queue);

        if dropped > 0 {
            info!(
                "Session {} cancelled, left {} segments for a later sweep",
                session_id, dropped
            );
            inner.emit_queue_size().await;
        }
    }

    /// Queue every ledger record this context may claim right now.
    ///
    /// Returns how many were added.
    pub async fn sweep(&self) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();

        let candidates = match inner.ledger.blocking(move |l| l.sweep_candidates(now)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Ledger sweep failed: {}", e);
                inner
                    .events
                    .emit(&UploadEvent::error(format!("ledger sweep failed: {}", e)));
                return 0;
            }
        };

        let mut added = 0;
        {
            let mut queue = inner.queue.lock().await;
            for record in &candidates {
                if queue.get(&record.segment_id).is_some() {
                    continue;
                }
                queue.enqueue(
                    &record.segment_id,
                    UploadTask::from_record(record),
                    now,
                    UploadTask::absorb,
                );
                added += 1;
            }
        }

        info!(
            "Ledger sweep found {} claimable records, queued {}",
            candidates.len(),
            added
        );
        if added > 0 {
            inner.emit_queue_size().await;
            inner.wake.notify_one();
        }
        added
    }

    /// Wait until the queue is empty or `timeout` passes.
    ///
    /// Returns whether the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue_len().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>) {
        let mut status_rx = self.network.subscribe();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = {
                let mut queue = self.queue.lock().await;
                let now = self.clock.now_ms();
                let paused = status_rx.borrow().uploads_paused();
                match queue.get_next_ready(now) {
                    Some(_) if paused => Err(Idle::Paused),
                    Some(item) => {
                        let task = item.payload.clone();
                        queue.mark_in_flight(&task.segment_id);
                        Ok(task)
                    }
                    None => Err(Idle::Empty),
                }
            };

            match next {
                Ok(task) => self.process(task).await,
                Err(Idle::Paused) => {
                    debug!("Uploads paused by network policy");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = wait_for_resume(&mut status_rx) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Err(Idle::Empty) => {
                    let wait = self.time_until_due().await;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = sleep_for(wait) => {}
                    }
                }
            }
        }

        debug!("Upload worker '{}' drain loop exited", self.context_tag);
    }

    async fn time_until_due(&self) -> Option<Duration> {
        let due = self.queue.lock().await.get_next_due_time()?;
        let wait = (due - self.clock.now_ms()).max(0) as u64;
        Some(Duration::from_millis(wait))
    }

    async fn process(&self, mut task: UploadTask) {
        let key = task.segment_id.clone();
        let started_at = self.clock.now_ms();

        let (id, owner) = (key.clone(), self.context_tag.clone());
        let claimed = self
            .ledger
            .blocking(move |l| {
                if l.claim(&id, &owner, started_at)?.is_some() {
                    return Ok((true, None));
                }
                Ok((false, l.get(&id)?))
            })
            .await;

        let leased = match claimed {
            Ok((true, _)) => true,
            Ok((false, holder)) => match holder {
                Some(record) => {
                    // The owner finishes it, or a sweep recovers it once the lease goes stale
                    debug!(
                        "Segment {} is leased by {:?}, leaving it to that context",
                        key, record.owner
                    );
                    self.queue.lock().await.complete(&key);
                    self.deferred_logs.lock().await.remove(&key);
                    self.emit_queue_size().await;
                    return;
                }
                None => {
                    debug!("Segment {} has no ledger record, uploading unrecorded", key);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to claim {} in upload ledger: {}", key, e);
                false
            }
        };

        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        self.events.emit(&UploadEvent::SegmentProcessing {
            local_segment_id: key.clone(),
            started_at,
        });

        let result = self.attempt(&mut task, leased, started_at).await;
        let now = self.clock.now_ms();

        match result {
            Ok(destination) => {
                let deferred = self.deferred_logs.lock().await.remove(&key);
                let follow_up = deferred
                    .filter(|logs| !logs.is_empty())
                    .map(|logs| task.logs_follow_up(logs));

                match &follow_up {
                    Some(next) => {
                        let (id, logs) = (key.clone(), next.logs.clone());
                        if let Err(e) = self
                            .ledger
                            .blocking(move |l| l.set_logs(&id, &logs, now))
                            .await
                        {
                            warn!("Failed to store late logs of {}: {}", key, e);
                        }
                        self.release(&key, leased, now).await;
                    }
                    None => {
                        let id = key.clone();
                        if let Err(e) = self.ledger.blocking(move |l| l.delete(&id)).await {
                            warn!("Failed to remove {} from upload ledger: {}", key, e);
                        }
                    }
                }

                {
                    let mut queue = self.queue.lock().await;
                    queue.complete(&key);
                    if let Some(next) = follow_up {
                        queue.enqueue(&key, next, now, UploadTask::absorb);
                    }
                }

                if !task.follow_up {
                    self.stats.uploaded.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Segment {} delivered as {}",
                        key, destination.remote_segment_id
                    );
                    self.events.emit(&UploadEvent::SegmentUploaded {
                        local_segment_id: key.clone(),
                        remote_segment_id: destination.remote_segment_id,
                        destination_url: destination.destination_url,
                    });
                }
            }

            Err(UploadError::MissingBytes(_)) => {
                // Left pending for a context that still holds the bytes
                error!("Segment {} is not stored locally, leaving it to a later sweep", key);
                self.release(&key, leased, now).await;
                self.queue.lock().await.complete(&key);
                self.deferred_logs.lock().await.remove(&key);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&UploadEvent::SegmentFailed {
                    local_segment_id: key.clone(),
                    reason: "segment bytes are no longer stored locally".to_string(),
                });
            }

            Err(UploadError::Cancelled) => {
                debug!("Upload of {} cancelled", key);
                self.release(&key, leased, now).await;
                self.queue.lock().await.complete(&key);
                self.deferred_logs.lock().await.remove(&key);
            }

            Err(e) if e.counts_as_attempt() => {
                self.release(&key, leased, now).await;
                self.requeue(task).await;

                let rescheduled = self.queue.lock().await.schedule_retry(&key, now);
                if rescheduled {
                    self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                    warn!("Upload of {} failed, will retry: {}", key, e);
                } else {
                    error!("Upload of {} exhausted its retries: {}", key, e);
                    self.queue.lock().await.complete(&key);
                    self.deferred_logs.lock().await.remove(&key);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(&UploadEvent::SegmentFailed {
                        local_segment_id: key.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            Err(e) => {
                debug!("Upload of {} held back: {}", key, e);
                self.release(&key, leased, now).await;
                self.stats.policy_pauses.fetch_add(1, Ordering::Relaxed);
                self.requeue(task).await;
                self.queue
                    .lock()
                    .await
                    .schedule_retry_without_increment(&key, now);
            }
        }

        self.emit_queue_size().await;
    }

    /// Run the executor under the session and reset tokens, heartbeating
    /// the lease while it runs
    async fn attempt(
        &self,
        task: &mut UploadTask,
        leased: bool,
        started_at: i64,
    ) -> UploadResult<UploadDestination> {
        let key = task.segment_id.clone();
        let session_token = self
            .sessions
            .entry(task.session_id.clone())
            .or_default()
            .clone();
        let generation = match self.generation.lock() {
            Ok(token) => token.clone(),
            Err(_) => CancellationToken::new(),
        };

        let status_rx = self.network.subscribe();
        let execution = self.executor.execute(task, status_rx);
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat,
            self.heartbeat,
        );

        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = session_token.cancelled() => return Err(UploadError::Cancelled),
                _ = generation.cancelled() => return Err(UploadError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(UploadError::Cancelled),
                _ = ticker.tick() => {
                    if leased {
                        let (id, owner, now) =
                            (key.clone(), self.context_tag.clone(), self.clock.now_ms());
                        match self.ledger.blocking(move |l| l.heartbeat(&id, &owner, now)).await {
                            Ok(true) => {}
                            Ok(false) => warn!("Lease on {} was lost", key),
                            Err(e) => warn!("Failed to renew lease on {}: {}", key, e),
                        }
                    }
                    self.events.emit(&UploadEvent::SegmentProcessing {
                        local_segment_id: key.clone(),
                        started_at,
                    });
                }
            }
        }
    }

    /// Store the attempt's progress back on the queued item, folding in any
    /// logs that arrived meanwhile
    async fn requeue(&self, mut task: UploadTask) {
        let key = task.segment_id.clone();
        if let Some(logs) = self.deferred_logs.lock().await.remove(&key) {
            task.logs.extend(logs);
        }
        self.queue.lock().await.update(&key, |payload| *payload = task);
    }

    async fn release(&self, key: &str, leased: bool, now: i64) {
        if !leased {
            return;
        }
        let (id, owner) = (key.to_string(), self.context_tag.clone());
        if let Err(e) = self
            .ledger
            .blocking(move |l| l.release(&id, &owner, now))
            .await
        {
            warn!("Failed to release lease on {}: {}", key, e);
        }
    }

    async fn emit_queue_size(&self) {
        let size = self.queue.lock().await.len();
        self.events.emit(&UploadEvent::QueueSize { size });
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}
