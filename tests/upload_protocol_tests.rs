// Upload worker protocol tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use segment_relay::api::{ByteStream, DestinationRequest};
use segment_relay::config::{FilesystemConfig, UploadConfig};
use segment_relay::error::{UploadError, UploadResult};
use segment_relay::store::{FilesystemBackend, MemoryBackend, StoreBackend};
use tempfile::TempDir;
use segment_relay::{
    Clock, InputLogEvent, Ledger, LedgerStatus, NetworkHealth, NetworkMonitor, NetworkStatus,
    SegmentMeta, SegmentStore, SegmentWindow, Subscription, SystemClock, UploadApi,
    UploadDestination, UploadEvent, UploadHub, UploadTask, UploadWorker, WorkerCommand,
    WorkerDeps,
};

#[derive(Default)]
struct MockApi {
    destination_failures: AtomicUsize,
    put_failures: AtomicUsize,
    destination_calls: AtomicUsize,
    put_calls: AtomicUsize,
    notify_calls: AtomicUsize,
    uploaded: Mutex<Vec<Bytes>>,
    log_batches: Mutex<Vec<Vec<InputLogEvent>>>,
}

impl MockApi {
    fn failing_destinations(n: usize) -> Self {
        Self {
            destination_failures: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    fn failing_puts(n: usize) -> Self {
        Self {
            put_failures: AtomicUsize::new(n),
            ..Self::default()
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl UploadApi for MockApi {
    async fn request_upload_destination(
        &self,
        request: &DestinationRequest,
    ) -> UploadResult<UploadDestination> {
        let call = self.destination_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.destination_failures) {
            return Err(UploadError::Transient("connection reset".to_string()));
        }
        Ok(UploadDestination {
            remote_segment_id: format!("remote-{}-{}", request.sequence, call),
            destination_url: format!("https://bucket.example/{}", request.sequence),
            expires_in: Some(3_600),
        })
    }

    async fn put_bytes(
        &self,
        _destination_url: &str,
        _content_type: &str,
        content_length: u64,
        body: ByteStream,
    ) -> UploadResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Bytes> = body
            .try_collect()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;
        if take_failure(&self.put_failures) {
            return Err(UploadError::Transient("503 Service Unavailable".to_string()));
        }
        let data = Bytes::from(chunks.concat());
        assert_eq!(data.len() as u64, content_length);
        self.uploaded.lock().unwrap().push(data);
        Ok(())
    }

    async fn notify_upload_complete(
        &self,
        _session_id: &str,
        _remote_segment_id: &str,
    ) -> UploadResult<()> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_input_logs(
        &self,
        _session_id: &str,
        _remote_segment_id: &str,
        _destination_url: &str,
        logs: &[InputLogEvent],
    ) -> UploadResult<()> {
        self.log_batches.lock().unwrap().push(logs.to_vec());
        Ok(())
    }
}

struct Harness {
    api: Arc<MockApi>,
    ledger: Arc<Ledger>,
    network: Arc<NetworkMonitor>,
    worker: Arc<UploadWorker>,
    events: mpsc::UnboundedReceiver<UploadEvent>,
    _subscription: Subscription,
}

fn upload_config(tag: &str) -> UploadConfig {
    UploadConfig {
        context_tag: tag.to_string(),
        base_delay_ms: 10,
        max_delay_ms: 40,
        max_retries: 3,
        heartbeat_ms: 1_000,
        chunk_size_bytes: 4,
        ..UploadConfig::default()
    }
}

async fn harness(api: MockApi, store: Option<Arc<SegmentStore>>) -> Harness {
    let api = Arc::new(api);
    let ledger = Arc::new(Ledger::open_in_memory(60_000).unwrap());
    let network = Arc::new(NetworkMonitor::new(NetworkStatus::default()));

    let worker = Arc::new(UploadWorker::new(
        &upload_config("test-ctx"),
        WorkerDeps {
            api: api.clone(),
            ledger: ledger.clone(),
            store,
            network: network.clone(),
            clock: Arc::new(SystemClock),
        },
    ));

    let (tx, events) = mpsc::unbounded_channel();
    let subscription = worker.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    Harness {
        api,
        ledger,
        network,
        worker,
        events,
        _subscription: subscription,
    }
}

impl Harness {
    /// Next segment-uploaded or segment-failed event
    async fn outcome(&mut self) -> UploadEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(event @ UploadEvent::SegmentUploaded { .. })
                    | Some(event @ UploadEvent::SegmentFailed { .. }) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("no terminal upload event")
    }
}

fn window(sequence: u64) -> SegmentWindow {
    SegmentWindow {
        sequence,
        core_start_ms: sequence * 10_000,
        core_end_ms: (sequence + 1) * 10_000,
        record_start_ms: (sequence * 10_000).saturating_sub(1_000),
        record_end_ms: (sequence + 1) * 10_000 + 1_000,
        overlap_ms: 1_000,
    }
}

fn click(t: u64) -> InputLogEvent {
    InputLogEvent {
        timestamp_ms: t,
        kind: "click".to_string(),
        data: serde_json::json!({"x": 1, "y": 2}),
    }
}

async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn task(segment_id: &str, logs: Vec<InputLogEvent>) -> UploadTask {
    UploadTask::new(
        "session-1",
        segment_id,
        &window(0),
        "video/webm",
        Some(Bytes::from_static(b"segment-bytes")),
        logs,
    )
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_delivered() {
    let mut h = harness(MockApi::failing_destinations(2), None).await;
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![click(5)])).await;

    match h.outcome().await {
        UploadEvent::SegmentUploaded {
            local_segment_id,
            remote_segment_id,
            destination_url,
        } => {
            assert_eq!(local_segment_id, "seg-1");
            assert_eq!(remote_segment_id, "remote-0-2");
            assert_eq!(destination_url, "https://bucket.example/0");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let stats = h.worker.stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.failed, 0);

    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.notify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.api.uploaded.lock().unwrap().clone(),
        vec![Bytes::from_static(b"segment-bytes")]
    );
    assert_eq!(*h.api.log_batches.lock().unwrap(), vec![vec![click(5)]]);

    // Delivered segments leave the ledger
    assert!(h.ledger.get("seg-1").unwrap().is_none());
    assert!(h.worker.wait_idle(Duration::from_secs(5)).await);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_retry_resumes_from_failed_step() {
    let mut h = harness(MockApi::failing_puts(1), None).await;
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![])).await;

    assert!(matches!(
        h.outcome().await,
        UploadEvent::SegmentUploaded { .. }
    ));

    // The destination from the first attempt was reused
    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.api.notify_calls.load(Ordering::SeqCst), 1);
    // No logs, no log upload
    assert!(h.api.log_batches.lock().unwrap().is_empty());
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_keep_ledger_record() {
    let mut h = harness(MockApi::failing_destinations(usize::MAX), None).await;
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![click(1)])).await;

    match h.outcome().await {
        UploadEvent::SegmentFailed {
            local_segment_id,
            reason,
        } => {
            assert_eq!(local_segment_id, "seg-1");
            assert!(reason.contains("connection reset"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let stats = h.worker.stats();
    assert_eq!(stats.attempts, 4);
    assert_eq!(stats.retries_scheduled, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 0);

    // Left for a later sweep, unleased
    let record = h.ledger.get("seg-1").unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Pending);
    assert_eq!(record.owner, None);
    assert_eq!(record.logs, vec![click(1)]);
    assert_eq!(h.worker.queue_len().await, 0);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_unstable_stream_pauses_uploads() {
    let mut h = harness(MockApi::default(), None).await;
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Unstable,
        rate_bps: None,
        streaming_active: true,
    });
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![])).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.worker.in_flight().await, 0);
    assert_eq!(h.worker.queue_len().await, 1);

    h.worker
        .handle_command(WorkerCommand::SetNetworkStatus {
            status: NetworkHealth::Degraded,
            rate_bps: Some(1_000_000),
            streaming_active: true,
        })
        .await;

    assert!(matches!(
        h.outcome().await,
        UploadEvent::SegmentUploaded { .. }
    ));
    assert_eq!(h.worker.stats().retries_scheduled, 0);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_unstable_network_without_stream_still_uploads() {
    let mut h = harness(MockApi::default(), None).await;
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Unstable,
        rate_bps: None,
        streaming_active: false,
    });
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![])).await;

    assert!(matches!(
        h.outcome().await,
        UploadEvent::SegmentUploaded { .. }
    ));
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_logs_attached_while_queued_ship_together() {
    let mut h = harness(MockApi::default(), None).await;
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Unstable,
        rate_bps: None,
        streaming_active: true,
    });
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![click(1)])).await;

    assert!(h.worker.attach_logs("seg-1", vec![click(2)]).await);
    assert_eq!(h.ledger.get("seg-1").unwrap().unwrap().logs.len(), 2);

    h.network.set_status(NetworkStatus::default());
    assert!(matches!(
        h.outcome().await,
        UploadEvent::SegmentUploaded { .. }
    ));
    assert_eq!(
        *h.api.log_batches.lock().unwrap(),
        vec![vec![click(1), click(2)]]
    );

    // Once delivered there is nowhere left to attach to
    assert!(!h.worker.attach_logs("seg-1", vec![click(3)]).await);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_same_segment_merges() {
    let h = harness(MockApi::default(), None).await;
    h.worker.enqueue(task("seg-1", vec![click(1)])).await;
    h.worker.enqueue(task("seg-1", vec![click(2)])).await;

    assert_eq!(h.worker.queue_len().await, 1);
    let record = h.ledger.get("seg-1").unwrap().unwrap();
    assert_eq!(record.logs, vec![click(1), click(2)]);
}

#[tokio::test]
async fn test_sweep_recovers_abandoned_segments() {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(
        SegmentStore::open(StoreBackend::Memory(MemoryBackend::new()), Some(1_024), clock.clone())
            .await
            .unwrap(),
    );
    store
        .save_segment(
            SegmentMeta {
                session_id: "session-1".to_string(),
                segment_id: "orphan".to_string(),
                window: window(3),
                content_type: "video/webm".to_string(),
                created_at_ms: clock.now_ms(),
            },
            Bytes::from_static(b"recovered"),
        )
        .await
        .unwrap();

    let mut h = harness(MockApi::default(), Some(store)).await;

    // A context that died mid-upload long ago
    let abandoned = task("orphan", vec![click(9)]);
    let mut record = abandoned.to_record();
    record.sequence = 3;
    let long_ago = clock.now_ms() - 120_000;
    h.ledger.upsert(&record, long_ago).unwrap();
    h.ledger.claim("orphan", "dead-tab", long_ago).unwrap().unwrap();

    // Only stored bytes are available to this context
    h.worker.start().await;
    h.worker.handle_command(WorkerCommand::ProcessUploads).await;

    match h.outcome().await {
        UploadEvent::SegmentUploaded {
            local_segment_id, ..
        } => assert_eq!(local_segment_id, "orphan"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        h.api.uploaded.lock().unwrap().clone(),
        vec![Bytes::from_static(b"recovered")]
    );
    assert_eq!(*h.api.log_batches.lock().unwrap(), vec![vec![click(9)]]);
    assert!(h.ledger.get("orphan").unwrap().is_none());
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_sweep_skips_live_leases() {
    let h = harness(MockApi::default(), None).await;
    let record = task("busy", vec![]).to_record();
    let now = SystemClock.now_ms();
    h.ledger.upsert(&record, now).unwrap();
    h.ledger.claim("busy", "other-tab", now).unwrap().unwrap();

    assert_eq!(h.worker.sweep().await, 0);
    assert_eq!(h.worker.queue_len().await, 0);
}

#[tokio::test]
async fn test_missing_bytes_fail_but_stay_in_ledger() {
    let mut h = harness(MockApi::default(), None).await;
    let record = task("lost", vec![click(3)]).to_record();
    h.ledger.upsert(&record, SystemClock.now_ms()).unwrap();

    h.worker.start().await;
    assert_eq!(h.worker.sweep().await, 1);

    match h.outcome().await {
        UploadEvent::SegmentFailed {
            local_segment_id, ..
        } => assert_eq!(local_segment_id, "lost"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.worker.stats().retries_scheduled, 0);
    assert_eq!(h.worker.queue_len().await, 0);

    // Another context holding the bytes can still deliver it
    let kept = h.ledger.get("lost").unwrap().unwrap();
    assert_eq!(kept.status, LedgerStatus::Pending);
    assert_eq!(kept.owner, None);
    assert_eq!(kept.logs, vec![click(3)]);
    h.worker.shutdown().await;
}

fn filesystem_store_backend(dir: &TempDir) -> StoreBackend {
    StoreBackend::Filesystem(
        FilesystemBackend::new(FilesystemConfig {
            base_path: dir.path().join("segments").to_string_lossy().to_string(),
            file_extension: "webm".to_string(),
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn test_sweep_finds_segments_saved_by_another_process() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(SystemClock);

    // The sweeping process opened its store before the recorder saved anything
    let sweeper_store = Arc::new(
        SegmentStore::open(filesystem_store_backend(&dir), Some(4_096), clock.clone())
            .await
            .unwrap(),
    );
    let recorder_store =
        SegmentStore::open(filesystem_store_backend(&dir), Some(4_096), clock.clone())
            .await
            .unwrap();
    recorder_store
        .save_segment(
            SegmentMeta {
                session_id: "session-1".to_string(),
                segment_id: "seg-x".to_string(),
                window: window(0),
                content_type: "video/webm".to_string(),
                created_at_ms: clock.now_ms(),
            },
            Bytes::from_static(b"written-elsewhere"),
        )
        .await
        .unwrap();

    let mut h = harness(MockApi::default(), Some(sweeper_store.clone())).await;
    let pending = task("seg-x", vec![]);
    h.ledger.upsert(&pending.to_record(), clock.now_ms()).unwrap();

    h.worker.start().await;
    assert_eq!(h.worker.sweep().await, 1);

    match h.outcome().await {
        UploadEvent::SegmentUploaded {
            local_segment_id, ..
        } => assert_eq!(local_segment_id, "seg-x"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        h.api.uploaded.lock().unwrap().clone(),
        vec![Bytes::from_static(b"written-elsewhere")]
    );
    assert!(h.ledger.get("seg-x").unwrap().is_none());
    assert!(sweeper_store.contains("session-1", "seg-x").await);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_unstable_mid_transfer_aborts_without_spending_a_retry() {
    let mut h = harness(MockApi::default(), None).await;
    // 13 bytes at 4 B/s keeps the PUT busy for about three seconds
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Healthy,
        rate_bps: Some(4),
        streaming_active: true,
    });
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![])).await;

    wait_until(|| h.api.put_calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Unstable,
        rate_bps: Some(4),
        streaming_active: true,
    });

    let worker = h.worker.clone();
    wait_until(move || worker.stats().policy_pauses == 1).await;
    assert!(h.api.uploaded.lock().unwrap().is_empty());
    assert_eq!(h.worker.queue_len().await, 1);

    // Held back, not failed: the lease went back to pending
    let record = h.ledger.get("seg-1").unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Pending);

    h.network.set_status(NetworkStatus::default());
    assert!(matches!(
        h.outcome().await,
        UploadEvent::SegmentUploaded { .. }
    ));

    let stats = h.worker.stats();
    assert_eq!(stats.policy_pauses, 1);
    assert_eq!(stats.retries_scheduled, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.api.uploaded.lock().unwrap().clone(),
        vec![Bytes::from_static(b"segment-bytes")]
    );
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_logs_attached_in_flight_ship_as_follow_up() {
    let mut h = harness(MockApi::default(), None).await;
    h.network.set_status(NetworkStatus {
        health: NetworkHealth::Healthy,
        rate_bps: Some(4),
        streaming_active: false,
    });
    h.worker.start().await;
    h.worker.enqueue(task("seg-1", vec![click(1)])).await;

    wait_until(|| h.api.put_calls.load(Ordering::SeqCst) == 1).await;
    assert_eq!(h.worker.in_flight().await, 1);
    assert!(h.worker.attach_logs("seg-1", vec![click(2)]).await);
    assert_eq!(
        h.ledger.get("seg-1").unwrap().unwrap().logs,
        vec![click(1), click(2)]
    );

    match h.outcome().await {
        UploadEvent::SegmentUploaded {
            local_segment_id, ..
        } => assert_eq!(local_segment_id, "seg-1"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.worker.wait_idle(Duration::from_secs(10)).await);
    h.worker.shutdown().await;

    assert_eq!(
        *h.api.log_batches.lock().unwrap(),
        vec![vec![click(1)], vec![click(2)]]
    );
    // The follow-up reuses the first attempt's destination and bytes
    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.put_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.notify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.worker.stats().uploaded, 1);

    // The follow-up is silent; only the first delivery was announced
    let mut uploaded_events = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, UploadEvent::SegmentUploaded { .. }) {
            uploaded_events += 1;
        }
    }
    assert_eq!(uploaded_events, 0);
    assert!(h.ledger.get("seg-1").unwrap().is_none());
}

#[tokio::test]
async fn test_reset_clears_queue_but_not_ledger() {
    let h = harness(MockApi::default(), None).await;
    h.worker.enqueue(task("seg-1", vec![])).await;
    h.worker.enqueue(task("seg-2", vec![])).await;
    assert_eq!(h.worker.queue_len().await, 2);

    h.worker.handle_command(WorkerCommand::Reset).await;
    assert_eq!(h.worker.queue_len().await, 0);
    assert_eq!(h.ledger.list().unwrap().len(), 2);

    // A sweep picks them back up
    assert_eq!(h.worker.sweep().await, 2);
}

#[tokio::test]
async fn test_cancel_session_drops_queued_segments() {
    let h = harness(MockApi::default(), None).await;
    h.worker.enqueue(task("seg-1", vec![])).await;
    let mut other = task("seg-2", vec![]);
    other.session_id = "session-2".to_string();
    h.worker.enqueue(other).await;

    h.worker.cancel_session("session-1").await;
    assert_eq!(h.worker.queue_len().await, 1);
    assert!(h.ledger.get("seg-1").unwrap().is_some());
}

#[tokio::test]
async fn test_hub_routes_and_tags_events() {
    let h = harness(MockApi::default(), None).await;
    let hub = UploadHub::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _events = hub.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    hub.init(h.worker.clone()).await.unwrap();
    assert!(hub.init(h.worker.clone()).await.is_err());
    assert_eq!(hub.context_tags(), vec!["test-ctx".to_string()]);
    assert!(hub.dispatch("missing", WorkerCommand::Flush).await.is_err());

    hub.dispatch(
        "test-ctx",
        WorkerCommand::EnqueueSegment {
            session_id: "session-1".to_string(),
            sequence: 0,
            segment: segment_relay::SegmentDescriptor {
                id: "seg-1".to_string(),
                window: window(0),
            },
            content_type: "video/webm".to_string(),
            blob: Some(Bytes::from_static(b"hub-bytes")),
            logs: vec![],
        },
    )
    .await
    .unwrap();

    let uploaded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("hub closed");
            if matches!(event.event, UploadEvent::SegmentUploaded { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("no upload through the hub");

    assert_eq!(uploaded.context_tag, "test-ctx");
    let wire = serde_json::to_value(&uploaded).unwrap();
    assert_eq!(wire["contextTag"], "test-ctx");
    assert_eq!(wire["type"], "segment-uploaded");
    assert_eq!(wire["localSegmentId"], "seg-1");

    hub.shutdown().await;
    assert!(hub.worker("test-ctx").is_none());
}

#[tokio::test]
async fn test_segment_leased_elsewhere_is_left_alone() {
    let h = harness(MockApi::default(), None).await;
    let now = SystemClock.now_ms();
    h.ledger.upsert(&task("shared", vec![]).to_record(), now).unwrap();
    h.ledger.claim("shared", "other-tab", now).unwrap().unwrap();

    h.worker.start().await;
    h.worker.enqueue(task("shared", vec![click(4)])).await;
    assert!(h.worker.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(h.worker.stats().attempts, 0);
    assert_eq!(h.api.destination_calls.load(Ordering::SeqCst), 0);

    // The owner keeps its lease and sees the merged logs
    let record = h.ledger.get("shared").unwrap().unwrap();
    assert_eq!(record.owner.as_deref(), Some("other-tab"));
    assert_eq!(record.logs, vec![click(4)]);
    h.worker.shutdown().await;
}
