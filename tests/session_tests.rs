// Recording session tests

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use segment_relay::api::{ByteStream, DestinationRequest};
use segment_relay::config::{RecorderSettings, UploadConfig};
use segment_relay::error::UploadResult;
use segment_relay::recorder::{Capture, MediaSource};
use segment_relay::store::{MemoryBackend, StoreBackend};
use segment_relay::{
    InputLogEvent, Ledger, NetworkHealth, NetworkMonitor, NetworkStatus, RecordingSession,
    SegmentStore, SystemClock, UploadApi, UploadDestination, UploadWorker, WorkerDeps,
};

struct CountingSource {
    started: AtomicUsize,
}

struct NumberedCapture(usize);

#[async_trait]
impl MediaSource for CountingSource {
    fn supports(&self, content_type: &str) -> bool {
        content_type == "video/webm"
    }

    async fn begin_capture(&self, _content_type: &str) -> Result<Box<dyn Capture>> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NumberedCapture(n)))
    }
}

#[async_trait]
impl Capture for NumberedCapture {
    async fn finish(self: Box<Self>) -> Result<Bytes> {
        Ok(Bytes::from(format!("capture-{}", self.0)))
    }
}

#[derive(Default)]
struct RecordingApi {
    calls: AtomicUsize,
    uploaded: Mutex<Vec<Bytes>>,
    log_batches: Mutex<Vec<Vec<u64>>>,
}

#[async_trait]
impl UploadApi for RecordingApi {
    async fn request_upload_destination(
        &self,
        request: &DestinationRequest,
    ) -> UploadResult<UploadDestination> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UploadDestination {
            remote_segment_id: format!("{}-{}", request.session_id, n),
            destination_url: format!("https://bucket.example/{}", n),
            expires_in: None,
        })
    }

    async fn put_bytes(
        &self,
        _destination_url: &str,
        _content_type: &str,
        _content_length: u64,
        body: ByteStream,
    ) -> UploadResult<()> {
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        self.uploaded.lock().unwrap().push(Bytes::from(chunks.concat()));
        Ok(())
    }

    async fn notify_upload_complete(&self, _: &str, _: &str) -> UploadResult<()> {
        Ok(())
    }

    async fn upload_input_logs(
        &self,
        _: &str,
        _: &str,
        _: &str,
        logs: &[InputLogEvent],
    ) -> UploadResult<()> {
        self.log_batches
            .lock()
            .unwrap()
            .push(logs.iter().map(|e| e.timestamp_ms).collect());
        Ok(())
    }
}

fn key(t: u64) -> InputLogEvent {
    InputLogEvent {
        timestamp_ms: t,
        kind: "keydown".to_string(),
        data: serde_json::Value::Null,
    }
}

struct Fixture {
    session: RecordingSession,
    store: Arc<SegmentStore>,
    worker: Arc<UploadWorker>,
    api: Arc<RecordingApi>,
    ledger: Arc<Ledger>,
    network: Arc<NetworkMonitor>,
}

/// A 1000 ms / 200 ms session whose uploads are held back until the
/// network is set healthy again
async fn paused_session(session_id: &str) -> Fixture {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(
        SegmentStore::open(StoreBackend::Memory(MemoryBackend::new()), Some(4_096), clock.clone())
            .await
            .unwrap(),
    );
    let api = Arc::new(RecordingApi::default());
    let ledger = Arc::new(Ledger::open_in_memory(60_000).unwrap());

    let network = Arc::new(NetworkMonitor::new(NetworkStatus {
        health: NetworkHealth::Unstable,
        rate_bps: None,
        streaming_active: true,
    }));

    let worker = Arc::new(UploadWorker::new(
        &UploadConfig {
            context_tag: "session-test".to_string(),
            base_delay_ms: 10,
            max_delay_ms: 40,
            ..UploadConfig::default()
        },
        WorkerDeps {
            api: api.clone(),
            ledger: ledger.clone(),
            store: Some(store.clone()),
            network: network.clone(),
            clock: clock.clone(),
        },
    ));
    worker.start().await;

    let session = RecordingSession::new(
        session_id,
        RecorderSettings {
            segment_duration_ms: 1_000,
            overlap_ms: 200,
            content_type: "video/webm".to_string(),
        },
        Arc::new(CountingSource {
            started: AtomicUsize::new(0),
        }),
        store.clone(),
        worker.clone(),
        clock,
    );

    Fixture {
        session,
        store,
        worker,
        api,
        ledger,
        network,
    }
}

impl Fixture {
    /// Release the network, drain the worker and return sorted log batches
    async fn deliver(&self) -> Vec<Vec<u64>> {
        self.network.set_status(NetworkStatus::default());
        assert!(self.worker.wait_idle(Duration::from_secs(10)).await);
        self.worker.shutdown().await;

        let mut batches = self.api.log_batches.lock().unwrap().clone();
        for batch in &mut batches {
            batch.sort();
        }
        batches.sort();
        batches
    }
}

#[tokio::test]
async fn test_session_records_attributes_and_delivers() {
    let f = paused_session("session-1").await;
    let session = &f.session;
    session.start().await;
    assert!(session.is_recording_supported());

    // Both segments are recording during the overlap
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(session.record_input(key(900)).await.len(), 2);
    assert_eq!(session.record_input(key(500)).await.len(), 1);

    // The first segment has been handed over by now
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.segments_handed_over(), 1);
    assert_eq!(session.record_input(key(1_100)).await.len(), 2);

    session.finish().await;
    assert_eq!(session.segments_handed_over(), 2);
    assert_eq!(f.store.list_segments().await.len(), 2);
    assert_eq!(f.ledger.list().unwrap().len(), 2);

    let batches = f.deliver().await;

    let mut uploaded = f.api.uploaded.lock().unwrap().clone();
    uploaded.sort();
    assert_eq!(
        uploaded,
        vec![Bytes::from("capture-0"), Bytes::from("capture-1")]
    );
    assert_eq!(batches, vec![vec![500, 900, 1_100], vec![900, 1_100]]);
    assert!(f.ledger.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_handed_over_buffers_are_released() {
    let f = paused_session("session-3").await;
    let session = &f.session;
    session.start().await;

    // Segment 0 records [0, 1200) and is handed over shortly after
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(session.segments_handed_over(), 1);

    // An event past its window lets the session forget segment 0
    assert_eq!(session.record_input(key(1_300)).await.len(), 1);
    assert_eq!(session.buffered_segments(), 1);

    // A straggler still reaches it through the uploader
    assert_eq!(session.record_input(key(1_100)).await.len(), 2);
    assert_eq!(session.buffered_segments(), 1);

    session.finish().await;
    assert_eq!(session.segments_handed_over(), 2);
    assert_eq!(f.deliver().await, vec![vec![1_100], vec![1_100, 1_300]]);
}

#[tokio::test]
async fn test_unsupported_source_disables_recording() {
    struct NoEncoder;

    #[async_trait]
    impl MediaSource for NoEncoder {
        fn supports(&self, _content_type: &str) -> bool {
            false
        }

        async fn begin_capture(&self, _content_type: &str) -> Result<Box<dyn Capture>> {
            anyhow::bail!("no encoder")
        }
    }

    let clock = Arc::new(SystemClock);
    let store = Arc::new(
        SegmentStore::open(StoreBackend::Memory(MemoryBackend::new()), Some(1_024), clock.clone())
            .await
            .unwrap(),
    );
    let worker = Arc::new(UploadWorker::new(
        &UploadConfig::default(),
        WorkerDeps {
            api: Arc::new(RecordingApi::default()),
            ledger: Arc::new(Ledger::open_in_memory(60_000).unwrap()),
            store: Some(store.clone()),
            network: Arc::new(NetworkMonitor::new(NetworkStatus::default())),
            clock: clock.clone(),
        },
    ));

    let session = RecordingSession::new(
        "session-2",
        RecorderSettings::default(),
        Arc::new(NoEncoder),
        store,
        worker,
        clock,
    );
    session.start().await;
    assert!(!session.is_recording_supported());
    assert!(session.record_input(key(10)).await.is_empty());
    session.finish().await;
    assert_eq!(session.segments_handed_over(), 0);
}
