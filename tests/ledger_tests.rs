// Upload ledger tests

use std::sync::Arc;
use tempfile::TempDir;

use segment_relay::config::LedgerConfig;
use segment_relay::{InputLogEvent, Ledger, LedgerStatus, PendingUploadRecord};

const STALE_MS: i64 = 60_000;

fn config(dir: &TempDir) -> LedgerConfig {
    LedgerConfig {
        path: dir.path().join("state").join("ledger.db").to_string_lossy().to_string(),
        stale_after_ms: STALE_MS,
        busy_timeout_ms: 5_000,
    }
}

fn event(t: u64) -> InputLogEvent {
    InputLogEvent {
        timestamp_ms: t,
        kind: "keydown".to_string(),
        data: serde_json::json!({"key": "a"}),
    }
}

fn record(segment_id: &str, logs: Vec<InputLogEvent>) -> PendingUploadRecord {
    PendingUploadRecord::pending(segment_id, "session-1", 0, 0, 11_000, "video/webm", logs)
}

#[test]
fn test_exactly_one_context_claims() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let setup = Ledger::open(&config).unwrap();
    setup.upsert(&record("seg-1", vec![]), 1_000).unwrap();

    let contexts: Vec<Arc<Ledger>> = (0..4)
        .map(|_| Arc::new(Ledger::open(&config).unwrap()))
        .collect();

    let handles: Vec<_> = contexts
        .into_iter()
        .enumerate()
        .map(|(i, ledger)| {
            std::thread::spawn(move || {
                ledger
                    .claim("seg-1", &format!("ctx-{}", i), 2_000)
                    .unwrap()
                    .is_some()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let stored = setup.get("seg-1").unwrap().unwrap();
    assert_eq!(stored.status, LedgerStatus::Processing);
    assert_eq!(stored.processing_started_at, Some(2_000));
    assert!(stored.owner.unwrap().starts_with("ctx-"));
}

#[test]
fn test_stale_lease_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let tab = Ledger::open(&config).unwrap();
    let sweeper = Ledger::open(&config).unwrap();

    tab.upsert(&record("seg-1", vec![]), 0).unwrap();
    assert!(tab.claim("seg-1", "tab", 1_000).unwrap().is_some());

    // Still fresh
    assert!(sweeper.claim("seg-1", "sweeper", 1_000 + STALE_MS).unwrap().is_none());

    // Expired
    let taken = sweeper
        .claim("seg-1", "sweeper", 1_001 + STALE_MS)
        .unwrap()
        .unwrap();
    assert_eq!(taken.owner.as_deref(), Some("sweeper"));

    // The previous owner can no longer release or renew it
    assert!(!tab.release("seg-1", "tab", 70_000).unwrap());
    assert!(!tab.heartbeat("seg-1", "tab", 70_000).unwrap());
}

#[test]
fn test_heartbeat_keeps_lease_fresh() {
    let ledger = Ledger::open_in_memory(STALE_MS).unwrap();
    ledger.upsert(&record("seg-1", vec![]), 0).unwrap();
    ledger.claim("seg-1", "owner", 0).unwrap().unwrap();

    assert!(ledger.heartbeat("seg-1", "owner", 50_000).unwrap());
    assert!(ledger.claim("seg-1", "other", 100_000).unwrap().is_none());
    assert!(ledger.claim("seg-1", "other", 110_001).unwrap().is_some());
}

#[test]
fn test_release_returns_record_to_pending() {
    let ledger = Ledger::open_in_memory(STALE_MS).unwrap();
    ledger.upsert(&record("seg-1", vec![]), 0).unwrap();
    ledger.claim("seg-1", "owner", 10).unwrap().unwrap();

    assert!(ledger.release("seg-1", "owner", 20).unwrap());
    let stored = ledger.get("seg-1").unwrap().unwrap();
    assert_eq!(stored.status, LedgerStatus::Pending);
    assert_eq!(stored.owner, None);
    assert_eq!(stored.processing_started_at, None);
    assert_eq!(stored.updated_at, 20);

    // Anyone may claim it again straight away
    assert!(ledger.claim("seg-1", "next", 21).unwrap().is_some());
}

#[test]
fn test_upsert_keeps_lease_and_merges_logs() {
    let ledger = Ledger::open_in_memory(STALE_MS).unwrap();
    ledger.upsert(&record("seg-1", vec![event(1)]), 0).unwrap();
    ledger.claim("seg-1", "owner", 5).unwrap().unwrap();

    ledger.upsert(&record("seg-1", vec![event(2)]), 10).unwrap();
    let stored = ledger.get("seg-1").unwrap().unwrap();
    assert_eq!(stored.status, LedgerStatus::Processing);
    assert_eq!(stored.owner.as_deref(), Some("owner"));
    assert_eq!(
        stored.logs.iter().map(|e| e.timestamp_ms).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_append_and_set_logs() {
    let ledger = Ledger::open_in_memory(STALE_MS).unwrap();
    assert!(!ledger.append_logs("missing", &[event(1)], 0).unwrap());

    ledger.upsert(&record("seg-1", vec![]), 0).unwrap();
    assert!(ledger.append_logs("seg-1", &[event(3), event(4)], 1).unwrap());
    assert_eq!(ledger.get("seg-1").unwrap().unwrap().logs.len(), 2);

    ledger.set_logs("seg-1", &[], 2).unwrap();
    assert!(ledger.get("seg-1").unwrap().unwrap().logs.is_empty());
}

#[test]
fn test_sweep_candidates_skip_live_leases() {
    let ledger = Ledger::open_in_memory(STALE_MS).unwrap();
    for id in ["pending", "live", "stale"] {
        ledger.upsert(&record(id, vec![]), 0).unwrap();
    }
    ledger.claim("live", "a", 50_000).unwrap().unwrap();
    ledger.claim("stale", "b", 1_000).unwrap().unwrap();

    let mut ids: Vec<String> = ledger
        .sweep_candidates(70_000)
        .unwrap()
        .into_iter()
        .map(|r| r.segment_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["pending", "stale"]);
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    {
        let ledger = Ledger::open(&config).unwrap();
        ledger.upsert(&record("seg-1", vec![event(7)]), 100).unwrap();
        ledger.upsert(&record("seg-2", vec![]), 200).unwrap();
        assert!(ledger.delete("seg-2").unwrap());
    }

    let ledger = Ledger::open(&config).unwrap();
    let records = ledger.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].segment_id, "seg-1");
    assert_eq!(records[0].end_ms, 11_000);
    assert_eq!(records[0].logs, vec![event(7)]);
    assert!(!ledger.delete("seg-2").unwrap());
}
