//! Round-trip and framing tests for the two session-store encoders.

mod common;

use std::fs::OpenOptions;
use std::io::Write;

use common::make_event;
use gosling::event::EventKind;
use gosling::storage::{EventFilter, Session, SessionManager, StorageFormat, StoreError};
use tempfile::TempDir;

fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        ..Session::new(0, "/usr/bin/testprog")
    }
}

#[test]
fn framed_roundtrip() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();

    let events = [
        make_event(100, EventKind::NewGoroutine, 1, 0, [0, 1, 0, 0, 0]),
        make_event(101, EventKind::StateChange, 1, 0, [1, 2, 1, 0, 0]),
        make_event(102, EventKind::GoExit, 1, 0, [1, 102, 0, 0, 0]),
    ];

    let store = manager.create(&session("s1"), StorageFormat::Framed).unwrap();
    for event in &events {
        store.append_one(event).unwrap();
    }
    store.close().unwrap();
    manager.release("s1");

    let reopened = manager.open("s1").unwrap();
    assert_eq!(reopened.event_count(), 3);

    let scan = reopened.scan(&EventFilter::default()).unwrap();
    assert!(scan.diagnostic.is_none());
    assert_eq!(scan.events, events);

    let goroutines = reopened.unique_goroutines().unwrap();
    assert_eq!(goroutines.into_iter().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn textual_filter_with_limit() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s2"), StorageFormat::Jsonl).unwrap();

    // 1,000 events alternating kind and goroutine.
    let events: Vec<_> = (0..1000u64)
        .map(|i| {
            let (kind, goroutine) = if i % 2 == 0 {
                (EventKind::MakeSlice, 10)
            } else {
                (EventKind::MakeMap, 11)
            };
            make_event(i, kind, goroutine, 0, [0; 5])
        })
        .collect();
    store.append_batch(&events).unwrap();
    store.close().unwrap();
    manager.release("s2");

    let reopened = manager.open("s2").unwrap();
    let scan = reopened
        .scan(&EventFilter {
            goroutine: Some(10),
            limit: 50,
            ..EventFilter::default()
        })
        .unwrap();

    assert_eq!(scan.events.len(), 50);
    assert!(scan.events.iter().all(|e| e.goroutine == 10));
    // Append order: timestamps strictly increasing.
    assert!(scan.events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(scan.events[0].timestamp, 0);
    assert_eq!(scan.events[49].timestamp, 98);
}

#[test]
fn framed_mixes_single_and_batch_frames() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s3"), StorageFormat::Framed).unwrap();

    let events: Vec<_> = (0..8u64)
        .map(|i| make_event(i, EventKind::NewObject, 7, 0, [64, 25, 0, 0, 0]))
        .collect();

    store.append_one(&events[0]).unwrap();
    store.append_one(&events[1]).unwrap();
    store.append_batch(&events[2..7]).unwrap();
    store.append_one(&events[7]).unwrap();
    store.close().unwrap();
    manager.release("s3");

    let reopened = manager.open("s3").unwrap();
    assert_eq!(reopened.event_count(), 8);
    let scan = reopened.scan(&EventFilter::default()).unwrap();
    assert_eq!(scan.events, events);
}

#[test]
fn framed_offset_and_time_bounds() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s4"), StorageFormat::Framed).unwrap();

    let events: Vec<_> = (0..100u64)
        .map(|i| make_event(1000 + i, EventKind::StateChange, 3, 0, [0, 2, 3, 0, 0]))
        .collect();
    store.append_batch(&events).unwrap();
    store.close().unwrap();
    manager.release("s4");

    let reopened = manager.open("s4").unwrap();
    let scan = reopened
        .scan(&EventFilter {
            start_time: Some(1010),
            end_time: Some(1019),
            offset: 2,
            limit: 5,
            ..EventFilter::default()
        })
        .unwrap();
    let timestamps: Vec<_> = scan.events.iter().map(|e| e.timestamp).collect();
    assert_eq!(timestamps, vec![1012, 1013, 1014, 1015, 1016]);
}

#[test]
fn framed_truncated_tail_stays_readable() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s5"), StorageFormat::Framed).unwrap();

    let events: Vec<_> = (0..3u64)
        .map(|i| make_event(i, EventKind::GoExit, 9, 0, [9, i, 0, 0, 0]))
        .collect();
    store.append_batch(&events).unwrap();
    store.close().unwrap();
    manager.release("s5");

    // Damage the file: a frame header promising more bytes than exist.
    let events_path = dir.path().join("s5").join("events.pb");
    let good_len = events_path.metadata().unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&events_path).unwrap();
    file.write_all(&100u32.to_le_bytes()).unwrap();
    file.write_all(&[0xAB; 10]).unwrap();
    drop(file);

    let reopened = manager.open("s5").unwrap();
    assert_eq!(reopened.event_count(), 3, "well-formed prefix still counts");

    let scan = reopened.scan(&EventFilter::default()).unwrap();
    assert_eq!(scan.events, events, "well-formed prefix still scans");
    match scan.diagnostic {
        Some(StoreError::Parse { offset, .. }) => assert_eq!(offset, good_len),
        other => panic!("expected a parse diagnostic, got {other:?}"),
    }
}

#[test]
fn textual_malformed_tail_stays_readable() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s6"), StorageFormat::Jsonl).unwrap();

    let event = make_event(5, EventKind::MakeMap, 2, 1, [8, 2, 16, 11, 4]);
    store.append_one(&event).unwrap();
    store.close().unwrap();
    manager.release("s6");

    let events_path = dir.path().join("s6").join("events.jsonl");
    let good_len = events_path.metadata().unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&events_path).unwrap();
    file.write_all(b"{\"timestamp\": 6, \"event_ty").unwrap();
    drop(file);

    let reopened = manager.open("s6").unwrap();
    assert_eq!(reopened.event_count(), 1);

    let scan = reopened.scan(&EventFilter::default()).unwrap();
    assert_eq!(scan.events, vec![event]);
    match scan.diagnostic {
        Some(StoreError::Parse { offset, .. }) => assert_eq!(offset, good_len),
        other => panic!("expected a parse diagnostic, got {other:?}"),
    }
}

#[test]
fn textual_ignores_unknown_fields() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();
    let store = manager.create(&session("s7"), StorageFormat::Jsonl).unwrap();
    store.close().unwrap();
    manager.release("s7");

    let events_path = dir.path().join("s7").join("events.jsonl");
    let mut file = OpenOptions::new().append(true).open(&events_path).unwrap();
    writeln!(
        file,
        "{{\"timestamp\":42,\"event_type\":4,\"goroutine\":8,\"parent_goroutine\":1,\
         \"attributes\":[1,8,0,0,0],\"annotation\":\"added by a newer writer\"}}"
    )
    .unwrap();
    drop(file);

    let reopened = manager.open("s7").unwrap();
    let scan = reopened.scan(&EventFilter::default()).unwrap();
    assert!(scan.diagnostic.is_none());
    assert_eq!(
        scan.events,
        vec![make_event(42, EventKind::NewGoroutine, 8, 1, [1, 8, 0, 0, 0])]
    );
}

#[test]
fn auto_detect_picks_the_created_encoder() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();

    for (id, format) in [("fr", StorageFormat::Framed), ("tx", StorageFormat::Jsonl)] {
        let store = manager.create(&session(id), format).unwrap();
        let events: Vec<_> = (0..10u64)
            .map(|i| make_event(i, EventKind::MakeSlice, 4, 0, [8, 6, i, i, 0]))
            .collect();
        store.append_batch(&events).unwrap();
        store.close().unwrap();
        manager.release(id);

        let reopened = manager.open(id).unwrap();
        assert_eq!(reopened.event_count(), 10, "{id}");
        let scan = reopened.scan(&EventFilter::default()).unwrap();
        assert_eq!(scan.events, events, "{id}");
    }
}

#[test]
fn manager_lifecycle() {
    let dir = TempDir::new().unwrap();
    let manager = SessionManager::new(dir.path()).unwrap();

    assert!(manager.list().unwrap().is_empty());
    assert!(matches!(
        manager.open("missing"),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        manager.get("missing"),
        Err(StoreError::NotFound(_))
    ));

    let store = manager.create(&session("run"), StorageFormat::Framed).unwrap();
    assert!(matches!(
        manager.create(&session("run"), StorageFormat::Framed),
        Err(StoreError::AlreadyExists(_))
    ));

    // A live writer blocks deletion.
    assert!(matches!(manager.delete("run"), Err(StoreError::InUse(_))));

    let mut meta = store.session();
    meta.end_time = Some(chrono::Utc::now());
    store.update_session(&meta).unwrap();
    store.close().unwrap();
    manager.release("run");

    let listed = manager.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "run");
    assert!(listed[0].end_time.is_some());

    manager.delete("run").unwrap();
    assert!(manager.list().unwrap().is_empty());
}
