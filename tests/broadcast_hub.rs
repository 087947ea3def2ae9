//! Broadcast hub behavior: frame shapes, per-subscriber ordering, and the
//! slow-viewer eviction policy.

mod common;

use std::time::{Duration, Instant};

use common::make_event;
use gosling::broadcast::{Hub, SLOW_PUBLISH_LIMIT, SUBSCRIBER_QUEUE_CAPACITY};
use gosling::event::EventKind;

/// Pop frames until `want` have arrived or the deadline passes. The
/// dispatcher runs on its own thread, so tests poll the subscriber ring the
/// way a connection task would.
fn drain(
    subscriber: &gosling::broadcast::Subscriber,
    want: usize,
    into: &mut Vec<String>,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while into.len() < want {
        match subscriber.pop() {
            Some(frame) => into.push(frame.to_string()),
            None => {
                assert!(Instant::now() < deadline, "timed out waiting for frames");
                std::thread::yield_now();
            }
        }
    }
}

#[test]
fn batch_and_single_frame_shapes() {
    let hub = Hub::start().unwrap();
    let subscriber = hub.subscribe();

    hub.broadcast(make_event(7, EventKind::GoExit, 3, 0, [3, 7, 0, 0, 0]));
    hub.broadcast_batch(vec![
        make_event(8, EventKind::MakeSlice, 4, 0, [8, 6, 2, 4, 0]),
        make_event(9, EventKind::MakeSlice, 4, 0, [8, 6, 3, 4, 0]),
    ]);

    let mut frames = Vec::new();
    drain(&subscriber, 2, &mut frames);
    hub.shutdown();

    let single: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(single["timestamp"], 7);
    assert_eq!(single["event_type"], 5);
    assert_eq!(single["goroutine"], 3);

    let batch: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
    assert_eq!(batch["type"], "batch");
    assert_eq!(batch["events"].as_array().unwrap().len(), 2);
    assert_eq!(batch["events"][0]["timestamp"], 8);
    assert_eq!(batch["events"][1]["timestamp"], 9);
}

#[test]
fn slow_subscriber_is_evicted_and_fast_one_sees_everything() {
    let hub = Hub::start().unwrap();
    let slow = hub.subscribe();
    let fast = hub.subscribe();

    let mut received = Vec::new();
    let total = 1000usize;
    // Publish in bursts smaller than the subscriber ring and drain the fast
    // viewer between bursts, the way a healthy connection keeps up. The slow
    // viewer never pops.
    for burst in 0..10 {
        for i in 0..100 {
            let n = (burst * 100 + i) as u64;
            hub.broadcast(make_event(n, EventKind::NewGoroutine, 1, 0, [1, n, 0, 0, 0]));
        }
        drain(&fast, (burst + 1) * 100, &mut received);
    }
    hub.shutdown();

    assert_eq!(received.len(), total);
    for (i, frame) in received.iter().enumerate() {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!(value["timestamp"], i as u64, "frames must arrive in dispatch order");
    }

    assert!(slow.is_closed(), "slow viewer must be disconnected");
    // The ring filled at SUBSCRIBER_QUEUE_CAPACITY publishes; the next
    // SLOW_PUBLISH_LIMIT publishes each displaced a frame, then eviction.
    assert_eq!(slow.dropped_frames(), u64::from(SLOW_PUBLISH_LIMIT));
    let mut backlog = 0;
    while slow.pop().is_some() {
        backlog += 1;
    }
    assert_eq!(backlog, SUBSCRIBER_QUEUE_CAPACITY);
}

#[test]
fn unsubscribe_closes_the_viewer() {
    let hub = Hub::start().unwrap();
    let subscriber = hub.subscribe();
    assert_eq!(hub.subscriber_count(), 1);

    hub.unsubscribe(subscriber.id());
    assert_eq!(hub.subscriber_count(), 0);
    assert!(subscriber.is_closed());
    hub.shutdown();
}
