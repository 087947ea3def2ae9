//! Metrics sampler: swap-on-sample semantics, snapshot coherence, and the
//! terminal dump. The sampler thread just calls `sample()` on a cadence, so
//! these tests drive sampling directly and stay deterministic.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use gosling::event::EventKind;
use gosling::metrics::{MetricsCollector, PipelineMetrics};
use tempfile::TempDir;

fn collector(
    metrics: &Arc<PipelineMetrics>,
    depth: &Arc<AtomicUsize>,
) -> Arc<MetricsCollector> {
    MetricsCollector::new(
        metrics.clone(),
        depth.clone(),
        Duration::from_millis(1000),
        1,
        1,
    )
}

#[test]
fn steady_feed_yields_expected_rates() {
    let metrics = PipelineMetrics::new();
    let depth = Arc::new(AtomicUsize::new(0));
    let collector = collector(&metrics, &depth);

    // A steady 100 events per 1-second interval, for 10 samples.
    for _ in 0..10 {
        for i in 0..100u64 {
            metrics.note_read();
            metrics.note_queue_wait(1_000);
            metrics.note_processed(EventKind::StateChange, 500, 200 + i % 3);
        }
        let snapshot = collector.sample();
        assert!((snapshot.rps - 100.0).abs() < 10.0, "rps {}", snapshot.rps);
        assert!((snapshot.pps - 100.0).abs() < 10.0, "pps {}", snapshot.pps);
        assert_eq!(snapshot.ewp, 0, "queue returns to 0 between samples");
        assert_eq!(snapshot.lat, 500.0);
        assert_eq!(snapshot.qwl, 1_000.0);
    }

    assert_eq!(collector.sample_count(), 10);
    let last = collector.latest();
    assert_eq!(last.events_by_kind["casgstatus"], 1_000);
}

#[test]
fn interval_counters_reset_on_sample() {
    let metrics = PipelineMetrics::new();
    let depth = Arc::new(AtomicUsize::new(3));
    let collector = collector(&metrics, &depth);

    metrics.note_read();
    metrics.note_read();
    metrics.note_processed(EventKind::GoExit, 40, 10);
    metrics.note_flush(5_000);

    let first = collector.sample();
    assert_eq!(first.rps, 2.0);
    assert_eq!(first.pps, 1.0);
    assert_eq!(first.ewp, 3);
    assert_eq!(first.lat, 40.0);
    assert_eq!(first.bfl, 5_000.0);

    // Nothing happened since; per-interval series go to zero, cumulative
    // per-kind counts stay.
    let second = collector.sample();
    assert_eq!(second.rps, 0.0);
    assert_eq!(second.pps, 0.0);
    assert_eq!(second.lat, 0.0);
    assert_eq!(second.bfl, 0.0);
    assert_eq!(second.events_by_kind["goexit"], 1);
}

#[test]
fn snapshot_is_published_whole() {
    let metrics = PipelineMetrics::new();
    let depth = Arc::new(AtomicUsize::new(0));
    let collector = collector(&metrics, &depth);

    for _ in 0..10 {
        metrics.note_read();
        metrics.note_processed(EventKind::MakeMap, 70, 30);
    }
    let sampled = collector.sample();
    let latest = collector.latest();

    // The served snapshot is exactly the sampled one, field for field.
    assert_eq!(latest.rps, sampled.rps);
    assert_eq!(latest.pps, sampled.pps);
    assert_eq!(latest.lat, sampled.lat);
    assert_eq!(latest.prc, sampled.prc);
    assert_eq!(latest.events_by_kind, sampled.events_by_kind);
}

#[test]
fn final_dump_carries_series_and_totals() {
    let dir = TempDir::new().unwrap();
    let metrics = PipelineMetrics::new();
    let depth = Arc::new(AtomicUsize::new(0));
    let collector = collector(&metrics, &depth);

    for _ in 0..5 {
        metrics.note_read();
        metrics.note_processed(EventKind::NewObject, 100, 50);
    }
    collector.sample();
    metrics.note_lost_batch(250);
    collector.sample();

    let path = collector.write_final(dir.path(), "t1").unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("metrics_"), "{name}");
    assert!(name.ends_with("_t1.json"), "{name}");

    let dump: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(dump["rps"].as_array().unwrap().len(), 2);
    assert_eq!(dump["ts"].as_array().unwrap().len(), 2);
    assert_eq!(dump["events_by_kind"]["newobject"], 5);
    assert_eq!(dump["lost_batches"], 1);
    assert_eq!(dump["lost_events"], 250);
}
