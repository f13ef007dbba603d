//! Integration tests for stream discovery and the trim walk.

use std::time::Duration;

use sluice::clock::ManualClock;
use sluice::error::RetentionError;
use sluice::kv::KeyValueStore;
use sluice::memory::{MemoryTransport, Operation, TestHook};
use sluice::message::{Fields, TIMESTAMP_FIELD};
use sluice::publisher::Publisher;
use sluice::retention::{RetentionManager, RetentionPolicy, TRIM_BATCH, WILDCARD};
use sluice::shutdown;
use sluice::transport::StreamTransport;
use tokio::time::timeout;

const NOW: u64 = 1_700_000_000_000;
const MINUTE: u64 = 60_000;

async fn append_stamped(transport: &MemoryTransport, stream: &str, stamp: &str) {
    let mut fields = Fields::new();
    fields.insert(TIMESTAMP_FIELD.to_string(), stamp.to_string());
    transport.append(stream, &fields).await.unwrap();
}

fn stamps(transport: &MemoryTransport, stream: &str) -> Vec<i64> {
    transport
        .entries(stream)
        .iter()
        .filter_map(|m| m.timestamp_ms().and_then(Result::ok))
        .collect()
}

#[tokio::test]
async fn test_five_entry_scenario() {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new(0);
    let publisher = Publisher::with_clock(transport.clone(), clock.clone());

    for minutes_ago in [10, 8, 6, 4, 2] {
        clock.set(NOW - minutes_ago * MINUTE);
        publisher
            .publish("events", &format!("m-{minutes_ago}"), &Fields::new())
            .await
            .unwrap();
    }

    clock.set(NOW);
    let manager = RetentionManager::with_clock(transport.clone(), clock);
    let report = manager
        .run_cycle(&["events".to_string()], Duration::from_secs(5 * 60))
        .await
        .unwrap();

    assert_eq!(report.threshold_ms, (NOW - 5 * MINUTE) as i64);
    assert_eq!(report.deleted(), 2);
    let now = NOW as i64;
    let minute = MINUTE as i64;
    assert_eq!(
        stamps(&transport, "events"),
        vec![now - 6 * minute, now - 4 * minute, now - 2 * minute]
    );
}

#[tokio::test]
async fn test_trim_removes_exactly_the_expired_prefix() {
    for threshold in [0_i64, 1_000, 5_500, 10_000, 20_000, 21_000] {
        let transport = MemoryTransport::new();
        for i in 1..=20 {
            append_stamped(&transport, "s", &(i * 1_000).to_string()).await;
        }

        let manager = RetentionManager::new(transport.clone());
        let report = manager.trim_stream("s", threshold).await.unwrap();

        let expected: Vec<i64> = (1..=20).map(|i| i * 1_000).filter(|ts| *ts >= threshold).collect();
        assert_eq!(stamps(&transport, "s"), expected, "threshold {threshold}");
        assert_eq!(report.deleted as usize, 20 - expected.len());
        assert_eq!(report.boundary.is_some(), !expected.is_empty());
    }
}

#[tokio::test]
async fn test_unparsable_and_missing_timestamps_are_skipped() {
    let transport = MemoryTransport::new();
    append_stamped(&transport, "s", "1000").await;
    append_stamped(&transport, "s", "not-a-number").await;
    transport.append("s", &Fields::new()).await.unwrap();
    append_stamped(&transport, "s", "2000").await;
    append_stamped(&transport, "s", "9000").await;

    let manager = RetentionManager::new(transport.clone());
    let report = manager.trim_stream("s", 5_000).await.unwrap();

    assert_eq!(report.deleted, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.scanned, 5);
    // The skipped entries stay; only the expired ones go.
    assert_eq!(transport.len("s"), 3);
    assert_eq!(stamps(&transport, "s"), vec![9_000]);
}

#[tokio::test]
async fn test_future_stamp_shields_older_entries() {
    let transport = MemoryTransport::new();
    append_stamped(&transport, "s", "50000").await;
    append_stamped(&transport, "s", "1000").await;

    let manager = RetentionManager::new(transport.clone());
    let report = manager.trim_stream("s", 10_000).await.unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(report.scanned, 1);
    assert_eq!(transport.len("s"), 2);
}

#[tokio::test]
async fn test_walk_is_bounded_per_cycle() {
    let transport = MemoryTransport::new();
    for i in 0..(TRIM_BATCH + 50) {
        append_stamped(&transport, "big", &i.to_string()).await;
    }

    let manager = RetentionManager::new(transport.clone());
    let first = manager.trim_stream("big", i64::MAX).await.unwrap();
    assert_eq!(first.deleted as usize, TRIM_BATCH);
    assert_eq!(transport.len("big"), 50);

    let second = manager.trim_stream("big", i64::MAX).await.unwrap();
    assert_eq!(second.deleted, 50);
    assert!(transport.is_empty("big"));
}

#[tokio::test]
async fn test_wildcard_discovers_only_streams() {
    let transport = MemoryTransport::new();
    append_stamped(&transport, "events", "1").await;
    transport.set("greeting", "hello", None).await.unwrap();

    let manager = RetentionManager::new(transport.clone());
    let streams = manager.resolve_streams(&[WILDCARD.to_string()]).await.unwrap();
    assert_eq!(streams, vec!["events"]);

    // Wildcard wins over literal names in the same list.
    let mixed = manager
        .resolve_streams(&["ghost".to_string(), WILDCARD.to_string()])
        .await
        .unwrap();
    assert_eq!(mixed, vec!["events"]);
}

#[tokio::test]
async fn test_discovery_pages_through_large_keyspace() {
    let transport = MemoryTransport::new();
    for i in 0..250 {
        append_stamped(&transport, &format!("stream-{i:03}"), "1").await;
        transport.rpush(&format!("list-{i:03}"), &["x"]).await.unwrap();
    }

    let manager = RetentionManager::new(transport.clone());
    let streams = manager.discover_streams().await.unwrap();
    assert_eq!(streams.len(), 250);
    assert!(streams.iter().all(|s| s.starts_with("stream-")));
    assert!(transport.calls(Operation::Scan) > 1);
}

#[tokio::test]
async fn test_cycle_aborts_on_first_failing_stream() {
    let transport = MemoryTransport::new();
    append_stamped(&transport, "a", "1").await;
    append_stamped(&transport, "b", "1").await;
    transport.register_hook(TestHook::FailAfter {
        operation: Operation::Delete,
        after: 0,
    });

    let manager = RetentionManager::new(transport.clone());
    let err = manager
        .run_cycle(&["a".to_string(), "b".to_string()], Duration::ZERO)
        .await
        .unwrap_err();
    match err {
        RetentionError::Trim { stream, .. } => assert_eq!(stream, "a"),
        other => panic!("expected trim error, got {other:?}"),
    }
    // Stream "b" was never visited.
    assert_eq!(transport.calls(Operation::Range), 1);
}

#[tokio::test]
async fn test_discovery_failure_surfaces() {
    let transport = MemoryTransport::new();
    transport.register_hook(TestHook::FailAfter {
        operation: Operation::Scan,
        after: 0,
    });

    let manager = RetentionManager::new(transport);
    let (_trigger, handle) = shutdown::channel();
    let err = manager
        .retain(&[WILDCARD.to_string()], Duration::from_millis(10), Duration::ZERO, handle)
        .await
        .unwrap_err();
    assert!(matches!(err, RetentionError::Discovery { .. }));
}

#[tokio::test]
async fn test_retain_runs_cycles_until_shutdown() {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new(NOW);
    append_stamped(&transport, "events", &(NOW - 10 * MINUTE).to_string()).await;

    let manager = RetentionManager::with_clock(transport.clone(), clock.clone());
    let (trigger, handle) = shutdown::channel();
    let policy = RetentionPolicy {
        streams: vec![WILDCARD.to_string()],
        interval: Duration::from_millis(10),
        retention: Duration::from_secs(5 * 60),
    };
    let task = tokio::spawn(async move { manager.retain_policy(&policy, handle).await });

    // The first cycle runs straight away.
    for _ in 0..100 {
        if transport.is_empty("events") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(transport.is_empty("events"));

    // Later cycles keep trimming the discovered stream as time moves on.
    append_stamped(&transport, "events", &NOW.to_string()).await;
    clock.advance(Duration::from_secs(10 * 60));
    for _ in 0..100 {
        if transport.is_empty("events") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(transport.is_empty("events"));

    // Streams created after discovery are not picked up.
    append_stamped(&transport, "late", "1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.len("late"), 1);

    trigger.trigger();
    let outcome = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(outcome.is_ok());
}
