//! Integration tests for the publisher.

use std::sync::Arc;
use std::time::Duration;

use sluice::clock::ManualClock;
use sluice::error::{PublishError, TransportError};
use sluice::kv::KeyValueStore;
use sluice::memory::{MemoryTransport, Operation, TestHook};
use sluice::message::Fields;
use sluice::publisher::Publisher;

fn order(sku: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("sku".to_string(), sku.to_string());
    fields
}

#[tokio::test]
async fn test_timestamps_are_non_decreasing_with_system_clock() {
    let transport = MemoryTransport::new();
    let publisher = Publisher::new(transport.clone());

    for i in 0..200 {
        publisher
            .publish("orders", &format!("order-{i}"), &order("a1"))
            .await
            .unwrap();
    }

    let stamps: Vec<i64> = transport
        .entries("orders")
        .iter()
        .map(|m| m.timestamp_ms().unwrap().unwrap())
        .collect();
    assert_eq!(stamps.len(), 200);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_timestamps_survive_clock_jitter() {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new(1_000_000);
    let publisher = Publisher::with_clock(transport.clone(), clock.clone());

    for step in [5_u64, 0, 3, 1, 8] {
        if step % 2 == 0 {
            clock.advance(Duration::from_millis(step * 100));
        } else {
            clock.rewind(Duration::from_millis(step * 100));
        }
        publisher.publish("s", "m", &order("x")).await.unwrap();
    }

    let stamps: Vec<i64> = transport
        .entries("s")
        .iter()
        .map(|m| m.timestamp_ms().unwrap().unwrap())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_from_one_publisher() {
    let transport = MemoryTransport::new();
    let publisher = Arc::new(Publisher::new(transport.clone()));

    let mut tasks = Vec::new();
    for t in 0..4 {
        let publisher = Arc::clone(&publisher);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                publisher
                    .publish("orders", &format!("{t}-{i}"), &order("a1"))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(transport.len("orders"), 100);
    let entries = transport.entries("orders");
    assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    // Append order and stamp order agree even when publishes race.
    let stamps: Vec<i64> = entries
        .iter()
        .map(|m| m.timestamp_ms().unwrap().unwrap())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_publishes_keep_stamp_order_as_clock_moves() {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new(1_000_000);
    let publisher = Arc::new(Publisher::with_clock(transport.clone(), clock.clone()));

    let ticker = {
        let clock = clock.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                clock.advance(Duration::from_millis(1));
                tokio::task::yield_now().await;
            }
        })
    };
    let mut tasks = Vec::new();
    for t in 0..4 {
        let publisher = Arc::clone(&publisher);
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                publisher
                    .publish("ticks", &format!("{t}-{i}"), &order("x"))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    ticker.await.unwrap();

    let stamps: Vec<i64> = transport
        .entries("ticks")
        .iter()
        .map(|m| m.timestamp_ms().unwrap().unwrap())
        .collect();
    assert_eq!(stamps.len(), 200);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
}

#[tokio::test]
async fn test_append_failure_reports_message_id() {
    let transport = MemoryTransport::new();
    transport.register_hook(TestHook::FailAfter {
        operation: Operation::Append,
        after: 1,
    });
    let publisher = Publisher::new(transport.clone());

    publisher.publish("orders", "order-1", &order("a1")).await.unwrap();
    let err = publisher
        .publish("orders", "order-2", &order("b2"))
        .await
        .unwrap_err();

    let PublishError::Append {
        stream,
        message_id,
        source,
    } = err;
    assert_eq!(stream, "orders");
    assert_eq!(message_id, "order-2");
    assert!(matches!(source, TransportError::Injected { operation: "append" }));
    assert_eq!(transport.len("orders"), 1);
}

#[tokio::test]
async fn test_publish_to_non_stream_key_fails() {
    let transport = MemoryTransport::new();
    transport.set("orders", "not a stream", None).await.unwrap();
    let publisher = Publisher::new(transport);

    let err = publisher
        .publish("orders", "order-1", &order("a1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Append {
            source: TransportError::WrongType { .. },
            ..
        }
    ));
}
