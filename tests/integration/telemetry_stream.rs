//! Telemetry buffering, draining and the emergency bypass

use crate::common::fixtures::{sent_types, stream_harness};
use pairlink::messages::{DataType, Payload, StreamPacket, StreamPriority};
use pairlink::network::{SimulatedTransport, StreamConfig, TelemetryStream};
use std::time::Duration;

fn packet(stream: &TelemetryStream, priority: StreamPriority) -> StreamPacket {
    StreamPacket::new(
        stream.next_sequence(),
        DataType::HeartRate,
        Payload::new(),
        priority,
    )
}

#[tokio::test(start_paused = true)]
async fn test_full_buffer_evicts_lowest_priority() {
    let harness = stream_harness(SimulatedTransport::unreachable(), StreamConfig::without_compaction(5));
    harness.stream.start();

    for _ in 0..5 {
        assert!(harness.stream.push(packet(&harness.stream, StreamPriority::Low)));
    }
    let high = packet(&harness.stream, StreamPriority::High);
    let high_sequence = high.sequence_number;
    assert!(harness.stream.push(high));

    let stats = harness.stream.stats();
    assert_eq!(stats.buffered, 5);
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.buffer_health, 1.0);
    assert_eq!(stats.highest_sequence, high_sequence);

    // nothing drains while the companion is out of reach
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.transport.sent_count(), 0);
    assert_eq!(harness.stream.buffered(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_compaction_relieves_pressure() {
    let harness = stream_harness(SimulatedTransport::unreachable(), StreamConfig::default());
    harness.stream.start();

    for _ in 0..81 {
        harness.stream.stream_heart_rate(150.0);
    }

    // crossing 80% cuts the ring back to 70% of capacity
    let stats = harness.stream.stats();
    assert_eq!(stats.buffered, 70);
    assert_eq!(stats.evicted, 11);
}

#[tokio::test(start_paused = true)]
async fn test_drain_sends_most_urgent_first() {
    let harness = stream_harness(SimulatedTransport::connected(), StreamConfig::default());
    harness.stream.start();

    assert!(harness.stream.stream_heart_rate(148.0));
    assert!(harness.stream.stream_location(37.33, -122.0, 8.0, 5.0));
    assert!(harness.stream.stream_rep_completion(1, 5.1, 40.0));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let data_types: Vec<String> = harness
        .transport
        .sent_messages()
        .iter()
        .filter_map(|message| message.get("dataType").and_then(|t| t.as_str()))
        .map(str::to_string)
        .collect();
    assert_eq!(data_types, vec!["rep", "gps", "hr"]);
    assert!(sent_types(&harness.transport)
        .iter()
        .all(|kind| kind == "stream_data"));

    let stats = harness.stream.stats();
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.highest_acked, 3);
    assert_eq!(stats.data_loss_rate, 0.0);
    assert_eq!(harness.metrics.snapshot().successful_transfers, 3);
}

#[tokio::test(start_paused = true)]
async fn test_drain_batches_per_tick() {
    let harness = stream_harness(SimulatedTransport::connected(), StreamConfig::default());
    harness.stream.start();

    for _ in 0..12 {
        harness.stream.stream_heart_rate(150.0);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.sent_count(), 5);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.sent_count(), 10);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.sent_count(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_failed_drain_sends_are_not_retried() {
    let harness = stream_harness(SimulatedTransport::connected(), StreamConfig::default());
    harness.transport.set_loss_rate(1.0);
    harness.stream.start();

    harness.stream.stream_heart_rate(150.0);
    harness.stream.stream_heart_rate(151.0);
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(harness.transport.sent_count(), 2);
    let stats = harness.stream.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.data_loss_rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_bypasses_full_buffer() {
    let harness = stream_harness(SimulatedTransport::connected(), StreamConfig::without_compaction(10));
    harness.stream.start();

    for _ in 0..10 {
        harness.stream.push(packet(&harness.stream, StreamPriority::Critical));
    }
    assert!(harness.stream.stream_emergency_stop());
    assert_eq!(harness.stream.buffered(), 10);

    // well inside one drain tick
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sent_types(&harness.transport)
        .iter()
        .any(|kind| kind == "emergency_data"));
    assert_eq!(harness.queue.stats().delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_delivered_emergency_counts_as_acknowledged() {
    let harness = stream_harness(SimulatedTransport::connected(), StreamConfig::default());
    harness.stream.start();

    assert!(harness.stream.stream_heart_rate(150.0));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.stream.stats().highest_acked, 1);

    // the stop is the last packet issued and never passes through the ring
    assert!(harness.stream.stream_emergency_stop());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stats = harness.stream.stats();
    assert_eq!(stats.highest_sequence, 2);
    assert_eq!(stats.highest_acked, 2);
    assert_eq!(stats.data_loss_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_buffer_and_rejects_pushes() {
    let harness = stream_harness(SimulatedTransport::unreachable(), StreamConfig::default());
    harness.stream.start();
    harness.stream.start();

    harness.stream.stream_heart_rate(150.0);
    harness.stream.stream_phase_change("warmup", "sprint");
    assert_eq!(harness.stream.buffered(), 2);

    harness.stream.stop();
    assert!(!harness.stream.is_streaming());
    assert_eq!(harness.stream.buffered(), 0);
    assert!(!harness.stream.stream_heart_rate(150.0));

    // sequence numbers keep counting across restarts
    harness.stream.start();
    assert!(harness.stream.stream_heart_rate(150.0));
    assert_eq!(harness.stream.stats().highest_sequence, 4);
}
