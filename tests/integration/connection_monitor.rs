//! Connection state derived from link events and delivery metrics

use crate::common::fixtures::{payload, queue_harness};
use pairlink::messages::{MessagePriority, OutboundMessage};
use pairlink::network::{
    ConnectionState, QualityTier, RetryPolicy, SimulatedTransport, TransportError,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_round_trip_latency_feeds_quality_tier() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());
    harness.transport.set_latency(Duration::from_millis(120));
    harness.queue.start();

    assert!(
        harness
            .queue
            .enqueue(OutboundMessage::new(payload("state"), MessagePriority::High))
            .await
    );

    let latency = harness.metrics.rolling_latency();
    assert!((latency - 120.0).abs() < 1.0, "latency {}", latency);
    assert_eq!(harness.metrics.quality_tier(), QualityTier::Good);
    assert_eq!(harness.monitor.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_excellent_window_keeps_connected() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());
    for latency in [50.0, 60.0, 55.0] {
        harness.metrics.record_outcome(latency, true);
    }
    harness.monitor.recompute();

    assert_eq!(harness.monitor.quality_tier(), QualityTier::Excellent);
    assert_eq!(harness.monitor.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_poor_ratio_degrades_connection() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());
    let mut states = harness.monitor.subscribe();

    for success in [true, false, true, false, true] {
        harness.metrics.record_outcome(800.0, success);
    }
    let transition = harness.monitor.recompute().unwrap();

    assert_eq!(transition.from, ConnectionState::Connected);
    assert_eq!(transition.to, ConnectionState::Degraded);
    assert!((harness.metrics.success_ratio() - 0.6).abs() < 1e-9);
    assert_eq!(harness.metrics.quality_tier(), QualityTier::Poor);

    states.changed().await.unwrap();
    assert_eq!(*states.borrow(), ConnectionState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_failed_deliveries_degrade_connection() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());
    harness
        .transport
        .fail_next(3, TransportError::TransferFailed("noise".to_string()));
    harness.queue.start();

    let delivered = harness
        .queue
        .enqueue(OutboundMessage::new(payload("state"), MessagePriority::Critical).with_max_retries(2))
        .await;

    assert!(!delivered);
    assert_eq!(harness.metrics.success_ratio(), 0.0);
    assert_eq!(harness.monitor.current_state(), ConnectionState::Degraded);
    assert!(harness.monitor.is_sendable());
}

#[tokio::test]
async fn test_reachability_loss_disconnects() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());
    assert_eq!(harness.monitor.current_state(), ConnectionState::Connected);

    let event = harness.transport.set_reachable(false);
    let transition = harness.monitor.on_link_event(&event).unwrap();

    assert_eq!(transition.to, ConnectionState::Disconnected);
    assert!(!harness.monitor.is_sendable());
}

#[tokio::test]
async fn test_missing_companion_app_is_an_error() {
    let harness = queue_harness(SimulatedTransport::connected(), RetryPolicy::default());

    let event = harness.transport.set_pairing(true, false);
    harness.monitor.on_link_event(&event);
    assert_eq!(
        harness.monitor.current_state(),
        ConnectionState::Error("app not installed".to_string())
    );

    let event = harness.transport.set_pairing(false, false);
    harness.monitor.on_link_event(&event);
    assert_eq!(harness.monitor.current_state(), ConnectionState::Disconnected);
}
