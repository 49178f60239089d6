//! Recovery strategies driven through the fault channel

use crate::common::fixtures::{recovery_harness, sent_types};
use pairlink::network::{
    ActivationState, ConnectionState, LinkError, SimulatedTransport,
};
use std::time::Duration;

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn test_inactive_session_is_reactivated() {
    let harness = recovery_harness(SimulatedTransport::connected());
    harness
        .transport
        .set_activation(ActivationState::NotActivated);

    harness.faults.send(LinkError::SessionNotActivated).unwrap();
    settle(Duration::from_secs(1)).await;

    assert_eq!(harness.transport.activation_requests(), 1);
    assert!(sent_types(&harness.transport)
        .iter()
        .any(|kind| kind == "connectivity_ping"));
    assert_eq!(harness.monitor.current_state(), ConnectionState::Connected);

    let status = harness.coordinator.status();
    assert_eq!(status.successful_recoveries, 1);
    assert_eq!(status.last_error, None);
    assert!(!status.recovering);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reactivation_keeps_fault_latched() {
    let harness = recovery_harness(SimulatedTransport::connected());
    harness
        .transport
        .set_activation(ActivationState::NotActivated);
    harness.transport.set_activation_succeeds(false);

    harness.faults.send(LinkError::SessionNotActivated).unwrap();
    settle(Duration::from_secs(5)).await;

    assert_eq!(
        harness.monitor.current_state(),
        ConnectionState::Error(LinkError::SessionNotActivated.to_string())
    );
    let status = harness.coordinator.status();
    assert_eq!(status.failed_recoveries, 1);
    assert_eq!(status.recovery_action, Some("Restart app"));
    assert_eq!(harness.transport.sent_count(), 0);

    harness.coordinator.reset_error_state();
    assert!(!harness.monitor.has_fault());
    assert_eq!(harness.coordinator.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_failure_backs_off_then_verifies() {
    let harness = recovery_harness(SimulatedTransport::connected());

    harness.faults.send(LinkError::MessageTimeout).unwrap();
    settle(Duration::from_secs(1)).await;

    // first backoff waits 2s
    let status = harness.coordinator.status();
    assert!(status.recovering);
    assert_eq!(status.backoff_attempts, 1);
    assert_eq!(harness.transport.sent_count(), 0);

    settle(Duration::from_secs(2)).await;
    let status = harness.coordinator.status();
    assert_eq!(status.successful_recoveries, 1);
    assert_eq!(status.backoff_attempts, 0);
    assert_eq!(sent_types(&harness.transport), vec!["connectivity_ping"]);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gives_up_after_max_attempts() {
    let harness = recovery_harness(SimulatedTransport::unreachable());

    for attempt in 1..=5 {
        harness
            .faults
            .send(LinkError::TransferFailed("lost".to_string()))
            .unwrap();
        settle(Duration::from_secs(40)).await;
        assert_eq!(harness.coordinator.status().backoff_attempts, attempt);
    }

    harness
        .faults
        .send(LinkError::TransferFailed("lost".to_string()))
        .unwrap();
    settle(Duration::from_secs(1)).await;

    let status = harness.coordinator.status();
    assert_eq!(status.backoff_attempts, 5);
    assert_eq!(status.failed_recoveries, 6);
    assert!(!status.recovering);

    harness.coordinator.reset_error_state();
    assert_eq!(harness.coordinator.status().backoff_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_wait_resumes_on_reachability_event() {
    let harness = recovery_harness(SimulatedTransport::unreachable());

    harness.faults.send(LinkError::EndpointNotReachable).unwrap();
    settle(Duration::from_secs(3)).await;
    assert!(harness.coordinator.is_recovering());
    assert_eq!(harness.transport.sent_count(), 0);

    let event = harness.transport.set_reachable(true);
    harness.monitor.on_link_event(&event);
    settle(Duration::from_millis(100)).await;

    let status = harness.coordinator.status();
    assert_eq!(status.successful_recoveries, 1);
    assert!(!status.recovering);
    assert_eq!(sent_types(&harness.transport), vec!["connectivity_ping"]);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_wait_polls_transport() {
    let harness = recovery_harness(SimulatedTransport::unreachable());

    harness.faults.send(LinkError::EndpointNotReachable).unwrap();
    settle(Duration::from_secs(6)).await;

    // no notification, only the 5s poll notices
    harness.transport.set_reachable(true);
    settle(Duration::from_secs(3)).await;
    assert_eq!(harness.coordinator.status().successful_recoveries, 0);

    settle(Duration::from_secs(2)).await;
    assert_eq!(harness.coordinator.status().successful_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_errors_during_recovery_record_last_error() {
    let harness = recovery_harness(SimulatedTransport::connected());

    harness
        .faults
        .send(LinkError::Unknown("glitch".to_string()))
        .unwrap();
    harness
        .faults
        .send(LinkError::TransferFailed("late".to_string()))
        .unwrap();
    settle(Duration::from_secs(1)).await;

    assert_eq!(
        harness.coordinator.last_error(),
        Some(LinkError::TransferFailed("late".to_string()))
    );
    assert!(harness.coordinator.is_recovering());

    // conservative recovery waits 10s before verifying
    settle(Duration::from_secs(10)).await;
    let status = harness.coordinator.status();
    assert_eq!(status.successful_recoveries, 1);
    assert_eq!(status.backoff_attempts, 0);
    assert_eq!(status.last_error, None);
    assert_eq!(harness.transport.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_recovery_preempts_running_recovery() {
    let harness = recovery_harness(SimulatedTransport::unreachable());

    harness.faults.send(LinkError::EndpointNotReachable).unwrap();
    settle(Duration::from_secs(1)).await;
    assert!(harness.coordinator.is_recovering());

    harness.transport.set_reachable(true);
    assert!(harness.coordinator.force_recovery().await);

    let status = harness.coordinator.status();
    assert_eq!(status.successful_recoveries, 1);
    assert_eq!(status.failed_recoveries, 1);
    assert_eq!(harness.monitor.current_state(), ConnectionState::Connected);
}
