//! The link manager facade end to end

use crate::common::fixtures::{payload, sent_types};
use pairlink::messages::MessagePriority;
use pairlink::network::{
    ActivationState, ConnectionState, LinkConfig, LinkManager, QualityTier, SimulatedTransport,
    Transport, TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager_over(transport: SimulatedTransport) -> (Arc<SimulatedTransport>, Arc<LinkManager>) {
    let transport = Arc::new(transport);
    let manager = LinkManager::new(
        transport.clone() as Arc<dyn Transport>,
        LinkConfig::default(),
    );
    (transport, Arc::new(manager))
}

#[tokio::test(start_paused = true)]
async fn test_send_helpers_deliver() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());

    assert!(manager.send_critical(payload("critical")).await);
    assert!(manager.send_high(payload("high")).await);
    assert!(manager.send_normal(payload("normal")).await);
    assert!(manager.send_low(payload("low")).await);

    assert_eq!(
        sent_types(&transport),
        vec!["critical", "high", "normal", "low"]
    );
    let priorities: Vec<_> = transport
        .sent_messages()
        .iter()
        .map(|message| message["priority"].clone())
        .collect();
    assert_eq!(
        priorities,
        vec![json!("critical"), json!("high"), json!("normal"), json!("low")]
    );
    assert_eq!(manager.current_quality_tier(), QualityTier::Excellent);
}

#[tokio::test(start_paused = true)]
async fn test_reachability_event_disconnects_and_notifies() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());
    let mut states = manager.subscribe_state();
    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);

    manager.on_transport_event(transport.set_reachable(false));

    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    assert_eq!(
        manager.current_connection_state(),
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_backlog_flushes_on_reconnection() {
    let (transport, manager) = manager_over(SimulatedTransport::unreachable());
    assert_eq!(
        manager.current_connection_state(),
        ConnectionState::Disconnected
    );

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send_high(payload("plan")).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.queue().backlog_len(), 1);
    assert_eq!(transport.sent_count(), 0);

    manager.on_transport_event(transport.set_reachable(true));
    assert!(pending.await.unwrap());
    assert_eq!(manager.queue().backlog_len(), 0);
    assert_eq!(sent_types(&transport), vec!["plan"]);
}

#[tokio::test(start_paused = true)]
async fn test_backlog_flushes_after_fault_latched_while_unreachable() {
    let (transport, manager) = manager_over(SimulatedTransport::unreachable());

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send_high(payload("plan")).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.queue().backlog_len(), 1);

    // the session drops while the companion is out of reach, so the
    // first recovery cannot verify the link
    manager.on_transport_event(transport.set_activation(ActivationState::NotActivated));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        manager.current_connection_state(),
        ConnectionState::Error(_)
    ));
    assert_eq!(manager.recovery_status().failed_recoveries, 1);
    assert_eq!(transport.sent_count(), 0);

    manager.on_transport_event(transport.set_reachable(true));
    assert!(pending.await.unwrap());

    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);
    assert_eq!(manager.queue().backlog_len(), 0);
    assert_eq!(sent_types(&transport), vec!["connectivity_ping", "plan"]);
    assert_eq!(manager.recovery_status().successful_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sampler_reverifies_latched_fault() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());
    transport.set_activation_succeeds(false);

    manager.on_transport_event(transport.set_activation(ActivationState::NotActivated));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(matches!(
        manager.current_connection_state(),
        ConnectionState::Error(_)
    ));

    // the session comes back without a notification
    transport.set_activation_succeeds(true);
    transport.set_activation(ActivationState::Activated);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);
    assert_eq!(manager.recovery_status().successful_recoveries, 1);
    assert!(manager.recovery_status().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_backlog_flushes_on_reconnection_into_degraded() {
    let (transport, manager) = manager_over(SimulatedTransport::unreachable());
    for _ in 0..10 {
        manager.metrics().record_outcome(1500.0, false);
    }
    assert_eq!(manager.current_quality_tier(), QualityTier::Poor);

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send_normal(payload("sync")).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.queue().backlog_len(), 1);

    manager.on_transport_event(transport.set_reachable(true));
    assert_eq!(manager.current_connection_state(), ConnectionState::Degraded);

    assert!(pending.await.unwrap());
    assert_eq!(manager.queue().backlog_len(), 0);
    assert_eq!(sent_types(&transport), vec!["sync"]);
}

#[tokio::test(start_paused = true)]
async fn test_sampler_notices_silent_link_changes() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());

    transport.set_reachable(false);
    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(
        manager.current_connection_state(),
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_deactivation_triggers_recovery() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());

    manager.on_transport_event(transport.set_activation(ActivationState::NotActivated));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.activation_requests(), 1);
    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);
    assert_eq!(manager.recovery_status().successful_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_send_failure_latches_error() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());
    transport.set_activation_succeeds(false);
    transport.push_outcome(Err(TransportError::SessionNotActivated));
    transport.set_activation(ActivationState::NotActivated);

    let outcome = manager
        .send_with_outcome(payload("plan"), MessagePriority::High)
        .await;
    assert!(!outcome.unwrap_err().is_recoverable());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        manager.current_connection_state(),
        ConnectionState::Error(_)
    ));

    // the companion comes back and the host asks for a retry
    transport.set_activation_succeeds(true);
    assert!(manager.force_recovery().await);
    assert_eq!(manager.current_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_streaming_through_manager() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());

    assert!(!manager.stream_heart_rate(150.0));
    manager.start_stream();
    assert!(manager.stream_location(37.33, -122.0, 8.0, 5.0));
    assert!(manager.stream_heart_rate(150.0));
    assert!(manager.stream_rep_completion(1, 5.0, 40.0));
    assert!(manager.stream_phase_change("rest", "sprint"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.sent_count(), 4);

    manager.stop_stream();
    assert!(!manager.stream_heart_rate(150.0));

    let diagnostics = manager.diagnostics();
    assert_eq!(diagnostics["bufferOccupancy"], json!(0));
    assert_eq!(diagnostics["dataLossRate"], json!(0.0));
    assert_eq!(diagnostics["streaming"], json!("stopped"));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_context_reaches_transport() {
    let (transport, manager) = manager_over(SimulatedTransport::connected());

    let mut context = payload("weekly_plan");
    context.insert("week".to_string(), json!(3));
    manager.update_persistent_context(context.clone()).unwrap();
    assert_eq!(transport.last_context(), Some(context));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_messages() {
    let (_transport, manager) = manager_over(SimulatedTransport::connected());

    manager.shutdown();
    assert!(!manager.send_high(payload("late")).await);
}
