use pairlink::messages::Payload;
use pairlink::network::{
    ConnectionMonitor, EndpointLink, LinkError, MetricsAggregator, PriorityRetryQueue,
    RecoveryConfig, RecoveryCoordinator, RetryPolicy, SimulatedTransport, StreamConfig,
    TelemetryStream,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message payload tagged with `type`
pub fn payload(kind: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("type".to_string(), json!(kind));
    payload
}

/// The `type` field of every payload handed to the transport
pub fn sent_types(transport: &SimulatedTransport) -> Vec<String> {
    transport
        .sent_messages()
        .iter()
        .filter_map(|message| message.get("type").and_then(|t| t.as_str()))
        .map(str::to_string)
        .collect()
}

pub struct QueueHarness {
    pub transport: Arc<SimulatedTransport>,
    pub metrics: Arc<MetricsAggregator>,
    pub monitor: Arc<ConnectionMonitor>,
    pub queue: Arc<PriorityRetryQueue>,
    pub faults: mpsc::UnboundedReceiver<LinkError>,
}

/// Queue over `transport` with the monitor primed from a probe; the dispatcher is not started
pub fn queue_harness(transport: SimulatedTransport, policy: RetryPolicy) -> QueueHarness {
    let transport = Arc::new(transport);
    let metrics = Arc::new(MetricsAggregator::new());
    let monitor = Arc::new(ConnectionMonitor::new(metrics.clone()));
    monitor.apply_snapshot(EndpointLink::probe(transport.as_ref()));

    let (fault_tx, faults) = mpsc::unbounded_channel();
    let queue = PriorityRetryQueue::new(
        transport.clone(),
        monitor.clone(),
        metrics.clone(),
        policy,
        Some(fault_tx),
    );

    QueueHarness {
        transport,
        metrics,
        monitor,
        queue,
        faults,
    }
}

pub struct StreamHarness {
    pub transport: Arc<SimulatedTransport>,
    pub metrics: Arc<MetricsAggregator>,
    pub monitor: Arc<ConnectionMonitor>,
    pub queue: Arc<PriorityRetryQueue>,
    pub stream: Arc<TelemetryStream>,
}

/// Telemetry stream with a running queue dispatcher; the stream itself is not started
pub fn stream_harness(transport: SimulatedTransport, config: StreamConfig) -> StreamHarness {
    let QueueHarness {
        transport,
        metrics,
        monitor,
        queue,
        ..
    } = queue_harness(transport, RetryPolicy::default());
    queue.start();

    let stream = TelemetryStream::new(
        config,
        transport.clone(),
        monitor.clone(),
        metrics.clone(),
        queue.clone(),
    );

    StreamHarness {
        transport,
        metrics,
        monitor,
        queue,
        stream,
    }
}

pub struct RecoveryHarness {
    pub transport: Arc<SimulatedTransport>,
    pub monitor: Arc<ConnectionMonitor>,
    pub queue: Arc<PriorityRetryQueue>,
    pub coordinator: Arc<RecoveryCoordinator>,
    pub faults: mpsc::UnboundedSender<LinkError>,
}

/// Running coordinator fed by the returned sender, over a running queue
pub fn recovery_harness(transport: SimulatedTransport) -> RecoveryHarness {
    let QueueHarness {
        transport,
        monitor,
        queue,
        ..
    } = queue_harness(transport, RetryPolicy::default());
    queue.start();

    let coordinator = RecoveryCoordinator::new(
        RecoveryConfig::default(),
        transport.clone(),
        monitor.clone(),
        queue.clone(),
    );
    let (faults, fault_rx) = mpsc::unbounded_channel();
    coordinator.start(fault_rx);

    RecoveryHarness {
        transport,
        monitor,
        queue,
        coordinator,
        faults,
    }
}
