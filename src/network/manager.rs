use crate::messages::{receipt, envelope_type, MessagePriority, OutboundMessage, Payload};
use crate::network::errors::LinkError;
use crate::network::metrics::{MetricsAggregator, QualityTier, METRICS_WINDOW_CAPACITY};
use crate::network::monitor::{ConnectionMonitor, ConnectionState, EndpointLink, MonitorConfig};
use crate::network::recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryStatus};
use crate::network::retry_queue::{DeliveryResult, PriorityRetryQueue, RetryPolicy};
use crate::network::stream::{StreamConfig, TelemetryStream};
use crate::network::ticker::PeriodicTask;
use crate::network::transport::{ActivationState, Transport, TransportError, TransportEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Configuration for every component behind a [`LinkManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
    pub stream: StreamConfig,
    pub recovery: RecoveryConfig,
    /// Samples kept by the metrics windows
    pub metrics_window: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            recovery: RecoveryConfig::default(),
            metrics_window: METRICS_WINDOW_CAPACITY,
        }
    }
}

/// Facade over the messaging and telemetry subsystem for one paired endpoint.
///
/// Construction wires the components together and starts their background
/// work, so it must happen inside a tokio runtime. Dropping the manager shuts
/// everything down.
pub struct LinkManager {
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsAggregator>,
    monitor: Arc<ConnectionMonitor>,
    queue: Arc<PriorityRetryQueue>,
    stream: Arc<TelemetryStream>,
    recovery: Arc<RecoveryCoordinator>,
    faults: mpsc::UnboundedSender<LinkError>,
    inbound: broadcast::Sender<Payload>,
    sampler: PeriodicTask,
    refresher: PeriodicTask,
    shutdown: CancellationToken,
}

impl LinkManager {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        let metrics = Arc::new(MetricsAggregator::with_capacity(config.metrics_window));
        let monitor = Arc::new(ConnectionMonitor::new(metrics.clone()));
        let (faults, fault_rx) = mpsc::unbounded_channel();

        let queue = PriorityRetryQueue::new(
            transport.clone(),
            monitor.clone(),
            metrics.clone(),
            config.retry.clone(),
            Some(faults.clone()),
        );
        let stream = TelemetryStream::new(
            config.stream.clone(),
            transport.clone(),
            monitor.clone(),
            metrics.clone(),
            queue.clone(),
        );
        let recovery = RecoveryCoordinator::new(
            config.recovery.clone(),
            transport.clone(),
            monitor.clone(),
            queue.clone(),
        );
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);

        let manager = Self {
            transport,
            metrics,
            monitor,
            queue,
            stream,
            recovery,
            faults,
            inbound,
            sampler: PeriodicTask::new("link-sampler", config.monitor.sample_interval),
            refresher: PeriodicTask::new("metrics-refresh", config.monitor.metrics_refresh_interval),
            shutdown: CancellationToken::new(),
        };

        if manager.transport.activation_state() == ActivationState::NotActivated {
            info!("Activating transport session");
            manager.transport.activate();
        }
        manager
            .monitor
            .apply_snapshot(EndpointLink::probe(manager.transport.as_ref()));

        manager.queue.start();
        manager.recovery.start(fault_rx);
        manager.spawn_backlog_flusher();
        manager.start_sampler();
        manager.start_refresher();
        info!(state = %manager.monitor.current_state(), "Link manager started");
        manager
    }

    fn spawn_backlog_flusher(&self) {
        let mut states = self.monitor.subscribe();
        let queue = self.queue.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let sendable = states.borrow_and_update().is_connected();
                if sendable {
                    queue.flush_backlog();
                }
            }
            debug!("Backlog flusher exited");
        });
    }

    fn start_sampler(&self) {
        let transport = self.transport.clone();
        let monitor = self.monitor.clone();
        let recovery = self.recovery.clone();
        let faults = self.faults.clone();
        self.sampler.start(move || {
            let link = EndpointLink::probe(transport.as_ref());
            monitor.apply_snapshot(link);
            revisit_latched_fault(&monitor, &recovery, &faults);
            async {}
        });
    }

    fn start_refresher(&self) {
        let metrics = self.metrics.clone();
        let monitor = self.monitor.clone();
        let queue = self.queue.clone();
        self.refresher.start(move || {
            let snapshot = metrics.snapshot();
            debug!(
                latency_ms = snapshot.rolling_latency_ms,
                success_ratio = snapshot.success_ratio,
                tier = %snapshot.quality_tier,
                samples = snapshot.samples,
                "Link metrics"
            );
            let expired = queue.prune_expired();
            if expired > 0 {
                info!(expired, "Dropped expired backlog messages");
            }
            monitor.recompute();
            async {}
        });
    }

    /// Deliver a message at `priority`; resolves `true` once acknowledged
    pub async fn send(&self, payload: Payload, priority: MessagePriority) -> bool {
        self.queue
            .enqueue(OutboundMessage::new(payload, priority))
            .await
    }

    /// Deliver a message and report how it ended
    pub async fn send_with_outcome(&self, payload: Payload, priority: MessagePriority) -> DeliveryResult {
        self.queue
            .submit(OutboundMessage::new(payload, priority))
            .await
    }

    pub async fn send_critical(&self, payload: Payload) -> bool {
        self.send(payload, MessagePriority::Critical).await
    }

    pub async fn send_high(&self, payload: Payload) -> bool {
        self.send(payload, MessagePriority::High).await
    }

    pub async fn send_normal(&self, payload: Payload) -> bool {
        self.send(payload, MessagePriority::Normal).await
    }

    pub async fn send_low(&self, payload: Payload) -> bool {
        self.send(payload, MessagePriority::Low).await
    }

    pub fn start_stream(&self) {
        self.stream.start();
    }

    pub fn stop_stream(&self) {
        self.stream.stop();
    }

    pub fn stream_location(&self, latitude: f64, longitude: f64, speed: f64, accuracy: f64) -> bool {
        self.stream.stream_location(latitude, longitude, speed, accuracy)
    }

    pub fn stream_heart_rate(&self, heart_rate: f64) -> bool {
        self.stream.stream_heart_rate(heart_rate)
    }

    pub fn stream_rep_completion(&self, rep_number: u32, time: f64, distance: f64) -> bool {
        self.stream.stream_rep_completion(rep_number, time, distance)
    }

    pub fn stream_phase_change(&self, from: &str, to: &str) -> bool {
        self.stream.stream_phase_change(from, to)
    }

    pub fn stream_emergency_stop(&self) -> bool {
        self.stream.stream_emergency_stop()
    }

    /// Push latest-value-wins state to the companion
    pub fn update_persistent_context(&self, context: Payload) -> Result<(), TransportError> {
        match self.transport.update_persistent_context(context) {
            Ok(()) => {
                debug!("Persistent context updated");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to update persistent context");
                Err(e)
            }
        }
    }

    /// Apply an activation, reachability or pairing notification
    pub fn on_transport_event(&self, event: TransportEvent) {
        self.monitor.on_link_event(&event);

        if event == TransportEvent::ActivationChanged(ActivationState::NotActivated) {
            if self.faults.send(LinkError::SessionNotActivated).is_err() {
                debug!("Recovery coordinator no longer listening for faults");
            }
        } else {
            revisit_latched_fault(&self.monitor, &self.recovery, &self.faults);
        }
    }

    /// Acknowledge an inbound message and republish it to subscribers
    pub fn on_message_received(&self, message: Payload) -> Payload {
        debug!(message_type = ?envelope_type(&message), "Message received from companion");
        // no subscribers is fine
        let _ = self.inbound.send(message);
        receipt()
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Payload> {
        self.inbound.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.subscribe()
    }

    pub fn current_connection_state(&self) -> ConnectionState {
        self.monitor.current_state()
    }

    pub fn current_quality_tier(&self) -> QualityTier {
        self.metrics.quality_tier()
    }

    pub async fn force_recovery(&self) -> bool {
        self.recovery.force_recovery().await
    }

    pub fn reset_error_state(&self) {
        self.recovery.reset_error_state();
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery.status()
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<PriorityRetryQueue> {
        &self.queue
    }

    pub fn stream(&self) -> &Arc<TelemetryStream> {
        &self.stream
    }

    /// Flat key/value report for the host UI
    pub fn diagnostics(&self) -> Payload {
        let state = self.monitor.current_state();
        let metrics = self.metrics.snapshot();
        let queue = self.queue.stats();
        let stream = self.stream.stats();
        let link = self.monitor.link();

        let report = json!({
            "connectionState": state.description(),
            "isConnected": state.is_connected(),
            "qualityTier": metrics.quality_tier.as_str(),
            "rollingLatencyMs": metrics.rolling_latency_ms,
            "successRatio": metrics.success_ratio,
            "successfulTransfers": metrics.successful_transfers,
            "failedTransfers": metrics.failed_transfers,
            "queueDepth": queue.depth(),
            "backlog": queue.backlog,
            "delivered": queue.delivered,
            "dropped": queue.dropped,
            "streaming": stream.state,
            "bufferOccupancy": stream.buffered,
            "bufferCapacity": stream.capacity,
            "bufferHealth": stream.buffer_health,
            "packetsPerSecond": stream.packets_per_second,
            "dataLossRate": stream.data_loss_rate,
            "streamQuality": stream.quality,
            "link": link,
            "recovery": self.recovery.status(),
        });

        match report {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Stop background work and fail everything still queued
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.sampler.stop();
        self.refresher.stop();
        self.stream.stop();
        self.recovery.shutdown();
        self.queue.shutdown();
        info!("Link manager shut down");
    }
}

/// Hand a latched fault back to the coordinator once the link it was raised
/// for looks healthy again, so a recovery that failed earlier is re-verified.
fn revisit_latched_fault(
    monitor: &ConnectionMonitor,
    recovery: &RecoveryCoordinator,
    faults: &mpsc::UnboundedSender<LinkError>,
) {
    if !monitor.fault_outlived() || recovery.is_recovering() {
        return;
    }
    let Some(error) = recovery.latched_error() else {
        return;
    };
    info!(error = %error, "Link healthy again under a latched fault, re-verifying");
    if faults.send(error).is_err() {
        debug!("Recovery coordinator no longer listening for faults");
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
