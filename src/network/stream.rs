//! High-frequency telemetry streaming.
//!
//! Packets are buffered in a fixed-capacity ring and drained on a fixed cadence,
//! most urgent first. Telemetry is loss tolerant: a failed drain send is not
//! retried, and under backpressure the ring sacrifices low-priority packets.
//! `Emergency` packets never enter the ring; they travel through the retry
//! queue at `Critical` priority instead.

use crate::messages::{
    emergency_envelope, stream_envelope, DataType, OutboundMessage, Payload, StreamPacket,
    StreamPriority,
};
use crate::network::lock;
use crate::network::metrics::MetricsAggregator;
use crate::network::monitor::{ConnectionMonitor, ConnectionState};
use crate::network::retry_queue::PriorityRetryQueue;
use crate::network::ticker::PeriodicTask;
use crate::network::transport::{send_with_timeout, Transport};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_DRAIN_BATCH: usize = 5;
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.8;
pub const DEFAULT_COMPACTION_FRACTION: f64 = 0.3;
pub const DEFAULT_STREAM_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    pub drain_interval: Duration,
    pub drain_batch: usize,
    /// Occupancy above which a compaction pass runs; `None` disables compaction
    pub compaction_threshold: Option<f64>,
    /// Share of capacity a compaction pass frees; the rest is kept, most urgent first
    pub compaction_fraction: f64,
    pub send_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            drain_batch: DEFAULT_DRAIN_BATCH,
            compaction_threshold: Some(DEFAULT_COMPACTION_THRESHOLD),
            compaction_fraction: DEFAULT_COMPACTION_FRACTION,
            send_timeout: DEFAULT_STREAM_SEND_TIMEOUT,
        }
    }
}

impl StreamConfig {
    /// Defaults with a different buffer size
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            ..Self::default()
        }
    }

    /// Buffer that only evicts when full
    pub fn without_compaction(buffer_capacity: usize) -> Self {
        Self {
            compaction_threshold: None,
            ..Self::with_capacity(buffer_capacity)
        }
    }
}

/// Fixed-capacity packet buffer that evicts by priority rather than by age
#[derive(Debug, Clone)]
pub struct PacketRing {
    packets: VecDeque<StreamPacket>,
    capacity: usize,
    compaction_threshold: Option<f64>,
    compaction_fraction: f64,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            compaction_threshold: None,
            compaction_fraction: DEFAULT_COMPACTION_FRACTION,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            compaction_threshold: config.compaction_threshold,
            compaction_fraction: config.compaction_fraction,
            ..Self::new(config.buffer_capacity)
        }
    }

    /// Insert a packet without blocking, returning whatever had to make room.
    ///
    /// At capacity the lowest-priority packet present is evicted (oldest
    /// first among ties). Past the compaction threshold the ring is cut back
    /// to its most urgent `1 - compaction_fraction` of capacity.
    pub fn push(&mut self, packet: StreamPacket) -> Vec<StreamPacket> {
        let mut evicted = Vec::new();
        if self.packets.len() >= self.capacity {
            if let Some(index) = self.eviction_candidate() {
                evicted.extend(self.packets.remove(index));
            }
        }
        self.packets.push_back(packet);

        if let Some(threshold) = self.compaction_threshold {
            if self.occupancy() > threshold {
                evicted.extend(self.compact());
            }
        }
        evicted
    }

    /// Keep the `floor(capacity * (1 - compaction_fraction))` most urgent
    /// packets (oldest first among ties) and return the rest
    pub fn compact(&mut self) -> Vec<StreamPacket> {
        let keep = (self.capacity as f64 * (1.0 - self.compaction_fraction)).floor() as usize;
        if self.packets.len() <= keep {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.packets.len()).collect();
        order.sort_by(|&a, &b| {
            self.packets[a]
                .priority
                .cmp(&self.packets[b].priority)
                .then(a.cmp(&b))
        });
        let shed = order.split_off(keep);
        self.remove_indices(shed)
    }

    /// Remove up to `max` packets, most urgent first (oldest first among ties)
    pub fn take_batch(&mut self, max: usize) -> Vec<StreamPacket> {
        let mut order: Vec<usize> = (0..self.packets.len()).collect();
        order.sort_by(|&a, &b| {
            self.packets[a]
                .priority
                .cmp(&self.packets[b].priority)
                .then(a.cmp(&b))
        });
        order.truncate(max);

        let mut batch = self.remove_indices(order);
        // remove_indices yields buffer order; restore urgency order
        batch.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });
        batch
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level in `[0, 1]`
    pub fn occupancy(&self) -> f64 {
        self.packets.len() as f64 / self.capacity as f64
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamPacket> {
        self.packets.iter()
    }

    fn eviction_candidate(&self) -> Option<usize> {
        let mut candidate: Option<usize> = None;
        for (index, packet) in self.packets.iter().enumerate() {
            match candidate {
                Some(current) if packet.priority <= self.packets[current].priority => {}
                _ => candidate = Some(index),
            }
        }
        candidate
    }

    fn remove_indices(&mut self, mut indices: Vec<usize>) -> Vec<StreamPacket> {
        indices.sort_unstable();
        let mut removed = Vec::with_capacity(indices.len());
        for index in indices.into_iter().rev() {
            removed.extend(self.packets.remove(index));
        }
        removed.reverse();
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Streaming,
}

/// Coarse health of the telemetry path as seen by the host UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl StreamQuality {
    /// Grade the stream from the link state, loss rate (fraction) and latency
    pub fn assess(state: &ConnectionState, data_loss_rate: f64, latency_ms: f64) -> Self {
        if !state.is_connected() {
            StreamQuality::Offline
        } else if data_loss_rate > 0.10 || latency_ms > 500.0 {
            StreamQuality::Poor
        } else if data_loss_rate > 0.05 || latency_ms > 200.0 {
            StreamQuality::Fair
        } else if data_loss_rate > 0.01 || latency_ms > 50.0 {
            StreamQuality::Good
        } else {
            StreamQuality::Excellent
        }
    }
}

/// Diagnostics for the telemetry path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub buffered: usize,
    pub capacity: usize,
    pub buffer_health: f64,
    pub packets_per_second: f64,
    pub data_loss_rate: f64,
    pub highest_sequence: u32,
    pub highest_acked: u32,
    pub sent: u64,
    pub failed: u64,
    pub evicted: u64,
    pub quality: StreamQuality,
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    ring: PacketRing,
    recent_sends: VecDeque<SystemTime>,
    highest_acked: u32,
    packets_per_second: f64,
    data_loss_rate: f64,
    sent: u64,
    failed: u64,
    evicted: u64,
}

pub struct TelemetryStream {
    this: Weak<Self>,
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectionMonitor>,
    metrics: Arc<MetricsAggregator>,
    queue: Arc<PriorityRetryQueue>,
    inner: Mutex<StreamInner>,
    sequence: AtomicU32,
    drain: PeriodicTask,
}

impl TelemetryStream {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<ConnectionMonitor>,
        metrics: Arc<MetricsAggregator>,
        queue: Arc<PriorityRetryQueue>,
    ) -> Arc<Self> {
        let ring = PacketRing::from_config(&config);
        let drain = PeriodicTask::new("telemetry-drain", config.drain_interval);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            transport,
            monitor,
            metrics,
            queue,
            inner: Mutex::new(StreamInner {
                state: StreamState::Stopped,
                ring,
                recent_sends: VecDeque::new(),
                highest_acked: 0,
                packets_per_second: 0.0,
                data_loss_rate: 0.0,
                sent: 0,
                failed: 0,
                evicted: 0,
            }),
            sequence: AtomicU32::new(0),
            drain,
        })
    }

    /// Enter `Streaming` and start the drain timer; a no-op when already streaming
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == StreamState::Streaming && self.drain.is_running() {
                return;
            }
            inner.state = StreamState::Streaming;
        }

        let stream: Weak<Self> = Arc::downgrade(self);
        self.drain.start(move || {
            let stream = stream.clone();
            async move {
                if let Some(stream) = stream.upgrade() {
                    stream.drain_once().await;
                }
            }
        });
        info!("Telemetry stream started");
    }

    /// Cancel the drain timer and discard buffered packets without flushing
    pub fn stop(&self) {
        self.drain.stop();
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Stopped {
            return;
        }
        let discarded = inner.ring.len();
        inner.ring.clear();
        inner.state = StreamState::Stopped;
        info!(discarded, "Telemetry stream stopped");
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.inner).state == StreamState::Streaming
    }

    /// Allocate the next per-process sequence number, starting at 1
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Buffer a packet without blocking. Returns whether the packet was accepted.
    ///
    /// Emergency packets skip the ring and are handed to the retry queue.
    /// Other packets are dropped while the stream is stopped.
    pub fn push(&self, packet: StreamPacket) -> bool {
        if packet.is_emergency() {
            self.send_emergency(packet);
            return true;
        }

        let mut inner = lock(&self.inner);
        if inner.state != StreamState::Streaming {
            trace!(sequence = packet.sequence_number, "Stream stopped, dropping packet");
            return false;
        }

        let evicted = inner.ring.push(packet);
        if !evicted.is_empty() {
            inner.evicted += evicted.len() as u64;
            warn!(
                evicted = evicted.len(),
                buffered = inner.ring.len(),
                "Telemetry buffer under pressure, dropped low-priority packets"
            );
        }
        true
    }

    pub fn stream_location(&self, latitude: f64, longitude: f64, speed: f64, accuracy: f64) -> bool {
        let mut payload = Payload::new();
        payload.insert("latitude".to_string(), Value::from(latitude));
        payload.insert("longitude".to_string(), Value::from(longitude));
        payload.insert("speed".to_string(), Value::from(speed));
        payload.insert("accuracy".to_string(), Value::from(accuracy));
        self.push(self.packet(DataType::GpsLocation, payload, StreamPriority::High))
    }

    pub fn stream_heart_rate(&self, heart_rate: f64) -> bool {
        let mut payload = Payload::new();
        payload.insert("heartRate".to_string(), Value::from(heart_rate));
        self.push(self.packet(DataType::HeartRate, payload, StreamPriority::Normal))
    }

    pub fn stream_rep_completion(&self, rep_number: u32, time: f64, distance: f64) -> bool {
        let mut payload = Payload::new();
        payload.insert("repNumber".to_string(), Value::from(rep_number));
        payload.insert("time".to_string(), Value::from(time));
        payload.insert("distance".to_string(), Value::from(distance));
        self.push(self.packet(DataType::RepComplete, payload, StreamPriority::Critical))
    }

    pub fn stream_phase_change(&self, from: &str, to: &str) -> bool {
        let mut payload = Payload::new();
        payload.insert("fromPhase".to_string(), Value::from(from));
        payload.insert("toPhase".to_string(), Value::from(to));
        self.push(self.packet(DataType::PhaseChange, payload, StreamPriority::Critical))
    }

    pub fn stream_emergency_stop(&self) -> bool {
        let mut payload = Payload::new();
        payload.insert("action".to_string(), Value::from("emergency_stop"));
        self.push(self.packet(DataType::Emergency, payload, StreamPriority::Emergency))
    }

    fn packet(&self, data_type: DataType, payload: Payload, priority: StreamPriority) -> StreamPacket {
        StreamPacket::new(self.next_sequence(), data_type, payload, priority)
    }

    fn send_emergency(&self, packet: StreamPacket) {
        info!(sequence = packet.sequence_number, "Emergency packet bypassing buffer");
        let message = OutboundMessage::new(
            emergency_envelope(&packet),
            packet.priority.as_message_priority(),
        );
        let delivery = self.queue.dispatch(message);
        let stream = self.this.clone();
        let sequence = packet.sequence_number;
        tokio::spawn(async move {
            if let Ok(Ok(_)) = delivery.await {
                if let Some(stream) = stream.upgrade() {
                    stream.acknowledge(sequence);
                }
            }
        });
    }

    /// Count a packet delivered outside the drain
    fn acknowledge(&self, sequence: u32) {
        {
            let mut inner = lock(&self.inner);
            inner.highest_acked = inner.highest_acked.max(sequence);
        }
        self.update_stream_metrics();
    }

    /// Send one batch of the most urgent packets. Returns how many were acknowledged.
    pub async fn drain_once(&self) -> usize {
        let batch = {
            let mut inner = lock(&self.inner);
            if inner.state != StreamState::Streaming
                || inner.ring.is_empty()
                || !self.monitor.is_sendable()
            {
                return 0;
            }
            inner.ring.take_batch(self.config.drain_batch)
        };

        let mut acknowledged = 0;
        for packet in batch {
            let started = tokio::time::Instant::now();
            let result = send_with_timeout(
                self.transport.as_ref(),
                stream_envelope(&packet),
                self.config.send_timeout,
            )
            .await;
            self.metrics.record_outcome(
                started.elapsed().as_secs_f64() * 1000.0,
                result.is_ok(),
            );

            let mut inner = lock(&self.inner);
            match result {
                Ok(_) => {
                    acknowledged += 1;
                    inner.sent += 1;
                    inner.highest_acked = inner.highest_acked.max(packet.sequence_number);
                    inner.recent_sends.push_back(packet.timestamp);
                }
                Err(e) => {
                    inner.failed += 1;
                    debug!(sequence = packet.sequence_number, error = %e, "Telemetry packet lost");
                }
            }
        }

        self.monitor.recompute();
        self.update_stream_metrics();
        acknowledged
    }

    fn update_stream_metrics(&self) {
        let issued = self.sequence.load(Ordering::SeqCst);
        let now = SystemTime::now();
        let mut inner = lock(&self.inner);

        inner.recent_sends.retain(|timestamp| {
            now.duration_since(*timestamp)
                .map(|age| age < Duration::from_secs(1))
                .unwrap_or(true)
        });
        inner.packets_per_second = inner.recent_sends.len() as f64;

        if issued > 0 {
            inner.data_loss_rate =
                f64::from(issued.saturating_sub(inner.highest_acked)) / f64::from(issued);
        }
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.monitor.current_state();
        let latency = self.metrics.rolling_latency();
        let inner = lock(&self.inner);
        StreamStats {
            state: inner.state,
            buffered: inner.ring.len(),
            capacity: inner.ring.capacity(),
            buffer_health: inner.ring.occupancy(),
            packets_per_second: inner.packets_per_second,
            data_loss_rate: inner.data_loss_rate,
            highest_sequence: self.sequence.load(Ordering::SeqCst),
            highest_acked: inner.highest_acked,
            sent: inner.sent,
            failed: inner.failed,
            evicted: inner.evicted,
            quality: StreamQuality::assess(&state, inner.data_loss_rate, latency),
        }
    }

    pub fn buffered(&self) -> usize {
        lock(&self.inner).ring.len()
    }
}
