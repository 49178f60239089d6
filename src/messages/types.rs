use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use uuid::Uuid;

/// Ordered key/value map exchanged with the transport
pub type Payload = Map<String, Value>;

/// Urgency class for outbound command/state messages.
///
/// Variants are declared most-urgent first, so the derived `Ord` sorts
/// `Critical` ahead of `Low`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Workout control and safety signals
    Critical,
    /// Real-time data and user actions
    High,
    /// Session sync and updates
    Normal,
    /// Background sync and analytics
    Low,
}

impl MessagePriority {
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// Base delay before the first retry; later retries double it
    pub fn base_retry_delay(&self) -> Duration {
        match self {
            MessagePriority::Critical => Duration::from_millis(500),
            MessagePriority::High => Duration::from_secs(1),
            MessagePriority::Normal => Duration::from_secs(2),
            MessagePriority::Low => Duration::from_secs(5),
        }
    }

    /// Retry budget for a freshly created message of this priority
    pub fn default_max_retries(&self) -> u32 {
        match self {
            MessagePriority::Critical => 10,
            _ => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
        }
    }

}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command or state update awaiting acknowledged delivery.
///
/// Values are never mutated in place: a retry is a new value produced by
/// [`OutboundMessage::next_attempt`] that keeps the same `id`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    id: Uuid,
    payload: Payload,
    priority: MessagePriority,
    attempts: u32,
    created_at: Instant,
    max_retries: u32,
}

impl OutboundMessage {
    /// Create a new message with the priority's default retry budget
    pub fn new(payload: Payload, priority: MessagePriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            attempts: 0,
            created_at: Instant::now(),
            max_retries: priority.default_max_retries(),
        }
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Produce the value used for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    /// Whether a failed attempt with the current index may be retried
    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_retries
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn priority(&self) -> MessagePriority {
        self.priority
    }

    /// Zero-based index of the attempt this value represents
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Urgency class for telemetry packets
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StreamPriority {
    Emergency,
    Critical,
    High,
    Normal,
    Low,
}

impl StreamPriority {
    /// Numeric rank sent on the wire, 0 being most urgent
    pub fn rank(&self) -> u8 {
        match self {
            StreamPriority::Emergency => 0,
            StreamPriority::Critical => 1,
            StreamPriority::High => 2,
            StreamPriority::Normal => 3,
            StreamPriority::Low => 4,
        }
    }

    /// Retry-queue tier used when a packet has to travel as a message
    pub fn as_message_priority(&self) -> MessagePriority {
        match self {
            StreamPriority::Emergency | StreamPriority::Critical => MessagePriority::Critical,
            StreamPriority::High => MessagePriority::High,
            StreamPriority::Normal => MessagePriority::Normal,
            StreamPriority::Low => MessagePriority::Low,
        }
    }
}

/// Kind of telemetry carried by a stream packet
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    #[serde(rename = "gps")]
    GpsLocation,
    #[serde(rename = "hr")]
    HeartRate,
    #[serde(rename = "pace")]
    Pace,
    #[serde(rename = "distance")]
    Distance,
    #[serde(rename = "rep")]
    RepComplete,
    #[serde(rename = "phase")]
    PhaseChange,
    #[serde(rename = "emergency")]
    Emergency,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::GpsLocation => "gps",
            DataType::HeartRate => "hr",
            DataType::Pace => "pace",
            DataType::Distance => "distance",
            DataType::RepComplete => "rep",
            DataType::PhaseChange => "phase",
            DataType::Emergency => "emergency",
        }
    }
}

/// A loss-tolerant telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    pub sequence_number: u32,
    pub timestamp: SystemTime,
    pub data_type: DataType,
    pub payload: Payload,
    pub priority: StreamPriority,
}

impl StreamPacket {
    pub fn new(
        sequence_number: u32,
        data_type: DataType,
        payload: Payload,
        priority: StreamPriority,
    ) -> Self {
        Self {
            sequence_number,
            timestamp: SystemTime::now(),
            data_type,
            payload,
            priority,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.priority == StreamPriority::Emergency
    }
}
