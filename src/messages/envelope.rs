//! Key/value envelopes handed to the transport.
//!
//! The transport only understands flat maps, so every outbound value is
//! wrapped here with the bookkeeping keys the companion side reads back.

use crate::messages::types::{OutboundMessage, Payload, StreamPacket};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TYPE_KEY: &str = "type";
pub const MESSAGE_ID_KEY: &str = "messageId";
pub const STREAM_DATA_TYPE: &str = "stream_data";
pub const EMERGENCY_DATA_TYPE: &str = "emergency_data";
pub const CONNECTIVITY_PING_TYPE: &str = "connectivity_ping";

/// Seconds since the Unix epoch as a float, the timestamp format used on the link
pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Wrap a queued message; caller keys win over bookkeeping keys except the id
pub fn outbound_envelope(message: &OutboundMessage) -> Payload {
    let mut envelope = message.payload().clone();
    envelope.insert(
        MESSAGE_ID_KEY.to_string(),
        Value::from(message.id().to_string()),
    );
    envelope
        .entry("priority")
        .or_insert_with(|| Value::from(message.priority().as_str()));
    envelope
}

/// Wrap a buffered telemetry packet for a drain send
pub fn stream_envelope(packet: &StreamPacket) -> Payload {
    let mut envelope = packet_fields(packet, STREAM_DATA_TYPE);
    envelope.insert("priority".to_string(), Value::from(packet.priority.rank()));
    envelope
}

/// Wrap an emergency packet; it travels through the retry queue instead of the ring
pub fn emergency_envelope(packet: &StreamPacket) -> Payload {
    packet_fields(packet, EMERGENCY_DATA_TYPE)
}

fn packet_fields(packet: &StreamPacket, kind: &str) -> Payload {
    let mut envelope = Payload::new();
    envelope.insert(TYPE_KEY.to_string(), Value::from(kind));
    envelope.insert(
        "dataType".to_string(),
        Value::from(packet.data_type.as_str()),
    );
    envelope.insert(
        "sequenceNumber".to_string(),
        Value::from(packet.sequence_number),
    );
    envelope.insert(
        "timestamp".to_string(),
        Value::from(epoch_seconds(packet.timestamp)),
    );
    envelope.insert(
        "payload".to_string(),
        Value::Object(packet.payload.clone()),
    );
    envelope
}

/// Lightweight probe used to verify a recovered link end to end
pub fn connectivity_ping() -> Payload {
    let mut ping = Payload::new();
    ping.insert(TYPE_KEY.to_string(), Value::from(CONNECTIVITY_PING_TYPE));
    ping.insert(
        "timestamp".to_string(),
        Value::from(epoch_seconds(SystemTime::now())),
    );
    ping.insert("recovery_attempt".to_string(), Value::Bool(true));
    ping
}

/// Reply returned for every inbound message
pub fn receipt() -> Payload {
    let mut reply = Payload::new();
    reply.insert("status".to_string(), Value::from("received"));
    reply.insert(
        "timestamp".to_string(),
        Value::from(epoch_seconds(SystemTime::now())),
    );
    reply
}

/// The `type` key of an envelope, if it carries one
pub fn envelope_type(payload: &Payload) -> Option<&str> {
    payload.get(TYPE_KEY).and_then(Value::as_str)
}
