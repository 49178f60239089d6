pub mod envelope;
pub mod types;

pub use envelope::{
    connectivity_ping, emergency_envelope, envelope_type, epoch_seconds, outbound_envelope,
    receipt, stream_envelope,
};
pub use types::{DataType, MessagePriority, OutboundMessage, Payload, StreamPacket, StreamPriority};
