pub mod cli;
pub mod messages;
pub mod network;

// Re-export key types for easy testing
pub use messages::{MessagePriority, OutboundMessage, Payload, StreamPacket, StreamPriority};
pub use network::{
    ConnectionState, LinkConfig, LinkError, LinkManager, QualityTier, SimulatedTransport,
    Transport, TransportEvent,
};
