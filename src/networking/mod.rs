//! Simulator networking: codec, reliable transport, handshake, routing.
//!
//! The layers stack leaves-first: the codec is stateless, the transport
//! owns the socket, the circuit owns sequencing and acknowledgment
//! state, the handshake drives the circuit to a live session, and the
//! router fans decoded messages out to handlers.

pub mod circuit;
pub mod client;
pub mod codec;
pub mod handshake;
pub mod messages;
pub mod router;
pub mod transport;

pub use circuit::{Circuit, CircuitEvent};
pub use client::{Client, ClientEvent};
pub use codec::{CodecError, Packet, PacketFlags};
pub use handshake::{Handshake, HandshakeState};
pub use messages::{Message, MessageType};
pub use router::MessageRouter;
pub use transport::UdpTransport;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("connection lost to {address}: {reason}")]
    ConnectionLost {
        address: std::net::SocketAddr,
        reason: String,
    },

    #[error("reliable delivery failed for sequence {sequence} (type {message_type})")]
    ReliableDeliveryFailed { sequence: u32, message_type: u32 },

    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("circuit is not active")]
    CircuitInactive,

    #[error("transport error: {reason}")]
    Transport { reason: String },
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport {
            reason: err.to_string(),
        }
    }
}
