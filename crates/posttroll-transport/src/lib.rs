//! # posttroll-transport
//!
//! Uniform transport capabilities for the PostTroll messaging substrate:
//! publish sockets, subscribe sockets, request/reply pairs, and broadcast
//! sender/receiver pairs, with optional mutual authentication.
//!
//! ## Architecture
//!
//! ```text
//! Transport (transport.rs)     -- backend-selecting factory (plain / secure)
//!     |
//!     v
//! Conn (conn.rs)                -- one TCP connection, optionally AEAD-sealed
//!     |
//!     v
//! framing.rs                    -- [length:4 LE][body] frames over the wire
//!     |
//!     v
//! crypto.rs                     -- X25519 key exchange + ChaCha20-Poly1305
//! ```
//!
//! `sockets.rs` builds the five publish/subscribe/request/reply socket
//! types on top of [`Conn`]; `broadcast.rs` builds the UDP
//! sender/receiver pair used by the discovery plane.

pub mod broadcast;
pub mod conn;
pub mod crypto;
pub mod framing;
pub mod keepalive;
pub mod sockets;
pub mod transport;

pub use broadcast::{BroadcastReceiver, BroadcastSender};
pub use sockets::{PendingRequest, PublishSocket, ReplySocket, RequestSocket, SubscribeSocket};
pub use transport::Transport;

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Transport bind/connect failed, or a secure-backend peer was not
    /// authorized (spec.md §7 `ConnectionError`).
    #[error("connection error: {0}")]
    Connection(String),

    /// A request/reply or receive operation exceeded its deadline
    /// (spec.md §7 `TimeoutError`).
    #[error("operation timed out")]
    Timeout,

    /// Socket read/write failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A frame violated the length-prefix or base wire contract.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Key loading, key exchange, or AEAD seal/open failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Secure-backend configuration was missing a required key file.
    #[error("config error: {0}")]
    Config(#[from] posttroll_types::ConfigError),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "operation timed out");
        assert_eq!(
            TransportError::Connection("refused".to_string()).to_string(),
            "connection error: refused"
        );
    }
}
