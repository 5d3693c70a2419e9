//! # Error Types
//!
//! Error handling for the framed-message layer.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Frame decoding has its own small [`FrameError`] so callers can
//! log and drop a malformed message without treating it as a connection failure.
//!
//! ## Error Categories
//! - **Connect failures**: invalid URL, refused socket, rejected handshake
//! - **Transport errors**: I/O failures after a session opened
//! - **Protocol errors**: malformed records, oversized messages
//! - **Queue errors**: full send queues, closed sessions
//! - **Configuration errors**: invalid or unreadable configuration
//!
//! Only connect failures and post-open transport errors terminate a session.
//! Parse errors, unknown opcodes, handler failures and queue overflow are
//! reported through hooks and logs while the session stays open.
//!
//! ## Example Usage
//! ```rust
//! use framelink::core::frame;
//! use framelink::error::FrameError;
//! use tracing::warn;
//!
//! match frame::decode(&[0x01]) {
//!     Ok(frame) => println!("opcode {}", frame.opcode),
//!     Err(FrameError::TooShort { len }) => warn!(len, "dropping short frame"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_OPEN: &str = "Session is not open";
    pub const ERR_ATTEMPT_SUPERSEDED: &str = "Connect attempt superseded by a newer attempt";
    pub const ERR_CLOSED_BEFORE_OPEN: &str = "Connection closed before it opened";
    pub const ERR_HANDSHAKE_REJECTED: &str = "Server rejected the opening handshake";
    pub const ERR_UNEXPECTED_RECORD: &str = "Unexpected record during handshake";
    pub const ERR_SERVER_FULL: &str = "Server at connection limit";
    pub const ERR_SERVER_SHUTDOWN: &str = "Server shutting down";

    /// Close handshake
    pub const ERR_CLOSE_TIMEOUT: &str = "Close handshake timed out";
    pub const ERR_PEER_HUNG_UP: &str = "Peer closed the socket without a close record";
}

/// Failure to split a byte buffer into opcode and payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes (minimum is the opcode width)")]
    TooShort { len: usize },
}

// ProtocolError is the primary error type for all operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connect failed: {0}")]
    ConnectFailure(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid record header")]
    InvalidHeader,

    #[error("Message too large: {0} bytes")]
    OversizedMessage(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    QueueFull,

    #[error("Unknown session: {0}")]
    UnknownSession(u64),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
