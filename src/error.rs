//! # Error Types
//!
//! Error handling for the messaging engine.
//!
//! This module defines every error variant that can surface from the engine,
//! from socket-level failures to misuse of the client/server façades.
//!
//! ## Error Categories
//! - **Transport Errors**: connect, handshake, read and write failures
//! - **Peer Errors**: the remote side went away (informational, never escalated)
//! - **Misuse Errors**: calling an operation in the wrong state
//! - **Payload Errors**: reading more than a body holds, unknown ids, oversized frames
//! - **TLS / Config Errors**: certificate loading and configuration problems
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use framewire::error::{Result, WireError};
//! use framewire::Message;
//!
//! fn last_value(msg: &mut Message<u32>) -> Result<u64> {
//!     let value: u64 = msg.pop()?;
//!     Ok(value)
//! }
//!
//! let mut msg = Message::<u32>::new(1);
//! assert!(matches!(last_value(&mut msg), Err(WireError::BodyUnderflow { .. })));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants for log lines and error payloads.
pub mod constants {
    pub const ERR_NOT_CONNECTED: &str = "Connection is not established";
    pub const ERR_ALREADY_CONNECTED: &str = "Connection object was already used";
    pub const ERR_DISPATCH_RUNNING: &str = "A dispatch loop is already running";
    pub const ERR_ALREADY_LISTENING: &str = "Server is already listening";
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed before the write finished";
    pub const ERR_NO_ENDPOINTS: &str = "Address resolved to no endpoints";
}

/// WireError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Connect failed: {0}")]
    ConnectFailure(String),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Read failed: {0}")]
    ReadFailure(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Server is already listening")]
    AlreadyListening,

    #[error("A dispatch loop is already running on this instance")]
    ConcurrentDispatchLoop,

    #[error("I/O executor is not running")]
    NotRunning,

    #[error("Body underflow: needed {needed} bytes, {available} available")]
    BodyUnderflow { needed: usize, available: usize },

    #[error("Invalid message id on the wire: {0}")]
    InvalidMessageId(u64),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(u64),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl WireError {
    /// True for errors that only mean the other side already hung up.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            WireError::PeerClosed => true,
            WireError::Io(e) => is_disconnect_error(e),
            _ => false,
        }
    }
}

/// Classify I/O errors that indicate the peer went away rather than a fault.
///
/// EOF, reset, aborted and an already-closed descriptor are all reported at
/// `info` level and never surfaced on completion handles.
pub fn is_disconnect_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Type alias for Results using WireError
pub type Result<T> = std::result::Result<T, WireError>;
