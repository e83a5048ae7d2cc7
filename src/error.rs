//! Error taxonomy for the WebSocket engine and its pub/sub bridge.
//!
//! Kinds loosely follow the engine's own vocabulary: a `HandshakeError` never reaches
//! the peer as anything but a status code, a `FrameError` always ends the connection,
//! and `BrokerError` surfaces to the caller rather than being swallowed.

use thiserror::Error;

/// Why the HTTP upgrade request was rejected, with the status code it maps to.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("HTTP version below 1.1")]
    UnsupportedVersion,
    #[error("missing or mismatched Upgrade header")]
    BadUpgradeHeader,
    #[error("missing or mismatched Connection header")]
    BadConnectionHeader,
    #[error("missing Origin header")]
    MissingOrigin,
    #[error("missing or unsupported Sec-WebSocket-Version")]
    BadVersion,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

impl HandshakeError {
    /// The HTTP status code this rejection reason maps to.
    pub fn status_code(self) -> u16 {
        match self {
            HandshakeError::UnsupportedVersion => 505,
            HandshakeError::BadUpgradeHeader => 400,
            HandshakeError::BadConnectionHeader => 400,
            HandshakeError::MissingOrigin => 403,
            HandshakeError::BadVersion => 400,
            HandshakeError::MissingKey => 400,
        }
    }
}

/// A malformed or oversized frame. Always fatal to the connection (PROTOCOL kind).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set in frame header")]
    ReservedBitsSet,
    #[error("client frame was not masked")]
    Unmasked,
    #[error("payload length {0} exceeds the frame size limit")]
    PayloadTooLarge(u64),
    #[error("continuation frame received with no message in progress")]
    UnexpectedContinuation,
    #[error("data frame received while a continuation is already in progress")]
    ContinuationInProgress,
    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),
}

/// The pub/sub broker transport's error taxonomy.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport disconnected")]
    Disconnected,
    #[error("broker transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

/// Top-level error for a single connection's lifetime. Any variant destroys the
/// connection (§5's "Cancellation and timeouts").
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("no read activity for 60s")]
    Timeout,
}
