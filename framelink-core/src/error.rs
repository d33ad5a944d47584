//! Domain-specific error types for the framelink transport.
//!
//! All fallible operations return `Result<T, FramelinkError>`.
//! Transport failures are returned to the caller; the background
//! receive task turns them into a [`ConnectionState`] transition
//! instead of propagating them across task boundaries.
//!
//! [`ConnectionState`]: crate::network::ConnectionState

use thiserror::Error;

/// The canonical error type for framelink.
#[derive(Debug, Error)]
pub enum FramelinkError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// The byte stream ended before a declared length was satisfied,
    /// or a length / name field was malformed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The envelope tag is outside the closed set of kinds.
    #[error("unknown envelope type tag: {0:#04x}")]
    UnknownType(u8),

    /// An envelope field exceeds the codec limits.
    #[error("{field} too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    // ── Connection Errors ────────────────────────────────────────
    /// Establishing a connection (connect / bind / accept) failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer disconnected or the connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The TCP/IO layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Application Errors ───────────────────────────────────────
    /// An ACK arrived for a name that is not being tracked.
    #[error("unexpected ack for {0:?}")]
    UnexpectedAck(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The display output sink failed.
    #[error("sink error: {0}")]
    Sink(String),
}

impl FramelinkError {
    /// Returns `true` for malformed-wire-data errors, which end the
    /// session they occur on.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            FramelinkError::Framing(_)
                | FramelinkError::UnknownType(_)
                | FramelinkError::PayloadTooLarge { .. }
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FramelinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FramelinkError::ConnectionClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FramelinkError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        FramelinkError::ConnectionClosed
    }
}
