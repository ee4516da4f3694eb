//! Typed error hierarchy for the download client
//!
//! Every error carries enough context to decide its disposition: session
//! errors are absorbed by the orchestrator, fatal errors terminate the run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Missing or malformed metainfo, unusable CLI input
    #[error("config error: {message}")]
    Config { message: String },

    /// Tracker handshake failures (DNS, UDP I/O, protocol, rejection)
    #[error("tracker error: {message}")]
    Tracker {
        kind: TrackerErrorKind,
        message: String,
    },

    /// Peer socket failures, localized to a single session
    #[error("peer transport error: {message}")]
    PeerTransport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Short or forged peer handshake
    #[error("handshake error: {message}")]
    Handshake { message: String },

    /// SHA-1 mismatch on a completed piece; the piece is reset for retry
    #[error("piece {piece} failed hash verification")]
    Integrity { piece: u32 },

    /// Output file create/pre-allocate/write/sync failure
    #[error("disk error at {path:?}: {message}")]
    Disk { path: PathBuf, message: String },
}

/// Tracker error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerErrorKind {
    /// Host resolution failed
    Dns,
    /// Socket send/recv failed
    Io,
    /// No datagram within the deadline, after all retries
    Timeout,
    /// Action or transaction mismatch, short response
    Protocol,
    /// Tracker returned an explicit error message (action = 3)
    Rejected,
}

/// Peer transport error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// TCP connect failed or timed out
    Dial,
    /// Read deadline expired
    Timeout,
    /// Read/write error
    Io,
    /// Peer closed the connection
    Eof,
    /// Malformed frame or protocol violation
    Protocol,
}

impl ClientError {
    /// Whether this error terminates the whole run.
    ///
    /// Session-scoped errors (transport, handshake, integrity) are logged
    /// and absorbed; everything else propagates to the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Tracker { .. } | Self::Disk { .. }
        )
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a tracker error
    pub fn tracker(kind: TrackerErrorKind, message: impl Into<String>) -> Self {
        Self::Tracker {
            kind,
            message: message.into(),
        }
    }

    /// Create a peer transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::PeerTransport {
            kind,
            message: message.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create an integrity error
    pub fn integrity(piece: u32) -> Self {
        Self::Integrity { piece }
    }

    /// Create a disk error
    pub fn disk(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Disk {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
