//! # Error Types
//!
//! Defines error types used across crates.

use crate::entities::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable numeric codes carried by domain errors across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Another live instance already owns this peer id.
    PeerAlreadyExists = 1,
}

impl ErrorCode {
    /// Numeric value of the code.
    #[must_use]
    pub fn value(self) -> u16 {
        self as u16
    }
}

/// Business-rule violations surfaced to the caller.
///
/// These are operational conflicts: the caller must not retry blindly.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DomainError {
    /// A responding peer with the same id runs on another machine.
    #[error(
        "Peer {peer_id} already exists (existing machine: {existing_machine}, registering machine: {registering_machine})"
    )]
    PeerAlreadyExists {
        peer_id: PeerId,
        existing_machine: String,
        registering_machine: String,
    },
}

impl DomainError {
    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PeerAlreadyExists { .. } => ErrorCode::PeerAlreadyExists,
        }
    }
}

/// Errors raised by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A storage call exceeded its time budget.
    #[error("Storage timeout during {operation} after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// The backend reported a failure.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be encoded or decoded.
    #[error("Storage serialization error: {0}")]
    Serialization(String),

    /// The storage was stopped.
    #[error("Storage stopped")]
    Stopped,
}

impl StorageError {
    /// `true` for the timeout class, which callers retry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised when sending to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("Peer {0} unreachable")]
    Unreachable(PeerId),

    /// The peer did not acknowledge in time.
    #[error("Send to {peer_id} timed out after {elapsed_ms}ms")]
    Timeout { peer_id: PeerId, elapsed_ms: u64 },

    /// The transport was shut down.
    #[error("Transport closed")]
    Closed,
}

/// Errors from payload encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The payload could not be encoded.
    #[error("Failed to encode {message_type}: {reason}")]
    Encode {
        message_type: String,
        reason: String,
    },

    /// The payload could not be decoded.
    #[error("Failed to decode {message_type}: {reason}")]
    Decode {
        message_type: String,
        reason: String,
    },

    /// The envelope carries another type than the one requested.
    #[error("Expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}
