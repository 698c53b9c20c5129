use shared_bus::{DispatchError, HandlerError};
use shared_types::{CodecError, DomainError, TransportError};
use thiserror::Error;

/// Errors returned by the directory client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryClientError {
    /// The directory refused the command (e.g. `PeerAlreadyExists`).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The directory could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A command or reply could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The directory did not answer in time.
    #[error("Directory did not answer within {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The directory failed to process the command.
    #[error("Directory failed to handle {message_type}: {reason}")]
    Rejected {
        message_type: String,
        reason: String,
    },

    /// A reply was expected but none came back.
    #[error("Directory sent no reply to {0}")]
    MissingReply(String),

    /// The operation needs a prior registration.
    #[error("Peer is not registered")]
    NotRegistered,
}

impl From<DispatchError> for DirectoryClientError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::NoHandler(message_type) => Self::Rejected {
                message_type: message_type.to_string(),
                reason: "no handler".into(),
            },
            DispatchError::Handler { source, handler } => match source {
                HandlerError::Domain(e) => Self::Domain(e),
                HandlerError::Codec(e) => Self::Codec(e),
                other => Self::Rejected {
                    message_type: handler,
                    reason: other.to_string(),
                },
            },
        }
    }
}
