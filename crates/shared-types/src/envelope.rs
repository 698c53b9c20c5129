//! # `TransportMessage` Envelope
//!
//! The universal wrapper for every command and event on the bus.
//!
//! ## Properties
//!
//! - **Identity**: every envelope carries a unique `MessageId`, used for acks
//!   and replay dedup.
//! - **Typing**: `message_type_id` selects the handler; `content` is the
//!   bincode-encoded payload.
//! - **Envelope Authority**: `originator` is the sole source of truth for the
//!   sender's identity. Payloads do not repeat it.

use crate::entities::{MessageId, MessageTypeId, PeerId};
use crate::errors::CodecError;
use crate::routing::BusMessage;
use serde::{Deserialize, Serialize};

/// Who sent a transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatorInfo {
    /// Sending peer.
    pub sender_id: PeerId,
    /// Endpoint the sender listens on.
    pub sender_endpoint: String,
}

impl OriginatorInfo {
    /// Create originator info.
    pub fn new(sender_id: PeerId, sender_endpoint: impl Into<String>) -> Self {
        Self {
            sender_id,
            sender_endpoint: sender_endpoint.into(),
        }
    }
}

/// A serialized message plus the metadata needed to route and ack it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique id of this message instance.
    pub id: MessageId,
    /// Type of the encoded payload.
    pub message_type_id: MessageTypeId,
    /// Sender identity.
    pub originator: OriginatorInfo,
    /// Encoded payload.
    pub content: Vec<u8>,
}

impl TransportMessage {
    /// Wrap a typed message in a fresh envelope.
    pub fn from_message<M: BusMessage>(
        message: &M,
        originator: OriginatorInfo,
    ) -> Result<Self, CodecError> {
        let content = bincode::serialize(message).map_err(|e| CodecError::Encode {
            message_type: M::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: MessageId::new(),
            message_type_id: M::message_type_id(),
            originator,
            content,
        })
    }

    /// `true` if the payload is an `M`.
    #[must_use]
    pub fn is<M: BusMessage>(&self) -> bool {
        self.message_type_id.full_name() == M::TYPE_NAME
    }

    /// Decode the payload as `M`.
    pub fn decode<M: BusMessage>(&self) -> Result<M, CodecError> {
        if !self.is::<M>() {
            return Err(CodecError::TypeMismatch {
                expected: M::TYPE_NAME.to_string(),
                actual: self.message_type_id.to_string(),
            });
        }
        bincode::deserialize(&self.content).map_err(|e| CodecError::Decode {
            message_type: self.message_type_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize the whole envelope, e.g. for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode {
            message_type: self.message_type_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Deserialize a whole envelope previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode {
            message_type: "TransportMessage".to_string(),
            reason: e.to_string(),
        })
    }
}
