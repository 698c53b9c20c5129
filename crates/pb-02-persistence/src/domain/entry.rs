use shared_types::{MessageId, MessageTypeId, PeerId};

/// One unit of work for the storage: a message copy for a peer, or the ack
/// retiring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherEntry {
    Message {
        peer_id: PeerId,
        message_id: MessageId,
        message_type_id: MessageTypeId,
        /// The serialized transport message.
        bytes: Vec<u8>,
    },
    Ack {
        peer_id: PeerId,
        message_id: MessageId,
    },
}

impl MatcherEntry {
    pub fn message(
        peer_id: PeerId,
        message_id: MessageId,
        message_type_id: MessageTypeId,
        bytes: Vec<u8>,
    ) -> Self {
        Self::Message {
            peer_id,
            message_id,
            message_type_id,
            bytes,
        }
    }

    pub fn ack(peer_id: PeerId, message_id: MessageId) -> Self {
        Self::Ack {
            peer_id,
            message_id,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Message { peer_id, .. } | Self::Ack { peer_id, .. } => peer_id,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Message { message_id, .. } | Self::Ack { message_id, .. } => *message_id,
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}
