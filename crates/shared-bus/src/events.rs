//! # Bus Events
//!
//! Defines all event types that flow through the shared bus.
//! Payloads are the message structs of `shared-types/src/messages.rs`.

use serde::{Deserialize, Serialize};
use shared_types::messages::{
    MessageProcessingFailed, NonAckMessagesCountChanged, PeerDecommissioned, PeerNotResponding,
    PeerResponding, PeerStarted, PeerStopped, PeerSubscriptionsForTypesUpdated,
    PeerSubscriptionsUpdated, ReplaySessionEnded, ReplaySessionStarted,
};
use shared_types::{BusMessage, CodecError, OriginatorInfo, PeerId, TransportMessage};

/// All events that can be published to the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    // =========================================================================
    // DIRECTORY
    // =========================================================================
    /// A peer registered.
    PeerStarted(PeerStarted),

    /// A persistent peer went down.
    PeerStopped(PeerStopped),

    /// A peer was removed.
    PeerDecommissioned(PeerDecommissioned),

    /// A peer's static subscriptions changed.
    PeerSubscriptionsUpdated(PeerSubscriptionsUpdated),

    /// A peer's dynamic subscriptions changed.
    PeerSubscriptionsForTypesUpdated(PeerSubscriptionsForTypesUpdated),

    /// A peer stopped answering pings.
    PeerNotResponding(PeerNotResponding),

    /// A peer answers pings again.
    PeerResponding(PeerResponding),

    // =========================================================================
    // PERSISTENCE
    // =========================================================================
    /// A replay session started.
    ReplaySessionStarted(ReplaySessionStarted),

    /// A replay session completed.
    ReplaySessionEnded(ReplaySessionEnded),

    /// Non-acked counts changed.
    NonAckMessagesCountChanged(NonAckMessagesCountChanged),

    // =========================================================================
    // DIAGNOSTICS
    // =========================================================================
    /// A message could not be processed.
    MessageProcessingFailed(MessageProcessingFailed),
}

impl BusEvent {
    /// Get the topic for this event (for filtering).
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::PeerStarted(_)
            | Self::PeerStopped(_)
            | Self::PeerDecommissioned(_)
            | Self::PeerSubscriptionsUpdated(_)
            | Self::PeerSubscriptionsForTypesUpdated(_)
            | Self::PeerNotResponding(_)
            | Self::PeerResponding(_) => EventTopic::Directory,
            Self::ReplaySessionStarted(_)
            | Self::ReplaySessionEnded(_)
            | Self::NonAckMessagesCountChanged(_) => EventTopic::Persistence,
            Self::MessageProcessingFailed(_) => EventTopic::Diagnostics,
        }
    }

    /// The peer this event is about, if any.
    #[must_use]
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::PeerStarted(e) => Some(e.peer_descriptor.peer_id()),
            Self::PeerStopped(e) => Some(&e.peer_id),
            Self::PeerDecommissioned(e) => Some(&e.peer_id),
            Self::PeerSubscriptionsUpdated(e) => Some(e.peer_descriptor.peer_id()),
            Self::PeerSubscriptionsForTypesUpdated(e) => Some(&e.peer_id),
            Self::PeerNotResponding(e) => Some(&e.peer_id),
            Self::PeerResponding(e) => Some(&e.peer_id),
            Self::ReplaySessionStarted(e) => Some(&e.peer_id),
            Self::ReplaySessionEnded(e) => Some(&e.peer_id),
            Self::NonAckMessagesCountChanged(_) | Self::MessageProcessingFailed(_) => None,
        }
    }

    /// Wrap this event in a transport envelope for remote subscribers.
    pub fn to_transport_message(
        &self,
        originator: OriginatorInfo,
    ) -> Result<TransportMessage, CodecError> {
        match self {
            Self::PeerStarted(e) => TransportMessage::from_message(e, originator),
            Self::PeerStopped(e) => TransportMessage::from_message(e, originator),
            Self::PeerDecommissioned(e) => TransportMessage::from_message(e, originator),
            Self::PeerSubscriptionsUpdated(e) => TransportMessage::from_message(e, originator),
            Self::PeerSubscriptionsForTypesUpdated(e) => {
                TransportMessage::from_message(e, originator)
            }
            Self::PeerNotResponding(e) => TransportMessage::from_message(e, originator),
            Self::PeerResponding(e) => TransportMessage::from_message(e, originator),
            Self::ReplaySessionStarted(e) => TransportMessage::from_message(e, originator),
            Self::ReplaySessionEnded(e) => TransportMessage::from_message(e, originator),
            Self::NonAckMessagesCountChanged(e) => TransportMessage::from_message(e, originator),
            Self::MessageProcessingFailed(e) => TransportMessage::from_message(e, originator),
        }
    }

    /// Decode a transport envelope carrying one of the bus events.
    ///
    /// Returns `Ok(None)` when the envelope holds some other message type.
    pub fn from_transport_message(message: &TransportMessage) -> Result<Option<Self>, CodecError> {
        fn decode<M: BusMessage>(
            message: &TransportMessage,
            wrap: fn(M) -> BusEvent,
        ) -> Result<Option<BusEvent>, CodecError> {
            message.decode::<M>().map(|m| Some(wrap(m)))
        }

        let name = message.message_type_id.full_name();
        match name {
            n if n == PeerStarted::TYPE_NAME => decode(message, Self::PeerStarted),
            n if n == PeerStopped::TYPE_NAME => decode(message, Self::PeerStopped),
            n if n == PeerDecommissioned::TYPE_NAME => decode(message, Self::PeerDecommissioned),
            n if n == PeerSubscriptionsUpdated::TYPE_NAME => {
                decode(message, Self::PeerSubscriptionsUpdated)
            }
            n if n == PeerSubscriptionsForTypesUpdated::TYPE_NAME => {
                decode(message, Self::PeerSubscriptionsForTypesUpdated)
            }
            n if n == PeerNotResponding::TYPE_NAME => decode(message, Self::PeerNotResponding),
            n if n == PeerResponding::TYPE_NAME => decode(message, Self::PeerResponding),
            n if n == ReplaySessionStarted::TYPE_NAME => {
                decode(message, Self::ReplaySessionStarted)
            }
            n if n == ReplaySessionEnded::TYPE_NAME => decode(message, Self::ReplaySessionEnded),
            n if n == NonAckMessagesCountChanged::TYPE_NAME => {
                decode(message, Self::NonAckMessagesCountChanged)
            }
            n if n == MessageProcessingFailed::TYPE_NAME => {
                decode(message, Self::MessageProcessingFailed)
            }
            _ => Ok(None),
        }
    }
}

/// Event topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Peer lifecycle and subscription changes.
    Directory,
    /// Replay sessions and backlog counts.
    Persistence,
    /// Processing failures.
    Diagnostics,
    /// All events (no filtering).
    All,
}

/// Filter for subscribing to specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<EventTopic>,
    /// Peers to include. Empty means all peers.
    pub peers: Vec<PeerId>,
}

impl EventFilter {
    /// Create a filter that accepts all events.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self {
            topics,
            peers: Vec::new(),
        }
    }

    /// Create a filter for events about specific peers.
    #[must_use]
    pub fn for_peers(peers: Vec<PeerId>) -> Self {
        Self {
            topics: Vec::new(),
            peers,
        }
    }

    /// Check if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &BusEvent) -> bool {
        let topic_match = self.topics.is_empty()
            || self.topics.contains(&EventTopic::All)
            || self.topics.contains(&event.topic());

        let peer_match = self.peers.is_empty()
            || event.peer_id().is_some_and(|id| self.peers.contains(id));

        topic_match && peer_match
    }
}
