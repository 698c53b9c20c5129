//! # Message Catalog
//!
//! Logical commands and events exchanged between peers, the directory and the
//! persistence service. Payloads never repeat the sender identity; the
//! envelope's originator is authoritative.
//!
//! | Message | Source | Target |
//! |---|---|---|
//! | `RegisterPeerCommand` → `RegisterPeerResponse` | peer | directory |
//! | `UnregisterPeerCommand` | peer | directory |
//! | `DecommissionPeerCommand` | operator | directory |
//! | `UpdatePeerSubscriptions*Command` | peer | directory |
//! | `Peer*` events | directory | all peers |
//! | `PersistMessageCommand`, `MessageHandled` | peers | persistence |
//! | `StartMessageReplayCommand` | peer | persistence |
//! | `ReplaySession*`, `NonAckMessagesCountChanged` | persistence | all peers |
//! | `ReplayPhaseEnded`, `SafetyPhaseEnded` | persistence | replayed peer |

use crate::entities::{MessageId, PeerDescriptor, PeerId, Timestamp};
use crate::envelope::TransportMessage;
use crate::routing::{BindingKey, BusMessage, RoutingPart, Subscription, SubscriptionsForType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! bus_message {
    ($t:ty, $name:literal) => {
        impl BusMessage for $t {
            const TYPE_NAME: &'static str = $name;
        }
    };
    ($t:ty, $name:literal, transient) => {
        impl BusMessage for $t {
            const TYPE_NAME: &'static str = $name;

            fn is_persistent() -> bool {
                false
            }
        }
    };
}

// =============================================================================
// DIRECTORY COMMANDS
// =============================================================================

/// Register the sending peer with the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerCommand {
    /// Self-descriptor including initial subscriptions.
    pub peer: PeerDescriptor,
}
bus_message!(RegisterPeerCommand, "Peerbus.Directory.RegisterPeerCommand", transient);

/// Reply to a successful registration: the full directory content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerResponse {
    /// Every known peer, the registrant included.
    pub peer_descriptors: Vec<PeerDescriptor>,
}
bus_message!(RegisterPeerResponse, "Peerbus.Directory.RegisterPeerResponse", transient);

/// Graceful shutdown of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterPeerCommand {
    /// Stopping peer.
    pub peer_id: PeerId,
    /// Version of the shutdown.
    pub timestamp_utc: Timestamp,
    /// Endpoint of the stopping instance, to ignore stale instances.
    pub endpoint: Option<String>,
}
bus_message!(UnregisterPeerCommand, "Peerbus.Directory.UnregisterPeerCommand", transient);

/// Administrative removal of a peer, regardless of versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecommissionPeerCommand {
    /// Removed peer.
    pub peer_id: PeerId,
}
bus_message!(DecommissionPeerCommand, "Peerbus.Directory.DecommissionPeerCommand", transient);

/// Replace a peer's static subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePeerSubscriptionsCommand {
    /// Updated peer.
    pub peer_id: PeerId,
    /// New static subscriptions.
    pub subscriptions: Vec<Subscription>,
    /// Version of the update.
    pub timestamp_utc: Timestamp,
}
bus_message!(
    UpdatePeerSubscriptionsCommand,
    "Peerbus.Directory.UpdatePeerSubscriptionsCommand",
    transient
);

/// Add or remove dynamic subscriptions, one message type at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePeerSubscriptionsForTypesCommand {
    /// Updated peer.
    pub peer_id: PeerId,
    /// Version of the update.
    pub timestamp_utc: Timestamp,
    /// Per-type patterns; an empty pattern list removes the type.
    pub subscriptions_for_types: Vec<SubscriptionsForType>,
}
bus_message!(
    UpdatePeerSubscriptionsForTypesCommand,
    "Peerbus.Directory.UpdatePeerSubscriptionsForTypesCommand",
    transient
);

// =============================================================================
// DIRECTORY EVENTS
// =============================================================================

/// A peer registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStarted {
    /// The stored descriptor.
    pub peer_descriptor: PeerDescriptor,
}
bus_message!(PeerStarted, "Peerbus.Directory.PeerStarted", transient);

/// A persistent peer went down; it stays in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStopped {
    /// Stopped peer.
    pub peer_id: PeerId,
    /// Its last endpoint.
    pub endpoint: String,
    /// Version of the transition.
    pub timestamp_utc: Option<Timestamp>,
}
bus_message!(PeerStopped, "Peerbus.Directory.PeerStopped", transient);

/// A peer was removed from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDecommissioned {
    /// Removed peer.
    pub peer_id: PeerId,
}
bus_message!(PeerDecommissioned, "Peerbus.Directory.PeerDecommissioned", transient);

/// A peer's static subscriptions changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSubscriptionsUpdated {
    /// Descriptor after the change.
    pub peer_descriptor: PeerDescriptor,
}
bus_message!(PeerSubscriptionsUpdated, "Peerbus.Directory.PeerSubscriptionsUpdated", transient);

/// A peer's dynamic subscriptions changed (possibly an empty change set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSubscriptionsForTypesUpdated {
    /// Updated peer.
    pub peer_id: PeerId,
    /// Version of the change.
    pub timestamp_utc: Timestamp,
    /// Per-type patterns; an empty list removed the type.
    pub subscriptions_for_types: Vec<SubscriptionsForType>,
}
bus_message!(
    PeerSubscriptionsForTypesUpdated,
    "Peerbus.Directory.PeerSubscriptionsForTypesUpdated",
    transient
);

/// A peer stopped answering pings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNotResponding {
    /// Silent peer.
    pub peer_id: PeerId,
    /// Version of the transition.
    pub timestamp_utc: Timestamp,
}
bus_message!(PeerNotResponding, "Peerbus.Directory.PeerNotResponding", transient);

/// A silent peer answers pings again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerResponding {
    /// Recovered peer.
    pub peer_id: PeerId,
    /// Version of the transition.
    pub timestamp_utc: Timestamp,
}
bus_message!(PeerResponding, "Peerbus.Directory.PeerResponding", transient);

// =============================================================================
// PERSISTENCE COMMANDS
// =============================================================================

/// Store a message for each target peer until it is acked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistMessageCommand {
    /// The message to store.
    pub transport_message: TransportMessage,
    /// Persistent peers the message was sent to.
    pub targets: Vec<PeerId>,
}
bus_message!(PersistMessageCommand, "Peerbus.Persistence.PersistMessageCommand", transient);

/// Ack from a peer: the message was handled and can be forgotten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandled {
    /// Handled message.
    pub message_id: MessageId,
}
bus_message!(MessageHandled, "Peerbus.Persistence.MessageHandled", transient);

/// Sent by a restarting persistent peer to receive its backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessageReplayCommand {
    /// Identifier of the replay session.
    pub replay_id: Uuid,
}
bus_message!(StartMessageReplayCommand, "Peerbus.Persistence.StartMessageReplayCommand", transient);

/// Drop every stored message of a peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeMessageQueueCommand {
    /// Peer id whose queue is purged.
    pub instance_name: String,
}
bus_message!(PurgeMessageQueueCommand, "Peerbus.Persistence.PurgeMessageQueueCommand", transient);

/// Ask the persistence service to publish changed non-acked counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishNonAckMessagesCountCommand;
bus_message!(
    PublishNonAckMessagesCountCommand,
    "Peerbus.Persistence.PublishNonAckMessagesCountCommand",
    transient
);

// =============================================================================
// PERSISTENCE EVENTS
// =============================================================================

/// A replay session started for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySessionStarted {
    /// Replayed peer.
    pub peer_id: PeerId,
    /// Session identifier (the replay id).
    pub session_id: Uuid,
}

impl BusMessage for ReplaySessionStarted {
    const TYPE_NAME: &'static str = "Peerbus.Persistence.ReplaySessionStarted";

    /// Routable on the replayed peer.
    fn binding_key(&self) -> BindingKey {
        BindingKey::from_parts([self.peer_id.as_str().to_routing_part()])
    }
}

/// A replay session completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySessionEnded {
    /// Replayed peer.
    pub peer_id: PeerId,
    /// Session identifier.
    pub session_id: Uuid,
}
bus_message!(ReplaySessionEnded, "Peerbus.Persistence.ReplaySessionEnded");

/// Sent to the replayed peer once its backlog has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPhaseEnded {
    /// Session identifier.
    pub replay_id: Uuid,
}
bus_message!(ReplayPhaseEnded, "Peerbus.Persistence.ReplayPhaseEnded", transient);

/// Sent to the replayed peer at the end of the safety phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPhaseEnded {
    /// Session identifier.
    pub replay_id: Uuid,
}
bus_message!(SafetyPhaseEnded, "Peerbus.Persistence.SafetyPhaseEnded", transient);

/// Non-acked count of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonAckMessage {
    /// Peer with a backlog.
    pub peer_id: PeerId,
    /// Number of stored, unacked messages.
    pub count: u64,
}

/// Peers whose non-acked count changed since the last publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonAckMessagesCountChanged {
    /// Changed counts.
    pub non_ack_messages: Vec<NonAckMessage>,
}
bus_message!(NonAckMessagesCountChanged, "Peerbus.Persistence.NonAckMessagesCountChanged", transient);

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// A message could not be decoded or handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProcessingFailed {
    /// The original message, as received.
    pub failing_message: TransportMessage,
    /// Error text.
    pub exception_message: String,
    /// Handler that failed, if one was selected.
    pub failing_handler: Option<String>,
}
bus_message!(MessageProcessingFailed, "Peerbus.Diagnostics.MessageProcessingFailed", transient);
