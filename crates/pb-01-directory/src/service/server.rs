//! # Directory Server
//!
//! Owns the [`PeerRegistry`] and turns each accepted directory command into
//! a change event. Commands that the registry rejects as stale produce no
//! event, so subscribers only ever see forward moves.

use crate::domain::{PeerRegistry, RegistrationOutcome, UnregisterOutcome};
use shared_bus::dispatch::reply;
use shared_bus::{BusEvent, EventPublisher, HandlerRegistry, HandlerResult, MessageContext};
use shared_types::messages::{
    DecommissionPeerCommand, PeerDecommissioned, PeerNotResponding, PeerResponding, PeerStarted,
    PeerSubscriptionsForTypesUpdated, PeerSubscriptionsUpdated, RegisterPeerCommand,
    RegisterPeerResponse, UnregisterPeerCommand, UpdatePeerSubscriptionsCommand,
    UpdatePeerSubscriptionsForTypesCommand,
};
use shared_types::{
    DomainError, OriginatorInfo, PeerDescriptor, PeerId, Subscription, SubscriptionsForType,
    TimeSource, Timestamp,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory server: applies directory commands to the registry and
/// broadcasts the resulting change events.
///
/// # Example
///
/// ```rust,ignore
/// let server = Arc::new(DirectoryServer::new(identity, bus.clone(), Arc::new(SystemTimeSource)));
/// let handlers = DirectoryServer::handler_registry(bus.clone());
/// let reply = handlers.dispatch(server.clone(), &register_command).await?;
/// ```
pub struct DirectoryServer {
    registry: PeerRegistry,
    publisher: Arc<dyn EventPublisher>,
    time_source: Arc<dyn TimeSource>,
    identity: OriginatorInfo,
}

impl DirectoryServer {
    /// Create a server with an empty registry.
    ///
    /// # Arguments
    ///
    /// * `identity` - Originator stamped on replies
    /// * `publisher` - Sink of directory events
    /// * `time_source` - Clock for server-side timestamps
    pub fn new(
        identity: OriginatorInfo,
        publisher: Arc<dyn EventPublisher>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(),
            publisher,
            time_source,
            identity,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Identity stamped on replies.
    pub fn identity(&self) -> &OriginatorInfo {
        &self.identity
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    /// Register a peer and return the full peer list.
    ///
    /// A stale registration changes nothing but still returns the list.
    pub async fn register(
        &self,
        descriptor: PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, DomainError> {
        let peer_id = descriptor.peer_id().clone();
        match self.registry.register(descriptor, self.now()) {
            Ok(RegistrationOutcome::Registered(stored)) => {
                info!(
                    peer_id = %peer_id,
                    endpoint = %stored.peer.endpoint,
                    persistent = stored.is_persistent,
                    "Peer registered"
                );
                self.publisher
                    .publish(BusEvent::PeerStarted(PeerStarted {
                        peer_descriptor: stored,
                    }))
                    .await;
            }
            Ok(RegistrationOutcome::Ignored) => {
                debug!(peer_id = %peer_id, "Stale registration ignored");
            }
            Err(error) => {
                warn!(peer_id = %peer_id, %error, "Registration rejected");
                return Err(error);
            }
        }
        Ok(self.registry.peers())
    }

    /// Graceful stop of a peer. Returns `true` if the directory changed.
    pub async fn unregister(
        &self,
        peer_id: &PeerId,
        timestamp: Timestamp,
        endpoint: Option<&str>,
    ) -> bool {
        let Some(outcome) = self.registry.unregister(peer_id, timestamp, endpoint) else {
            debug!(peer_id = %peer_id, "Unregistration ignored");
            return false;
        };
        let event = match outcome {
            UnregisterOutcome::Stopped(stopped) => {
                info!(peer_id = %peer_id, "Persistent peer stopped");
                BusEvent::PeerStopped(stopped)
            }
            UnregisterOutcome::Decommissioned(decommissioned) => {
                info!(peer_id = %peer_id, "Transient peer removed");
                BusEvent::PeerDecommissioned(decommissioned)
            }
        };
        self.publisher.publish(event).await;
        true
    }

    /// Remove a peer regardless of versions.
    pub async fn decommission(&self, peer_id: &PeerId) -> bool {
        if !self.registry.decommission(peer_id) {
            debug!(peer_id = %peer_id, "Decommission of unknown peer");
            return false;
        }
        info!(peer_id = %peer_id, "Peer decommissioned");
        self.publisher
            .publish(BusEvent::PeerDecommissioned(PeerDecommissioned {
                peer_id: peer_id.clone(),
            }))
            .await;
        true
    }

    /// Replace the static subscriptions of a peer.
    pub async fn update_subscriptions(
        &self,
        peer_id: &PeerId,
        subscriptions: Vec<Subscription>,
        timestamp: Timestamp,
    ) -> Option<PeerDescriptor> {
        let Some(descriptor) = self
            .registry
            .update_subscriptions(peer_id, subscriptions, timestamp)
        else {
            debug!(peer_id = %peer_id, timestamp = %timestamp, "Stale subscription update ignored");
            return None;
        };
        debug!(
            peer_id = %peer_id,
            count = descriptor.subscriptions.len(),
            "Subscriptions updated"
        );
        self.publisher
            .publish(BusEvent::PeerSubscriptionsUpdated(PeerSubscriptionsUpdated {
                peer_descriptor: descriptor.clone(),
            }))
            .await;
        Some(descriptor)
    }

    /// Apply per-type dynamic subscription changes.
    ///
    /// Always publishes `PeerSubscriptionsForTypesUpdated` carrying the
    /// applied entries, possibly none.
    pub async fn update_dynamic_subscriptions_for_types(
        &self,
        peer_id: &PeerId,
        timestamp: Timestamp,
        updates: &[SubscriptionsForType],
    ) -> Vec<SubscriptionsForType> {
        let applied = self
            .registry
            .update_dynamic_subscriptions_for_types(peer_id, timestamp, updates);
        debug!(
            peer_id = %peer_id,
            requested = updates.len(),
            applied = applied.len(),
            "Dynamic subscriptions updated"
        );
        self.publisher
            .publish(BusEvent::PeerSubscriptionsForTypesUpdated(
                PeerSubscriptionsForTypesUpdated {
                    peer_id: peer_id.clone(),
                    timestamp_utc: timestamp,
                    subscriptions_for_types: applied.clone(),
                },
            ))
            .await;
        applied
    }

    /// Mark a peer down without removing it.
    pub async fn set_peer_down(&self, peer_id: &PeerId, timestamp: Timestamp) -> bool {
        let Some(stopped) = self.registry.set_peer_down(peer_id, timestamp) else {
            return false;
        };
        info!(peer_id = %peer_id, "Peer marked down");
        self.publisher.publish(BusEvent::PeerStopped(stopped)).await;
        true
    }

    /// Flip the responding flag of a peer, versioned by the server clock.
    pub async fn set_peer_responding(&self, peer_id: &PeerId, is_responding: bool) -> bool {
        let timestamp = self.now();
        if !self
            .registry
            .set_peer_responding(peer_id, is_responding, timestamp)
        {
            return false;
        }
        let event = if is_responding {
            info!(peer_id = %peer_id, "Peer responding again");
            BusEvent::PeerResponding(PeerResponding {
                peer_id: peer_id.clone(),
                timestamp_utc: timestamp,
            })
        } else {
            warn!(peer_id = %peer_id, "Peer not responding");
            BusEvent::PeerNotResponding(PeerNotResponding {
                peer_id: peer_id.clone(),
                timestamp_utc: timestamp,
            })
        };
        self.publisher.publish(event).await;
        true
    }

    /// Handlers for every directory command.
    ///
    /// `RegisterPeerCommand` is answered with `RegisterPeerResponse`; the
    /// other commands have no reply.
    pub fn handler_registry(failure_publisher: Arc<dyn EventPublisher>) -> HandlerRegistry<Self> {
        HandlerRegistry::new()
            .register::<RegisterPeerCommand, _, _>("RegisterPeerCommandHandler", Self::handle_register)
            .register::<UnregisterPeerCommand, _, _>(
                "UnregisterPeerCommandHandler",
                Self::handle_unregister,
            )
            .register::<DecommissionPeerCommand, _, _>(
                "DecommissionPeerCommandHandler",
                Self::handle_decommission,
            )
            .register::<UpdatePeerSubscriptionsCommand, _, _>(
                "UpdatePeerSubscriptionsCommandHandler",
                Self::handle_update_subscriptions,
            )
            .register::<UpdatePeerSubscriptionsForTypesCommand, _, _>(
                "UpdatePeerSubscriptionsForTypesCommandHandler",
                Self::handle_update_subscriptions_for_types,
            )
            .with_failure_publisher(failure_publisher)
    }

    async fn handle_register(
        server: Arc<Self>,
        _ctx: MessageContext,
        cmd: RegisterPeerCommand,
    ) -> HandlerResult {
        let peer_descriptors = server.register(cmd.peer).await?;
        reply(
            &RegisterPeerResponse { peer_descriptors },
            server.identity.clone(),
        )
    }

    async fn handle_unregister(
        server: Arc<Self>,
        _ctx: MessageContext,
        cmd: UnregisterPeerCommand,
    ) -> HandlerResult {
        server
            .unregister(&cmd.peer_id, cmd.timestamp_utc, cmd.endpoint.as_deref())
            .await;
        Ok(None)
    }

    async fn handle_decommission(
        server: Arc<Self>,
        _ctx: MessageContext,
        cmd: DecommissionPeerCommand,
    ) -> HandlerResult {
        server.decommission(&cmd.peer_id).await;
        Ok(None)
    }

    async fn handle_update_subscriptions(
        server: Arc<Self>,
        _ctx: MessageContext,
        cmd: UpdatePeerSubscriptionsCommand,
    ) -> HandlerResult {
        server
            .update_subscriptions(&cmd.peer_id, cmd.subscriptions, cmd.timestamp_utc)
            .await;
        Ok(None)
    }

    async fn handle_update_subscriptions_for_types(
        server: Arc<Self>,
        _ctx: MessageContext,
        cmd: UpdatePeerSubscriptionsForTypesCommand,
    ) -> HandlerResult {
        server
            .update_dynamic_subscriptions_for_types(
                &cmd.peer_id,
                cmd.timestamp_utc,
                &cmd.subscriptions_for_types,
            )
            .await;
        Ok(None)
    }
}
