//! # Directory Client
//!
//! The peer-side half of the directory. Registration seeds a local cache
//! with every known peer; directory events keep it current afterwards.
//!
//! Events can arrive before the state they refer to:
//! - during the registration round trip they are held and applied after
//!   the seed;
//! - for a peer the cache has never seen they are buffered per peer and
//!   replayed when its descriptor arrives, minus those older than it;
//! - for a peer decommissioned since the last seed they are dropped.

use super::cache::DirectoryCache;
use super::error::DirectoryClientError;
use crate::domain::DirectoryConfig;
use crate::ports::DirectoryTransport;
use parking_lot::Mutex;
use shared_bus::{BusEvent, Subscription as EventSubscription};
use shared_types::messages::{
    RegisterPeerCommand, RegisterPeerResponse, UnregisterPeerCommand,
    UpdatePeerSubscriptionsForTypesCommand,
};
use shared_types::{
    BusMessage, CodecError, MessageBinding, OriginatorInfo, Peer, PeerDescriptor, PeerId,
    SubscriptionsForType, TimeSource, Timestamp, TransportMessage,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ClientState {
    /// Our own descriptor once registration was attempted.
    self_descriptor: Option<PeerDescriptor>,
    registering: bool,
    /// Events received while a registration round trip is in flight.
    pending: Vec<BusEvent>,
    /// Events about peers the cache does not know yet.
    orphans: HashMap<PeerId, VecDeque<BusEvent>>,
    /// Peers decommissioned since the last seed; their stray events are dropped.
    decommissioned: HashSet<PeerId>,
    last_timestamp: Option<Timestamp>,
}

/// A peer's view of the directory.
///
/// Registers the local peer, keeps a cache of every other peer fed by
/// directory events and answers routing lookups from that cache.
pub struct PeerDirectoryClient {
    config: DirectoryConfig,
    transport: Arc<dyn DirectoryTransport>,
    time_source: Arc<dyn TimeSource>,
    cache: DirectoryCache,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for PeerDirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectoryClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeerDirectoryClient {
    /// Unregistered client with an empty cache.
    pub fn new(
        config: DirectoryConfig,
        transport: Arc<dyn DirectoryTransport>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            transport,
            time_source,
            cache: DirectoryCache::new(),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Strictly increasing timestamp for our own commands.
    fn next_timestamp(state: &mut ClientState, now: Timestamp) -> Timestamp {
        let next = match state.last_timestamp {
            Some(last) if last >= now => last.plus_millis(1),
            _ => now,
        };
        state.last_timestamp = Some(next);
        next
    }

    async fn send(
        &self,
        message: TransportMessage,
    ) -> Result<Option<TransportMessage>, DirectoryClientError> {
        let timeout = self.config.registration_timeout();
        match tokio::time::timeout(timeout, self.transport.send(message)).await {
            Ok(reply) => reply,
            Err(_) => Err(DirectoryClientError::Timeout {
                elapsed_ms: self.config.registration_timeout_ms,
            }),
        }
    }

    /// Register the local peer and seed the cache from the reply.
    ///
    /// Directory events received during the round trip are applied after
    /// the seed.
    pub async fn register(&self, descriptor: PeerDescriptor) -> Result<(), DirectoryClientError> {
        let mut descriptor = descriptor;
        let originator = OriginatorInfo::new(
            descriptor.peer_id().clone(),
            descriptor.peer.endpoint.clone(),
        );
        {
            let mut state = self.state.lock();
            descriptor.timestamp_utc =
                Some(Self::next_timestamp(&mut state, self.time_source.now()));
            state.registering = true;
            state.pending.clear();
            state.self_descriptor = Some(descriptor.clone());
        }

        let peer_id = descriptor.peer_id().clone();
        let response = self.request_registration(descriptor, originator).await;

        let mut state = self.state.lock();
        state.registering = false;
        let pending = std::mem::take(&mut state.pending);

        let result = match response {
            Ok(response) => {
                self.cache.clear();
                state.orphans.clear();
                state.decommissioned.clear();
                for peer in &response.peer_descriptors {
                    self.apply_descriptor(&mut state, peer);
                }
                info!(
                    peer_id = %peer_id,
                    peers = response.peer_descriptors.len(),
                    "Registered on directory"
                );
                Ok(())
            }
            Err(error) => {
                warn!(peer_id = %peer_id, %error, "Registration failed");
                state.self_descriptor = None;
                Err(error)
            }
        };

        for event in pending {
            self.apply_event(&mut state, event);
        }
        result
    }

    async fn request_registration(
        &self,
        descriptor: PeerDescriptor,
        originator: OriginatorInfo,
    ) -> Result<RegisterPeerResponse, DirectoryClientError> {
        let command = RegisterPeerCommand { peer: descriptor };
        let message = TransportMessage::from_message(&command, originator)?;
        let reply = self.send(message).await?.ok_or_else(|| {
            DirectoryClientError::MissingReply(RegisterPeerCommand::TYPE_NAME.to_string())
        })?;
        Ok(reply.decode::<RegisterPeerResponse>()?)
    }

    /// Change the local peer's subscriptions for the given types.
    ///
    /// The change is applied locally first, then sent to the directory.
    pub async fn update_subscriptions(
        &self,
        subscriptions_for_types: Vec<SubscriptionsForType>,
    ) -> Result<(), DirectoryClientError> {
        let (originator, timestamp) = {
            let mut state = self.state.lock();
            let Some(own) = state.self_descriptor.as_ref() else {
                return Err(DirectoryClientError::NotRegistered);
            };
            let originator =
                OriginatorInfo::new(own.peer_id().clone(), own.peer.endpoint.clone());
            let timestamp = Self::next_timestamp(&mut state, self.time_source.now());
            (originator, timestamp)
        };

        if self
            .cache
            .apply_subscriptions_for_types(&originator.sender_id, timestamp, &subscriptions_for_types)
            .is_none()
        {
            debug!(
                peer_id = %originator.sender_id,
                "Own peer not cached yet, local view follows the directory event"
            );
        }

        let command = UpdatePeerSubscriptionsForTypesCommand {
            peer_id: originator.sender_id.clone(),
            timestamp_utc: timestamp,
            subscriptions_for_types,
        };
        let message = TransportMessage::from_message(&command, originator)?;
        self.send(message).await?;
        Ok(())
    }

    /// Leave the directory.
    pub async fn unregister(&self) -> Result<(), DirectoryClientError> {
        let (originator, timestamp) = {
            let mut state = self.state.lock();
            let Some(own) = state.self_descriptor.take() else {
                return Err(DirectoryClientError::NotRegistered);
            };
            let originator = OriginatorInfo::new(own.peer_id().clone(), own.peer.endpoint);
            let timestamp = Self::next_timestamp(&mut state, self.time_source.now());
            (originator, timestamp)
        };

        let command = UnregisterPeerCommand {
            peer_id: originator.sender_id.clone(),
            timestamp_utc: timestamp,
            endpoint: Some(originator.sender_endpoint.clone()),
        };
        let message = TransportMessage::from_message(&command, originator)?;
        self.send(message).await?;
        info!(peer_id = %command.peer_id, "Unregistered from directory");
        Ok(())
    }

    /// Apply one directory event to the cache.
    pub fn handle_event(&self, event: BusEvent) {
        let mut state = self.state.lock();
        if state.registering {
            state.pending.push(event);
            return;
        }
        self.apply_event(&mut state, event);
    }

    /// Decode and apply a directory event received from the network.
    ///
    /// Returns `false` for envelopes that carry no bus event.
    pub fn handle_transport_message(&self, message: &TransportMessage) -> Result<bool, CodecError> {
        match BusEvent::from_transport_message(message)? {
            Some(event) => {
                self.handle_event(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply events from `events` until `shutdown` turns `true`.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: EventSubscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Directory client event loop stopped");
    }

    fn apply_descriptor(&self, state: &mut ClientState, descriptor: &PeerDescriptor) {
        self.cache.apply_descriptor(descriptor);
        state.decommissioned.remove(descriptor.peer_id());
        let Some(buffered) = state.orphans.remove(descriptor.peer_id()) else {
            return;
        };
        let fresh: Vec<BusEvent> = buffered
            .into_iter()
            .filter(|event| !is_older(event_timestamp(event), descriptor.timestamp_utc))
            .collect();
        debug!(
            peer_id = %descriptor.peer_id(),
            events = fresh.len(),
            "Replaying buffered events"
        );
        for event in fresh {
            self.apply_event(state, event);
        }
    }

    fn apply_event(&self, state: &mut ClientState, event: BusEvent) {
        let known = match &event {
            BusEvent::PeerStarted(e) => {
                self.apply_descriptor(state, &e.peer_descriptor);
                return;
            }
            BusEvent::PeerSubscriptionsUpdated(e) => {
                self.apply_descriptor(state, &e.peer_descriptor);
                return;
            }
            BusEvent::PeerDecommissioned(e) => {
                self.cache.remove(&e.peer_id);
                state.orphans.remove(&e.peer_id);
                state.decommissioned.insert(e.peer_id.clone());
                return;
            }
            BusEvent::PeerStopped(e) => self
                .cache
                .set_peer_down(&e.peer_id, &e.endpoint, e.timestamp_utc)
                .is_some(),
            BusEvent::PeerSubscriptionsForTypesUpdated(e) => self
                .cache
                .apply_subscriptions_for_types(
                    &e.peer_id,
                    e.timestamp_utc,
                    &e.subscriptions_for_types,
                )
                .is_some(),
            BusEvent::PeerResponding(e) => self
                .cache
                .set_peer_responding(&e.peer_id, true, e.timestamp_utc)
                .is_some(),
            BusEvent::PeerNotResponding(e) => self
                .cache
                .set_peer_responding(&e.peer_id, false, e.timestamp_utc)
                .is_some(),
            _ => return,
        };

        if !known {
            self.buffer_orphan(state, event);
        }
    }

    fn buffer_orphan(&self, state: &mut ClientState, event: BusEvent) {
        let Some(peer_id) = event.peer_id().cloned() else {
            return;
        };
        if state.decommissioned.contains(&peer_id) {
            debug!(peer_id = %peer_id, "Dropping event for decommissioned peer");
            return;
        }
        let limit = self.config.max_buffered_events_per_peer;
        let buffer = state.orphans.entry(peer_id.clone()).or_default();
        if buffer.len() >= limit {
            buffer.pop_front();
            warn!(peer_id = %peer_id, limit, "Dropping oldest buffered event for unknown peer");
        }
        if limit > 0 {
            buffer.push_back(event);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Peers subscribed to `message`, up or down.
    pub fn get_peers_handling_message<M: BusMessage>(&self, message: &M) -> Vec<Peer> {
        self.cache.peers_handling(&MessageBinding::of(message))
    }

    /// Peers subscribed to `binding`, up or down.
    pub fn get_peers_handling(&self, binding: &MessageBinding) -> Vec<Peer> {
        self.cache.peers_handling(binding)
    }

    /// Cached descriptor of a peer.
    pub fn get_peer_descriptor(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        self.cache.get(peer_id).map(|d| PeerDescriptor::clone(&d))
    }

    /// Every cached descriptor, the local peer's included.
    pub fn get_peer_descriptors(&self) -> Vec<PeerDescriptor> {
        self.cache.peers()
    }

    /// `false` for unknown peers.
    pub fn is_persistent(&self, peer_id: &PeerId) -> bool {
        self.cache.get(peer_id).is_some_and(|d| d.is_persistent)
    }

    /// `true` between a successful `register` and `unregister`.
    pub fn is_registered(&self) -> bool {
        self.state.lock().self_descriptor.is_some()
    }

    /// Events waiting for an unknown peer to appear.
    pub fn buffered_event_count(&self, peer_id: &PeerId) -> usize {
        self.state.lock().orphans.get(peer_id).map_or(0, VecDeque::len)
    }
}

/// Version carried by a peer-level event, if any.
fn event_timestamp(event: &BusEvent) -> Option<Timestamp> {
    match event {
        BusEvent::PeerStopped(e) => e.timestamp_utc,
        BusEvent::PeerSubscriptionsForTypesUpdated(e) => Some(e.timestamp_utc),
        BusEvent::PeerResponding(e) => Some(e.timestamp_utc),
        BusEvent::PeerNotResponding(e) => Some(e.timestamp_utc),
        BusEvent::PeerStarted(e) => e.peer_descriptor.timestamp_utc,
        BusEvent::PeerSubscriptionsUpdated(e) => e.peer_descriptor.timestamp_utc,
        _ => None,
    }
}

fn is_older(event: Option<Timestamp>, descriptor: Option<Timestamp>) -> bool {
    matches!((event, descriptor), (Some(event), Some(descriptor)) if event < descriptor)
}
