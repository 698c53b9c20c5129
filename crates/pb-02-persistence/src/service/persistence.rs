//! # Persistence Service
//!
//! Entry point of the persistence tier: command handlers, background
//! bookkeeping and graceful shutdown over the matcher, the storage and the
//! replayer repository.

use super::matcher::InMemoryMessageMatcher;
use super::periodic::run_periodic;
use super::replayer::ReplayContext;
use super::repository::MessageReplayerRepository;
use crate::domain::{NonAckedCountCache, PersistenceConfig};
use crate::ports::{PeerTransport, Storage};
use parking_lot::Mutex;
use shared_bus::{
    BusEvent, EventPublisher, HandlerError, HandlerRegistry, HandlerResult, MessageContext,
    Subscription as EventSubscription,
};
use shared_types::messages::{
    MessageHandled, NonAckMessagesCountChanged, PeerStopped, PersistMessageCommand,
    PublishNonAckMessagesCountCommand, PurgeMessageQueueCommand, StartMessageReplayCommand,
};
use shared_types::{
    CodecError, MessageId, OriginatorInfo, Peer, PeerId, StorageError, TransportMessage,
};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors returned by persistence commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<PersistenceError> for HandlerError {
    fn from(error: PersistenceError) -> Self {
        match error {
            PersistenceError::Storage(e) => Self::Storage(e),
            PersistenceError::Codec(e) => Self::Codec(e),
        }
    }
}

/// The persistence tier.
///
/// Stores a copy of each persistent message per down peer, records acks,
/// replays a peer's backlog when it comes back and reports non-acked counts.
pub struct PersistenceService {
    matcher: InMemoryMessageMatcher,
    storage: Arc<dyn Storage>,
    repository: MessageReplayerRepository,
    publisher: Arc<dyn EventPublisher>,
    non_acked: Mutex<NonAckedCountCache>,
    config: PersistenceConfig,
}

impl PersistenceService {
    /// Wire the service. Spawns the matcher, so a Tokio runtime is required.
    pub fn new(
        identity: OriginatorInfo,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
        publisher: Arc<dyn EventPublisher>,
        config: PersistenceConfig,
    ) -> Self {
        let matcher = InMemoryMessageMatcher::start(storage.clone(), config.clone());
        let repository = MessageReplayerRepository::new(ReplayContext {
            storage: storage.clone(),
            transport,
            publisher: publisher.clone(),
            identity,
            config: config.clone(),
        });
        Self {
            matcher,
            storage,
            repository,
            publisher,
            non_acked: Mutex::new(NonAckedCountCache::new()),
            config,
        }
    }

    pub fn repository(&self) -> &MessageReplayerRepository {
        &self.repository
    }

    pub fn matcher(&self) -> &InMemoryMessageMatcher {
        &self.matcher
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    async fn with_storage_timeout<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.config.storage_timeout(), call)
            .await
            .unwrap_or(Err(StorageError::Timeout {
                operation,
                elapsed_ms: self.config.storage_timeout_ms,
            }))
    }

    /// Start the storage backend.
    pub async fn start(&self) -> Result<(), PersistenceError> {
        self.with_storage_timeout("start", self.storage.start()).await?;
        info!("Persistence started");
        Ok(())
    }

    /// Store a copy of `message` for every target and feed running replays.
    pub fn persist_message(
        &self,
        message: &TransportMessage,
        targets: &[PeerId],
    ) -> Result<(), PersistenceError> {
        let bytes = message.to_bytes()?;
        for target in targets {
            self.matcher.enqueue_message(
                target.clone(),
                message.id,
                message.message_type_id.clone(),
                bytes.clone(),
            )?;
            if let Some(replayer) = self.repository.get_active_message_replayer(target) {
                replayer.add_live_message(message.clone());
            }
        }
        debug!(
            message_id = %message.id,
            message_type = %message.message_type_id,
            targets = targets.len(),
            "Persisted message"
        );
        Ok(())
    }

    /// Record that `peer_id` handled `message_id`.
    pub fn message_handled(
        &self,
        peer_id: &PeerId,
        message_id: MessageId,
    ) -> Result<(), PersistenceError> {
        self.matcher.enqueue_ack(peer_id.clone(), message_id)?;
        if let Some(replayer) = self.repository.get_active_message_replayer(peer_id) {
            replayer.handle_message_acked(message_id);
        }
        Ok(())
    }

    /// Start replaying `peer`'s backlog, superseding any running replay.
    ///
    /// Returns `false` when replays are deactivated.
    pub async fn start_message_replay(
        &self,
        peer: Peer,
        replay_id: Uuid,
    ) -> Result<bool, PersistenceError> {
        let peer_id = peer.id.clone();
        let Some(replayer) = self.repository.create_message_replayer(peer, replay_id) else {
            return Ok(false);
        };
        if !self.repository.set_active_message_replayer(replayer.clone()).await {
            return Ok(false);
        }
        // Entries queued before activation must be readable by the replayer.
        self.matcher.flush().await?;
        info!(peer_id = %peer_id, %replay_id, "Starting message replay");
        Ok(replayer.start())
    }

    /// Cancel the replay of a peer that went away.
    pub fn handle_peer_stopped(&self, peer_id: &PeerId) {
        if let Some(replayer) = self.repository.get_active_message_replayer(peer_id) {
            info!(peer_id = %peer_id, replay_id = %replayer.replay_id(), "Peer stopped, cancelling replay");
            replayer.cancel();
        }
    }

    /// Drop everything stored for the instance.
    pub async fn purge_message_queue(&self, instance_name: &str) -> Result<(), PersistenceError> {
        let peer_id = PeerId::new(instance_name);
        if let Some(replayer) = self.repository.get_active_message_replayer(&peer_id) {
            replayer.cancel();
            replayer.wait_for_completion().await;
        }
        self.matcher.flush().await?;
        self.with_storage_timeout("remove_peer", self.storage.remove_peer(&peer_id))
            .await?;
        info!(peer_id = %peer_id, "Purged message queue");
        Ok(())
    }

    /// Publish the peers whose non-acked count changed since the last call.
    ///
    /// Returns how many peers were reported.
    pub async fn publish_non_ack_messages_count(&self) -> Result<usize, PersistenceError> {
        let counts = self.matcher.get_non_acked_message_counts().await?;
        let changed = self.non_acked.lock().get_updated_values(counts);
        if changed.is_empty() {
            return Ok(0);
        }
        let reported = changed.len();
        self.publisher
            .publish(BusEvent::NonAckMessagesCountChanged(
                NonAckMessagesCountChanged {
                    non_ack_messages: changed,
                },
            ))
            .await;
        debug!(peers = reported, "Published non-acked counts");
        Ok(reported)
    }

    /// Refresh each peer's oldest non-acked timestamp.
    pub async fn update_oldest_non_acked(&self) -> Result<(), PersistenceError> {
        self.with_storage_timeout(
            "update_oldest_non_acked_timestamps",
            self.storage.update_oldest_non_acked_timestamps(),
        )
        .await?;
        Ok(())
    }

    /// Spawn the count publication and oldest-timestamp bookkeeping loops.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let counts = {
            let service = self.clone();
            tokio::spawn(run_periodic(
                "publish_non_acked_counts",
                self.config.non_acked_count_publish_interval(),
                shutdown.clone(),
                move || {
                    let service = service.clone();
                    async move {
                        if let Err(error) = service.publish_non_ack_messages_count().await {
                            warn!(%error, "Failed to publish non-acked counts");
                        }
                    }
                },
            ))
        };
        let oldest = {
            let service = self.clone();
            tokio::spawn(run_periodic(
                "update_oldest_non_acked",
                self.config.oldest_non_acked_update_interval(),
                shutdown,
                move || {
                    let service = service.clone();
                    async move {
                        if let Err(error) = service.update_oldest_non_acked().await {
                            warn!(%error, "Failed to update oldest non-acked timestamps");
                        }
                    }
                },
            ))
        };
        vec![counts, oldest]
    }

    /// Follow directory events until `shutdown` turns `true`.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: EventSubscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(BusEvent::PeerStopped(stopped)) => self.handle_peer_stopped(&stopped.peer_id),
                    Some(_) => {}
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Persistence event loop stopped");
    }

    /// Stop replays, drain the matcher and stop the storage.
    ///
    /// Running replays get `safety_phase_duration + shutdown_grace` to
    /// finish before they are cancelled.
    pub async fn shutdown(&self) {
        info!("Persistence shutting down");
        self.repository.deactivate_message_replayers();
        if !self
            .repository
            .wait_for_replayers(self.config.shutdown_timeout())
            .await
        {
            warn!("Cancelling replays still running at shutdown");
            self.repository.cancel_all();
        }
        self.matcher.stop().await;
        if let Err(error) = self
            .with_storage_timeout("stop", self.storage.stop())
            .await
        {
            error!(%error, "Storage failed to stop");
        }
        info!("Persistence stopped");
    }

    // =========================================================================
    // Bus handlers
    // =========================================================================

    /// Handlers for every command the persistence tier accepts.
    pub fn handler_registry(failure_publisher: Arc<dyn EventPublisher>) -> HandlerRegistry<Self> {
        HandlerRegistry::new()
            .register::<PersistMessageCommand, _, _>(
                "PersistMessageCommandHandler",
                Self::handle_persist_message,
            )
            .register::<MessageHandled, _, _>("MessageHandledHandler", Self::handle_message_handled)
            .register::<StartMessageReplayCommand, _, _>(
                "StartMessageReplayCommandHandler",
                Self::handle_start_message_replay,
            )
            .register::<PeerStopped, _, _>("PeerStoppedHandler", Self::handle_peer_stopped_event)
            .register::<PurgeMessageQueueCommand, _, _>(
                "PurgeMessageQueueCommandHandler",
                Self::handle_purge_message_queue,
            )
            .register::<PublishNonAckMessagesCountCommand, _, _>(
                "PublishNonAckMessagesCountCommandHandler",
                Self::handle_publish_non_ack_messages_count,
            )
            .with_failure_publisher(failure_publisher)
    }

    async fn handle_persist_message(
        service: Arc<Self>,
        _ctx: MessageContext,
        cmd: PersistMessageCommand,
    ) -> HandlerResult {
        service.persist_message(&cmd.transport_message, &cmd.targets)?;
        Ok(None)
    }

    async fn handle_message_handled(
        service: Arc<Self>,
        ctx: MessageContext,
        msg: MessageHandled,
    ) -> HandlerResult {
        service.message_handled(&ctx.originator.sender_id, msg.message_id)?;
        Ok(None)
    }

    async fn handle_start_message_replay(
        service: Arc<Self>,
        ctx: MessageContext,
        cmd: StartMessageReplayCommand,
    ) -> HandlerResult {
        let peer = Peer::new(ctx.originator.sender_id, ctx.originator.sender_endpoint);
        service.start_message_replay(peer, cmd.replay_id).await?;
        Ok(None)
    }

    async fn handle_peer_stopped_event(
        service: Arc<Self>,
        _ctx: MessageContext,
        event: PeerStopped,
    ) -> HandlerResult {
        service.handle_peer_stopped(&event.peer_id);
        Ok(None)
    }

    async fn handle_purge_message_queue(
        service: Arc<Self>,
        _ctx: MessageContext,
        cmd: PurgeMessageQueueCommand,
    ) -> HandlerResult {
        service.purge_message_queue(&cmd.instance_name).await?;
        Ok(None)
    }

    async fn handle_publish_non_ack_messages_count(
        service: Arc<Self>,
        _ctx: MessageContext,
        _cmd: PublishNonAckMessagesCountCommand,
    ) -> HandlerResult {
        service.publish_non_ack_messages_count().await?;
        Ok(None)
    }
}
