//! # Message Replayer
//!
//! One replay session for one peer coming back online.
//!
//! ```text
//! Created ─start()─▶ Starting ─reader open─▶ Replaying ─backlog sent─▶ SafetyPhase ─deadline─▶ Completed
//!    │                  │                        │                          │
//!    └──────────────────┴──── cancel() / unrecoverable error ──────────────┴──────────▶ Cancelled
//! ```
//!
//! Live messages persisted for the peer during the session are forwarded
//! after the backlog. Every message is sent at most once per session, and
//! messages acked during the session are not sent at all.

use crate::domain::PersistenceConfig;
use crate::ports::{MessageReader, PeerTransport, Storage};
use parking_lot::Mutex;
use shared_bus::{BusEvent, EventPublisher};
use shared_types::messages::{
    MessageProcessingFailed, ReplayPhaseEnded, ReplaySessionEnded, ReplaySessionStarted,
    SafetyPhaseEnded,
};
use shared_types::{
    BusMessage, CodecError, MessageId, MessageTypeId, OriginatorInfo, Peer, PeerId, StorageError,
    TransportError, TransportMessage,
};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Type stamped on envelopes rebuilt around undecodable stored bytes.
const UNDECODABLE_MESSAGE_TYPE: &str = "Peerbus.Persistence.UndecodableMessage";

/// Lifecycle of a replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Created,
    Starting,
    Replaying,
    SafetyPhase,
    Completed,
    Cancelled,
}

impl ReplayStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Replaying => "replaying",
            Self::SafetyPhase => "safety-phase",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a replay session stopped before completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("Replay cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Collaborators shared by every replayer.
#[derive(Clone)]
pub struct ReplayContext {
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn PeerTransport>,
    pub publisher: Arc<dyn EventPublisher>,
    /// Originator of the phase markers sent to the peer.
    pub identity: OriginatorInfo,
    pub config: PersistenceConfig,
}

enum LiveEvent {
    Message(TransportMessage),
    Acked(MessageId),
}

/// Per-session dedup state.
#[derive(Default)]
struct SessionState {
    replayed: HashSet<MessageId>,
    acked: HashSet<MessageId>,
    live: VecDeque<TransportMessage>,
}

impl SessionState {
    fn accept(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Message(message) => self.live.push_back(message),
            LiveEvent::Acked(message_id) => {
                self.acked.insert(message_id);
            }
        }
    }

    fn drain(&mut self, live: &mut mpsc::UnboundedReceiver<LiveEvent>) {
        while let Ok(event) = live.try_recv() {
            self.accept(event);
        }
    }

    fn is_settled(&self, message_id: &MessageId) -> bool {
        self.replayed.contains(message_id) || self.acked.contains(message_id)
    }

    fn next_live(&mut self) -> Option<TransportMessage> {
        while let Some(message) = self.live.pop_front() {
            if !self.is_settled(&message.id) {
                return Some(message);
            }
        }
        None
    }
}

type FinishHook = Box<dyn FnOnce(ReplayStatus) + Send>;

/// Drains a reconnected peer's backlog, then hands over to live traffic.
///
/// ```text
/// Created ─► Starting ─► Replaying ─► SafetyPhase ─► Completed
///    └──────────┴───────────┴─────────────┴────────► Cancelled
/// ```
///
/// Live messages for the peer are buffered from creation and delivered
/// during the safety phase; anything already replayed or acked is skipped.
/// The storage reader is dropped on every exit path, and the replayer never
/// writes to the storage.
pub struct MessageReplayer {
    peer: Peer,
    replay_id: Uuid,
    context: ReplayContext,
    status: watch::Sender<ReplayStatus>,
    cancel: watch::Sender<bool>,
    live_tx: mpsc::UnboundedSender<LiveEvent>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<LiveEvent>>>,
    on_finished: Mutex<Option<FinishHook>>,
}

impl MessageReplayer {
    /// Session in the `Created` state; nothing runs until [`Self::start`].
    pub fn new(peer: Peer, replay_id: Uuid, context: ReplayContext) -> Self {
        let (status, _) = watch::channel(ReplayStatus::Created);
        let (cancel, _) = watch::channel(false);
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Self {
            peer,
            replay_id,
            context,
            status,
            cancel,
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
            on_finished: Mutex::new(None),
        }
    }

    /// Peer being replayed to.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    pub fn replay_id(&self) -> Uuid {
        self.replay_id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ReplayStatus {
        *self.status.borrow()
    }

    /// Follow status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ReplayStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_on_finished(&self, hook: FinishHook) {
        *self.on_finished.lock() = Some(hook);
    }

    /// Buffer a live message sent to the peer while replaying.
    pub fn add_live_message(&self, message: TransportMessage) {
        let _ = self.live_tx.send(LiveEvent::Message(message));
    }

    /// Record an ack from the peer.
    pub fn handle_message_acked(&self, message_id: MessageId) {
        let _ = self.live_tx.send(LiveEvent::Acked(message_id));
    }

    /// Spawn the session. Returns `false` if it already started or was
    /// cancelled.
    pub fn start(self: &Arc<Self>) -> bool {
        let started = self.status.send_if_modified(|status| {
            if *status == ReplayStatus::Created {
                *status = ReplayStatus::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }
        let Some(live) = self.live_rx.lock().take() else {
            return false;
        };
        let cancel = self.cancel.subscribe();
        tokio::spawn(self.clone().run(live, cancel));
        true
    }

    /// Ask the session to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
        let never_started = self.status.send_if_modified(|status| {
            if *status == ReplayStatus::Created {
                *status = ReplayStatus::Cancelled;
                true
            } else {
                false
            }
        });
        if never_started {
            self.run_finish_hook(ReplayStatus::Cancelled);
        }
    }

    /// Wait for a terminal status.
    pub async fn wait_for_completion(&self) -> ReplayStatus {
        let mut status = self.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if status.changed().await.is_err() {
                return *status.borrow();
            }
        }
    }

    fn set_status(&self, status: ReplayStatus) {
        debug!(peer_id = %self.peer.id, replay_id = %self.replay_id, %status, "Replay status");
        self.status.send_replace(status);
    }

    fn run_finish_hook(&self, status: ReplayStatus) {
        let hook = self.on_finished.lock().take();
        if let Some(hook) = hook {
            hook(status);
        }
    }

    async fn run(
        self: Arc<Self>,
        mut live: mpsc::UnboundedReceiver<LiveEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        info!(peer_id = %self.peer.id, replay_id = %self.replay_id, "Replay session started");
        self.context
            .publisher
            .publish(BusEvent::ReplaySessionStarted(ReplaySessionStarted {
                peer_id: self.peer.id.clone(),
                session_id: self.replay_id,
            }))
            .await;

        let mut session = SessionState::default();
        let status = match self.replay(&mut session, &mut live, &mut cancel).await {
            Ok(()) => {
                self.context
                    .publisher
                    .publish(BusEvent::ReplaySessionEnded(ReplaySessionEnded {
                        peer_id: self.peer.id.clone(),
                        session_id: self.replay_id,
                    }))
                    .await;
                info!(
                    peer_id = %self.peer.id,
                    replay_id = %self.replay_id,
                    sent = session.replayed.len(),
                    "Replay session completed"
                );
                ReplayStatus::Completed
            }
            Err(ReplayError::Cancelled) => {
                info!(peer_id = %self.peer.id, replay_id = %self.replay_id, "Replay session cancelled");
                ReplayStatus::Cancelled
            }
            Err(error) => {
                error!(
                    peer_id = %self.peer.id,
                    replay_id = %self.replay_id,
                    %error,
                    "Replay session failed"
                );
                ReplayStatus::Cancelled
            }
        };

        self.run_finish_hook(status);
        self.set_status(status);
    }

    async fn replay(
        &self,
        session: &mut SessionState,
        live: &mut mpsc::UnboundedReceiver<LiveEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ReplayError> {
        let reader = self.open_reader(cancel).await?;
        self.set_status(ReplayStatus::Replaying);

        if let Some(mut reader) = reader {
            loop {
                Self::check_cancelled(cancel)?;
                let batch = self.read_batch(reader.as_mut(), cancel).await?;
                if batch.is_empty() {
                    break;
                }
                for bytes in batch {
                    Self::check_cancelled(cancel)?;
                    let message = match TransportMessage::from_bytes(&bytes) {
                        Ok(message) => message,
                        Err(error) => {
                            self.report_undecodable(bytes, &error).await;
                            continue;
                        }
                    };
                    session.drain(live);
                    if session.is_settled(&message.id) {
                        continue;
                    }
                    let message_id = message.id;
                    self.send_with_retry(message, cancel).await?;
                    session.replayed.insert(message_id);
                }
            }
        }

        self.send_marker(&ReplayPhaseEnded {
            replay_id: self.replay_id,
        }, cancel)
        .await?;
        self.set_status(ReplayStatus::SafetyPhase);

        let deadline = Instant::now() + self.context.config.safety_phase_duration();
        loop {
            session.drain(live);
            self.send_live(session, cancel).await?;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(ReplayError::Cancelled);
                    }
                }
                event = live.recv() => match event {
                    Some(event) => session.accept(event),
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        break;
                    }
                },
            }
        }
        session.drain(live);
        self.send_live(session, cancel).await?;

        self.send_marker(&SafetyPhaseEnded {
            replay_id: self.replay_id,
        }, cancel)
        .await
    }

    fn check_cancelled(cancel: &watch::Receiver<bool>) -> Result<(), ReplayError> {
        if *cancel.borrow() {
            Err(ReplayError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep before a retry, waking early on cancellation.
    async fn pause(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), ReplayError> {
        tokio::select! {
            _ = tokio::time::sleep(self.context.config.replay_retry_delay()) => Ok(()),
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    Err(ReplayError::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn storage_timeout(&self, operation: &'static str) -> StorageError {
        StorageError::Timeout {
            operation,
            elapsed_ms: self.context.config.storage_timeout_ms,
        }
    }

    async fn open_reader(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<Box<dyn MessageReader>>, ReplayError> {
        let config = &self.context.config;
        let mut attempt = 0;
        loop {
            Self::check_cancelled(cancel)?;
            let result = tokio::time::timeout(
                config.storage_timeout(),
                self.context.storage.create_message_reader(&self.peer.id),
            )
            .await
            .unwrap_or_else(|_| Err(self.storage_timeout("create_message_reader")));
            match result {
                Ok(reader) => return Ok(reader),
                Err(error) if error.is_timeout() && attempt < config.replay_max_batch_retries => {
                    attempt += 1;
                    warn!(peer_id = %self.peer.id, %error, attempt, "Opening message reader timed out");
                    self.pause(cancel).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn read_batch(
        &self,
        reader: &mut dyn MessageReader,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<Vec<u8>>, ReplayError> {
        let config = &self.context.config;
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                config.storage_timeout(),
                reader.read_batch(config.replay_batch_size),
            )
            .await
            .unwrap_or_else(|_| Err(self.storage_timeout("read_batch")));
            match result {
                Ok(batch) => return Ok(batch),
                Err(error) if error.is_timeout() && attempt < config.replay_max_batch_retries => {
                    attempt += 1;
                    warn!(peer_id = %self.peer.id, %error, attempt, "Replay batch timed out, retrying");
                    self.pause(cancel).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn send_with_retry(
        &self,
        message: TransportMessage,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ReplayError> {
        let config = &self.context.config;
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                config.send_timeout(),
                self.context.transport.send(&self.peer, message.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    peer_id: self.peer.id.clone(),
                    elapsed_ms: config.send_timeout_ms,
                })
            });
            match result {
                Ok(()) => return Ok(()),
                Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                Err(error) if attempt < config.replay_max_batch_retries => {
                    attempt += 1;
                    warn!(peer_id = %self.peer.id, message_id = %message.id, %error, attempt, "Replay send failed, retrying");
                    self.pause(cancel).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn send_live(
        &self,
        session: &mut SessionState,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ReplayError> {
        while let Some(message) = session.next_live() {
            Self::check_cancelled(cancel)?;
            let message_id = message.id;
            self.send_with_retry(message, cancel).await?;
            session.replayed.insert(message_id);
        }
        Ok(())
    }

    async fn send_marker<M: BusMessage>(
        &self,
        marker: &M,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ReplayError> {
        let message = TransportMessage::from_message(marker, self.context.identity.clone())?;
        self.send_with_retry(message, cancel).await
    }

    async fn report_undecodable(&self, bytes: Vec<u8>, error: &CodecError) {
        error!(peer_id = %self.peer.id, %error, "Skipping undecodable stored message");
        let failing_message = TransportMessage {
            id: MessageId::new(),
            message_type_id: MessageTypeId::new(UNDECODABLE_MESSAGE_TYPE),
            originator: self.context.identity.clone(),
            content: bytes,
        };
        self.context
            .publisher
            .publish(BusEvent::MessageProcessingFailed(MessageProcessingFailed {
                failing_message,
                exception_message: error.to_string(),
                failing_handler: Some("MessageReplayer".into()),
            }))
            .await;
    }
}
