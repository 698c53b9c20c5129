//! Registry of the replay sessions in flight.

use super::replayer::{MessageReplayer, ReplayContext};
use dashmap::DashMap;
use shared_types::{Peer, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// At most one active replayer per peer.
///
/// A replayer leaves the active set on its own when it reaches a terminal
/// status. Once deactivated, the repository refuses new replays.
pub struct MessageReplayerRepository {
    active: Arc<DashMap<PeerId, Arc<MessageReplayer>>>,
    accepting: AtomicBool,
    context: ReplayContext,
}

impl MessageReplayerRepository {
    /// Empty repository accepting replays. `context` is shared by every replayer it creates.
    pub fn new(context: ReplayContext) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            accepting: AtomicBool::new(true),
            context,
        }
    }

    /// Build a replayer for `peer`. `None` after deactivation.
    pub fn create_message_replayer(
        &self,
        peer: Peer,
        replay_id: Uuid,
    ) -> Option<Arc<MessageReplayer>> {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!(peer_id = %peer.id, %replay_id, "Replay refused, replayers are deactivated");
            return None;
        }
        Some(Arc::new(MessageReplayer::new(
            peer,
            replay_id,
            self.context.clone(),
        )))
    }

    /// The peer's replayer, unless it already finished.
    pub fn get_active_message_replayer(&self, peer_id: &PeerId) -> Option<Arc<MessageReplayer>> {
        self.active
            .get(peer_id)
            .map(|entry| entry.value().clone())
            .filter(|replayer| !replayer.status().is_terminal())
    }

    /// Make `replayer` the peer's active one.
    ///
    /// A previous replayer for the same peer is cancelled and awaited.
    /// Returns `false` (and cancels `replayer`) after deactivation.
    pub async fn set_active_message_replayer(&self, replayer: Arc<MessageReplayer>) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            replayer.cancel();
            return false;
        }

        let peer_id = replayer.peer_id().clone();
        let replay_id = replayer.replay_id();
        let active = Arc::downgrade(&self.active);
        let hook_peer_id = peer_id.clone();
        replayer.set_on_finished(Box::new(move |status| {
            if let Some(active) = active.upgrade() {
                active.remove_if(&hook_peer_id, |_, current| current.replay_id() == replay_id);
            }
            debug!(peer_id = %hook_peer_id, %replay_id, %status, "Replayer left active set");
        }));

        let previous = self.active.insert(peer_id.clone(), replayer);
        if let Some(previous) = previous {
            info!(
                peer_id = %peer_id,
                previous = %previous.replay_id(),
                next = %replay_id,
                "Superseding replay"
            );
            previous.cancel();
            previous.wait_for_completion().await;
        }
        true
    }

    /// Refuse new replays. Running ones are left to finish.
    pub fn deactivate_message_replayers(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(active = self.active.len(), "Message replayers deactivated");
        }
    }

    /// `true` while any replayer has not reached a terminal status.
    pub fn has_active_message_replayers(&self) -> bool {
        self.active
            .iter()
            .any(|entry| !entry.value().status().is_terminal())
    }

    fn snapshot(&self) -> Vec<Arc<MessageReplayer>> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancel every active replayer.
    pub fn cancel_all(&self) {
        // Cancelling may run finish hooks that touch the map.
        for replayer in self.snapshot() {
            replayer.cancel();
        }
    }

    /// Wait for the active replayers to finish. `false` on timeout.
    pub async fn wait_for_replayers(&self, timeout: Duration) -> bool {
        let replayers = self.snapshot();
        let all = async {
            for replayer in &replayers {
                replayer.wait_for_completion().await;
            }
        };
        if tokio::time::timeout(timeout, all).await.is_ok() {
            return true;
        }
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            pending = replayers.iter().filter(|r| !r.status().is_terminal()).count(),
            "Replayers still running after timeout"
        );
        false
    }
}
