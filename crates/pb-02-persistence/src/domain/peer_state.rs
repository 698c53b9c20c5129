use shared_types::{PeerId, Timestamp};

/// Storage-side bookkeeping of one peer's backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub non_acked_message_count: u64,
    /// Time of the oldest message still waiting for an ack.
    pub oldest_non_acked_message_timestamp: Option<Timestamp>,
    /// Set once the peer was purged.
    pub removed: bool,
}

impl PeerState {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            non_acked_message_count: 0,
            oldest_non_acked_message_timestamp: None,
            removed: false,
        }
    }

    /// Count one more stored message written at `timestamp`.
    pub fn record_message(&mut self, timestamp: Timestamp) {
        self.non_acked_message_count += 1;
        if self.oldest_non_acked_message_timestamp.is_none() {
            self.oldest_non_acked_message_timestamp = Some(timestamp);
        }
    }

    /// Count one ack.
    pub fn record_ack(&mut self) {
        self.non_acked_message_count = self.non_acked_message_count.saturating_sub(1);
        if self.non_acked_message_count == 0 {
            self.oldest_non_acked_message_timestamp = None;
        }
    }

    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.non_acked_message_count > 0
    }
}
