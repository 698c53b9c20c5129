//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the persistence tier requires the host to implement.
//!
//! Production backends (columnar or log-structured stores) live outside this
//! crate; [`crate::adapters::InMemoryStorage`] implements the contract for
//! tests and single-process deployments.

use crate::domain::MatcherEntry;
use async_trait::async_trait;
use shared_types::{Peer, PeerId, StorageError, TransportError, TransportMessage};
use std::collections::HashMap;

/// Durable store of per-peer message copies and acks.
///
/// Implementations must be `Send + Sync`: the matcher writes while
/// replayers read.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Apply a batch of entries in order.
    async fn write(&self, entries: Vec<MatcherEntry>) -> Result<(), StorageError>;

    /// Open a reader over the peer's unacked messages.
    ///
    /// Returns `None` when the peer has no backlog.
    async fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<Box<dyn MessageReader>>, StorageError>;

    /// Drop every stored message and the state of a peer.
    async fn remove_peer(&self, peer_id: &PeerId) -> Result<(), StorageError>;

    /// Point-in-time non-acked count of every known peer.
    async fn get_non_acked_message_counts(&self) -> Result<HashMap<PeerId, u64>, StorageError>;

    /// Recompute each peer's oldest non-acked timestamp and clean up fully
    /// acked buckets before it.
    async fn update_oldest_non_acked_timestamps(&self) -> Result<(), StorageError>;

    async fn start(&self) -> Result<(), StorageError>;

    async fn stop(&self) -> Result<(), StorageError>;

    /// Writes accepted but not yet applied.
    fn persistence_queue_size(&self) -> usize;
}

/// Lazy, scoped cursor over a peer's unacked messages.
///
/// The underlying resource is released when the reader is dropped.
#[async_trait]
pub trait MessageReader: Send {
    /// Next serialized transport messages, at most `max`. Empty when done.
    async fn read_batch(&mut self, max: usize) -> Result<Vec<Vec<u8>>, StorageError>;
}

/// Delivery of replayed messages to a peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send and wait for the transport-level ack.
    async fn send(&self, peer: &Peer, message: TransportMessage) -> Result<(), TransportError>;
}
