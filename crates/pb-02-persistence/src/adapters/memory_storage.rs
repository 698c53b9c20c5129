//! Storage kept in process memory.
//!
//! Each peer owns an ordered queue keyed by (bucket, write sequence). Acked
//! messages stay in place until cleanup retires them; retired ids and acks
//! that arrived before their message are remembered for
//! [`ACK_RETENTION_BUCKETS`] buckets so a redelivered persist or ack cannot
//! bring an acked message back.

use crate::domain::{bucket_id, MatcherEntry, PeerState, BUCKET_SIZE_MILLIS};
use crate::ports::{MessageReader, Storage};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{MessageId, PeerId, StorageError, TimeSource, Timestamp};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Buckets during which retired ids and early acks are remembered.
pub const ACK_RETENTION_BUCKETS: u64 = 24;

/// Position of a stored message: (bucket, write sequence).
type MessageKey = (u64, u64);

struct StoredMessage {
    message_id: MessageId,
    bytes: Vec<u8>,
    acked: bool,
}

struct PeerQueue {
    state: PeerState,
    messages: BTreeMap<MessageKey, StoredMessage>,
    index: HashMap<MessageId, MessageKey>,
    /// Acked ids removed by cleanup, with the bucket they were stored in.
    retired: HashMap<MessageId, u64>,
    /// Acks that arrived before their message, with the bucket of arrival.
    early_acks: HashMap<MessageId, u64>,
}

impl PeerQueue {
    fn new(peer_id: PeerId) -> Self {
        Self {
            state: PeerState::new(peer_id),
            messages: BTreeMap::new(),
            index: HashMap::new(),
            retired: HashMap::new(),
            early_acks: HashMap::new(),
        }
    }

    fn insert(&mut self, key: MessageKey, message_id: MessageId, bytes: Vec<u8>, now: Timestamp) {
        if self.index.contains_key(&message_id) || self.retired.contains_key(&message_id) {
            return;
        }
        let acked = self.early_acks.remove(&message_id).is_some();
        if !acked {
            self.state.record_message(now);
        }
        self.index.insert(message_id, key);
        self.messages.insert(
            key,
            StoredMessage {
                message_id,
                bytes,
                acked,
            },
        );
    }

    fn ack(&mut self, message_id: MessageId, bucket: u64) {
        if let Some(key) = self.index.get(&message_id) {
            if let Some(message) = self.messages.get_mut(key) {
                if !message.acked {
                    message.acked = true;
                    self.state.record_ack();
                }
            }
        } else if !self.retired.contains_key(&message_id) {
            self.early_acks.insert(message_id, bucket);
        }
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.retired.clear();
        self.early_acks.clear();
        self.state.non_acked_message_count = 0;
        self.state.oldest_non_acked_message_timestamp = None;
    }

    /// Retire acked messages in buckets older than the oldest unacked one
    /// and forget ack records older than the retention window.
    fn cleanup(&mut self, current_bucket: u64) -> usize {
        let oldest = self
            .messages
            .iter()
            .find(|(_, m)| !m.acked)
            .map(|(key, _)| key.0);
        let removable: Vec<MessageKey> = self
            .messages
            .iter()
            .filter(|(key, m)| m.acked && oldest.map_or(true, |bucket| key.0 < bucket))
            .map(|(key, _)| *key)
            .collect();
        for key in &removable {
            if let Some(message) = self.messages.remove(key) {
                self.index.remove(&message.message_id);
                self.retired.insert(message.message_id, key.0);
            }
        }

        let horizon = current_bucket.saturating_sub(ACK_RETENTION_BUCKETS * BUCKET_SIZE_MILLIS);
        self.retired.retain(|_, bucket| *bucket >= horizon);
        self.early_acks.retain(|_, bucket| *bucket >= horizon);
        removable.len()
    }
}

struct Inner {
    peers: RwLock<HashMap<PeerId, PeerQueue>>,
    running: AtomicBool,
    sequence: AtomicU64,
    open_readers: AtomicUsize,
}

/// Storage kept in process memory, partitioned in one-hour buckets.
///
/// Writes are applied synchronously, so the persistence queue is always
/// empty.
pub struct InMemoryStorage {
    inner: Arc<Inner>,
    time_source: Arc<dyn TimeSource>,
}

impl InMemoryStorage {
    /// Empty storage, ready to accept writes.
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(true),
                sequence: AtomicU64::new(0),
                open_readers: AtomicUsize::new(0),
            }),
            time_source,
        }
    }

    /// Bookkeeping of one peer.
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.inner.peers.read().get(peer_id).map(|q| q.state.clone())
    }

    /// Stored copies of a peer, acked or not.
    pub fn stored_message_count(&self, peer_id: &PeerId) -> usize {
        self.inner
            .peers
            .read()
            .get(peer_id)
            .map_or(0, |q| q.messages.len())
    }

    /// Readers created and not yet dropped.
    pub fn open_reader_count(&self) -> usize {
        self.inner.open_readers.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Stopped)
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn write(&self, entries: Vec<MatcherEntry>) -> Result<(), StorageError> {
        self.ensure_running()?;
        let now = self.time_source.now();
        let bucket = bucket_id(now);
        let mut peers = self.inner.peers.write();

        for entry in entries {
            match entry {
                MatcherEntry::Message {
                    peer_id,
                    message_id,
                    bytes,
                    ..
                } => {
                    let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
                    let queue = peers
                        .entry(peer_id.clone())
                        .or_insert_with(|| PeerQueue::new(peer_id));
                    queue.state.removed = false;
                    queue.insert((bucket, sequence), message_id, bytes, now);
                }
                MatcherEntry::Ack {
                    peer_id,
                    message_id,
                } => {
                    peers
                        .entry(peer_id.clone())
                        .or_insert_with(|| PeerQueue::new(peer_id))
                        .ack(message_id, bucket);
                }
            }
        }
        Ok(())
    }

    async fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<Box<dyn MessageReader>>, StorageError> {
        self.ensure_running()?;
        let peers = self.inner.peers.read();
        let Some(queue) = peers.get(peer_id).filter(|q| q.state.has_backlog()) else {
            return Ok(None);
        };

        let pending: VecDeque<MessageKey> = queue
            .messages
            .iter()
            .filter(|(_, m)| !m.acked)
            .map(|(key, _)| *key)
            .collect();
        self.inner.open_readers.fetch_add(1, Ordering::SeqCst);
        debug!(peer_id = %peer_id, messages = pending.len(), "Message reader opened");

        Ok(Some(Box::new(InMemoryMessageReader {
            inner: self.inner.clone(),
            peer_id: peer_id.clone(),
            pending,
        })))
    }

    async fn remove_peer(&self, peer_id: &PeerId) -> Result<(), StorageError> {
        self.ensure_running()?;
        if let Some(queue) = self.inner.peers.write().get_mut(peer_id) {
            queue.clear();
            queue.state.removed = true;
            info!(peer_id = %peer_id, "Peer removed from storage");
        }
        Ok(())
    }

    async fn get_non_acked_message_counts(&self) -> Result<HashMap<PeerId, u64>, StorageError> {
        Ok(self
            .inner
            .peers
            .read()
            .iter()
            .filter(|(_, q)| !q.state.removed)
            .map(|(peer_id, q)| (peer_id.clone(), q.state.non_acked_message_count))
            .collect())
    }

    async fn update_oldest_non_acked_timestamps(&self) -> Result<(), StorageError> {
        let current_bucket = bucket_id(self.time_source.now());
        let mut peers = self.inner.peers.write();
        for queue in peers.values_mut() {
            let oldest = queue
                .messages
                .iter()
                .find(|(_, m)| !m.acked)
                .map(|(key, _)| Timestamp::from_millis(key.0));
            queue.state.oldest_non_acked_message_timestamp = oldest;
            let removed = queue.cleanup(current_bucket);
            if removed > 0 {
                debug!(peer_id = %queue.state.peer_id, removed, "Acked messages cleaned up");
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), StorageError> {
        self.inner.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        self.inner.running.store(false, Ordering::SeqCst);
        info!("In-memory storage stopped");
        Ok(())
    }

    fn persistence_queue_size(&self) -> usize {
        0
    }
}

struct InMemoryMessageReader {
    inner: Arc<Inner>,
    peer_id: PeerId,
    pending: VecDeque<MessageKey>,
}

#[async_trait]
impl MessageReader for InMemoryMessageReader {
    async fn read_batch(&mut self, max: usize) -> Result<Vec<Vec<u8>>, StorageError> {
        let peers = self.inner.peers.read();
        let Some(queue) = peers.get(&self.peer_id) else {
            self.pending.clear();
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(key) = self.pending.pop_front() else {
                break;
            };
            // Skip messages acked since the reader was opened.
            if let Some(message) = queue.messages.get(&key).filter(|m| !m.acked) {
                batch.push(message.bytes.clone());
            }
        }
        Ok(batch)
    }
}

impl Drop for InMemoryMessageReader {
    fn drop(&mut self) {
        self.inner.open_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{ControllableTimeSource, MessageTypeId};

    fn storage() -> (InMemoryStorage, Arc<ControllableTimeSource>) {
        let clock = Arc::new(ControllableTimeSource::new(1_000));
        (InMemoryStorage::new(clock.clone()), clock)
    }

    fn message(peer: &str, id: MessageId, payload: u8) -> MatcherEntry {
        MatcherEntry::message(
            PeerId::new(peer),
            id,
            MessageTypeId::new("Abc.TypeX"),
            vec![payload],
        )
    }

    async fn read_all(storage: &InMemoryStorage, peer: &str) -> Vec<Vec<u8>> {
        let Some(mut reader) = storage.create_message_reader(&PeerId::new(peer)).await.unwrap()
        else {
            return Vec::new();
        };
        let mut all = Vec::new();
        loop {
            let batch = reader.read_batch(2).await.unwrap();
            if batch.is_empty() {
                return all;
            }
            all.extend(batch);
        }
    }

    #[tokio::test]
    async fn test_ack_retires_message() {
        let (storage, _) = storage();
        let (m1, m2) = (MessageId::new(), MessageId::new());
        storage
            .write(vec![message("A", m1, 1), message("A", m2, 2)])
            .await
            .unwrap();
        storage
            .write(vec![MatcherEntry::ack(PeerId::new("A"), m1)])
            .await
            .unwrap();

        let counts = storage.get_non_acked_message_counts().await.unwrap();
        assert_eq!(counts[&PeerId::new("A")], 1);
        assert_eq!(read_all(&storage, "A").await, vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_early_ack_is_remembered() {
        let (storage, _) = storage();
        let id = MessageId::new();
        storage
            .write(vec![MatcherEntry::ack(PeerId::new("A"), id)])
            .await
            .unwrap();
        storage.write(vec![message("A", id, 1)]).await.unwrap();

        assert_eq!(storage.peer_state(&PeerId::new("A")).unwrap().non_acked_message_count, 0);
        assert!(storage
            .create_message_reader(&PeerId::new("A"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_ack_counts_once() {
        let (storage, _) = storage();
        let (m1, m2) = (MessageId::new(), MessageId::new());
        storage
            .write(vec![message("A", m1, 1), message("A", m2, 2)])
            .await
            .unwrap();
        let ack = MatcherEntry::ack(PeerId::new("A"), m1);
        storage.write(vec![ack.clone(), ack]).await.unwrap();

        assert_eq!(storage.peer_state(&PeerId::new("A")).unwrap().non_acked_message_count, 1);
    }

    #[tokio::test]
    async fn test_reader_is_released_on_drop() {
        let (storage, _) = storage();
        storage.write(vec![message("A", MessageId::new(), 1)]).await.unwrap();

        let reader = storage.create_message_reader(&PeerId::new("A")).await.unwrap();
        assert!(reader.is_some());
        assert_eq!(storage.open_reader_count(), 1);
        drop(reader);
        assert_eq!(storage.open_reader_count(), 0);
    }

    #[tokio::test]
    async fn test_reader_skips_messages_acked_after_opening() {
        let (storage, _) = storage();
        let (m1, m2) = (MessageId::new(), MessageId::new());
        storage
            .write(vec![message("A", m1, 1), message("A", m2, 2)])
            .await
            .unwrap();
        let mut reader = storage
            .create_message_reader(&PeerId::new("A"))
            .await
            .unwrap()
            .unwrap();

        storage
            .write(vec![MatcherEntry::ack(PeerId::new("A"), m1)])
            .await
            .unwrap();

        assert_eq!(reader.read_batch(10).await.unwrap(), vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_messages_are_read_in_write_order_across_buckets() {
        let (storage, clock) = storage();
        storage.write(vec![message("A", MessageId::new(), 1)]).await.unwrap();
        clock.advance(BUCKET_SIZE_MILLIS);
        storage.write(vec![message("A", MessageId::new(), 2)]).await.unwrap();
        storage.write(vec![message("A", MessageId::new(), 3)]).await.unwrap();

        assert_eq!(read_all(&storage, "A").await, vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_cleanup_drops_acked_buckets_before_oldest_unacked() {
        let (storage, clock) = storage();
        let old = MessageId::new();
        storage.write(vec![message("A", old, 1)]).await.unwrap();
        clock.advance(BUCKET_SIZE_MILLIS);
        storage.write(vec![message("A", MessageId::new(), 2)]).await.unwrap();
        storage
            .write(vec![MatcherEntry::ack(PeerId::new("A"), old)])
            .await
            .unwrap();

        storage.update_oldest_non_acked_timestamps().await.unwrap();

        let state = storage.peer_state(&PeerId::new("A")).unwrap();
        assert_eq!(
            state.oldest_non_acked_message_timestamp,
            Some(Timestamp::from_millis(BUCKET_SIZE_MILLIS))
        );
        assert_eq!(storage.stored_message_count(&PeerId::new("A")), 1);
    }

    fn ack_records(storage: &InMemoryStorage, peer: &str) -> (usize, usize) {
        let peers = storage.inner.peers.read();
        let queue = peers.get(&PeerId::new(peer)).unwrap();
        (queue.retired.len(), queue.early_acks.len())
    }

    #[tokio::test]
    async fn test_redelivered_persist_after_cleanup_stays_acked() {
        let (storage, clock) = storage();
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        let peer = PeerId::new("A");
        storage
            .write(ids.iter().map(|id| message("A", *id, 1)).collect())
            .await
            .unwrap();
        storage
            .write(ids.iter().map(|id| MatcherEntry::ack(peer.clone(), *id)).collect())
            .await
            .unwrap();
        clock.advance(BUCKET_SIZE_MILLIS);
        storage.update_oldest_non_acked_timestamps().await.unwrap();
        assert_eq!(storage.stored_message_count(&peer), 0);

        storage
            .write(ids.iter().map(|id| MatcherEntry::ack(peer.clone(), *id)).collect())
            .await
            .unwrap();
        storage.write(vec![message("A", ids[0], 1)]).await.unwrap();
        storage.update_oldest_non_acked_timestamps().await.unwrap();

        assert_eq!(ack_records(&storage, "A"), (100, 0));
        assert_eq!(storage.peer_state(&peer).unwrap().non_acked_message_count, 0);
        assert!(read_all(&storage, "A").await.is_empty());
    }

    #[tokio::test]
    async fn test_ack_records_expire_after_retention() {
        let (storage, clock) = storage();
        let acked = MessageId::new();
        storage.write(vec![message("A", acked, 1)]).await.unwrap();
        storage
            .write(vec![
                MatcherEntry::ack(PeerId::new("A"), acked),
                MatcherEntry::ack(PeerId::new("A"), MessageId::new()),
            ])
            .await
            .unwrap();
        clock.advance(BUCKET_SIZE_MILLIS);
        storage.update_oldest_non_acked_timestamps().await.unwrap();
        assert_eq!(ack_records(&storage, "A"), (1, 1));

        clock.advance(ACK_RETENTION_BUCKETS * BUCKET_SIZE_MILLIS);
        storage.update_oldest_non_acked_timestamps().await.unwrap();

        assert_eq!(ack_records(&storage, "A"), (0, 0));
    }

    #[tokio::test]
    async fn test_remove_peer_forgets_ack_records() {
        let (storage, _) = storage();
        storage
            .write(vec![MatcherEntry::ack(PeerId::new("A"), MessageId::new())])
            .await
            .unwrap();

        storage.remove_peer(&PeerId::new("A")).await.unwrap();

        assert_eq!(ack_records(&storage, "A"), (0, 0));
    }

    #[tokio::test]
    async fn test_remove_peer_hides_counts() {
        let (storage, _) = storage();
        storage.write(vec![message("A", MessageId::new(), 1)]).await.unwrap();

        storage.remove_peer(&PeerId::new("A")).await.unwrap();

        assert!(storage.get_non_acked_message_counts().await.unwrap().is_empty());
        assert!(storage.peer_state(&PeerId::new("A")).unwrap().removed);
        assert!(read_all(&storage, "A").await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_storage_rejects_writes() {
        let (storage, _) = storage();
        storage.stop().await.unwrap();
        let err = storage
            .write(vec![message("A", MessageId::new(), 1)])
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Stopped);

        storage.start().await.unwrap();
        assert!(storage.write(vec![]).await.is_ok());
    }
}
