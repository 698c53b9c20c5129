//! Test utilities for the persistence tier.
//!
//! Enable with the `test-utils` feature flag.

use crate::adapters::InMemoryStorage;
use crate::domain::MatcherEntry;
use crate::ports::{MessageReader, PeerTransport, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{MessageId, Peer, PeerId, StorageError, TransportError, TransportMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn timeout(operation: &'static str) -> StorageError {
    StorageError::Timeout {
        operation,
        elapsed_ms: 0,
    }
}

/// Consume one scripted failure, if any is left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory storage whose calls can be made to time out.
pub struct FlakyStorage {
    inner: Arc<InMemoryStorage>,
    failing_writes: AtomicUsize,
    failing_reads: Arc<AtomicUsize>,
    read_delay_ms: Arc<AtomicU64>,
    write_attempts: AtomicUsize,
    largest_write: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: Arc<InMemoryStorage>) -> Self {
        Self {
            inner,
            failing_writes: AtomicUsize::new(0),
            failing_reads: Arc::new(AtomicUsize::new(0)),
            read_delay_ms: Arc::new(AtomicU64::new(0)),
            write_attempts: AtomicUsize::new(0),
            largest_write: AtomicUsize::new(0),
        }
    }

    /// The next `count` writes time out.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// The next `count` reader batches time out.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Delay every reader batch by `millis`.
    pub fn set_read_delay_ms(&self, millis: u64) {
        self.read_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Largest batch handed to `write`.
    pub fn largest_write(&self) -> usize {
        self.largest_write.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn write(&self, entries: Vec<MatcherEntry>) -> Result<(), StorageError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.largest_write.fetch_max(entries.len(), Ordering::SeqCst);
        if take_failure(&self.failing_writes) {
            return Err(timeout("write"));
        }
        self.inner.write(entries).await
    }

    async fn create_message_reader(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<Box<dyn MessageReader>>, StorageError> {
        let reader = self.inner.create_message_reader(peer_id).await?;
        Ok(reader.map(|inner| {
            Box::new(FlakyReader {
                inner,
                failing_reads: self.failing_reads.clone(),
                read_delay_ms: self.read_delay_ms.clone(),
            }) as Box<dyn MessageReader>
        }))
    }

    async fn remove_peer(&self, peer_id: &PeerId) -> Result<(), StorageError> {
        self.inner.remove_peer(peer_id).await
    }

    async fn get_non_acked_message_counts(&self) -> Result<HashMap<PeerId, u64>, StorageError> {
        self.inner.get_non_acked_message_counts().await
    }

    async fn update_oldest_non_acked_timestamps(&self) -> Result<(), StorageError> {
        self.inner.update_oldest_non_acked_timestamps().await
    }

    async fn start(&self) -> Result<(), StorageError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), StorageError> {
        self.inner.stop().await
    }

    fn persistence_queue_size(&self) -> usize {
        self.inner.persistence_queue_size()
    }
}

struct FlakyReader {
    inner: Box<dyn MessageReader>,
    failing_reads: Arc<AtomicUsize>,
    read_delay_ms: Arc<AtomicU64>,
}

#[async_trait]
impl MessageReader for FlakyReader {
    async fn read_batch(&mut self, max: usize) -> Result<Vec<Vec<u8>>, StorageError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_failure(&self.failing_reads) {
            return Err(timeout("read_batch"));
        }
        self.inner.read_batch(max).await
    }
}

/// Transport recording every message sent, per peer.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, TransportMessage)>>,
    unreachable: AtomicBool,
    failing_sends: AtomicUsize,
    delay_ms: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` sends time out.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Delay every send by `millis`.
    pub fn set_delay_ms(&self, millis: u64) {
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Messages delivered to `peer_id`, in order.
    pub fn sent_to(&self, peer_id: &PeerId) -> Vec<TransportMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(target, _)| target == peer_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Ids of the messages delivered to `peer_id`, in order.
    pub fn sent_ids(&self, peer_id: &PeerId) -> Vec<MessageId> {
        self.sent_to(peer_id).iter().map(|m| m.id).collect()
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send(&self, peer: &Peer, message: TransportMessage) -> Result<(), TransportError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(peer.id.clone()));
        }
        if take_failure(&self.failing_sends) {
            return Err(TransportError::Timeout {
                peer_id: peer.id.clone(),
                elapsed_ms: 0,
            });
        }
        self.sent.lock().push((peer.id.clone(), message));
        Ok(())
    }
}
