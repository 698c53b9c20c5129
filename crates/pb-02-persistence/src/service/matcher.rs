//! # Message Matcher
//!
//! Buffers persistence entries and writes them to storage in batches. A
//! message acked within the same batch window never reaches the storage.
//!
//! All entries go through one channel drained by one task, so storage sees
//! them in enqueue order.

use crate::domain::{MatcherEntry, PersistenceConfig};
use crate::ports::Storage;
use parking_lot::Mutex;
use shared_types::{MessageId, MessageTypeId, PeerId, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

enum MatcherCommand {
    Entry(MatcherEntry),
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Entries gathered during one batch window.
///
/// An ack whose message is still in the window cancels it: neither entry
/// reaches the storage.
#[derive(Default)]
struct Batch {
    entries: Vec<Option<MatcherEntry>>,
    waiting: HashMap<(PeerId, MessageId), usize>,
    cancelled: usize,
}

impl Batch {
    fn push(&mut self, entry: MatcherEntry) {
        match &entry {
            MatcherEntry::Ack {
                peer_id,
                message_id,
            } => {
                if let Some(index) = self.waiting.remove(&(peer_id.clone(), *message_id)) {
                    self.entries[index] = None;
                    self.cancelled += 2;
                    return;
                }
            }
            MatcherEntry::Message {
                peer_id,
                message_id,
                ..
            } => {
                self.waiting
                    .insert((peer_id.clone(), *message_id), self.entries.len());
            }
        }
        self.entries.push(Some(entry));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn into_entries(self) -> (Vec<MatcherEntry>, usize) {
        (self.entries.into_iter().flatten().collect(), self.cancelled)
    }
}

/// Non-blocking front of the storage.
///
/// Messages and acks go through a single ordered queue drained by one
/// background task, so an ack is never written before its message.
pub struct InMemoryMessageMatcher {
    sender: mpsc::UnboundedSender<MatcherCommand>,
    storage: Arc<dyn Storage>,
    storage_timeout: std::time::Duration,
    queue_len: Arc<AtomicUsize>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryMessageMatcher {
    /// Spawn the batching task. Must be called inside a Tokio runtime.
    pub fn start(storage: Arc<dyn Storage>, config: PersistenceConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue_len = Arc::new(AtomicUsize::new(0));
        let worker = BatchWriter {
            storage: storage.clone(),
            config: config.clone(),
            queue_len: queue_len.clone(),
            receiver,
        };
        let handle = tokio::spawn(worker.run());
        info!(
            batch_size = config.matcher_batch_size,
            batch_delay_ms = config.matcher_batch_delay_ms,
            "Message matcher started"
        );

        Self {
            sender,
            storage,
            storage_timeout: config.storage_timeout(),
            queue_len,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue a copy of a message for `peer_id`.
    pub fn enqueue_message(
        &self,
        peer_id: PeerId,
        message_id: MessageId,
        message_type_id: MessageTypeId,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.enqueue(MatcherEntry::message(
            peer_id,
            message_id,
            message_type_id,
            bytes,
        ))
    }

    /// Queue the ack of a message by `peer_id`.
    pub fn enqueue_ack(&self, peer_id: PeerId, message_id: MessageId) -> Result<(), StorageError> {
        self.enqueue(MatcherEntry::ack(peer_id, message_id))
    }

    fn enqueue(&self, entry: MatcherEntry) -> Result<(), StorageError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StorageError::Stopped);
        }
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        self.sender.send(MatcherCommand::Entry(entry)).map_err(|_| {
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            StorageError::Stopped
        })
    }

    /// Wait until every entry queued so far has been written.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MatcherCommand::Flush(tx))
            .map_err(|_| StorageError::Stopped)?;
        rx.await.map_err(|_| StorageError::Stopped)
    }

    /// Write what is queued, then stop the batching task.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.sender.send(MatcherCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                error!(%error, "Message matcher task failed");
            }
        }
        info!("Message matcher stopped");
    }

    /// Point-in-time non-acked count of every peer.
    pub async fn get_non_acked_message_counts(&self) -> Result<HashMap<PeerId, u64>, StorageError> {
        match tokio::time::timeout(self.storage_timeout, self.storage.get_non_acked_message_counts())
            .await
        {
            Ok(counts) => counts,
            Err(_) => Err(StorageError::Timeout {
                operation: "get_non_acked_message_counts",
                elapsed_ms: self.storage_timeout.as_millis() as u64,
            }),
        }
    }

    /// Entries not yet written, including the storage's own queue.
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst) + self.storage.persistence_queue_size()
    }
}

struct BatchWriter {
    storage: Arc<dyn Storage>,
    config: PersistenceConfig,
    queue_len: Arc<AtomicUsize>,
    receiver: mpsc::UnboundedReceiver<MatcherCommand>,
}

impl BatchWriter {
    async fn run(mut self) {
        while let Some(first) = self.receiver.recv().await {
            let mut batch = Batch::default();
            let mut waiters = Vec::new();
            let mut stop = None;
            Self::accept(first, &mut batch, &mut waiters, &mut stop);

            let deadline = Instant::now() + self.config.matcher_batch_delay();
            while waiters.is_empty()
                && stop.is_none()
                && batch.len() < self.config.matcher_batch_size
            {
                match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                    Ok(Some(command)) => {
                        Self::accept(command, &mut batch, &mut waiters, &mut stop);
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            self.write(batch).await;

            if let Some(stopped) = stop {
                // Entries racing with the stop request are still written.
                let mut rest = Batch::default();
                while let Ok(command) = self.receiver.try_recv() {
                    Self::accept(command, &mut rest, &mut waiters, &mut None);
                }
                self.write(rest).await;
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                let _ = stopped.send(());
                return;
            }

            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn accept(
        command: MatcherCommand,
        batch: &mut Batch,
        waiters: &mut Vec<oneshot::Sender<()>>,
        stop: &mut Option<oneshot::Sender<()>>,
    ) {
        match command {
            MatcherCommand::Entry(entry) => batch.push(entry),
            MatcherCommand::Flush(waiter) => waiters.push(waiter),
            MatcherCommand::Stop(waiter) => *stop = Some(waiter),
        }
    }

    async fn write(&self, batch: Batch) {
        let (entries, cancelled) = batch.into_entries();
        if cancelled > 0 {
            self.queue_len.fetch_sub(cancelled, Ordering::SeqCst);
            debug!(cancelled, "Acks matched queued messages");
        }
        if entries.is_empty() {
            return;
        }

        let count = entries.len();
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.storage_timeout(),
                self.storage.write(entries.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout {
                    operation: "write",
                    elapsed_ms: self.config.storage_timeout_ms,
                }),
            };

            match result {
                Ok(()) => {
                    debug!(entries = count, "Batch written");
                    break;
                }
                Err(StorageError::Stopped) => {
                    error!(entries = count, "Storage stopped, batch lost");
                    break;
                }
                Err(error) if attempt < self.config.matcher_max_write_retries => {
                    attempt += 1;
                    warn!(%error, attempt, entries = count, "Storage write failed, retrying");
                    tokio::time::sleep(self.config.replay_retry_delay()).await;
                }
                Err(error) => {
                    error!(%error, entries = count, attempts = attempt + 1, "Storage write failed, batch lost");
                    break;
                }
            }
        }
        self.queue_len.fetch_sub(count, Ordering::SeqCst);
    }
}
