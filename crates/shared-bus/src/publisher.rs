//! # Event Publisher
//!
//! The directory server and the persistence service announce state changes
//! through [`EventPublisher`]. [`InMemoryEventBus`] fans them out to every
//! local [`Subscription`]; forwarding to remote peers is the transport's job.

use crate::events::{BusEvent, EventFilter};
use crate::subscriber::Subscription;
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Sink for directory and persistence events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event and return how many subscribers received it.
    async fn publish(&self, event: BusEvent) -> usize;
}

/// Broadcast bus shared by the components of one process.
///
/// Each subscriber holds its own cursor into a bounded ring; a subscriber
/// that falls more than the capacity behind skips the oldest events.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl InMemoryEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bus buffering at most `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on that matches `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        debug!(topics = ?filter.topics, "Event subscription opened");
        Subscription::new(self.sender.subscribe(), filter)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(?topic, receivers, "Event published");
                receivers
            }
            Err(_) => {
                // A standalone directory has nobody listening.
                trace!(?topic, "Event dropped, no subscriber");
                0
            }
        }
    }
}
