//! Test utilities for the directory.
//!
//! Enable with the `test-utils` feature flag.

use crate::ports::PeerPinger;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{Peer, PeerId, TransportError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A pinger whose answers are scripted per peer.
///
/// Tracks how many pings were in flight at once.
#[derive(Debug, Default)]
pub struct ScriptedPinger {
    unreachable: Mutex<HashSet<PeerId>>,
    delay_ms: AtomicU64,
    pings: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedPinger {
    /// Every peer answers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer_id` answer or not.
    pub fn set_unreachable(&self, peer_id: &PeerId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(peer_id.clone());
        } else {
            set.remove(peer_id);
        }
    }

    /// Delay every ping by `millis`.
    pub fn set_delay_ms(&self, millis: u64) {
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Pings sent so far.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent pings observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerPinger for ScriptedPinger {
    async fn ping(&self, peer: &Peer) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(&peer.id) {
            Err(TransportError::Unreachable(peer.id.clone()))
        } else {
            Ok(())
        }
    }
}
