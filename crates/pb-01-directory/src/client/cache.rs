//! Client-side mirror of the directory.
//!
//! Writes are serialised by a mutex and republish a copy-on-write snapshot;
//! lookups read the snapshot without taking any lock.

use crate::domain::{DescriptorSnapshot, TypedSubscriptions};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use shared_types::{
    MessageBinding, Peer, PeerDescriptor, PeerId, SubscriptionsForType, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct PeerEntry {
    peer: Peer,
    is_persistent: bool,
    timestamp_utc: Option<Timestamp>,
    /// Version of the last responding transition.
    liveness_timestamp: Option<Timestamp>,
    has_debugger_attached: bool,
    subscriptions: TypedSubscriptions,
}

impl PeerEntry {
    fn new(descriptor: &PeerDescriptor) -> Self {
        Self {
            peer: descriptor.peer.clone(),
            is_persistent: descriptor.is_persistent,
            timestamp_utc: None,
            liveness_timestamp: None,
            has_debugger_attached: descriptor.has_debugger_attached,
            subscriptions: TypedSubscriptions::new(),
        }
    }

    fn is_newer_than(&self, timestamp: Option<Timestamp>) -> bool {
        matches!((self.timestamp_utc, timestamp), (Some(stored), Some(incoming)) if stored > incoming)
    }

    fn to_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            peer: self.peer.clone(),
            is_persistent: self.is_persistent,
            timestamp_utc: self.timestamp_utc,
            subscriptions: self.subscriptions.to_subscriptions(),
            has_debugger_attached: self.has_debugger_attached,
        }
    }
}

/// Local copy of every known peer and its subscriptions.
pub struct DirectoryCache {
    entries: Mutex<HashMap<PeerId, PeerEntry>>,
    snapshot: ArcSwap<DescriptorSnapshot>,
}

impl DirectoryCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    fn publish(&self, peer_id: &PeerId, entry: Option<&PeerEntry>) {
        let mut next = DescriptorSnapshot::clone(&self.snapshot.load());
        match entry {
            Some(entry) => {
                next.insert(peer_id.clone(), Arc::new(entry.to_descriptor()));
            }
            None => {
                next.remove(peer_id);
            }
        }
        self.snapshot.store(Arc::new(next));
    }

    /// Store a full descriptor unless the cached one is newer.
    ///
    /// Per-type subscription versions newer than the descriptor are kept.
    pub fn apply_descriptor(&self, descriptor: &PeerDescriptor) -> bool {
        let mut entries = self.entries.lock();
        let peer_id = descriptor.peer_id();
        let entry = entries
            .entry(peer_id.clone())
            .or_insert_with(|| PeerEntry::new(descriptor));
        if entry.is_newer_than(descriptor.timestamp_utc) {
            return false;
        }
        entry.peer = descriptor.peer.clone();
        entry.is_persistent = descriptor.is_persistent;
        entry.has_debugger_attached = descriptor.has_debugger_attached;
        entry.timestamp_utc = descriptor.timestamp_utc.or(entry.timestamp_utc);
        entry
            .subscriptions
            .replace_all(&descriptor.subscriptions, descriptor.timestamp_utc);
        let entry = entry.clone();
        self.publish(peer_id, Some(&entry));
        true
    }

    /// Apply per-type subscription changes. `None` if the peer is unknown.
    pub fn apply_subscriptions_for_types(
        &self,
        peer_id: &PeerId,
        timestamp: Timestamp,
        updates: &[SubscriptionsForType],
    ) -> Option<Vec<SubscriptionsForType>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(peer_id)?;
        let applied = entry.subscriptions.apply_for_types(timestamp, updates);
        if !applied.is_empty() {
            let entry = entry.clone();
            self.publish(peer_id, Some(&entry));
        }
        Some(applied)
    }

    /// Mark a peer down. `None` if the peer is unknown.
    pub fn set_peer_down(
        &self,
        peer_id: &PeerId,
        endpoint: &str,
        timestamp: Option<Timestamp>,
    ) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(peer_id)?;
        if entry.is_newer_than(timestamp) {
            return Some(false);
        }
        entry.peer.is_up = false;
        entry.peer.endpoint = endpoint.to_string();
        entry.timestamp_utc = timestamp.or(entry.timestamp_utc);
        let entry = entry.clone();
        self.publish(peer_id, Some(&entry));
        Some(true)
    }

    /// Flip the responding flag. `None` if the peer is unknown.
    ///
    /// Transitions older than the stored descriptor or than the last
    /// transition are ignored.
    pub fn set_peer_responding(
        &self,
        peer_id: &PeerId,
        is_responding: bool,
        timestamp: Timestamp,
    ) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(peer_id)?;
        if entry.is_newer_than(Some(timestamp))
            || entry.liveness_timestamp.is_some_and(|stored| stored >= timestamp)
        {
            return Some(false);
        }
        entry.liveness_timestamp = Some(timestamp);
        if entry.peer.is_responding == is_responding {
            return Some(false);
        }
        entry.peer.is_responding = is_responding;
        let entry = entry.clone();
        self.publish(peer_id, Some(&entry));
        Some(true)
    }

    /// Forget a peer. Returns `false` if it was unknown.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let mut entries = self.entries.lock();
        if entries.remove(peer_id).is_none() {
            return false;
        }
        self.publish(peer_id, None);
        true
    }

    /// Forget every peer.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.snapshot.store(Arc::new(HashMap::new()));
    }

    /// `true` if the peer is known.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.snapshot.load().contains_key(peer_id)
    }

    /// Cached descriptor of a peer.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerDescriptor>> {
        self.snapshot.load().get(peer_id).cloned()
    }

    /// Every cached descriptor.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.snapshot
            .load()
            .values()
            .map(|d| PeerDescriptor::clone(d))
            .collect()
    }

    /// Peers with a subscription matching `binding`, up or down.
    #[must_use]
    pub fn peers_handling(&self, binding: &MessageBinding) -> Vec<Peer> {
        self.snapshot
            .load()
            .values()
            .filter(|d| d.subscriptions.iter().any(|s| s.matches(binding)))
            .map(|d| d.peer.clone())
            .collect()
    }
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}
