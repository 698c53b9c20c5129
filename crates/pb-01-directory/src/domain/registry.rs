//! # Peer Registry
//!
//! Authoritative store of peer records, indexed by `PeerId`.
//!
//! ## Concurrency
//!
//! - Writes for one peer are linearised by the `DashMap` shard lock of its
//!   entry. Writes for different peers proceed in parallel.
//! - Every write republishes the peer's descriptor into an immutable snapshot
//!   (`ArcSwap`) while the entry is still locked. Readers load the snapshot
//!   and never block writers.
//!
//! ## Versioning
//!
//! A record's `timestamp_utc` orders the writes applied to it. Registration,
//! static subscription updates and unregistration are guarded by it.
//! Dynamic subscriptions carry one version per message type, and a
//! registration sets a floor below which dynamic writes are stale.

use crate::domain::subscriptions::TypedSubscriptions;
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared_types::messages::{PeerDecommissioned, PeerStopped};
use shared_types::{
    DomainError, MessageBinding, Peer, PeerDescriptor, PeerId, Subscription, SubscriptionsForType,
    Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view of every descriptor, as of one write.
pub type DescriptorSnapshot = HashMap<PeerId, Arc<PeerDescriptor>>;

/// Result of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The descriptor was stored.
    Registered(PeerDescriptor),
    /// The registration was not newer than the stored record.
    Ignored,
}

/// Effect of an accepted unregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// A persistent peer was marked down and kept.
    Stopped(PeerStopped),
    /// A transient peer was removed.
    Decommissioned(PeerDecommissioned),
}

#[derive(Debug, Clone)]
struct PeerRecord {
    peer: Peer,
    is_persistent: bool,
    timestamp_utc: Option<Timestamp>,
    has_debugger_attached: bool,
    static_subscriptions: Vec<Subscription>,
    dynamic_subscriptions: TypedSubscriptions,
    dynamic_floor: Option<Timestamp>,
    liveness_timestamp: Option<Timestamp>,
}

impl PeerRecord {
    fn registered(descriptor: PeerDescriptor, timestamp: Timestamp) -> Self {
        let mut record = Self {
            peer: descriptor.peer.clone(),
            is_persistent: descriptor.is_persistent,
            timestamp_utc: None,
            has_debugger_attached: descriptor.has_debugger_attached,
            static_subscriptions: Vec::new(),
            dynamic_subscriptions: TypedSubscriptions::new(),
            dynamic_floor: None,
            liveness_timestamp: None,
        };
        record.apply_registration(descriptor, timestamp);
        record
    }

    fn apply_registration(&mut self, descriptor: PeerDescriptor, timestamp: Timestamp) {
        self.peer = descriptor.peer;
        self.peer.is_up = true;
        self.peer.is_responding = true;
        self.is_persistent = descriptor.is_persistent;
        self.has_debugger_attached = descriptor.has_debugger_attached;
        self.timestamp_utc = Some(timestamp);
        self.static_subscriptions = descriptor.subscriptions;
        self.dynamic_subscriptions.remove_older_than(timestamp);
        self.dynamic_floor = Some(timestamp);
        self.liveness_timestamp = Some(timestamp);
    }

    /// `true` if `timestamp` is strictly newer than the record version.
    fn is_older_than(&self, timestamp: Timestamp) -> bool {
        self.timestamp_utc.map_or(true, |stored| timestamp > stored)
    }

    /// `true` if the record version is strictly newer than `timestamp`.
    fn is_newer_than(&self, timestamp: Timestamp) -> bool {
        self.timestamp_utc.is_some_and(|stored| stored > timestamp)
    }

    fn mark_down(&mut self, timestamp: Timestamp) -> PeerStopped {
        self.peer.is_up = false;
        self.timestamp_utc = Some(timestamp);
        PeerStopped {
            peer_id: self.peer.id.clone(),
            endpoint: self.peer.endpoint.clone(),
            timestamp_utc: Some(timestamp),
        }
    }

    fn to_descriptor(&self) -> PeerDescriptor {
        let mut subscriptions = self.static_subscriptions.clone();
        for subscription in self.dynamic_subscriptions.to_subscriptions() {
            if !subscriptions.contains(&subscription) {
                subscriptions.push(subscription);
            }
        }
        PeerDescriptor {
            peer: self.peer.clone(),
            is_persistent: self.is_persistent,
            timestamp_utc: self.timestamp_utc,
            subscriptions,
            has_debugger_attached: self.has_debugger_attached,
        }
    }
}

/// Server-side registry of peers.
pub struct PeerRegistry {
    records: DashMap<PeerId, PeerRecord>,
    snapshot: ArcSwap<DescriptorSnapshot>,
}

impl PeerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Copy-on-write update of one snapshot slot. Callers hold the entry lock.
    fn publish(&self, peer_id: &PeerId, descriptor: Option<Arc<PeerDescriptor>>) {
        self.snapshot.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(descriptor) = &descriptor {
                next.insert(peer_id.clone(), Arc::clone(descriptor));
            } else {
                next.remove(peer_id);
            }
            next
        });
    }

    fn publish_record(&self, peer_id: &PeerId, record: &PeerRecord) -> PeerDescriptor {
        let descriptor = record.to_descriptor();
        self.publish(peer_id, Some(Arc::new(descriptor.clone())));
        descriptor
    }

    /// Register a peer.
    ///
    /// A missing descriptor timestamp is replaced by `now`.
    ///
    /// # Errors
    ///
    /// `PeerAlreadyExists` when a live, responding record for the same id
    /// runs on another machine.
    pub fn register(
        &self,
        descriptor: PeerDescriptor,
        now: Timestamp,
    ) -> Result<RegistrationOutcome, DomainError> {
        let timestamp = descriptor.timestamp_utc.unwrap_or(now);
        let peer_id = descriptor.peer_id().clone();

        match self.records.entry(peer_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.peer.is_up && existing.peer.is_responding {
                    let existing_machine = existing.peer.machine_name();
                    let registering_machine = descriptor.peer.machine_name();
                    if existing_machine != registering_machine {
                        return Err(DomainError::PeerAlreadyExists {
                            peer_id,
                            existing_machine,
                            registering_machine,
                        });
                    }
                }
                if !existing.is_older_than(timestamp) {
                    return Ok(RegistrationOutcome::Ignored);
                }

                let record = entry.get_mut();
                record.apply_registration(descriptor, timestamp);
                let stored = self.publish_record(&peer_id, record);
                Ok(RegistrationOutcome::Registered(stored))
            }
            Entry::Vacant(entry) => {
                let record = PeerRecord::registered(descriptor, timestamp);
                let stored = self.publish_record(&peer_id, &record);
                entry.insert(record);
                Ok(RegistrationOutcome::Registered(stored))
            }
        }
    }

    /// Graceful stop of a peer.
    ///
    /// Ignored if the peer is unknown, if the stored version is newer than
    /// `timestamp`, or if `endpoint` names another instance.
    pub fn unregister(
        &self,
        peer_id: &PeerId,
        timestamp: Timestamp,
        endpoint: Option<&str>,
    ) -> Option<UnregisterOutcome> {
        let Entry::Occupied(mut entry) = self.records.entry(peer_id.clone()) else {
            return None;
        };
        let record = entry.get();
        if record.is_newer_than(timestamp) {
            return None;
        }
        if endpoint.is_some_and(|endpoint| endpoint != record.peer.endpoint) {
            return None;
        }

        if record.is_persistent {
            let record = entry.get_mut();
            let stopped = record.mark_down(timestamp);
            self.publish_record(peer_id, record);
            Some(UnregisterOutcome::Stopped(stopped))
        } else {
            self.publish(peer_id, None);
            entry.remove();
            Some(UnregisterOutcome::Decommissioned(PeerDecommissioned {
                peer_id: peer_id.clone(),
            }))
        }
    }

    /// Remove a peer regardless of versions. Returns `false` if unknown.
    pub fn decommission(&self, peer_id: &PeerId) -> bool {
        let Entry::Occupied(entry) = self.records.entry(peer_id.clone()) else {
            return false;
        };
        self.publish(peer_id, None);
        entry.remove();
        true
    }

    /// Replace the static subscriptions of a peer.
    ///
    /// Returns the updated descriptor, or `None` if the peer is unknown or
    /// `timestamp` is not newer than the stored version.
    pub fn update_subscriptions(
        &self,
        peer_id: &PeerId,
        subscriptions: Vec<Subscription>,
        timestamp: Timestamp,
    ) -> Option<PeerDescriptor> {
        let mut record = self.records.get_mut(peer_id)?;
        if !record.is_older_than(timestamp) {
            return None;
        }
        record.static_subscriptions = subscriptions;
        record.timestamp_utc = Some(timestamp);
        Some(self.publish_record(peer_id, &record))
    }

    /// Apply per-type dynamic subscription changes.
    ///
    /// Returns the entries that were applied. Entries older than the last
    /// registration, or not newer than their type's version, are dropped.
    pub fn update_dynamic_subscriptions_for_types(
        &self,
        peer_id: &PeerId,
        timestamp: Timestamp,
        updates: &[SubscriptionsForType],
    ) -> Vec<SubscriptionsForType> {
        let Some(mut record) = self.records.get_mut(peer_id) else {
            return Vec::new();
        };
        if record.dynamic_floor.is_some_and(|floor| timestamp < floor) {
            return Vec::new();
        }
        let applied = record.dynamic_subscriptions.apply_for_types(timestamp, updates);
        if !applied.is_empty() {
            self.publish_record(peer_id, &record);
        }
        applied
    }

    /// Mark a peer down without removing it.
    pub fn set_peer_down(&self, peer_id: &PeerId, timestamp: Timestamp) -> Option<PeerStopped> {
        let mut record = self.records.get_mut(peer_id)?;
        if !record.peer.is_up || record.is_newer_than(timestamp) {
            return None;
        }
        let stopped = record.mark_down(timestamp);
        self.publish_record(peer_id, &record);
        Some(stopped)
    }

    /// Flip the responding flag of a peer.
    ///
    /// Returns `true` when the flag changed. Flips not newer than the last
    /// liveness change are ignored.
    pub fn set_peer_responding(
        &self,
        peer_id: &PeerId,
        is_responding: bool,
        timestamp: Timestamp,
    ) -> bool {
        let Some(mut record) = self.records.get_mut(peer_id) else {
            return false;
        };
        if record
            .liveness_timestamp
            .is_some_and(|stored| stored >= timestamp)
        {
            return false;
        }
        record.liveness_timestamp = Some(timestamp);
        if record.peer.is_responding == is_responding {
            return false;
        }
        record.peer.is_responding = is_responding;
        self.publish_record(peer_id, &record);
        true
    }

    /// Current descriptor of a peer.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerDescriptor>> {
        self.snapshot.load().get(peer_id).cloned()
    }

    /// Every known descriptor, the down ones included.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.snapshot
            .load()
            .values()
            .map(|descriptor| PeerDescriptor::clone(descriptor))
            .collect()
    }

    /// The whole snapshot, for callers scanning many peers.
    #[must_use]
    pub fn snapshot(&self) -> Arc<DescriptorSnapshot> {
        self.snapshot.load_full()
    }

    /// Peers with at least one subscription matching `binding`.
    #[must_use]
    pub fn peers_handling(&self, binding: &MessageBinding) -> Vec<Peer> {
        self.snapshot
            .load()
            .values()
            .filter(|d| d.subscriptions.iter().any(|s| s.matches(binding)))
            .map(|d| d.peer.clone())
            .collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if no peer is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shared_types::{BindingKey, MessageTypeId};

    fn ts(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn type_x() -> MessageTypeId {
        MessageTypeId::new("Abc.TypeX")
    }

    fn descriptor(id: &str, endpoint: &str, persistent: bool, at: u64) -> PeerDescriptor {
        PeerDescriptor::new(
            PeerId::new(id),
            endpoint,
            persistent,
            vec![Subscription::new(type_x(), BindingKey::any())],
            ts(at),
        )
    }

    fn registered(outcome: RegistrationOutcome) -> PeerDescriptor {
        match outcome {
            RegistrationOutcome::Registered(d) => d,
            RegistrationOutcome::Ignored => panic!("registration ignored"),
        }
    }

    #[test]
    fn test_register_stores_up_and_responding() {
        let registry = PeerRegistry::new();
        let mut d = descriptor("A", "tcp://host-a:1", false, 10);
        d.peer.is_up = false;
        d.peer.is_responding = false;

        let stored = registered(registry.register(d, ts(0)).unwrap());

        assert!(stored.peer.is_up);
        assert!(stored.peer.is_responding);
        assert_eq!(registry.get(&PeerId::new("A")).unwrap().as_ref(), &stored);
    }

    #[test]
    fn test_register_without_timestamp_uses_server_clock() {
        let registry = PeerRegistry::new();
        let mut d = descriptor("A", "tcp://host-a:1", false, 10);
        d.timestamp_utc = None;

        let stored = registered(registry.register(d, ts(77)).unwrap());
        assert_eq!(stored.timestamp_utc, Some(ts(77)));
    }

    #[test]
    fn test_register_conflict_on_other_machine() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        let err = registry
            .register(descriptor("A", "tcp://host-b:1", false, 20), ts(0))
            .unwrap_err();

        assert!(matches!(err, DomainError::PeerAlreadyExists { .. }));
    }

    #[test]
    fn test_register_same_machine_new_port_is_not_a_conflict() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();
        let stored = registered(
            registry
                .register(descriptor("A", "tcp://HOST-A:2", false, 20), ts(0))
                .unwrap(),
        );
        assert_eq!(stored.peer.endpoint, "tcp://HOST-A:2");
    }

    #[test]
    fn test_register_over_down_peer_on_other_machine_is_allowed() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", true, 10), ts(0))
            .unwrap();
        registry.unregister(&PeerId::new("A"), ts(20), None).unwrap();

        assert!(registry
            .register(descriptor("A", "tcp://host-b:1", true, 30), ts(0))
            .is_ok());
    }

    #[test]
    fn test_stale_registration_changes_nothing() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();
        let before = registry.peers();

        let mut stale = descriptor("A", "tcp://host-a:9", false, 10);
        stale.subscriptions.clear();
        assert_eq!(
            registry.register(stale, ts(0)).unwrap(),
            RegistrationOutcome::Ignored
        );
        assert_eq!(registry.peers(), before);
    }

    #[test]
    fn test_unregister_persistent_keeps_peer_down() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", true, 10), ts(0))
            .unwrap();

        let outcome = registry.unregister(&PeerId::new("A"), ts(20), None).unwrap();

        assert!(matches!(outcome, UnregisterOutcome::Stopped(_)));
        let stored = registry.get(&PeerId::new("A")).unwrap();
        assert!(!stored.peer.is_up);
        assert_eq!(registry.peers().len(), 1);
    }

    #[test]
    fn test_unregister_transient_removes_peer() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        let outcome = registry.unregister(&PeerId::new("A"), ts(20), None).unwrap();

        assert!(matches!(outcome, UnregisterOutcome::Decommissioned(_)));
        assert!(registry.peers().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_ignores_stale_and_other_instances() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        assert!(registry.unregister(&PeerId::new("A"), ts(5), None).is_none());
        assert!(registry
            .unregister(&PeerId::new("A"), ts(20), Some("tcp://host-a:2"))
            .is_none());
        assert!(registry.unregister(&PeerId::new("B"), ts(20), None).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decommission_is_unconditional() {
        let registry = PeerRegistry::new();
        registry
            .register(descriptor("A", "tcp://host-a:1", true, 10), ts(0))
            .unwrap();
        assert!(registry.decommission(&PeerId::new("A")));
        assert!(!registry.decommission(&PeerId::new("A")));
        assert!(registry.get(&PeerId::new("A")).is_none());
    }

    #[test]
    fn test_update_subscriptions_monotonic_guard() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("A");
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        let subs = vec![Subscription::new(type_x(), BindingKey::from_parts(["1"]))];
        let subs2 = vec![Subscription::new(type_x(), BindingKey::from_parts(["2"]))];

        assert!(registry.update_subscriptions(&id, subs.clone(), ts(30)).is_some());
        assert!(registry.update_subscriptions(&id, subs2, ts(20)).is_none());

        assert_eq!(registry.get(&id).unwrap().subscriptions, subs);
    }

    #[test]
    fn test_dynamic_removal_entry_drops_type() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("A");
        let type_y = MessageTypeId::new("Abc.TypeY");
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        registry.update_dynamic_subscriptions_for_types(
            &id,
            ts(20),
            &[SubscriptionsForType::new(
                type_y.clone(),
                vec![BindingKey::from_parts(["1"]), BindingKey::from_parts(["2"])],
            )],
        );
        assert_eq!(registry.get(&id).unwrap().subscriptions.len(), 3);

        let applied = registry.update_dynamic_subscriptions_for_types(
            &id,
            ts(30),
            &[SubscriptionsForType::removal(type_y.clone())],
        );

        assert_eq!(applied.len(), 1);
        let subs = &registry.get(&id).unwrap().subscriptions;
        assert!(subs.iter().all(|s| s.message_type_id != type_y));
    }

    #[test]
    fn test_registration_wipes_older_dynamic_subscriptions() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("A");
        let type_y = MessageTypeId::new("Abc.TypeY");
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();
        registry.update_dynamic_subscriptions_for_types(
            &id,
            ts(20),
            &[SubscriptionsForType::new(type_y.clone(), vec![BindingKey::any()])],
        );

        registry
            .register(descriptor("A", "tcp://host-a:1", false, 30), ts(0))
            .unwrap();
        assert_eq!(registry.get(&id).unwrap().subscriptions.len(), 1);

        // A late dynamic write from before the registration is stale.
        let applied = registry.update_dynamic_subscriptions_for_types(
            &id,
            ts(25),
            &[SubscriptionsForType::new(type_y, vec![BindingKey::any()])],
        );
        assert!(applied.is_empty());
    }

    #[test]
    fn test_set_peer_responding_is_timestamp_guarded() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("A");
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        assert!(registry.set_peer_responding(&id, false, ts(20)));
        assert!(!registry.set_peer_responding(&id, true, ts(15)));
        assert!(!registry.get(&id).unwrap().peer.is_responding);
        assert!(registry.set_peer_responding(&id, true, ts(25)));
        assert!(registry.get(&id).unwrap().peer.is_responding);
    }

    #[test]
    fn test_set_peer_down_once() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("A");
        registry
            .register(descriptor("A", "tcp://host-a:1", false, 10), ts(0))
            .unwrap();

        assert!(registry.set_peer_down(&id, ts(5)).is_none());
        let stopped = registry.set_peer_down(&id, ts(20)).unwrap();
        assert_eq!(stopped.endpoint, "tcp://host-a:1");
        assert!(registry.set_peer_down(&id, ts(30)).is_none());
    }

    #[test]
    fn test_peers_handling_matches_binding_keys() {
        let registry = PeerRegistry::new();
        let mut a = descriptor("A", "tcp://host-a:1", false, 10);
        a.subscriptions = vec![Subscription::new(type_x(), BindingKey::from_parts(["1"]))];
        registry.register(a, ts(0)).unwrap();
        registry
            .register(descriptor("B", "tcp://host-b:1", false, 10), ts(0))
            .unwrap();

        let one = MessageBinding::new(type_x(), BindingKey::from_parts(["1"]));
        let two = MessageBinding::new(type_x(), BindingKey::from_parts(["2"]));

        let mut ids: Vec<_> = registry.peers_handling(&one).into_iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec![PeerId::new("A"), PeerId::new("B")]);

        let ids: Vec<_> = registry.peers_handling(&two).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PeerId::new("B")]);
    }

    #[test]
    fn test_concurrent_writers_keep_snapshot_complete() {
        let registry = Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        let id = format!("Peer.{i}.{j}");
                        registry
                            .register(descriptor(&id, "tcp://host:1", false, 10), ts(0))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 200);
        assert_eq!(registry.snapshot().len(), 200);
    }

    proptest! {
        #[test]
        fn prop_stale_register_is_idempotent(first in 1u64..1_000, delta in 0u64..1_000) {
            let registry = PeerRegistry::new();
            registry.register(descriptor("A", "tcp://host-a:1", false, first), ts(0)).unwrap();
            let before = registry.peers();

            let mut stale = descriptor("A", "tcp://host-a:2", true, first.saturating_sub(delta));
            stale.subscriptions.clear();
            prop_assert_eq!(registry.register(stale, ts(0)).unwrap(), RegistrationOutcome::Ignored);
            prop_assert_eq!(registry.peers(), before);
        }
    }
}
