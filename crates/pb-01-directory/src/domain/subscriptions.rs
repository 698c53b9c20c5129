//! Per-type, timestamp-versioned subscription sets.
//!
//! Each message type carries its own version. A write for a type is applied
//! only if it is strictly newer than the version stored for that type. An
//! empty key list is kept as a tombstone so that older adds arriving late
//! cannot resurrect a removed type.

use shared_types::{BindingKey, MessageTypeId, Subscription, SubscriptionsForType, Timestamp};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TypeEntry {
    binding_keys: Vec<BindingKey>,
    timestamp: Option<Timestamp>,
}

/// Subscriptions of one peer, grouped by message type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypedSubscriptions {
    by_type: BTreeMap<MessageTypeId, TypeEntry>,
}

impl TypedSubscriptions {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every type older than `timestamp` with the content of
    /// `subscriptions`.
    ///
    /// Types with a stored version newer than `timestamp` are kept. Types
    /// absent from `subscriptions` are removed.
    pub fn replace_all(&mut self, subscriptions: &[Subscription], timestamp: Option<Timestamp>) {
        let mut incoming: BTreeMap<MessageTypeId, Vec<BindingKey>> = BTreeMap::new();
        for subscription in subscriptions {
            let keys = incoming
                .entry(subscription.message_type_id.clone())
                .or_default();
            if !keys.contains(&subscription.binding_key) {
                keys.push(subscription.binding_key.clone());
            }
        }

        self.by_type
            .retain(|_, entry| is_newer(entry.timestamp, timestamp));
        for (message_type_id, binding_keys) in incoming {
            let keep_existing = self
                .by_type
                .get(&message_type_id)
                .is_some_and(|entry| is_newer(entry.timestamp, timestamp));
            if !keep_existing {
                self.by_type.insert(
                    message_type_id,
                    TypeEntry {
                        binding_keys,
                        timestamp,
                    },
                );
            }
        }
    }

    /// Apply per-type updates versioned by `timestamp`.
    ///
    /// Returns the entries that were applied; stale entries are skipped.
    pub fn apply_for_types(
        &mut self,
        timestamp: Timestamp,
        updates: &[SubscriptionsForType],
    ) -> Vec<SubscriptionsForType> {
        let mut applied = Vec::new();
        for update in updates {
            let stale = self
                .by_type
                .get(&update.message_type_id)
                .and_then(|entry| entry.timestamp)
                .is_some_and(|stored| stored >= timestamp);
            if stale {
                continue;
            }
            self.by_type.insert(
                update.message_type_id.clone(),
                TypeEntry {
                    binding_keys: update.binding_keys.clone(),
                    timestamp: Some(timestamp),
                },
            );
            applied.push(update.clone());
        }
        applied
    }

    /// Drop every type whose version is strictly before `timestamp`.
    pub fn remove_older_than(&mut self, timestamp: Timestamp) {
        self.by_type
            .retain(|_, entry| entry.timestamp.is_some_and(|stored| stored >= timestamp));
    }

    /// Flatten into subscriptions, skipping tombstones.
    #[must_use]
    pub fn to_subscriptions(&self) -> Vec<Subscription> {
        self.by_type
            .iter()
            .flat_map(|(message_type_id, entry)| {
                entry
                    .binding_keys
                    .iter()
                    .map(move |key| Subscription::new(message_type_id.clone(), key.clone()))
            })
            .collect()
    }

    /// Binding keys held for `message_type_id`.
    #[must_use]
    pub fn binding_keys(&self, message_type_id: &MessageTypeId) -> &[BindingKey] {
        self.by_type
            .get(message_type_id)
            .map(|entry| entry.binding_keys.as_slice())
            .unwrap_or_default()
    }

    /// `true` when no type holds a live pattern.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(|entry| entry.binding_keys.is_empty())
    }
}

/// `true` if `stored` is strictly newer than `incoming`.
fn is_newer(stored: Option<Timestamp>, incoming: Option<Timestamp>) -> bool {
    matches!((stored, incoming), (Some(stored), Some(incoming)) if stored > incoming)
}
