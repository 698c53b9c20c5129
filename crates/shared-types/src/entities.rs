//! # Core Domain Entities
//!
//! Defines the identity and state records the directory and the persistence
//! tier agree on.
//!
//! ## Clusters
//!
//! - **Identity**: `PeerId`, `MessageId`, `MessageTypeId`
//! - **Peers**: `Peer`, `PeerDescriptor`
//! - **Versioning**: `Timestamp`

use crate::routing::Subscription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// CLUSTER A: IDENTITY
// =============================================================================

/// Opaque, stable identifier of a peer (e.g. `Abc.Trading.Engine.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique identifier of a single message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh random message id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a message schema: its fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId(String);

impl MessageTypeId {
    /// Create a message type identifier from a fully-qualified name.
    pub fn new(full_name: impl Into<String>) -> Self {
        Self(full_name.into())
    }

    /// The fully-qualified name.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// CLUSTER B: VERSIONING
// =============================================================================

/// UTC timestamp in milliseconds since the Unix epoch.
///
/// Used as a Lamport-like version for directory records: ordering is what
/// matters, not wall-clock truth.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// This timestamp moved forward by `millis`.
    #[must_use]
    pub const fn plus_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Milliseconds elapsed from `earlier` to `self` (zero if `earlier` is later).
    #[must_use]
    pub const fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = i64::try_from(self.0).unwrap_or(i64::MAX);
        match DateTime::<Utc>::from_timestamp_millis(millis) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// =============================================================================
// CLUSTER C: PEERS
// =============================================================================

/// A peer as seen by the rest of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable identity.
    pub id: PeerId,
    /// Transport address, e.g. `tcp://trading-01:5432`.
    pub endpoint: String,
    /// Whether the peer is running.
    pub is_up: bool,
    /// Whether the peer answers pings.
    pub is_responding: bool,
}

impl Peer {
    /// A running, responding peer.
    pub fn new(id: PeerId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            is_up: true,
            is_responding: true,
        }
    }

    /// Host part of the endpoint, lower-cased.
    ///
    /// `tcp://Trading-01:5432` yields `trading-01`.
    #[must_use]
    pub fn machine_name(&self) -> String {
        machine_name_of(&self.endpoint)
    }
}

/// Extract the host part of an endpoint string.
#[must_use]
pub fn machine_name_of(endpoint: &str) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let host = without_scheme
        .rsplit_once(':')
        .map_or(without_scheme, |(host, _)| host);
    host.to_ascii_lowercase()
}

/// The directory record for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Identity and liveness.
    pub peer: Peer,
    /// Persistent peers get their messages stored while down.
    pub is_persistent: bool,
    /// Version of the last write applied to this record.
    pub timestamp_utc: Option<Timestamp>,
    /// Static and dynamic subscriptions.
    pub subscriptions: Vec<Subscription>,
    /// Debugged peers are excluded from dead-peer detection.
    pub has_debugger_attached: bool,
}

impl PeerDescriptor {
    /// Create a descriptor for a running peer.
    pub fn new(
        peer_id: PeerId,
        endpoint: impl Into<String>,
        is_persistent: bool,
        subscriptions: Vec<Subscription>,
        timestamp_utc: Timestamp,
    ) -> Self {
        Self {
            peer: Peer::new(peer_id, endpoint),
            is_persistent,
            timestamp_utc: Some(timestamp_utc),
            subscriptions,
            has_debugger_attached: false,
        }
    }

    /// Shortcut to the peer id.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    /// `true` if `timestamp` is strictly newer than this record's version.
    #[must_use]
    pub fn is_older_than(&self, timestamp: Timestamp) -> bool {
        self.timestamp_utc.map_or(true, |current| timestamp > current)
    }
}
