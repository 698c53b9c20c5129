//! # Peer Directory
//!
//! Authoritative registry of the peers on a Peerbus cluster and the peer-side
//! client that mirrors it.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** Versioned peer records and per-type subscriptions
//! - **Ports Layer:** Pinger and directory transport traits
//! - **Service Layer:** Directory server and dead-peer detector
//! - **Client:** Registration plus a cached routing view fed by events
//! - **Adapters Layer:** In-process transport between client and server
//!
//! Every record carries a UTC timestamp used as a version: an update older
//! than what is stored is ignored, so events may arrive out of order.
//!
//! ## Example
//!
//! ```rust,ignore
//! let bus = Arc::new(InMemoryEventBus::new());
//! let server = Arc::new(DirectoryServer::new(identity, bus.clone(), Arc::new(SystemTimeSource)));
//! let handlers = Arc::new(DirectoryServer::handler_registry(bus.clone()));
//! let transport = Arc::new(LocalDirectoryTransport::new(server.clone(), handlers));
//!
//! let client = PeerDirectoryClient::new(config, transport, Arc::new(SystemTimeSource));
//! client.register(descriptor).await?;
//! let targets = client.get_peers_handling_message(&order_created);
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod client;
pub mod domain;
pub mod ports;
pub mod service;

/// Test utilities.
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapters::LocalDirectoryTransport;
pub use client::{DirectoryCache, DirectoryClientError, PeerDirectoryClient};
pub use domain::{
    ConfigError, DescriptorSnapshot, DirectoryConfig, PeerRegistry, RegistrationOutcome,
    TypedSubscriptions, UnregisterOutcome,
};
pub use ports::{DirectoryTransport, PeerPinger};
pub use service::{DeadPeerDetector, DetectionReport, DirectoryServer};
