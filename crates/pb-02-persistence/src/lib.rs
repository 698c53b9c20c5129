//! # Persistence
//!
//! Keeps a copy of every persistent message sent to a peer that is down or
//! has not yet acked it, and replays that backlog when the peer comes back.
//!
//! ## Architecture
//!
//! - **Domain Layer:** Matcher entries, per-peer state, time buckets, count deltas
//! - **Ports Layer:** Storage, message reader and peer transport traits
//! - **Service Layer:** Matcher, replayers, repository and command handlers
//! - **Adapters Layer:** In-memory storage
//!
//! ## Replay protocol
//!
//! ```text
//! peer ── StartMessageReplayCommand ──► persistence
//! peer ◄── backlog, in storage order ── replayer
//! peer ◄── ReplayPhaseEnded ─────────── replayer
//! peer ◄── live messages (deduped) ──── replayer   (safety phase)
//! peer ◄── SafetyPhaseEnded ─────────── replayer
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let service = Arc::new(PersistenceService::new(identity, storage, transport, bus.clone(), config));
//! let handlers = PersistenceService::handler_registry(bus);
//! service.start().await?;
//! let tasks = service.spawn_background_tasks(shutdown_rx);
//! handlers.dispatch(service.clone(), &incoming).await?;
//! service.shutdown().await;
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

/// Test utilities.
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapters::InMemoryStorage;
pub use domain::{
    bucket_id, ConfigError, MatcherEntry, NonAckedCountCache, PeerState, PersistenceConfig,
    BUCKET_SIZE_MILLIS,
};
pub use ports::{MessageReader, PeerTransport, Storage};
pub use service::{
    run_periodic, InMemoryMessageMatcher, MessageReplayer, MessageReplayerRepository,
    PersistenceError, PersistenceService, ReplayContext, ReplayError, ReplayStatus,
};
