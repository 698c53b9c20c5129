//! # Persistence Service
//!
//! - [`InMemoryMessageMatcher`]: ordered, batched writes of messages and acks
//! - [`MessageReplayer`]: per-peer backlog replay followed by a safety phase
//! - [`MessageReplayerRepository`]: one active replayer per peer
//! - [`PersistenceService`]: command handlers, periodic bookkeeping, shutdown

mod matcher;
mod periodic;
mod persistence;
mod replayer;
mod repository;

pub use matcher::InMemoryMessageMatcher;
pub use periodic::run_periodic;
pub use persistence::{PersistenceError, PersistenceService};
pub use replayer::{MessageReplayer, ReplayContext, ReplayError, ReplayStatus};
pub use repository::MessageReplayerRepository;
