//! # Persistence Domain
//!
//! Matcher entries, per-peer backlog bookkeeping, time buckets and the
//! non-acked count delta cache. No I/O happens here.

pub mod bucket;
pub mod config;
pub mod entry;
pub mod non_acked;
pub mod peer_state;

pub use bucket::{bucket_id, BUCKET_SIZE_MILLIS};
pub use config::{ConfigError, PersistenceConfig};
pub use entry::MatcherEntry;
pub use non_acked::NonAckedCountCache;
pub use peer_state::PeerState;
