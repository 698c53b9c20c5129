//! # Directory Client
//!
//! Peer-side half of the directory: registration, subscription updates and
//! a locally cached routing view kept current by directory events.
//!
//! Events about a peer the cache has never seen are held back, up to
//! `max_buffered_events_per_peer`, and replayed once a full descriptor for
//! that peer arrives.

mod cache;
mod directory_client;
mod error;

pub use cache::DirectoryCache;
pub use directory_client::PeerDirectoryClient;
pub use error::DirectoryClientError;
