//! # Directory Service
//!
//! Wires the registry to the event bus and exposes directory commands as
//! bus handlers.
//!
//! - [`DirectoryServer`]: command handling and change-event broadcast
//! - [`DeadPeerDetector`]: periodic liveness checks over up peers

mod dead_peer_detector;
mod server;

pub use dead_peer_detector::{DeadPeerDetector, DetectionReport};
pub use server::DirectoryServer;
