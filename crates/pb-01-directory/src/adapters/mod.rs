//! # Adapters
//!
//! In-process implementations of the directory ports.

pub mod local_transport;

pub use local_transport::LocalDirectoryTransport;
