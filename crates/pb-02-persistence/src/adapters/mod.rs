//! # Adapters
//!
//! In-memory implementation of the storage port.

pub mod memory_storage;

pub use memory_storage::InMemoryStorage;
