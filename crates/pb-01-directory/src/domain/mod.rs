//! # Directory Domain
//!
//! Pure directory state: versioned peer records and their subscriptions.
//! Nothing here publishes events or performs I/O; the service layer turns
//! the outcomes into bus events.

pub mod config;
pub mod registry;
pub mod subscriptions;

pub use config::{ConfigError, DirectoryConfig};
pub use registry::{DescriptorSnapshot, PeerRegistry, RegistrationOutcome, UnregisterOutcome};
pub use subscriptions::TypedSubscriptions;
