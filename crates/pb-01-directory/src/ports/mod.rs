//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the directory requires the host to implement.

use crate::client::DirectoryClientError;
use async_trait::async_trait;
use shared_types::{Peer, TransportError, TransportMessage};

/// Liveness probe used by the dead-peer detector.
///
/// Implementations must be `Send + Sync`: one check pings many peers
/// concurrently.
#[async_trait]
pub trait PeerPinger: Send + Sync {
    /// Send a ping and wait for its acknowledgement.
    async fn ping(&self, peer: &Peer) -> Result<(), TransportError>;
}

/// Request/response channel from a directory client to a directory server.
#[async_trait]
pub trait DirectoryTransport: Send + Sync {
    /// Send a command and wait for the optional reply.
    ///
    /// A domain error raised by the server comes back as
    /// [`DirectoryClientError::Domain`].
    async fn send(
        &self,
        message: TransportMessage,
    ) -> Result<Option<TransportMessage>, DirectoryClientError>;
}
