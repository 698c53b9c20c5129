//! In-process client to server transport.

use crate::client::DirectoryClientError;
use crate::ports::DirectoryTransport;
use crate::service::DirectoryServer;
use async_trait::async_trait;
use shared_bus::HandlerRegistry;
use shared_types::TransportMessage;
use std::sync::Arc;
use tracing::trace;

/// Delivers client commands straight to a server in the same process.
pub struct LocalDirectoryTransport {
    server: Arc<DirectoryServer>,
    handlers: Arc<HandlerRegistry<DirectoryServer>>,
}

impl LocalDirectoryTransport {
    pub fn new(server: Arc<DirectoryServer>, handlers: Arc<HandlerRegistry<DirectoryServer>>) -> Self {
        Self { server, handlers }
    }
}

#[async_trait]
impl DirectoryTransport for LocalDirectoryTransport {
    async fn send(
        &self,
        message: TransportMessage,
    ) -> Result<Option<TransportMessage>, DirectoryClientError> {
        trace!(message_type = %message.message_type_id, "Local directory command");
        Ok(self.handlers.dispatch(self.server.clone(), &message).await?)
    }
}
