//! # Handler Registry
//!
//! Explicit map from message type to handler function, built once at startup.
//!
//! Each handler receives the shared component state, the message context and
//! the decoded payload. A payload that fails to decode, or a handler that
//! fails with anything but a domain error, is reported as
//! `MessageProcessingFailed` on the failure publisher.

use crate::events::BusEvent;
use crate::publisher::EventPublisher;
use futures::future::{BoxFuture, FutureExt};
use shared_types::messages::MessageProcessingFailed;
use shared_types::{
    BusMessage, CodecError, DomainError, MessageId, MessageTypeId, OriginatorInfo, StorageError,
    TransportMessage,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a handler may return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Business-rule violation, returned to the caller as is.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The payload could not be decoded or the reply encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Any other failure.
    #[error("Handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Domain errors are expected outcomes, not processing failures.
    #[must_use]
    pub fn is_processing_failure(&self) -> bool {
        !matches!(self, Self::Domain(_))
    }
}

/// Errors returned by [`HandlerRegistry::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No handler is registered for the message type.
    #[error("No handler registered for {0}")]
    NoHandler(MessageTypeId),

    /// The selected handler failed.
    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },
}

impl DispatchError {
    /// The domain error carried by this failure, if any.
    #[must_use]
    pub fn domain_error(&self) -> Option<&DomainError> {
        match self {
            Self::Handler {
                source: HandlerError::Domain(e),
                ..
            } => Some(e),
            _ => None,
        }
    }
}

/// Outcome of a handler: an optional reply to the sender.
pub type HandlerResult = Result<Option<TransportMessage>, HandlerError>;

/// Metadata of the message being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Who sent the message.
    pub originator: OriginatorInfo,
    /// Id of the received transport message.
    pub message_id: MessageId,
}

impl MessageContext {
    /// Context of a received transport message.
    #[must_use]
    pub fn of(message: &TransportMessage) -> Self {
        Self {
            originator: message.originator.clone(),
            message_id: message.id,
        }
    }
}

/// Build a reply envelope sent back by `responder`.
pub fn reply<M: BusMessage>(message: &M, responder: OriginatorInfo) -> HandlerResult {
    Ok(Some(TransportMessage::from_message(message, responder)?))
}

type BoxedHandler<S> = Arc<
    dyn Fn(
            Arc<S>,
            MessageContext,
            &TransportMessage,
        ) -> Result<BoxFuture<'static, HandlerResult>, HandlerError>
        + Send
        + Sync,
>;

struct HandlerEntry<S> {
    name: String,
    handler: BoxedHandler<S>,
}

/// Routes transport messages to the handler registered for their type.
pub struct HandlerRegistry<S> {
    handlers: HashMap<MessageTypeId, HandlerEntry<S>>,
    failure_publisher: Option<Arc<dyn EventPublisher>>,
}

impl<S: Send + Sync + 'static> HandlerRegistry<S> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            failure_publisher: None,
        }
    }

    /// Register `handler` for messages of type `M`.
    ///
    /// A later registration for the same type replaces the earlier one.
    #[must_use]
    pub fn register<M, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        M: BusMessage,
        F: Fn(Arc<S>, MessageContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler<S> = Arc::new(
            move |state: Arc<S>,
                  context: MessageContext,
                  message: &TransportMessage|
                  -> Result<BoxFuture<'static, HandlerResult>, HandlerError> {
                let payload = message.decode::<M>()?;
                Ok(handler(state, context, payload).boxed())
            },
        );
        self.handlers.insert(
            M::message_type_id(),
            HandlerEntry {
                name: name.to_string(),
                handler: boxed,
            },
        );
        self
    }

    /// Publish `MessageProcessingFailed` on `publisher` when a message fails.
    #[must_use]
    pub fn with_failure_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.failure_publisher = Some(publisher);
        self
    }

    /// `true` if a handler is registered for `message_type_id`.
    #[must_use]
    pub fn handles(&self, message_type_id: &MessageTypeId) -> bool {
        self.handlers.contains_key(message_type_id)
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decode `message` and run its handler.
    pub async fn dispatch(
        &self,
        state: Arc<S>,
        message: &TransportMessage,
    ) -> Result<Option<TransportMessage>, DispatchError> {
        let Some(entry) = self.handlers.get(&message.message_type_id) else {
            debug!(message_type = %message.message_type_id, "No handler for message");
            return Err(DispatchError::NoHandler(message.message_type_id.clone()));
        };

        let context = MessageContext::of(message);
        let outcome = match (entry.handler)(state, context, message) {
            Ok(fut) => fut.await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) => Ok(reply),
            Err(error) => {
                if error.is_processing_failure() {
                    self.report_failure(&entry.name, message, &error).await;
                } else {
                    debug!(handler = %entry.name, %error, "Handler rejected message");
                }
                Err(DispatchError::Handler {
                    handler: entry.name.clone(),
                    source: error,
                })
            }
        }
    }

    async fn report_failure(&self, handler: &str, message: &TransportMessage, error: &HandlerError) {
        warn!(
            handler = %handler,
            message_id = %message.id,
            message_type = %message.message_type_id,
            %error,
            "Message processing failed"
        );
        if let Some(publisher) = &self.failure_publisher {
            let event = BusEvent::MessageProcessingFailed(MessageProcessingFailed {
                failing_message: message.clone(),
                exception_message: error.to_string(),
                failing_handler: Some(handler.to_string()),
            });
            publisher.publish(event).await;
        }
    }
}

impl<S: Send + Sync + 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
