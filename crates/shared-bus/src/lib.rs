//! # Shared Bus - In-Process Event Bus and Handler Registry
//!
//! Carries directory and persistence events between the components of one
//! process, and routes incoming transport messages to their handlers.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │  Directory   │                    │ Dir. client  │
//! │   server     │    publish()       │ Persistence  │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │  Event Bus   │          │
//!                  │              │ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```
//!
//! ## Dispatch
//!
//! Handlers are registered explicitly, per message type, in a
//! [`HandlerRegistry`] built at startup. A message that fails to decode or
//! whose handler fails is reported as `MessageProcessingFailed` and does not
//! stop the dispatch of other messages.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod dispatch;
pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use dispatch::{DispatchError, HandlerError, HandlerRegistry, HandlerResult, MessageContext};
pub use events::{BusEvent, EventFilter, EventTopic};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{Subscription, SubscriptionError};

/// Maximum events to buffer per subscriber before lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
