//! # Shared Types Crate
//!
//! This crate contains the peer, subscription and message types shared by the
//! directory and the persistence tier, together with the `TransportMessage`
//! envelope every command and event travels in.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-crate types are defined here.
//! - **Envelope Integrity**: Payloads travel inside `TransportMessage`; the
//!   envelope's originator is the authoritative sender identity.
//! - **Explicit Time**: Every timestamp-consuming component takes a
//!   [`TimeSource`]; nothing reads the wall clock behind the caller's back.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod entities;
pub mod envelope;
pub mod errors;
pub mod messages;
pub mod routing;
pub mod time;

pub use entities::*;
pub use envelope::{OriginatorInfo, TransportMessage};
pub use errors::*;
pub use messages::*;
pub use routing::*;
pub use time::{SystemTimeSource, TimeSource};

#[cfg(feature = "test-utils")]
pub use time::ControllableTimeSource;
