//! # Peerbus Test Suite
//!
//! Cross-crate scenarios wiring the directory and the persistence tier
//! through the in-memory event bus.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs        # Cluster wiring, sample messages, tracing setup
//! └── integration/
//!     ├── directory_flows.rs    # Registration, routing, subscription updates
//!     └── persistence_flows.rs  # Persist, ack, replay, shutdown
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p pb-tests
//!
//! # With logs
//! RUST_LOG=pb_02_persistence=debug cargo test -p pb-tests -- --nocapture
//! ```

#![allow(dead_code)]

pub mod harness;
pub mod integration;
