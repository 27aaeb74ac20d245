//! Warden Test - shared test utilities for the audit engine.
//!
//! This crate provides mock collaborators and fixtures that can be used
//! across Warden crates as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! warden-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use warden_test::{FailingStore, memory_service_over, sample_context};
//! use warden_audit::{HandlerAction, Outcome};
//!
//! #[tokio::test]
//! async fn test_dropped_entry() {
//!     let store = FailingStore::new();
//!     store.fail_next(1);
//!     let service = memory_service_over(store.clone()).await;
//!
//!     let entry = service
//!         .log_action(HandlerAction::Speak, "speak_handler", sample_context(), Outcome::Success)
//!         .await
//!         .unwrap();
//!     assert!(entry.is_none());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![cfg_attr(test, allow(clippy::arithmetic_side_effects))]

pub mod clock;
pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use clock::*;
pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
