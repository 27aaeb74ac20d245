//! Warden Storage - the durability layer underneath the audit chain.
//!
//! [`KvStore`] is a namespaced, byte-level key-value contract. The audit
//! crate builds its entry store on top of it and never depends on a
//! concrete engine.
//!
//! # Backends
//!
//! - [`MemoryKvStore`]: always available, for tests and ephemeral chains
//! - `SurrealKvStore`: embedded, ACID, LSM-tree storage. Enable with the
//!   **`kv`** feature.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod kv;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKvStore};

#[cfg(feature = "kv")]
pub use kv::SurrealKvStore;
