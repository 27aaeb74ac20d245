//! Warden Gateway - process wiring and query surface for the audit chain.
//!
//! This crate provides:
//! - Bootstrap from [`warden_config::Config`]: storage, signing keys,
//!   logging and the [`warden_audit::AuditService`]
//! - A JSON-RPC API (`audit_entries`, `audit_verify`, `audit_entry`) over
//!   HTTP and `WebSocket`
//!
//! # Architecture
//!
//! ```text
//! warden-gateway
//! ├── bootstrap   Config -> store + keys + AuditService
//! ├── server      jsonrpsee server over AuditService
//! └── rpc         API trait and wire types
//!     └── warden-audit (sequencer, verifier, queries)
//!         └── warden-storage / warden-crypto
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_config::Config;
//! use warden_gateway::{Gateway, init_logging};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     init_logging(&config)?;
//!     let gateway = Gateway::start(&config).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod bootstrap;
pub mod error;
pub mod rpc;
pub mod server;

pub use bootstrap::{Gateway, audit_options, init_logging, open_keys, open_store};
pub use error::{GatewayError, GatewayResult};
pub use rpc::{AuditEntriesResponse, AuditEntryView, AuditRpcClient, AuditRpcServer, error_codes};
pub use server::{DEFAULT_PAGE_SIZE, RpcServer};
