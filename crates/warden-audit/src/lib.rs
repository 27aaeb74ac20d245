//! Warden Audit - tamper-evident audit chain.
//!
//! This crate provides:
//! - A canonical, domain-separated entry encoding ([`codec`])
//! - A single-owner sequencer that gives every entry a gapless sequence,
//!   links it to its predecessor and signs it
//! - Key management with rotation and a persistent key ring
//! - A verifier that replays the chain and reports where it breaks
//! - Lazy, paginated queries over committed entries
//! - [`AuditService`], the facade the rest of the system holds
//!
//! # Security Model
//!
//! Every entry is:
//! - Hashed over its full content, including its sequence and the hash of
//!   the entry before it
//! - Signed by the active Ed25519 key, named in the entry by key id
//! - Persisted before the chain head moves
//!
//! Changing, removing or reordering any historical entry breaks the chain
//! at that sequence, and [`Verifier::verify`] reports it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use warden_audit::{AuditContext, AuditService, HandlerAction, KvAuditStore, Outcome};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), warden_audit::AuditError> {
//! let service = AuditService::builder(Arc::new(KvAuditStore::in_memory()))
//!     .start()
//!     .await?;
//!
//! service
//!     .log_action(
//!         HandlerAction::Memorize,
//!         "memorize_handler",
//!         AuditContext::new().with_entity("thought-1"),
//!         Outcome::Success,
//!     )
//!     .await?;
//!
//! let report = service.verify_audit_integrity().await?;
//! assert!(report.verified);
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod codec;
pub mod prelude;

mod anchor;
mod clock;
mod entry;
mod error;
mod keys;
mod query;
mod sequencer;
mod service;
mod store;
mod verifier;

pub use anchor::{MERKLE_DOMAIN, RootAnchor, merkle_root};
pub use clock::{Clock, SystemClock};
pub use entry::{
    ActionType, AuditContext, AuditEntry, ContextValue, EntryFields, GENESIS_HASH, HandlerAction,
    Outcome, Severity,
};
pub use error::{AuditError, AuditResult};
pub use keys::{KeyManager, KeyRecord};
pub use query::{AuditPage, AuditQuery, QueryService, SortOrder, TimeRange};
pub use sequencer::{ChainHead, ChainSequencer, SequencerOptions};
pub use service::{
    AuditEvent, AuditOptions, AuditService, AuditServiceBuilder, AuditStats, ConscienceResult,
    FAILURE_TARGET,
};
pub use store::{AuditStore, KvAuditStore, StoredRow};
pub use verifier::{
    AnchorReport, ChainIssue, ChainSummary, EntryVerification, IntegrityAssessment,
    VerificationReport, Verifier, VerifyRange,
};
