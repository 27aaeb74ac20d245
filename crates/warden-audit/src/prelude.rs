//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warden_audit::prelude::*;` to import the types a producer or an
//! operator tool needs.

// Errors
pub use crate::{AuditError, AuditResult};

// Entry types
pub use crate::{
    ActionType, AuditContext, AuditEntry, ContextValue, EntryFields, HandlerAction, Outcome,
    Severity,
};

// Facade
pub use crate::{AuditEvent, AuditOptions, AuditService, AuditStats, ConscienceResult};

// Verification
pub use crate::{ChainIssue, VerificationReport, Verifier, VerifyRange};

// Queries
pub use crate::{AuditPage, AuditQuery, SortOrder, TimeRange};

// Storage and keys
pub use crate::{AuditStore, KeyManager, KvAuditStore, StoredRow};
