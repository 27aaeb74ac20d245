//! Audit-related error types.

use thiserror::Error;

/// Errors that can occur while recording, verifying or querying the chain.
///
/// A broken chain is not an error: verification reports it through
/// [`VerificationReport`](crate::VerificationReport).
#[derive(Debug, Error)]
pub enum AuditError {
    /// The entry content cannot be encoded canonically.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// No signing key is active.
    #[error("no active signing key")]
    NoActiveKey,

    /// A key id that this manager never issued.
    #[error("unknown signing key: {key_id}")]
    UnknownKey {
        /// The key id that was looked up.
        key_id: String,
    },

    /// The storage collaborator did not durably commit the entry.
    ///
    /// The chain head was not advanced; a retry links to the same
    /// previous hash.
    #[error("failed to persist entry {sequence}: {reason}")]
    Persistence {
        /// Sequence the entry would have taken.
        sequence: u64,
        /// Underlying storage failure.
        reason: String,
    },

    /// Another entry already holds this sequence.
    ///
    /// Seen when a write landed but reported failure, leaving the chain
    /// head behind the store.
    #[error("sequence {sequence} is already committed")]
    SequenceTaken {
        /// The sequence that was refused.
        sequence: u64,
    },

    /// A stored entry no longer decodes.
    #[error("stored entry {sequence} is unreadable: {reason}")]
    Corrupt {
        /// Sequence named by the entry's storage key.
        sequence: u64,
        /// Decode failure.
        reason: String,
    },

    /// The producer waited too long for its turn. Nothing was committed.
    #[error("audit append timed out after {waited_ms} ms")]
    Timeout {
        /// How long the producer waited.
        waited_ms: u64,
    },

    /// Audit is mandatory and the append failed.
    #[error("audit unavailable: {0}")]
    Unavailable(#[source] Box<AuditError>),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key file or key ring could not be read or written.
    #[error("key store error: {0}")]
    KeyStore(String),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] warden_crypto::CryptoError),

    /// Entry not found.
    #[error("audit entry not found: {entry_id}")]
    EntryNotFound {
        /// The entry id that was not found.
        entry_id: String,
    },

    /// The sequencer has stopped accepting appends.
    #[error("audit service is shutting down")]
    ShuttingDown,
}

impl From<warden_storage::StorageError> for AuditError {
    fn from(err: warden_storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;
