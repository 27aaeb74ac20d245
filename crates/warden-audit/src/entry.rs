//! Audit entry types.
//!
//! Every significant action is recorded as an [`AuditEntry`]. Entries are
//! chain-linked (each carries the hash of the previous one) and signed by
//! the key that was active when they were committed.
//!
//! Entry content is a closed set of typed values. [`ContextValue`] has no
//! float or nested variant, so the canonical encoding in
//! [`codec`](crate::codec) is total and deterministic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_crypto::{ContentHash, KeyId, Signature};

use crate::codec::CanonicalEntry;
use crate::error::AuditError;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
}

impl ContextValue {
    /// The string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ContextValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl TryFrom<serde_json::Value> for ContextValue {
    type Error = AuditError;

    /// Accepts strings, booleans and integers that fit in `i64`.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::String(s) => Ok(Self::Str(s)),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => n.as_i64().map(Self::Int).ok_or_else(|| {
                AuditError::Encoding(format!(
                    "number {n} is not an integer in the i64 range"
                ))
            }),
            Value::Null => Err(AuditError::Encoding("null is not a context value".into())),
            Value::Array(_) => Err(AuditError::Encoding(
                "arrays are not context values".into(),
            )),
            Value::Object(_) => Err(AuditError::Encoding(
                "objects are not context values".into(),
            )),
        }
    }
}

/// Typed context attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    /// The entity the action concerns (thought, task, conscience, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Correlation id of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Structured metadata, ordered by key.
    #[serde(default)]
    pub metadata: BTreeMap<String, ContextValue>,
}

impl AuditContext {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entity id.
    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the request id.
    #[must_use]
    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Add a metadata value, replacing any previous value for `key`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build a context from a JSON object of scalar values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Encoding`] if `value` is not an object or any
    /// member is not a permitted scalar.
    pub fn from_json_metadata(value: serde_json::Value) -> Result<Self, AuditError> {
        let serde_json::Value::Object(map) = value else {
            return Err(AuditError::Encoding("metadata must be a JSON object".into()));
        };
        let mut metadata = BTreeMap::new();
        for (key, value) in map {
            let value = ContextValue::try_from(value)
                .map_err(|e| AuditError::Encoding(format!("metadata '{key}': {e}")))?;
            metadata.insert(key, value);
        }
        Ok(Self {
            metadata,
            ..Self::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Action types
// ---------------------------------------------------------------------------

/// How much attention an entry deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine.
    Low,
    /// Changes state.
    Medium,
    /// Needs review.
    High,
}

impl Severity {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions an agent handler can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerAction {
    /// Observe input.
    Observe,
    /// Send a message.
    Speak,
    /// Invoke a tool.
    Tool,
    /// Refuse a request.
    Reject,
    /// Think further.
    Ponder,
    /// Hand off to a human.
    Defer,
    /// Store a memory.
    Memorize,
    /// Read a memory.
    Recall,
    /// Delete a memory.
    Forget,
    /// Mark a task done.
    TaskComplete,
}

impl HandlerAction {
    /// Upper-case label, e.g. `MEMORIZE`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Speak => "SPEAK",
            Self::Tool => "TOOL",
            Self::Reject => "REJECT",
            Self::Ponder => "PONDER",
            Self::Defer => "DEFER",
            Self::Memorize => "MEMORIZE",
            Self::Recall => "RECALL",
            Self::Forget => "FORGET",
            Self::TaskComplete => "TASK_COMPLETE",
        }
    }

    /// Stable wire code used by the canonical encoding.
    #[must_use]
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Observe => 1,
            Self::Speak => 2,
            Self::Tool => 3,
            Self::Reject => 4,
            Self::Ponder => 5,
            Self::Defer => 6,
            Self::Memorize => 7,
            Self::Recall => 8,
            Self::Forget => 9,
            Self::TaskComplete => 10,
        }
    }

    /// Severity of the action.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Defer | Self::Reject | Self::Forget => Severity::High,
            Self::Tool | Self::Memorize | Self::TaskComplete => Severity::Medium,
            Self::Observe | Self::Speak | Self::Ponder | Self::Recall => Severity::Low,
        }
    }
}

impl fmt::Display for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ActionType {
    /// An agent handler action.
    Handler(HandlerAction),
    /// A named system event (`audit_service_shutdown`, ...).
    SystemEvent(String),
    /// An ethical check of the named action.
    ConscienceEvent(String),
    /// An error of the named kind.
    Error(String),
}

impl ActionType {
    /// Label used for filtering and display.
    ///
    /// Handler actions use their upper-case name. System events use the
    /// event name. Conscience checks are `conscience_check` and errors are
    /// `error`; the checked action or error kind is in the payload.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Handler(action) => action.as_str(),
            Self::SystemEvent(name) => name,
            Self::ConscienceEvent(_) => "conscience_check",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(action) => write!(f, "{action}"),
            Self::SystemEvent(name) => write!(f, "{name}"),
            Self::ConscienceEvent(action) => write!(f, "conscience_check({action})"),
            Self::Error(kind) => write!(f, "error({kind})"),
        }
    }
}

/// Result of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action succeeded.
    Success,
    /// The action failed or was denied.
    Failure,
    /// The action was handed off.
    Deferred,
    /// The action started; its result is recorded separately.
    Start,
}

impl Outcome {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Deferred => "deferred",
            Self::Start => "start",
        }
    }

    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Success => 1,
            Self::Failure => 2,
            Self::Deferred => 3,
            Self::Start => 4,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Producer-supplied content of an entry that has not been committed yet.
///
/// The sequencer adds the sequence, timestamp, chain link and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFields {
    /// Identifier, assigned when the fields are built.
    pub id: Uuid,
    /// What kind of action.
    pub action_type: ActionType,
    /// Who performed it.
    pub actor: String,
    /// Typed context.
    pub context: AuditContext,
    /// How it ended.
    pub outcome: Outcome,
}

impl EntryFields {
    /// New fields with a fresh random id.
    #[must_use]
    pub fn new(
        action_type: ActionType,
        actor: impl Into<String>,
        context: AuditContext,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            actor: actor.into(),
            context,
            outcome,
        }
    }
}

/// The caller-supplied part of an entry, keeping its id.
impl From<AuditEntry> for EntryFields {
    fn from(entry: AuditEntry) -> Self {
        Self {
            id: entry.id,
            action_type: entry.action_type,
            actor: entry.actor,
            context: entry.context,
            outcome: entry.outcome,
        }
    }
}

/// A committed, signed, chain-linked audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    /// Commit time from the clock.
    pub timestamp: DateTime<Utc>,
    /// What kind of action.
    pub action_type: ActionType,
    /// Who performed it.
    pub actor: String,
    /// Typed context.
    pub context: AuditContext,
    /// How it ended.
    pub outcome: Outcome,
    /// `entry_hash` of the previous entry, or [`GENESIS_HASH`].
    pub previous_hash: ContentHash,
    /// Hash of the canonical encoding of this entry.
    pub entry_hash: ContentHash,
    /// Signature over `entry_hash`.
    pub signature: Signature,
    /// Key that produced `signature`.
    pub signing_key_id: KeyId,
}

/// `previous_hash` of the entry at sequence 0.
pub const GENESIS_HASH: ContentHash = ContentHash::ZERO;

impl AuditEntry {
    /// Borrowed view of the hashed fields.
    #[must_use]
    pub fn canonical(&self) -> CanonicalEntry<'_> {
        CanonicalEntry {
            id: &self.id,
            sequence: self.sequence,
            timestamp: &self.timestamp,
            action_type: &self.action_type,
            actor: &self.actor,
            context: &self.context,
            outcome: self.outcome,
            previous_hash: &self.previous_hash,
        }
    }

    /// Whether this is the first entry of a chain.
    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.sequence == 0 && self.previous_hash == GENESIS_HASH
    }

    /// Check if this entry directly follows `previous`.
    #[must_use]
    pub fn follows(&self, previous: &AuditEntry) -> bool {
        previous.sequence.checked_add(1) == Some(self.sequence)
            && self.previous_hash == previous.entry_hash
    }
}
