//! Canonical entry encoding.
//!
//! The bytes produced here are what the chain hashes and signs, so the
//! format is fixed:
//!
//! ```text
//! domain   := str("warden.audit.entry.v1")
//! entry    := domain id sequence timestamp action actor context outcome previous
//! id       := 16 raw bytes
//! sequence := u64 BE
//! timestamp:= i64 BE seconds, u32 BE nanoseconds
//! action   := u8 kind, then u8 handler code | str name
//! context  := opt(entity) opt(request) u32 BE count, count * (str key, value)
//! value    := 'b' u8 | 'i' i64 BE | 's' str
//! outcome  := u8 code
//! previous := 32 raw bytes
//! str      := u32 BE length, UTF-8 bytes
//! opt(x)   := 0 | 1 x
//! ```
//!
//! Metadata is a `BTreeMap`, so keys are always emitted in byte order no
//! matter how the map was built.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use warden_crypto::ContentHash;

use crate::entry::{ActionType, AuditContext, ContextValue, EntryFields, Outcome};
use crate::error::{AuditError, AuditResult};

/// Domain for entry hashes (BLAKE3 `derive_key` context).
pub const ENTRY_DOMAIN: &str = "warden.audit.entry.v1";

/// Longest actor, id or metadata key, in bytes.
pub const MAX_NAME_LEN: usize = 256;
/// Longest string value, in bytes.
pub const MAX_VALUE_LEN: usize = 64 * 1024;
/// Most metadata entries per context.
pub const MAX_METADATA_ENTRIES: usize = 256;

const ACTION_HANDLER: u8 = 1;
const ACTION_SYSTEM: u8 = 2;
const ACTION_CONSCIENCE: u8 = 3;
const ACTION_ERROR: u8 = 4;

/// The hashed fields of an entry, borrowed.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalEntry<'a> {
    /// Entry id.
    pub id: &'a Uuid,
    /// Chain position.
    pub sequence: u64,
    /// Commit time.
    pub timestamp: &'a DateTime<Utc>,
    /// Category.
    pub action_type: &'a ActionType,
    /// Producer.
    pub actor: &'a str,
    /// Typed context.
    pub context: &'a AuditContext,
    /// Result.
    pub outcome: Outcome,
    /// Link to the previous entry.
    pub previous_hash: &'a ContentHash,
}

/// Check producer content against the encoding bounds.
///
/// The sequencer calls this before an append is queued, so oversized or
/// malformed content never reaches the chain.
///
/// # Errors
///
/// Returns [`AuditError::Encoding`] naming the offending field.
pub fn validate_fields(fields: &EntryFields) -> AuditResult<()> {
    check_name("actor", &fields.actor)?;
    if fields.actor.is_empty() {
        return Err(AuditError::Encoding("actor must not be empty".into()));
    }
    match &fields.action_type {
        ActionType::Handler(_) => {},
        ActionType::SystemEvent(name) | ActionType::ConscienceEvent(name) | ActionType::Error(name) => {
            check_name("action name", name)?;
        },
    }
    validate_context(&fields.context)
}

fn validate_context(context: &AuditContext) -> AuditResult<()> {
    if let Some(entity) = &context.entity_id {
        check_name("entity_id", entity)?;
    }
    if let Some(request) = &context.request_id {
        check_name("request_id", request)?;
    }
    if context.metadata.len() > MAX_METADATA_ENTRIES {
        return Err(AuditError::Encoding(format!(
            "metadata has {} entries, limit is {MAX_METADATA_ENTRIES}",
            context.metadata.len()
        )));
    }
    for (key, value) in &context.metadata {
        if key.is_empty() {
            return Err(AuditError::Encoding("metadata key must not be empty".into()));
        }
        check_name("metadata key", key)?;
        if let ContextValue::Str(s) = value
            && s.len() > MAX_VALUE_LEN
        {
            return Err(AuditError::Encoding(format!(
                "metadata '{key}' is {} bytes, limit is {MAX_VALUE_LEN}",
                s.len()
            )));
        }
    }
    Ok(())
}

fn check_name(field: &str, value: &str) -> AuditResult<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(AuditError::Encoding(format!(
            "{field} is {} bytes, limit is {MAX_NAME_LEN}",
            value.len()
        )));
    }
    Ok(())
}

/// Encode the hashed fields of an entry.
///
/// # Errors
///
/// Returns [`AuditError::Encoding`] if the context exceeds the encoding
/// bounds.
pub fn canonicalize(entry: &CanonicalEntry<'_>) -> AuditResult<Vec<u8>> {
    validate_context(entry.context)?;
    check_name("actor", entry.actor)?;

    let mut out = Encoder::with_capacity(256);
    out.str(ENTRY_DOMAIN)?;
    out.raw(entry.id.as_bytes());
    out.u64(entry.sequence);
    out.i64(entry.timestamp.timestamp());
    out.u32(entry.timestamp.timestamp_subsec_nanos());

    match entry.action_type {
        ActionType::Handler(action) => {
            out.u8(ACTION_HANDLER);
            out.u8(action.code());
        },
        ActionType::SystemEvent(name) => {
            out.u8(ACTION_SYSTEM);
            out.str(name)?;
        },
        ActionType::ConscienceEvent(name) => {
            out.u8(ACTION_CONSCIENCE);
            out.str(name)?;
        },
        ActionType::Error(kind) => {
            out.u8(ACTION_ERROR);
            out.str(kind)?;
        },
    }

    out.str(entry.actor)?;
    out.opt_str(entry.context.entity_id.as_deref())?;
    out.opt_str(entry.context.request_id.as_deref())?;
    out.len(entry.context.metadata.len())?;
    for (key, value) in &entry.context.metadata {
        out.str(key)?;
        match value {
            ContextValue::Bool(b) => {
                out.u8(b'b');
                out.u8(u8::from(*b));
            },
            ContextValue::Int(i) => {
                out.u8(b'i');
                out.i64(*i);
            },
            ContextValue::Str(s) => {
                out.u8(b's');
                out.str(s)?;
            },
        }
    }
    out.u8(entry.outcome.code());
    out.raw(entry.previous_hash.as_bytes());

    Ok(out.finish())
}

/// Hash canonical bytes under [`ENTRY_DOMAIN`].
#[must_use]
pub fn entry_hash(canonical: &[u8]) -> ContentHash {
    ContentHash::hash_with_domain(ENTRY_DOMAIN, canonical)
}

/// Canonicalize and hash in one step.
///
/// # Errors
///
/// See [`canonicalize`].
pub fn compute_entry_hash(entry: &CanonicalEntry<'_>) -> AuditResult<ContentHash> {
    canonicalize(entry).map(|bytes| entry_hash(&bytes))
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.raw(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.raw(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.raw(&v.to_be_bytes());
    }

    fn len(&mut self, len: usize) -> AuditResult<()> {
        let len = u32::try_from(len)
            .map_err(|_| AuditError::Encoding(format!("length {len} overflows u32")))?;
        self.u32(len);
        Ok(())
    }

    fn str(&mut self, s: &str) -> AuditResult<()> {
        self.len(s.len())?;
        self.raw(s.as_bytes());
        Ok(())
    }

    fn opt_str(&mut self, s: Option<&str>) -> AuditResult<()> {
        match s {
            None => self.u8(0),
            Some(s) => {
                self.u8(1);
                self.str(s)?;
            },
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::entry::HandlerAction;

    struct Owned {
        id: Uuid,
        timestamp: DateTime<Utc>,
        action_type: ActionType,
        actor: String,
        context: AuditContext,
        previous_hash: ContentHash,
    }

    impl Owned {
        fn sample() -> Self {
            Self {
                id: Uuid::from_u128(0x1234),
                timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
                action_type: ActionType::Handler(HandlerAction::Memorize),
                actor: "memorize_handler".into(),
                context: AuditContext::new()
                    .with_entity("thought-1")
                    .with_metadata("task_id", "task-9")
                    .with_metadata("attempt", 1i64),
                previous_hash: ContentHash::ZERO,
            }
        }

        fn view(&self, sequence: u64, outcome: Outcome) -> CanonicalEntry<'_> {
            CanonicalEntry {
                id: &self.id,
                sequence,
                timestamp: &self.timestamp,
                action_type: &self.action_type,
                actor: &self.actor,
                context: &self.context,
                outcome,
                previous_hash: &self.previous_hash,
            }
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let owned = Owned::sample();
        let a = canonicalize(&owned.view(3, Outcome::Success)).unwrap();
        let b = canonicalize(&owned.view(3, Outcome::Success)).unwrap();
        assert_eq!(a, b);
        assert_eq!(entry_hash(&a), entry_hash(&b));
    }

    #[test]
    fn test_metadata_insertion_order_does_not_matter() {
        let mut forward = BTreeMap::new();
        forward.insert("alpha".to_string(), ContextValue::Int(1));
        forward.insert("beta".to_string(), ContextValue::from("two"));
        forward.insert("gamma".to_string(), ContextValue::Bool(false));

        let mut reverse = BTreeMap::new();
        reverse.insert("gamma".to_string(), ContextValue::Bool(false));
        reverse.insert("beta".to_string(), ContextValue::from("two"));
        reverse.insert("alpha".to_string(), ContextValue::Int(1));

        let mut one = Owned::sample();
        one.context.metadata = forward;
        let mut two = Owned::sample();
        two.context.metadata = reverse;

        assert_eq!(
            compute_entry_hash(&one.view(0, Outcome::Start)).unwrap(),
            compute_entry_hash(&two.view(0, Outcome::Start)).unwrap()
        );
    }

    #[test]
    fn test_every_field_changes_the_hash() {
        let base = Owned::sample();
        let reference = compute_entry_hash(&base.view(5, Outcome::Success)).unwrap();

        assert_ne!(reference, compute_entry_hash(&base.view(6, Outcome::Success)).unwrap());
        assert_ne!(reference, compute_entry_hash(&base.view(5, Outcome::Failure)).unwrap());

        let mut changed = Owned::sample();
        changed.actor = "speak_handler".into();
        assert_ne!(reference, compute_entry_hash(&changed.view(5, Outcome::Success)).unwrap());

        let mut changed = Owned::sample();
        changed.previous_hash = ContentHash::hash_with_domain("test", b"x");
        assert_ne!(reference, compute_entry_hash(&changed.view(5, Outcome::Success)).unwrap());

        let mut changed = Owned::sample();
        changed.timestamp = changed.timestamp + chrono::Duration::nanoseconds(1);
        assert_ne!(reference, compute_entry_hash(&changed.view(5, Outcome::Success)).unwrap());

        let mut changed = Owned::sample();
        changed.context = changed.context.with_metadata("attempt", 2i64);
        assert_ne!(reference, compute_entry_hash(&changed.view(5, Outcome::Success)).unwrap());
    }

    #[test]
    fn test_value_types_are_distinguished() {
        let mut as_int = Owned::sample();
        as_int.context.metadata.clear();
        as_int.context.metadata.insert("v".into(), ContextValue::Int(1));
        let mut as_str = Owned::sample();
        as_str.context.metadata.clear();
        as_str.context.metadata.insert("v".into(), ContextValue::from("1"));
        let mut as_bool = Owned::sample();
        as_bool.context.metadata.clear();
        as_bool.context.metadata.insert("v".into(), ContextValue::Bool(true));

        let a = compute_entry_hash(&as_int.view(0, Outcome::Success)).unwrap();
        let b = compute_entry_hash(&as_str.view(0, Outcome::Success)).unwrap();
        let c = compute_entry_hash(&as_bool.view(0, Outcome::Success)).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_absent_and_empty_entity_differ() {
        let mut none = Owned::sample();
        none.context.entity_id = None;
        let mut empty = Owned::sample();
        empty.context.entity_id = Some(String::new());
        assert_ne!(
            canonicalize(&none.view(0, Outcome::Success)).unwrap(),
            canonicalize(&empty.view(0, Outcome::Success)).unwrap()
        );
    }

    #[test]
    fn test_domain_prefix_leads_the_encoding() {
        let owned = Owned::sample();
        let bytes = canonicalize(&owned.view(0, Outcome::Success)).unwrap();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(&bytes[4..4 + len], ENTRY_DOMAIN.as_bytes());
    }

    #[test]
    fn test_validate_rejects_oversized_content() {
        let fields = EntryFields::new(
            ActionType::SystemEvent("x".into()),
            "a".repeat(MAX_NAME_LEN + 1),
            AuditContext::new(),
            Outcome::Success,
        );
        assert!(matches!(validate_fields(&fields), Err(AuditError::Encoding(_))));

        let fields = EntryFields::new(
            ActionType::SystemEvent("x".into()),
            "system",
            AuditContext::new().with_metadata("blob", "z".repeat(MAX_VALUE_LEN + 1)),
            Outcome::Success,
        );
        assert!(matches!(validate_fields(&fields), Err(AuditError::Encoding(_))));

        let fields = EntryFields::new(
            ActionType::SystemEvent("x".into()),
            "",
            AuditContext::new(),
            Outcome::Success,
        );
        assert!(validate_fields(&fields).is_err());
    }

    #[test]
    fn test_validate_rejects_too_many_metadata_entries() {
        let mut context = AuditContext::new();
        for i in 0..=MAX_METADATA_ENTRIES {
            context = context.with_metadata(format!("k{i}"), i64::try_from(i).unwrap());
        }
        let fields = EntryFields::new(
            ActionType::Handler(HandlerAction::Tool),
            "tool_handler",
            context,
            Outcome::Success,
        );
        assert!(validate_fields(&fields).is_err());
    }
}
