//! Audit entry storage trait and key-value implementation.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;
use warden_storage::{KvStore, MemoryKvStore};

use crate::anchor::RootAnchor;
use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};

/// A committed row as found in storage.
///
/// `sequence` comes from the row's storage key, so a row whose content was
/// rewritten still has a trustworthy position.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Sequence named by the storage key.
    pub sequence: u64,
    /// The decoded entry, or why it no longer decodes.
    pub entry: Result<AuditEntry, String>,
}

impl StoredRow {
    /// The decoded entry, if the row still decodes.
    #[must_use]
    pub fn entry(&self) -> Option<&AuditEntry> {
        self.entry.as_ref().ok()
    }

    /// The decoded entry, or [`AuditError::Corrupt`].
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Corrupt`] if the row does not decode.
    pub fn into_entry(self) -> AuditResult<AuditEntry> {
        let sequence = self.sequence;
        self.entry
            .map_err(|reason| AuditError::Corrupt { sequence, reason })
    }
}

/// Storage collaborator for the chain.
///
/// Implementations must be thread-safe and:
/// - make an entry durable before `persist_entry` returns `Ok`
/// - refuse a second entry for an already committed sequence
/// - return rows in ascending key order
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably persist a fully formed entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SequenceTaken`] if another entry holds the
    /// sequence, or another error if the entry was not committed.
    async fn persist_entry(&self, entry: &AuditEntry) -> AuditResult<()>;

    /// Up to `limit` rows whose key sequence is in `range`, ascending.
    ///
    /// Rows that no longer decode are returned, not skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if retrieval fails.
    async fn read_rows(&self, range: Range<u64>, limit: usize) -> AuditResult<Vec<StoredRow>>;

    /// The row with the highest key.
    ///
    /// # Errors
    ///
    /// Returns an error if retrieval fails.
    async fn last_row(&self) -> AuditResult<Option<StoredRow>>;

    /// Look up an entry by id.
    ///
    /// # Errors
    ///
    /// Returns an error if retrieval or deserialization fails.
    async fn get_entry(&self, id: &Uuid) -> AuditResult<Option<AuditEntry>>;

    /// Persist a Merkle root anchor.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be written.
    async fn persist_anchor(&self, anchor: &RootAnchor) -> AuditResult<()>;

    /// All anchors, ascending by start sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if retrieval or deserialization fails.
    async fn read_anchors(&self) -> AuditResult<Vec<RootAnchor>>;

    /// Release the backing store. Nothing may be read or written after.
    ///
    /// # Errors
    ///
    /// Returns an error if pending writes cannot be flushed.
    async fn close(&self) -> AuditResult<()> {
        Ok(())
    }

    /// Every entry with a sequence in `range`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Corrupt`] at the first row that does not
    /// decode, or an error if retrieval fails.
    async fn read_entries(&self, range: Range<u64>) -> AuditResult<Vec<AuditEntry>> {
        self.read_rows(range, usize::MAX)
            .await?
            .into_iter()
            .map(StoredRow::into_entry)
            .collect()
    }

    /// The entry with the highest sequence.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Corrupt`] if that row does not decode, or an
    /// error if retrieval fails.
    async fn latest_entry(&self) -> AuditResult<Option<AuditEntry>> {
        self.last_row().await?.map(StoredRow::into_entry).transpose()
    }
}

// -- Namespace constants --

const NS_ENTRIES: &str = "audit:entries";
const NS_IDS: &str = "audit:ids";
const NS_ANCHORS: &str = "audit:anchors";
const NS_META: &str = "audit:meta";
const META_HEAD: &str = "head";

/// Fixed-width key so byte order is numeric order. `u64::MAX` has 20 digits.
fn sequence_key(sequence: u64) -> String {
    format!("{sequence:020}")
}

fn parse_sequence_key(key: &str) -> AuditResult<u64> {
    key.parse()
        .map_err(|_| AuditError::Storage(format!("malformed sequence key '{key}'")))
}

/// [`AuditStore`] over any namespaced [`KvStore`].
///
/// Layout:
/// - `audit:entries/{sequence:020}` → entry JSON, written with
///   [`KvStore::insert_new`] so a sequence can only be taken once
/// - `audit:ids/{uuid}` → sequence key
/// - `audit:anchors/{sequence_start:020}` → anchor JSON
/// - `audit:meta/head` → hint for the latest sequence
pub struct KvAuditStore {
    kv: Arc<dyn KvStore>,
}

impl KvAuditStore {
    /// Wrap a key-value store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Store backed by process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    /// Open a persistent `SurrealKV` store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    #[cfg(feature = "kv")]
    pub fn open(path: impl AsRef<std::path::Path>) -> AuditResult<Self> {
        let kv = warden_storage::SurrealKvStore::open(path)?;
        Ok(Self::new(Arc::new(kv)))
    }

    /// The underlying key-value store.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    async fn head_hint(&self) -> u64 {
        match self.kv.get(NS_META, META_HEAD).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to read audit head hint");
                0
            },
        }
    }
}

fn decode_entry(bytes: &[u8]) -> AuditResult<AuditEntry> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_row(key: &str, bytes: &[u8]) -> Option<StoredRow> {
    let Ok(sequence) = parse_sequence_key(key) else {
        warn!(key, "Ignoring audit row with a malformed key");
        return None;
    };
    Some(StoredRow {
        sequence,
        entry: serde_json::from_slice(bytes).map_err(|e| e.to_string()),
    })
}

#[async_trait]
impl AuditStore for KvAuditStore {
    async fn persist_entry(&self, entry: &AuditEntry) -> AuditResult<()> {
        let key = sequence_key(entry.sequence);
        let data = serde_json::to_vec(entry)?;

        // The id index goes first. A dangling index left by a failed insert
        // is ignored by `get_entry`, which checks the id it finds.
        self.kv
            .set(NS_IDS, &entry.id.to_string(), key.clone().into_bytes())
            .await?;

        if !self.kv.insert_new(NS_ENTRIES, &key, data).await? {
            return Err(AuditError::SequenceTaken {
                sequence: entry.sequence,
            });
        }

        if let Err(e) = self.kv.set(NS_META, META_HEAD, key.into_bytes()).await {
            warn!(sequence = entry.sequence, error = %e, "Failed to update audit head hint");
        }
        Ok(())
    }

    async fn read_rows(&self, range: Range<u64>, limit: usize) -> AuditResult<Vec<StoredRow>> {
        if range.start >= range.end || limit == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .kv
            .scan(
                NS_ENTRIES,
                &sequence_key(range.start),
                &sequence_key(range.end),
                limit,
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|(key, bytes)| decode_row(key, bytes))
            .collect())
    }

    async fn last_row(&self) -> AuditResult<Option<StoredRow>> {
        // The hint can lag behind but never runs ahead, so scan from it.
        let hint = self.head_hint().await;
        let mut rows = self
            .kv
            .scan(NS_ENTRIES, &sequence_key(hint), &sequence_key(u64::MAX), usize::MAX)
            .await?;
        if rows.is_empty() && hint > 0 {
            rows = self
                .kv
                .scan(NS_ENTRIES, &sequence_key(0), &sequence_key(u64::MAX), usize::MAX)
                .await?;
        }
        Ok(rows
            .iter()
            .rev()
            .find_map(|(key, bytes)| decode_row(key, bytes)))
    }

    async fn get_entry(&self, id: &Uuid) -> AuditResult<Option<AuditEntry>> {
        let Some(key) = self.kv.get(NS_IDS, &id.to_string()).await? else {
            return Ok(None);
        };
        let key = String::from_utf8(key)
            .map_err(|e| AuditError::Storage(format!("malformed id index: {e}")))?;
        let sequence = parse_sequence_key(&key)?;

        match self.kv.get(NS_ENTRIES, &key).await? {
            Some(bytes) => {
                let entry = decode_entry(&bytes).map_err(|e| AuditError::Corrupt {
                    sequence,
                    reason: e.to_string(),
                })?;
                Ok((entry.id == *id).then_some(entry))
            },
            None => Ok(None),
        }
    }

    async fn persist_anchor(&self, anchor: &RootAnchor) -> AuditResult<()> {
        let data = serde_json::to_vec(anchor)?;
        self.kv
            .set(NS_ANCHORS, &sequence_key(anchor.sequence_start), data)
            .await?;
        Ok(())
    }

    async fn read_anchors(&self) -> AuditResult<Vec<RootAnchor>> {
        let rows = self
            .kv
            .scan(NS_ANCHORS, &sequence_key(0), &sequence_key(u64::MAX), usize::MAX)
            .await?;
        rows.iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }

    async fn close(&self) -> AuditResult<()> {
        Ok(self.kv.close().await?)
    }
}

impl std::fmt::Debug for KvAuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvAuditStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use warden_crypto::{ContentHash, Signature};

    use super::*;
    use crate::codec::compute_entry_hash;
    use crate::entry::{ActionType, AuditContext, HandlerAction, Outcome};
    use crate::keys::KeyManager;

    /// Build a correctly hashed and signed entry linked to `previous`.
    pub(crate) fn signed_entry(
        keys: &KeyManager,
        sequence: u64,
        previous: ContentHash,
        action: HandlerAction,
    ) -> AuditEntry {
        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            action_type: ActionType::Handler(action),
            actor: "test_handler".into(),
            context: AuditContext::new().with_entity("thought-1"),
            outcome: Outcome::Success,
            previous_hash: previous,
            entry_hash: ContentHash::ZERO,
            signature: Signature::from_bytes([0u8; 64]),
            signing_key_id: keys.active_key().unwrap().key_id,
        };
        entry.entry_hash = compute_entry_hash(&entry.canonical()).unwrap();
        let (key_id, signature) = keys.sign(&entry.entry_hash).unwrap();
        entry.signature = signature;
        entry.signing_key_id = key_id;
        entry
    }

    pub(crate) fn chain(keys: &KeyManager, len: u64) -> Vec<AuditEntry> {
        let mut previous = ContentHash::ZERO;
        (0..len)
            .map(|seq| {
                let entry = signed_entry(keys, seq, previous, HandlerAction::Speak);
                previous = entry.entry_hash;
                entry
            })
            .collect()
    }

    #[tokio::test]
    async fn test_persist_and_read_range() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        for entry in chain(&keys, 5) {
            store.persist_entry(&entry).await.unwrap();
        }

        let middle = store.read_entries(1..4).await.unwrap();
        let sequences: Vec<u64> = middle.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        assert!(store.read_entries(3..3).await.unwrap().is_empty());
        assert_eq!(store.read_entries(0..u64::MAX).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        let first = signed_entry(&keys, 0, ContentHash::ZERO, HandlerAction::Speak);
        let rival = signed_entry(&keys, 0, ContentHash::ZERO, HandlerAction::Tool);

        store.persist_entry(&first).await.unwrap();
        assert!(matches!(
            store.persist_entry(&rival).await,
            Err(AuditError::SequenceTaken { sequence: 0 })
        ));

        let stored = store.read_entries(0..1).await.unwrap();
        assert_eq!(stored[0].id, first.id);
        // The rival's id index dangles but resolves to nothing.
        assert!(store.get_entry(&rival.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_entry() {
        let store = KvAuditStore::in_memory();
        assert!(store.latest_entry().await.unwrap().is_none());

        let keys = KeyManager::ephemeral();
        for entry in chain(&keys, 3) {
            store.persist_entry(&entry).await.unwrap();
        }
        assert_eq!(store.latest_entry().await.unwrap().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_latest_entry_ignores_stale_hint() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        for entry in chain(&keys, 3) {
            store.persist_entry(&entry).await.unwrap();
        }
        store
            .kv()
            .set(NS_META, META_HEAD, sequence_key(0).into_bytes())
            .await
            .unwrap();
        assert_eq!(store.latest_entry().await.unwrap().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_get_entry_by_id() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        let entries = chain(&keys, 2);
        for entry in &entries {
            store.persist_entry(entry).await.unwrap();
        }
        let found = store.get_entry(&entries[1].id).await.unwrap().unwrap();
        assert_eq!(found, entries[1]);
        assert!(store.get_entry(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_anchors_round_trip_in_order() {
        let store = KvAuditStore::in_memory();
        for start in [20u64, 0, 10] {
            store
                .persist_anchor(&RootAnchor {
                    sequence_start: start,
                    sequence_end: start + 9,
                    root_hash: ContentHash::ZERO,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let starts: Vec<u64> = store
            .read_anchors()
            .await
            .unwrap()
            .iter()
            .map(|a| a.sequence_start)
            .collect();
        assert_eq!(starts, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_rows_keep_undecodable_entries() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        for entry in chain(&keys, 3) {
            store.persist_entry(&entry).await.unwrap();
        }
        store
            .kv()
            .set(NS_ENTRIES, &sequence_key(1), b"{\"outcome\":\"approved\"}".to_vec())
            .await
            .unwrap();

        let rows = store.read_rows(0..u64::MAX, usize::MAX).await.unwrap();
        let sequences: Vec<u64> = rows.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(rows[0].entry().is_some());
        assert!(rows[1].entry.is_err());

        assert!(matches!(
            store.read_entries(0..3).await,
            Err(AuditError::Corrupt { sequence: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_rows_take_sequence_from_key() {
        let store = KvAuditStore::in_memory();
        let keys = KeyManager::ephemeral();
        let mut entries = chain(&keys, 3);
        for entry in &entries {
            store.persist_entry(entry).await.unwrap();
        }
        entries[2].sequence = 1 << 40;
        store
            .kv()
            .set(NS_ENTRIES, &sequence_key(2), serde_json::to_vec(&entries[2]).unwrap())
            .await
            .unwrap();

        let last = store.last_row().await.unwrap().unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(last.entry().unwrap().sequence, 1 << 40);

        let batch = store.read_rows(1..u64::MAX, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence, 1);
    }
}
