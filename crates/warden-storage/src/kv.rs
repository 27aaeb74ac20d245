//! Namespaced key-value store trait and implementations.
//!
//! Keys live inside a namespace. Both backends order keys bytewise within
//! a namespace, so fixed-width keys (e.g. zero-padded sequence numbers)
//! come back from [`KvStore::scan`] in numeric order.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_namespace(namespace: &str) -> StorageResult<()> {
    if namespace.is_empty() {
        return Err(StorageError::InvalidKey(
            "namespace must not be empty".into(),
        ));
    }
    if namespace.contains('\0') {
        return Err(StorageError::InvalidKey(
            "namespace must not contain null bytes".into(),
        ));
    }
    Ok(())
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    if key.contains('\0') {
        return Err(StorageError::InvalidKey(
            "key must not contain null bytes".into(),
        ));
    }
    Ok(())
}

/// `"{namespace}\0{key}"` as bytes.
fn composite_key(namespace: &str, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len().saturating_add(key.len()).saturating_add(1));
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key.as_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Raw key-value store.
///
/// Writes are durable once the returned future resolves `Ok`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value. `None` if the key does not exist.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Set a value, overwriting any existing one.
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Insert a value only if the key is absent.
    ///
    /// Returns `false`, writing nothing, when the key already exists. The
    /// check and the write are one atomic step.
    async fn insert_new(&self, namespace: &str, key: &str, value: Vec<u8>)
    -> StorageResult<bool>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Up to `limit` entries with `start <= key < end`, in ascending key
    /// order.
    async fn scan(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Flush pending writes and release the backend.
    ///
    /// The store must not be used afterwards.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory store for tests and ephemeral chains.
///
/// Keys are held as composite `"{namespace}\0{key}"` bytes in a `BTreeMap`,
/// giving the same ordering as the persistent backend.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
        StorageError::Internal(e.to_string())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let data = self.data.read().map_err(Self::poisoned)?;
        Ok(data.get(&composite_key(namespace, key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.insert(composite_key(namespace, key), value);
        Ok(())
    }

    async fn insert_new(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let mut data = self.data.write().map_err(Self::poisoned)?;
        match data.entry(composite_key(namespace, key)) {
            std::collections::btree_map::Entry::Occupied(_) => Ok(false),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            },
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let mut data = self.data.write().map_err(Self::poisoned)?;
        Ok(data.remove(&composite_key(namespace, key)).is_some())
    }

    async fn scan(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>> {
        validate_namespace(namespace)?;
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }
        let lower = composite_key(namespace, start);
        let upper = composite_key(namespace, end);
        let prefix_len = namespace.len().saturating_add(1);

        let data = self.data.read().map_err(Self::poisoned)?;
        Ok(data
            .range(lower..upper)
            .filter_map(|(k, v)| {
                let key = std::str::from_utf8(k.get(prefix_len..)?).ok()?;
                Some((key.to_owned(), v.clone()))
            })
            .take(limit)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SurrealKV implementation (behind `kv` feature)
// ---------------------------------------------------------------------------

/// Persistent store backed by `SurrealKV`.
///
/// Every call runs in its own transaction. Writes commit before returning.
#[cfg(feature = "kv")]
pub struct SurrealKvStore {
    tree: surrealkv::Tree,
}

#[cfg(feature = "kv")]
impl std::fmt::Debug for SurrealKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealKvStore").finish_non_exhaustive()
    }
}

#[cfg(feature = "kv")]
impl SurrealKvStore {
    /// Open (or create) a store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the store cannot be opened.
    pub fn open(path: impl AsRef<std::path::Path>) -> StorageResult<Self> {
        let tree = surrealkv::TreeBuilder::new()
            .with_path(path.as_ref().to_path_buf())
            .build()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        tracing::debug!(path = %path.as_ref().display(), "Opened SurrealKV store");
        Ok(Self { tree })
    }
}

#[cfg(feature = "kv")]
fn map_kv_err(e: &surrealkv::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[cfg(feature = "kv")]
#[async_trait]
impl KvStore for SurrealKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(|ref e| map_kv_err(e))?;
        tx.get(&composite_key(namespace, key))
            .map_err(|ref e| map_kv_err(e))
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let mut tx = self.tree.begin().map_err(|ref e| map_kv_err(e))?;
        tx.set(&composite_key(namespace, key), &value)
            .map_err(|ref e| map_kv_err(e))?;
        tx.commit().await.map_err(|ref e| map_kv_err(e))
    }

    async fn insert_new(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let ck = composite_key(namespace, key);
        let mut tx = self.tree.begin().map_err(|ref e| map_kv_err(e))?;
        if tx.get(&ck).map_err(|ref e| map_kv_err(e))?.is_some() {
            return Ok(false);
        }
        tx.set(&ck, &value).map_err(|ref e| map_kv_err(e))?;
        // A concurrent writer of the same key makes this commit fail.
        tx.commit().await.map_err(|ref e| map_kv_err(e))?;
        Ok(true)
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let ck = composite_key(namespace, key);
        let mut tx = self.tree.begin().map_err(|ref e| map_kv_err(e))?;
        let existed = tx.get(&ck).map_err(|ref e| map_kv_err(e))?.is_some();
        if existed {
            tx.delete(&ck).map_err(|ref e| map_kv_err(e))?;
            tx.commit().await.map_err(|ref e| map_kv_err(e))?;
        }
        Ok(existed)
    }

    async fn scan(
        &self,
        namespace: &str,
        start: &str,
        end: &str,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>> {
        validate_namespace(namespace)?;
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }
        let lower = composite_key(namespace, start);
        let upper = composite_key(namespace, end);
        let prefix_len = namespace.len().saturating_add(1);

        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(|ref e| map_kv_err(e))?;

        let raw_keys = {
            let mut iter = tx.range(&lower, &upper).map_err(|ref e| map_kv_err(e))?;
            iter.seek_first().map_err(|ref e| map_kv_err(e))?;
            let mut keys = Vec::new();
            while iter.valid() && keys.len() < limit {
                keys.push(iter.key());
                iter.next().map_err(|ref e| map_kv_err(e))?;
            }
            keys
        };

        let mut out = Vec::with_capacity(raw_keys.len());
        for raw in raw_keys {
            let Some(value) = tx.get(&raw).map_err(|ref e| map_kv_err(e))? else {
                continue;
            };
            if let Some(key) = raw
                .get(prefix_len..)
                .and_then(|k| std::str::from_utf8(k).ok())
            {
                out.push((key.to_owned(), value));
            }
        }
        Ok(out)
    }

    async fn close(&self) -> StorageResult<()> {
        self.tree
            .close()
            .await
            .map_err(|ref e| map_kv_err(e))?;
        tracing::debug!("Closed SurrealKV store");
        Ok(())
    }
}
