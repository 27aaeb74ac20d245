//! Signing key management.
//!
//! The [`KeyManager`] owns the active Ed25519 key and the public half of
//! every key it has ever issued. The chain only references keys by
//! [`KeyId`].
//!
//! # Persistence
//!
//! A directory-backed manager keeps two files:
//!
//! - `active.key`: the raw 32-byte secret, mode `0600`, replaced atomically
//!   on rotation
//! - `keyring.json`: every [`KeyRecord`], so signatures by retired keys
//!   still verify after a restart
//!
//! On open, the key in `active.key` is the active key. Any other record
//! still marked active is retired, which also resolves a rotation that was
//! interrupted between the two writes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warden_crypto::{ContentHash, KeyId, KeyPair, PublicKey, Signature};

use crate::error::{AuditError, AuditResult};

const ACTIVE_KEY_FILE: &str = "active.key";
const KEYRING_FILE: &str = "keyring.json";

/// Public record of a key issued by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Fingerprint of the public key.
    pub key_id: KeyId,
    /// The public key.
    pub public_key: PublicKey,
    /// When the key was generated.
    pub created_at: DateTime<Utc>,
    /// When the key stopped signing. `None` for the active key.
    pub retired_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    fn new(public_key: PublicKey) -> Self {
        Self {
            key_id: public_key.key_id(),
            public_key,
            created_at: Utc::now(),
            retired_at: None,
        }
    }

    /// Whether this key still signs.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }
}

#[derive(Debug, Clone)]
enum Backing {
    Memory,
    Directory(PathBuf),
}

struct KeyState {
    active: Option<KeyPair>,
    /// Oldest first.
    records: Vec<KeyRecord>,
}

impl KeyState {
    fn active_record(&self) -> Option<&KeyRecord> {
        let id = self.active.as_ref()?.key_id();
        self.records.iter().find(|r| r.key_id == id)
    }
}

/// Holds the active signing key and the history of public keys.
pub struct KeyManager {
    state: RwLock<KeyState>,
    /// Serialises rotations so the state lock is only taken for the swap.
    rotation: Mutex<()>,
    backing: Backing,
}

impl KeyManager {
    /// A manager whose keys live only in memory, starting with a fresh key.
    ///
    /// Signatures will not verify in another process.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::from_keypair(KeyPair::generate())
    }

    /// An in-memory manager using `keypair` as the active key.
    #[must_use]
    pub fn from_keypair(keypair: KeyPair) -> Self {
        let record = KeyRecord::new(keypair.public_key());
        Self {
            state: RwLock::new(KeyState {
                active: Some(keypair),
                records: vec![record],
            }),
            rotation: Mutex::new(()),
            backing: Backing::Memory,
        }
    }

    /// A manager that can verify but never sign.
    ///
    /// [`active_key`](Self::active_key) and [`sign`](Self::sign) fail with
    /// [`AuditError::NoActiveKey`].
    #[must_use]
    pub fn verify_only(records: Vec<KeyRecord>) -> Self {
        Self {
            state: RwLock::new(KeyState {
                active: None,
                records,
            }),
            rotation: Mutex::new(()),
            backing: Backing::Memory,
        }
    }

    /// Load the public key ring from `directory` without touching the
    /// secret key.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::KeyStore`] if the key ring is missing or
    /// unreadable.
    pub fn verify_only_from_dir(directory: impl AsRef<Path>) -> AuditResult<Self> {
        let path = directory.as_ref().join(KEYRING_FILE);
        if !path.exists() {
            return Err(AuditError::KeyStore(format!(
                "no key ring at {}",
                path.display()
            )));
        }
        Ok(Self::verify_only(read_keyring(&path)?))
    }

    /// Open (or initialise) a key directory.
    ///
    /// Generates `active.key` if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Crypto`] if the key file is invalid, and
    /// [`AuditError::KeyStore`] if the key ring cannot be read or written.
    pub fn open(directory: impl AsRef<Path>) -> AuditResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            AuditError::KeyStore(format!("creating {}: {e}", directory.display()))
        })?;

        let keyring_path = directory.join(KEYRING_FILE);
        let mut records = if keyring_path.exists() {
            read_keyring(&keyring_path)?
        } else {
            Vec::new()
        };

        let (keypair, created) = KeyPair::load_or_generate(directory.join(ACTIVE_KEY_FILE))?;
        let active_id = keypair.key_id();

        let now = Utc::now();
        for record in &mut records {
            if record.key_id != active_id && record.retired_at.is_none() {
                warn!(key_id = %record.key_id, "Retiring key that no longer matches active.key");
                record.retired_at = Some(now);
            }
        }
        match records.iter_mut().find(|r| r.key_id == active_id) {
            Some(record) => record.retired_at = None,
            None => records.push(KeyRecord::new(keypair.public_key())),
        }
        write_keyring(&keyring_path, &records)?;

        if created {
            info!(key_id = %active_id, dir = %directory.display(), "Generated audit signing key");
        } else {
            info!(key_id = %active_id, dir = %directory.display(), "Loaded audit signing key");
        }

        Ok(Self {
            state: RwLock::new(KeyState {
                active: Some(keypair),
                records,
            }),
            rotation: Mutex::new(()),
            backing: Backing::Directory(directory),
        })
    }

    /// The record of the key currently used for signing.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NoActiveKey`] if no key is provisioned.
    pub fn active_key(&self) -> AuditResult<KeyRecord> {
        let state = self.read()?;
        state.active_record().cloned().ok_or(AuditError::NoActiveKey)
    }

    /// Retire the active key and activate a freshly generated one.
    ///
    /// Retired public keys are kept indefinitely. The new key is written to
    /// disk before it becomes active; signing is only paused for the swap.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NoActiveKey`] for a verify-only manager, or a
    /// key store error if the new key cannot be persisted. On error the
    /// previous key stays active.
    pub fn rotate_key(&self) -> AuditResult<KeyRecord> {
        let _rotating = self
            .rotation
            .lock()
            .map_err(|e| AuditError::KeyStore(e.to_string()))?;
        let (old_id, mut records) = {
            let state = self.read()?;
            let old_id = state
                .active
                .as_ref()
                .map(KeyPair::key_id)
                .ok_or(AuditError::NoActiveKey)?;
            (old_id, state.records.clone())
        };

        let next = KeyPair::generate();
        let next_record = KeyRecord::new(next.public_key());
        let now = next_record.created_at;
        for record in &mut records {
            if record.key_id == old_id {
                record.retired_at = Some(now);
            }
        }
        records.push(next_record.clone());

        if let Backing::Directory(dir) = &self.backing {
            // Key ring first: a crash before the key file is replaced leaves
            // the old key active and the new record retired on next open.
            write_keyring(&dir.join(KEYRING_FILE), &records)?;
            next.store(dir.join(ACTIVE_KEY_FILE))?;
        }

        {
            let mut state = self.write()?;
            state.records = records;
            state.active = Some(next);
        }

        info!(old_key = %old_id, new_key = %next_record.key_id, "Rotated audit signing key");
        Ok(next_record)
    }

    /// Public key for `key_id`, active or retired.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::UnknownKey`] if this manager never issued it.
    pub fn public_key_for(&self, key_id: &KeyId) -> AuditResult<PublicKey> {
        let state = self.read()?;
        state
            .records
            .iter()
            .find(|r| &r.key_id == key_id)
            .map(|r| r.public_key)
            .ok_or_else(|| AuditError::UnknownKey {
                key_id: key_id.to_string(),
            })
    }

    /// Sign an entry hash with the active key.
    ///
    /// Holds the key lock for the whole operation, so a concurrent
    /// rotation cannot change the key between choosing it and signing.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NoActiveKey`] if no key is provisioned.
    pub fn sign(&self, entry_hash: &ContentHash) -> AuditResult<(KeyId, Signature)> {
        let state = self.read()?;
        let keypair = state.active.as_ref().ok_or(AuditError::NoActiveKey)?;
        Ok((keypair.key_id(), keypair.sign(entry_hash.as_bytes())))
    }

    /// Every key ever issued, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::KeyStore`] if the key lock is poisoned.
    pub fn records(&self) -> AuditResult<Vec<KeyRecord>> {
        Ok(self.read()?.records.clone())
    }

    /// Whether keys survive a restart.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.backing, Backing::Directory(_))
    }

    fn read(&self) -> AuditResult<std::sync::RwLockReadGuard<'_, KeyState>> {
        self.state
            .read()
            .map_err(|e| AuditError::KeyStore(e.to_string()))
    }

    fn write(&self) -> AuditResult<std::sync::RwLockWriteGuard<'_, KeyState>> {
        self.state
            .write()
            .map_err(|e| AuditError::KeyStore(e.to_string()))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

fn read_keyring(path: &Path) -> AuditResult<Vec<KeyRecord>> {
    let bytes = fs::read(path)
        .map_err(|e| AuditError::KeyStore(format!("reading {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuditError::KeyStore(format!("parsing {}: {e}", path.display())))
}

/// Write-then-rename so readers never see a half-written key ring.
fn write_keyring(path: &Path, records: &[KeyRecord]) -> AuditResult<()> {
    let json = serde_json::to_vec_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)
        .map_err(|e| AuditError::KeyStore(format!("creating {}: {e}", tmp.display())))?;
    file.write_all(&json)
        .and_then(|()| file.sync_all())
        .map_err(|e| AuditError::KeyStore(format!("writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| AuditError::KeyStore(format!("installing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(tag: &[u8]) -> ContentHash {
        ContentHash::hash_with_domain("warden.test", tag)
    }

    #[test]
    fn test_ephemeral_has_active_key() {
        let keys = KeyManager::ephemeral();
        let active = keys.active_key().unwrap();
        assert!(active.is_active());
        assert_eq!(keys.records().unwrap().len(), 1);
        assert!(!keys.is_persistent());
    }

    #[test]
    fn test_sign_verifies_with_public_key_for() {
        let keys = KeyManager::ephemeral();
        let hash = digest(b"entry");
        let (key_id, signature) = keys.sign(&hash).unwrap();
        let public = keys.public_key_for(&key_id).unwrap();
        assert!(public.verify(hash.as_bytes(), &signature).is_ok());
    }

    #[test]
    fn test_rotation_keeps_retired_keys() {
        let keys = KeyManager::ephemeral();
        let hash = digest(b"before");
        let (old_id, old_sig) = keys.sign(&hash).unwrap();

        let new_record = keys.rotate_key().unwrap();
        assert_ne!(new_record.key_id, old_id);
        assert_eq!(keys.active_key().unwrap().key_id, new_record.key_id);

        let records = keys.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].retired_at.is_some());
        assert!(records[1].retired_at.is_none());

        let old_public = keys.public_key_for(&old_id).unwrap();
        assert!(old_public.verify(hash.as_bytes(), &old_sig).is_ok());

        let (signer, _) = keys.sign(&digest(b"after")).unwrap();
        assert_eq!(signer, new_record.key_id);
    }

    #[test]
    fn test_failed_rotation_keeps_active_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path().join("keys")).unwrap();
        let before = keys.active_key().unwrap();
        fs::remove_dir_all(dir.path().join("keys")).unwrap();

        assert!(matches!(keys.rotate_key(), Err(AuditError::KeyStore(_))));
        assert_eq!(keys.active_key().unwrap(), before);
        assert_eq!(keys.records().unwrap().len(), 1);
        let (signer, _) = keys.sign(&digest(b"still signing")).unwrap();
        assert_eq!(signer, before.key_id);
    }

    #[test]
    fn test_signing_during_directory_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path()).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..5 {
                    keys.rotate_key().unwrap();
                }
            });
            for i in 0..200u32 {
                let hash = digest(&i.to_le_bytes());
                let (key_id, signature) = keys.sign(&hash).unwrap();
                let public = keys.public_key_for(&key_id).unwrap();
                assert!(public.verify(hash.as_bytes(), &signature).is_ok());
            }
        });

        let records = keys.records().unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.iter().filter(|r| r.is_active()).count(), 1);
        let reopened = KeyManager::open(dir.path()).unwrap();
        assert_eq!(reopened.active_key().unwrap(), keys.active_key().unwrap());
    }

    #[test]
    fn test_unknown_key() {
        let keys = KeyManager::ephemeral();
        let stranger = KeyPair::generate().key_id();
        assert!(matches!(
            keys.public_key_for(&stranger),
            Err(AuditError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_verify_only_cannot_sign_or_rotate() {
        let source = KeyManager::ephemeral();
        let keys = KeyManager::verify_only(source.records().unwrap());
        assert!(matches!(keys.active_key(), Err(AuditError::NoActiveKey)));
        assert!(matches!(keys.sign(&digest(b"x")), Err(AuditError::NoActiveKey)));
        assert!(matches!(keys.rotate_key(), Err(AuditError::NoActiveKey)));

        let id = source.active_key().unwrap().key_id;
        assert!(keys.public_key_for(&id).is_ok());
    }

    #[test]
    fn test_directory_key_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = KeyManager::open(dir.path()).unwrap();
        let id = first.active_key().unwrap().key_id;
        assert!(first.is_persistent());
        drop(first);

        let second = KeyManager::open(dir.path()).unwrap();
        assert_eq!(second.active_key().unwrap().key_id, id);
        assert_eq!(second.records().unwrap().len(), 1);
    }

    #[test]
    fn test_directory_rotation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path()).unwrap();
        let hash = digest(b"old");
        let (old_id, old_sig) = keys.sign(&hash).unwrap();
        let new_record = keys.rotate_key().unwrap();
        drop(keys);

        let reopened = KeyManager::open(dir.path()).unwrap();
        assert_eq!(reopened.active_key().unwrap().key_id, new_record.key_id);
        let old_public = reopened.public_key_for(&old_id).unwrap();
        assert!(old_public.verify(hash.as_bytes(), &old_sig).is_ok());
    }

    #[test]
    fn test_replaced_key_file_retires_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let old_id = KeyManager::open(dir.path()).unwrap().active_key().unwrap().key_id;

        KeyPair::generate().store(dir.path().join(ACTIVE_KEY_FILE)).unwrap();
        let keys = KeyManager::open(dir.path()).unwrap();

        let records = keys.records().unwrap();
        assert_eq!(records.len(), 2);
        let old = records.iter().find(|r| r.key_id == old_id).unwrap();
        assert!(old.retired_at.is_some());
        assert_ne!(keys.active_key().unwrap().key_id, old_id);
    }

    #[test]
    fn test_verify_only_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let id = KeyManager::open(dir.path()).unwrap().active_key().unwrap().key_id;

        let keys = KeyManager::verify_only_from_dir(dir.path()).unwrap();
        assert!(keys.public_key_for(&id).is_ok());
        assert!(keys.active_key().is_err());

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            KeyManager::verify_only_from_dir(empty.path()),
            Err(AuditError::KeyStore(_))
        ));
    }
}
