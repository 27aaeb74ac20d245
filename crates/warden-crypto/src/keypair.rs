//! Ed25519 signing keys and their on-disk form.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::key_id::KeyId;
use crate::signature::Signature;

const SECRET_LEN: usize = 32;

fn io_err(context: &str, path: &Path, e: &std::io::Error) -> CryptoError {
    CryptoError::KeyFile(format!("{context} {}: {e}", path.display()))
}

/// An Ed25519 key pair whose secret half is wiped on drop.
///
/// `Debug` prints only the key id.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
        }
    }

    /// Rebuild a key pair from its 32 secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `bytes` is not 32 bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let mut secret: [u8; SECRET_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SECRET_LEN,
                    actual: bytes.len(),
                })?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
        })
    }

    /// The shareable public half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.verifying_key.to_bytes())
    }

    /// Fingerprint of the public half.
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        KeyId::for_public_key(&self.public_key())
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from(self.signing_key.sign(message))
    }

    /// Load the key stored at `path`, creating a new one if the file does
    /// not exist yet.
    ///
    /// Returns the key pair and whether it was freshly created.
    ///
    /// # Security
    ///
    /// - New files are created with `O_CREAT | O_EXCL` and mode `0600` on
    ///   Unix, so there is no window where the secret is world readable.
    /// - Symlinked key files are refused.
    /// - Read buffers are wrapped in [`Zeroizing`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] on I/O failures or a symlinked path,
    /// and [`CryptoError::InvalidKeyLength`] if the file is not 32 bytes.
    pub fn load_or_generate(path: impl AsRef<Path>) -> CryptoResult<(Self, bool)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("creating", parent, &e))?;
        }

        let keypair = Self::generate();
        match create_secret_file(path) {
            Ok(mut file) => {
                let secret = Zeroizing::new(keypair.signing_key.to_bytes());
                file.write_all(secret.as_slice())
                    .and_then(|()| file.sync_all())
                    .map_err(|e| io_err("writing", path, &e))?;
                Ok((keypair, true))
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok((Self::load(path)?, false))
            },
            Err(e) => Err(io_err("creating", path, &e)),
        }
    }

    /// Load an existing key file.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] if the file is missing, unreadable
    /// or a symlink, and [`CryptoError::InvalidKeyLength`] if it is not
    /// 32 bytes.
    pub fn load(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        let meta = fs::symlink_metadata(path).map_err(|e| io_err("inspecting", path, &e))?;
        if meta.file_type().is_symlink() {
            return Err(CryptoError::KeyFile(format!(
                "refusing to read key file {}: path is a symlink",
                path.display()
            )));
        }
        let bytes = Zeroizing::new(fs::read(path).map_err(|e| io_err("reading", path, &e))?);
        Self::from_secret_bytes(&bytes)
    }

    /// Atomically replace the key file at `path` with this key.
    ///
    /// The secret is written to a sibling temporary file (mode `0600`),
    /// synced, then renamed over `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] on any I/O failure.
    pub fn store(&self, path: impl AsRef<Path>) -> CryptoResult<()> {
        let path = path.as_ref();
        let tmp = staging_path(path);
        // A stale staging file from an interrupted rotation is discarded.
        match fs::remove_file(&tmp) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(io_err("removing", &tmp, &e)),
        }

        let mut file = create_secret_file(&tmp).map_err(|e| io_err("creating", &tmp, &e))?;
        let secret = Zeroizing::new(self.signing_key.to_bytes());
        file.write_all(secret.as_slice())
            .and_then(|()| file.sync_all())
            .map_err(|e| io_err("writing", &tmp, &e))?;
        fs::rename(&tmp, path).map_err(|e| io_err("installing", path, &e))
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn create_secret_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_secret_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 public key. Serializes as base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint of this key.
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        KeyId::for_public_key(self)
    }

    /// Base64 form.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the base64 form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| CryptoError::InvalidEncoding { encoding: "base64" })?;
        let array: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Verify `signature` over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// curve point, or [`CryptoError::SignatureVerificationFailed`].
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        key.verify(message, &signature.to_dalek())
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.key_id())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"entry hash");
        assert!(kp.public_key().verify(b"entry hash", &sig).is_ok());
        assert!(matches!(
            kp.public_key().verify(b"other", &sig),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_foreign_key_rejects_signature() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = kp.sign(b"msg");
        assert!(other.public_key().verify(b"msg", &sig).is_err());
    }

    #[test]
    fn test_secret_length_checked() {
        let err = KeyPair::from_secret_bytes(&[7u8; 31]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[test]
    fn test_load_or_generate_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("active.key");

        let (first, created) = KeyPair::load_or_generate(&path).unwrap();
        assert!(created);
        let (second, created) = KeyPair::load_or_generate(&path).unwrap();
        assert!(!created);
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_store_replaces_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.key");
        let (old, _) = KeyPair::load_or_generate(&path).unwrap();

        let new = KeyPair::generate();
        new.store(&path).unwrap();

        let loaded = KeyPair::load(&path).unwrap();
        assert_eq!(loaded.public_key(), new.public_key());
        assert_ne!(loaded.public_key(), old.public_key());
        assert!(!dir.path().join("active.key.tmp").exists());
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, [1u8; 12]).unwrap();
        assert!(matches!(
            KeyPair::load_or_generate(&path),
            Err(CryptoError::InvalidKeyLength { actual: 12, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.key");
        KeyPair::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        KeyPair::generate().store(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_key_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.key");
        let link = dir.path().join("link.key");
        KeyPair::load_or_generate(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = KeyPair::load(&link).unwrap_err();
        assert!(err.to_string().contains("symlink"), "got: {err}");
    }

    #[test]
    fn test_public_key_serde() {
        let pk = KeyPair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::generate();
        let debug = format!("{kp:?}");
        assert!(debug.contains("warden-"));
        assert!(!debug.contains(&hex::encode(kp.signing_key.to_bytes())));
    }
}
