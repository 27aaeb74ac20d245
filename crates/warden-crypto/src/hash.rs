//! BLAKE3 digests for chain links and anchors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// A 32-byte BLAKE3 digest.
///
/// Every hash that enters the audit chain is computed with a domain
/// context string so that an entry hash can never collide with a Merkle
/// node or any other digest built from the same bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Length of a digest in bytes.
    pub const LEN: usize = 32;

    /// The all-zero digest. Never produced by BLAKE3 in practice, which
    /// makes it usable as a well-known sentinel.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash bytes with a domain context (BLAKE3 `derive_key` mode).
    #[must_use]
    pub fn hash_with_domain(domain: &str, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(domain);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash two digests together under a domain context.
    ///
    /// Used for interior Merkle nodes: `H(domain, left || right)`.
    #[must_use]
    pub fn hash_pair(domain: &str, left: &Self, right: &Self) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(domain);
        hasher.update(&left.0);
        hasher.update(&right.0);
        Self(*hasher.finalize().as_bytes())
    }

    /// Whether this is [`ContentHash::ZERO`].
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex form, as stored and served.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEncoding`] for bad hex and
    /// [`CryptoError::InvalidKeyLength`] when the digest is not 32 bytes.
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidEncoding { encoding: "hex" })?;
        let array: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: Self::LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
