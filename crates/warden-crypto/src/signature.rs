//! Ed25519 signatures over entry hashes.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signature as DalekSignature;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// A 64-byte Ed25519 signature. Serializes as base64.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Length of a signature in bytes.
    pub const LEN: usize = 64;

    /// Wrap raw signature bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Base64 form, as stored and served.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the base64 form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEncoding`] or
    /// [`CryptoError::InvalidSignatureLength`].
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| CryptoError::InvalidEncoding { encoding: "base64" })?;
        let array: [u8; 64] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidSignatureLength {
                    expected: Self::LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub(crate) fn to_dalek(self) -> DalekSignature {
        DalekSignature::from_bytes(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "Signature({}...)", hex.get(..16).unwrap_or(&hex))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<DalekSignature> for Signature {
    fn from(sig: DalekSignature) -> Self {
        Self(sig.to_bytes())
    }
}
