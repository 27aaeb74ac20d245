//! Key fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::PublicKey;

const PREFIX: &str = "warden-";
const FINGERPRINT_HEX_LEN: usize = 12;

/// Identifier of a signing key, recorded on every audit entry.
///
/// The id is `warden-` followed by the first 12 hex characters of the
/// SHA-256 of the public key, so it can be recomputed from the key alone
/// and never reveals secret material.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    /// Derive the fingerprint of a public key.
    #[must_use]
    pub fn for_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_HEX_LEN);
        Self(format!("{PREFIX}{hex}"))
    }

    /// Parse a key id received from storage or a caller.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedKeyId`] unless the string is
    /// `warden-` followed by exactly 12 lowercase hex characters.
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let well_formed = s.strip_prefix(PREFIX).is_some_and(|rest| {
            rest.len() == FINGERPRINT_HEX_LEN
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        });
        if well_formed {
            Ok(Self(s.to_owned()))
        } else {
            Err(CryptoError::MalformedKeyId(s.to_owned()))
        }
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyId {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn test_fingerprint_shape() {
        let id = KeyPair::generate().key_id();
        assert!(id.as_str().starts_with("warden-"));
        assert_eq!(id.as_str().len(), 19);
        assert_eq!(KeyId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_fingerprint_is_stable_per_key() {
        let kp = KeyPair::generate();
        assert_eq!(kp.key_id(), KeyId::for_public_key(&kp.public_key()));
        assert_ne!(kp.key_id(), KeyPair::generate().key_id());
    }

    #[test]
    fn test_parse_rejects_foreign_ids() {
        assert!(KeyId::parse("agent-0123456789ab").is_err());
        assert!(KeyId::parse("warden-0123").is_err());
        assert!(KeyId::parse("warden-0123456789AB").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: KeyId = serde_json::from_str("\"warden-0123456789ab\"").unwrap();
        assert_eq!(ok.as_str(), "warden-0123456789ab");
        assert!(serde_json::from_str::<KeyId>("\"nope\"").is_err());
    }
}
