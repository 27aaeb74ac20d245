//! Cryptographic error types.

use thiserror::Error;

/// Errors raised while handling hashes, keys and signatures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key had the wrong number of bytes.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// A signature had the wrong number of bytes.
    #[error("invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// The bytes do not describe a valid Ed25519 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The signature does not match the message and key.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// A hex or base64 string could not be decoded.
    #[error("invalid {encoding} encoding")]
    InvalidEncoding {
        /// Which encoding was expected (`hex` or `base64`).
        encoding: &'static str,
    },

    /// A key id string was not a `warden-` fingerprint.
    #[error("malformed key id: {0}")]
    MalformedKeyId(String),

    /// Reading or writing a key file failed.
    #[error("key file error: {0}")]
    KeyFile(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
