//! Warden Crypto - primitives behind the tamper-evident audit chain.
//!
//! This crate provides:
//! - [`ContentHash`]: BLAKE3 digests with domain separation, used for entry
//!   hashes, chain links and Merkle anchors
//! - [`KeyPair`]: Ed25519 signing keys that zeroize on drop and can be
//!   persisted to a `0600` key file
//! - [`PublicKey`] / [`Signature`]: the shareable halves, serializable as
//!   base64
//! - [`KeyId`]: a stable fingerprint naming a key inside the audit chain
//!
//! # Example
//!
//! ```
//! use warden_crypto::{ContentHash, KeyPair};
//!
//! let keypair = KeyPair::generate();
//! let digest = ContentHash::hash_with_domain("warden.example", b"payload");
//!
//! let signature = keypair.sign(digest.as_bytes());
//! assert!(keypair.public_key().verify(digest.as_bytes(), &signature).is_ok());
//! assert!(keypair.key_id().as_str().starts_with("warden-"));
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod hash;
mod key_id;
mod keypair;
mod signature;

pub use error::{CryptoError, CryptoResult};
pub use hash::ContentHash;
pub use key_id::KeyId;
pub use keypair::{KeyPair, PublicKey};
pub use signature::Signature;
