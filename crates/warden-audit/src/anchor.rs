//! Merkle root anchors over fixed ranges of the chain.
//!
//! Every `anchor_interval` entries the sequencer records the Merkle root of
//! the entry hashes in that range. An anchor can be published elsewhere and
//! later checked against the stored entries without replaying signatures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_crypto::ContentHash;

/// Domain for interior Merkle nodes.
pub const MERKLE_DOMAIN: &str = "warden.audit.merkle.v1";

/// Merkle root over the entries `sequence_start..=sequence_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAnchor {
    /// First covered sequence.
    pub sequence_start: u64,
    /// Last covered sequence (inclusive).
    pub sequence_end: u64,
    /// Root over the `entry_hash` of each covered entry, in sequence order.
    pub root_hash: ContentHash,
    /// When the anchor was recorded.
    pub created_at: DateTime<Utc>,
}

impl RootAnchor {
    /// Number of entries covered.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.sequence_end
            .saturating_sub(self.sequence_start)
            .saturating_add(1)
    }
}

/// Merkle root of `leaves`.
///
/// Levels with an odd node count pair the last node with itself. A single
/// leaf is its own root and an empty slice yields [`ContentHash::ZERO`].
#[must_use]
pub fn merkle_root(leaves: &[ContentHash]) -> ContentHash {
    if leaves.is_empty() {
        return ContentHash::ZERO;
    }

    let mut level: Vec<ContentHash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => ContentHash::hash_pair(MERKLE_DOMAIN, left, right),
                [single] => ContentHash::hash_pair(MERKLE_DOMAIN, single, single),
                _ => ContentHash::ZERO,
            })
            .collect();
    }
    level.first().copied().unwrap_or(ContentHash::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u8) -> ContentHash {
        ContentHash::hash_with_domain("warden.test", &[i])
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(merkle_root(&[]), ContentHash::ZERO);
        assert_eq!(merkle_root(&[leaf(1)]), leaf(1));
    }

    #[test]
    fn test_pair() {
        let expected = ContentHash::hash_pair(MERKLE_DOMAIN, &leaf(1), &leaf(2));
        assert_eq!(merkle_root(&[leaf(1), leaf(2)]), expected);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let left = ContentHash::hash_pair(MERKLE_DOMAIN, &leaf(1), &leaf(2));
        let right = ContentHash::hash_pair(MERKLE_DOMAIN, &leaf(3), &leaf(3));
        let expected = ContentHash::hash_pair(MERKLE_DOMAIN, &left, &right);
        assert_eq!(merkle_root(&[leaf(1), leaf(2), leaf(3)]), expected);
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(
            merkle_root(&[leaf(1), leaf(2), leaf(3), leaf(4)]),
            merkle_root(&[leaf(2), leaf(1), leaf(3), leaf(4)])
        );
    }

    #[test]
    fn test_anchor_entry_count() {
        let anchor = RootAnchor {
            sequence_start: 1000,
            sequence_end: 1999,
            root_hash: ContentHash::ZERO,
            created_at: Utc::now(),
        };
        assert_eq!(anchor.entry_count(), 1000);
    }
}
