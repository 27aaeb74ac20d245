//! Chain verification.
//!
//! The verifier only reads committed entries through the store. For every
//! entry it checks, in order:
//!
//! 1. the stored `entry_hash` matches a recomputation of the content
//! 2. `previous_hash` matches the hash of the entry before it
//! 3. the signature verifies under the key named by `signing_key_id`
//!
//! Divergences are collected as [`ChainIssue`]s rather than returned as
//! errors. The first one marks the chain broken from that sequence on.
//!
//! Rows are walked by storage key, so a rewritten `sequence` field or a row
//! that no longer decodes is reported without steering the walk.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use warden_crypto::{ContentHash, KeyId};

use crate::anchor::merkle_root;
use crate::codec;
use crate::entry::{AuditEntry, GENESIS_HASH};
use crate::error::{AuditError, AuditResult};
use crate::keys::KeyManager;
use crate::store::{AuditStore, StoredRow};

/// Runs slower than this get a recommendation.
const SLOW_VERIFICATION: Duration = Duration::from_secs(10);
/// Chains longer than this get an archival recommendation.
const LARGE_CHAIN: u64 = 100_000;

/// Sequences to verify: `start..end`, with `end = None` meaning "through the
/// latest committed entry".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyRange {
    /// First sequence to check.
    pub start: u64,
    /// One past the last sequence to check.
    pub end: Option<u64>,
}

impl VerifyRange {
    /// The whole chain.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// From `start` through the latest entry.
    #[must_use]
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }
}

impl From<Range<u64>> for VerifyRange {
    fn from(range: Range<u64>) -> Self {
        Self {
            start: range.start,
            end: Some(range.end),
        }
    }
}

/// A divergence found during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssue {
    /// The content no longer hashes to the stored `entry_hash`.
    ContentMismatch {
        /// Affected entry.
        sequence: u64,
    },
    /// `previous_hash` does not match the preceding entry.
    BrokenLink {
        /// Affected entry.
        sequence: u64,
        /// Hash of the preceding entry (or genesis).
        expected: ContentHash,
        /// What the entry claims.
        actual: ContentHash,
    },
    /// The signature does not verify.
    InvalidSignature {
        /// Affected entry.
        sequence: u64,
    },
    /// The entry names a key the manager never issued.
    UnknownKey {
        /// Affected entry.
        sequence: u64,
        /// The unrecognised key id.
        key_id: KeyId,
    },
    /// Sequences are missing between two entries.
    SequenceGap {
        /// Sequence that should have come next.
        expected: u64,
        /// Sequence that was found.
        found: u64,
    },
    /// The entry before a sub-range is missing or unreadable, so the link
    /// into the range cannot be checked.
    MissingPredecessor {
        /// First sequence of the range.
        sequence: u64,
    },
    /// The stored row no longer decodes as an entry.
    Undecodable {
        /// Sequence named by the row's storage key.
        sequence: u64,
    },
    /// The entry records a different sequence than the key it is stored under.
    SequenceMismatch {
        /// Sequence named by the storage key.
        sequence: u64,
        /// Sequence the entry claims.
        recorded: u64,
    },
}

impl ChainIssue {
    /// The sequence at which the chain diverges.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            Self::ContentMismatch { sequence }
            | Self::BrokenLink { sequence, .. }
            | Self::InvalidSignature { sequence }
            | Self::UnknownKey { sequence, .. }
            | Self::MissingPredecessor { sequence }
            | Self::Undecodable { sequence }
            | Self::SequenceMismatch { sequence, .. } => *sequence,
            Self::SequenceGap { expected, .. } => *expected,
        }
    }
}

impl std::fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContentMismatch { sequence } => {
                write!(f, "Content hash mismatch at sequence {sequence}")
            },
            Self::BrokenLink { sequence, .. } => {
                write!(f, "Broken chain link at sequence {sequence}")
            },
            Self::InvalidSignature { sequence } => {
                write!(f, "Invalid signature at sequence {sequence}")
            },
            Self::UnknownKey { sequence, key_id } => {
                write!(f, "Unknown signing key {key_id} at sequence {sequence}")
            },
            Self::SequenceGap { expected, found } => {
                write!(f, "Missing entries: expected sequence {expected}, found {found}")
            },
            Self::MissingPredecessor { sequence } => {
                write!(f, "Entry before sequence {sequence} is missing or unreadable")
            },
            Self::Undecodable { sequence } => {
                write!(f, "Unreadable entry at sequence {sequence}")
            },
            Self::SequenceMismatch { sequence, recorded } => {
                write!(f, "Entry stored at sequence {sequence} claims sequence {recorded}")
            },
        }
    }
}

/// Result of one verification run. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Every entry in range passed every check.
    pub verified: bool,
    /// Entries examined.
    pub total_entries: u64,
    /// Entries that passed every check.
    pub valid_entries: u64,
    /// Entries that failed at least one check.
    pub invalid_entries: u64,
    /// No divergence was found.
    pub chain_intact: bool,
    /// Sequence of the first divergence.
    pub first_break_sequence: Option<u64>,
    /// Last sequence of the unbroken prefix.
    pub last_valid_sequence: Option<u64>,
    /// Every divergence, in the order found.
    pub issues: Vec<ChainIssue>,
    /// When the run started.
    pub verification_started: DateTime<Utc>,
    /// When the run finished.
    pub verification_completed: DateTime<Utc>,
    /// Wall time of the run.
    pub duration_ms: u64,
}

/// Per-check result for a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVerification {
    /// The entry checked.
    pub sequence: u64,
    /// Content matches `entry_hash`.
    pub hash_valid: bool,
    /// `previous_hash` matches the preceding entry.
    pub link_valid: bool,
    /// Signature verifies.
    pub signature_valid: bool,
}

impl EntryVerification {
    /// All checks passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.hash_valid && self.link_valid && self.signature_valid
    }
}

/// Shape of the stored chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    /// Entries between the first and last sequence, inclusive. Gaps are
    /// reported by [`Verifier::verify`], not here.
    pub total_entries: u64,
    /// Lowest stored sequence.
    pub first_sequence: Option<u64>,
    /// Highest stored sequence.
    pub last_sequence: Option<u64>,
    /// Timestamp of the first entry.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// Timestamp of the last entry.
    pub newest_entry: Option<DateTime<Utc>>,
    /// `entry_hash` of the last entry.
    pub head_hash: Option<ContentHash>,
}

/// Result of re-checking stored Merkle anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReport {
    /// Anchors examined.
    pub anchors_checked: u64,
    /// `sequence_start` of every anchor whose root no longer matches.
    pub mismatched: Vec<u64>,
}

impl AnchorReport {
    /// All anchors match.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// A verification report with operator guidance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityAssessment {
    /// The underlying report.
    pub report: VerificationReport,
    /// Human-readable follow-ups.
    pub recommendations: Vec<String>,
}

/// Read-only chain verifier.
#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn AuditStore>,
    keys: Arc<KeyManager>,
    batch_size: usize,
}

impl Verifier {
    /// Verifier reading `batch_size` entries per store call.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, keys: Arc<KeyManager>, batch_size: usize) -> Self {
        Self {
            store,
            keys,
            batch_size: batch_size.max(1),
        }
    }

    /// Verify a range of the chain.
    ///
    /// A sub-range starting after 0 is seeded with the stored hash of the
    /// entry at `start - 1`. An `end` past the head simply stops at the head.
    ///
    /// # Errors
    ///
    /// Returns an error only if entries cannot be read. Tampering is
    /// reported in the [`VerificationReport`].
    pub async fn verify(&self, range: VerifyRange) -> AuditResult<VerificationReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let end = range.end.unwrap_or(u64::MAX);

        let mut walk = ChainWalk::starting_at(range.start);
        if range.start > 0 {
            let before = range.start.saturating_sub(1);
            let previous = self.store.read_rows(before..range.start, 1).await?.pop();
            match previous.as_ref().and_then(StoredRow::entry) {
                Some(previous) => walk.expected_previous = Some(previous.entry_hash),
                None => {
                    walk.expected_previous = None;
                    walk.pending = Some(ChainIssue::MissingPredecessor {
                        sequence: range.start,
                    });
                },
            }
        }

        // Continue from the last key seen, never from a decoded field.
        let mut cursor = range.start;
        while cursor < end {
            let rows = self.store.read_rows(cursor..end, self.batch_size).await?;
            let Some(last) = rows.last().map(|row| row.sequence) else {
                break;
            };
            for row in &rows {
                let issues = self.check_row(row, &walk);
                walk.record(row, issues);
            }
            match last.checked_add(1) {
                Some(next) => cursor = next,
                None => break,
            }
        }

        let completed_at = Utc::now();
        let report = walk.into_report(started_at, completed_at, timer.elapsed());
        if report.chain_intact {
            info!(
                entries = report.total_entries,
                duration_ms = report.duration_ms,
                "Audit chain verified"
            );
        } else {
            warn!(
                entries = report.total_entries,
                invalid = report.invalid_entries,
                first_break = ?report.first_break_sequence,
                "Audit chain integrity violation"
            );
        }
        Ok(report)
    }

    fn check_row(&self, row: &StoredRow, walk: &ChainWalk) -> Vec<ChainIssue> {
        let mut issues = Vec::new();
        let sequence = row.sequence;

        if sequence != walk.next_sequence {
            issues.push(ChainIssue::SequenceGap {
                expected: walk.next_sequence,
                found: sequence,
            });
        }

        let entry = match &row.entry {
            Ok(entry) => entry,
            Err(reason) => {
                debug!(sequence, reason = %reason, "Stored entry no longer decodes");
                issues.push(ChainIssue::Undecodable { sequence });
                return issues;
            },
        };

        if entry.sequence != sequence {
            issues.push(ChainIssue::SequenceMismatch {
                sequence,
                recorded: entry.sequence,
            });
        }

        match codec::compute_entry_hash(&entry.canonical()) {
            Ok(hash) if hash == entry.entry_hash => {},
            Ok(_) => issues.push(ChainIssue::ContentMismatch { sequence }),
            Err(e) => {
                debug!(sequence, error = %e, "Stored entry no longer encodes");
                issues.push(ChainIssue::ContentMismatch { sequence });
            },
        }

        // No expectation after an unreadable predecessor.
        let expected = if sequence == 0 {
            Some(GENESIS_HASH)
        } else {
            walk.expected_previous
        };
        if let Some(expected) = expected
            && entry.previous_hash != expected
        {
            issues.push(ChainIssue::BrokenLink {
                sequence,
                expected,
                actual: entry.previous_hash,
            });
        }

        match self.keys.public_key_for(&entry.signing_key_id) {
            Ok(public_key) => {
                if public_key
                    .verify(entry.entry_hash.as_bytes(), &entry.signature)
                    .is_err()
                {
                    issues.push(ChainIssue::InvalidSignature { sequence });
                }
            },
            Err(_) => issues.push(ChainIssue::UnknownKey {
                sequence,
                key_id: entry.signing_key_id.clone(),
            }),
        }

        issues
    }

    /// Check one entry against its predecessor.
    ///
    /// A row that no longer decodes fails every check.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::EntryNotFound`] if no entry has `sequence`.
    pub async fn verify_entry(&self, sequence: u64) -> AuditResult<EntryVerification> {
        let start = sequence.saturating_sub(1);
        let rows = self
            .store
            .read_rows(start..sequence.saturating_add(1), 2)
            .await?;
        let row = rows
            .iter()
            .find(|r| r.sequence == sequence)
            .ok_or_else(|| AuditError::EntryNotFound {
                entry_id: format!("sequence {sequence}"),
            })?;
        let Some(entry) = row.entry() else {
            return Ok(EntryVerification {
                sequence,
                hash_valid: false,
                link_valid: false,
                signature_valid: false,
            });
        };

        let hash_valid = entry.sequence == sequence
            && codec::compute_entry_hash(&entry.canonical())
                .is_ok_and(|hash| hash == entry.entry_hash);
        let link_valid = if sequence == 0 {
            entry.previous_hash == GENESIS_HASH
        } else {
            rows.iter()
                .find(|r| r.sequence == start)
                .and_then(StoredRow::entry)
                .is_some_and(|previous| entry.follows(previous))
        };
        let signature_valid = self
            .keys
            .public_key_for(&entry.signing_key_id)
            .is_ok_and(|pk| pk.verify(entry.entry_hash.as_bytes(), &entry.signature).is_ok());

        Ok(EntryVerification {
            sequence,
            hash_valid,
            link_valid,
            signature_valid,
        })
    }

    /// First sequence where the chain diverges, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn find_tampering(&self) -> AuditResult<Option<u64>> {
        Ok(self.verify(VerifyRange::all()).await?.first_break_sequence)
    }

    /// Bounds and head of the stored chain.
    ///
    /// Bounds come from storage keys. Timestamps and the head hash are
    /// `None` when the boundary rows no longer decode.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn chain_summary(&self) -> AuditResult<ChainSummary> {
        let Some(last) = self.store.last_row().await? else {
            return Ok(ChainSummary {
                total_entries: 0,
                first_sequence: None,
                last_sequence: None,
                oldest_entry: None,
                newest_entry: None,
                head_hash: None,
            });
        };
        let first = self
            .store
            .read_rows(0..u64::MAX, 1)
            .await?
            .pop()
            .unwrap_or_else(|| last.clone());

        Ok(ChainSummary {
            total_entries: last
                .sequence
                .saturating_sub(first.sequence)
                .saturating_add(1),
            first_sequence: Some(first.sequence),
            last_sequence: Some(last.sequence),
            oldest_entry: first.entry().map(|e| e.timestamp),
            newest_entry: last.entry().map(|e| e.timestamp),
            head_hash: last.entry().map(|e| e.entry_hash),
        })
    }

    /// Recompute every stored Merkle anchor.
    ///
    /// # Errors
    ///
    /// Returns an error if anchors or entries cannot be read.
    pub async fn verify_root_anchors(&self) -> AuditResult<AnchorReport> {
        let anchors = self.store.read_anchors().await?;
        let mut mismatched = Vec::new();

        for anchor in &anchors {
            let limit = usize::try_from(anchor.entry_count()).unwrap_or(usize::MAX);
            let rows = self
                .store
                .read_rows(anchor.sequence_start..anchor.sequence_end.saturating_add(1), limit)
                .await?;
            let leaves: Option<Vec<ContentHash>> = rows
                .iter()
                .map(|r| r.entry().map(|e| e.entry_hash))
                .collect();
            let complete = u64::try_from(rows.len()).ok() == Some(anchor.entry_count());
            let matches = leaves.is_some_and(|leaves| merkle_root(&leaves) == anchor.root_hash);
            if !complete || !matches {
                warn!(
                    start = anchor.sequence_start,
                    end = anchor.sequence_end,
                    "Root anchor mismatch"
                );
                mismatched.push(anchor.sequence_start);
            }
        }

        Ok(AnchorReport {
            anchors_checked: u64::try_from(anchors.len()).unwrap_or(u64::MAX),
            mismatched,
        })
    }

    /// Verify the whole chain and attach recommendations.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn assess(&self) -> AuditResult<IntegrityAssessment> {
        let report = self.verify(VerifyRange::all()).await?;
        let mut recommendations = Vec::new();

        if !report.chain_intact {
            recommendations.push(
                "CRITICAL: Audit log integrity compromised. Investigate immediately.".to_string(),
            );
            if let Some(sequence) = report.first_break_sequence {
                recommendations.push(format!(
                    "Tampering detected at sequence {sequence}. Entries from this point on cannot be trusted."
                ));
            }
        }
        if report.duration_ms > u64::try_from(SLOW_VERIFICATION.as_millis()).unwrap_or(u64::MAX) {
            recommendations.push(
                "Verification took too long. Consider verifying in ranges or anchoring more often."
                    .to_string(),
            );
        }
        if report.total_entries > LARGE_CHAIN {
            recommendations.push(
                "Large audit log. Consider archiving older entries.".to_string(),
            );
        }
        if self.keys.active_key().is_err() {
            recommendations.push(
                "Signing key is revoked or inactive. Rotate to a new key before recording further entries."
                    .to_string(),
            );
        }

        Ok(IntegrityAssessment {
            report,
            recommendations,
        })
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Running state of one verification pass.
#[derive(Debug)]
struct ChainWalk {
    /// `None` when the previous row could not be read.
    expected_previous: Option<ContentHash>,
    next_sequence: u64,
    /// Raised against the first row walked, if any.
    pending: Option<ChainIssue>,
    total: u64,
    valid: u64,
    invalid: u64,
    first_break: Option<u64>,
    last_valid: Option<u64>,
    issues: Vec<ChainIssue>,
}

impl ChainWalk {
    fn starting_at(sequence: u64) -> Self {
        Self {
            expected_previous: Some(GENESIS_HASH),
            next_sequence: sequence,
            pending: None,
            total: 0,
            valid: 0,
            invalid: 0,
            first_break: None,
            last_valid: None,
            issues: Vec::new(),
        }
    }

    fn record(&mut self, row: &StoredRow, mut issues: Vec<ChainIssue>) {
        if let Some(issue) = self.pending.take() {
            issues.insert(0, issue);
        }
        self.total = self.total.saturating_add(1);
        if issues.is_empty() {
            self.valid = self.valid.saturating_add(1);
            if self.first_break.is_none() {
                self.last_valid = Some(row.sequence);
            }
        } else {
            self.invalid = self.invalid.saturating_add(1);
            if self.first_break.is_none() {
                self.first_break = issues.iter().map(ChainIssue::sequence).min();
            }
            self.issues.extend(issues);
        }

        self.expected_previous = row.entry().map(|e| e.entry_hash);
        self.next_sequence = row.sequence.saturating_add(1);
    }

    fn into_report(
        self,
        started: DateTime<Utc>,
        completed: DateTime<Utc>,
        elapsed: Duration,
    ) -> VerificationReport {
        let chain_intact = self.first_break.is_none();
        VerificationReport {
            verified: chain_intact && self.invalid == 0,
            total_entries: self.total,
            valid_entries: self.valid,
            invalid_entries: self.invalid,
            chain_intact,
            first_break_sequence: self.first_break,
            last_valid_sequence: self.last_valid,
            issues: self.issues,
            verification_started: started,
            verification_completed: completed,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
