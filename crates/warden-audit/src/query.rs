//! Read-only queries over committed entries.
//!
//! Queries go through the store's committed view only and never touch the
//! sequencer. Results are produced batch by batch, so memory is bounded by
//! the batch size rather than the chain length.
//!
//! Batches continue from the last storage key read. Rows that no longer
//! decode are skipped with a warning; [`Verifier`](crate::Verifier)
//! reports them.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entry::AuditEntry;
use crate::error::AuditResult;
use crate::store::{AuditStore, StoredRow};

/// Inclusive timestamp window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Earliest timestamp included.
    pub start: DateTime<Utc>,
    /// Latest timestamp included.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Window between two instants.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` leading up to `now`.
    #[must_use]
    pub fn last_hours(hours: u32, now: DateTime<Utc>) -> Self {
        let start = TimeDelta::try_hours(i64::from(hours))
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end: now }
    }

    /// Whether `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Entry filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Only entries about this entity.
    pub entity_id: Option<String>,
    /// Only entries by this actor.
    pub actor: Option<String>,
    /// Only entries committed in this window.
    pub time_range: Option<TimeRange>,
    /// Only entries whose action label is one of these (case-insensitive).
    pub action_types: Option<Vec<String>>,
}

impl AuditQuery {
    /// Match everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one entity.
    #[must_use]
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Restrict to one actor.
    #[must_use]
    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Restrict to a time window.
    #[must_use]
    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Restrict to action labels such as `MEMORIZE` or `conscience_check`.
    #[must_use]
    pub fn with_action_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `entry` passes every set filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_id
            .as_deref()
            .is_none_or(|id| entry.context.entity_id.as_deref() == Some(id))
            && self.actor.as_deref().is_none_or(|actor| entry.actor == actor)
            && self
                .time_range
                .is_none_or(|range| range.contains(entry.timestamp))
            && self.action_types.as_ref().is_none_or(|types| {
                let label = entry.action_type.label();
                types.iter().any(|t| t.eq_ignore_ascii_case(label))
            })
    }
}

/// Sequence order of a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// One page of matching entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPage {
    /// Entries in the requested order.
    pub entries: Vec<AuditEntry>,
    /// Matching entries across all pages.
    pub total: u64,
    /// Matches skipped before this page.
    pub offset: u64,
    /// Page size after clamping.
    pub limit: u64,
}

/// Query executor over an [`AuditStore`].
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn AuditStore>,
    batch_size: usize,
    max_limit: u64,
}

impl QueryService {
    /// Reads `batch_size` entries per store call and caps pages at
    /// `max_limit`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, batch_size: usize, max_limit: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_limit: u64::try_from(max_limit).unwrap_or(u64::MAX).max(1),
        }
    }

    /// Lazy ascending stream of matching entries.
    ///
    /// Entries committed while the stream is read are included once their
    /// batch is reached.
    #[must_use]
    pub fn stream(&self, query: AuditQuery) -> BoxStream<'static, AuditResult<AuditEntry>> {
        let cursor = Cursor {
            store: Arc::clone(&self.store),
            query,
            next: Some(0),
            batch_size: self.batch_size,
        };

        stream::try_unfold(cursor, Cursor::next_batch)
            .try_flatten()
            .boxed()
    }

    /// One page of matching entries plus the total match count.
    ///
    /// `limit` is clamped to `1..=max_limit`. An unfiltered query reads only
    /// the page and takes the total from the head sequence. A filtered query
    /// walks the chain to count matches, twice for a descending page.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn page(
        &self,
        query: &AuditQuery,
        offset: u64,
        limit: u64,
        order: SortOrder,
    ) -> AuditResult<AuditPage> {
        let limit = limit.clamp(1, self.max_limit);
        if *query == AuditQuery::default() {
            return self.unfiltered_page(offset, limit, order).await;
        }
        let window_end = offset.saturating_add(limit);

        let mut total = 0u64;
        let mut entries = Vec::new();
        let last_key = self
            .for_each_match(query, u64::MAX, |entry| {
                if order == SortOrder::Ascending && (offset..window_end).contains(&total) {
                    entries.push(entry);
                }
                total = total.saturating_add(1);
            })
            .await?;

        if order == SortOrder::Descending && offset < total {
            // Newest-first position `i` is ascending position `total - 1 - i`.
            let wanted = total.saturating_sub(window_end)..total.saturating_sub(offset);
            let end = last_key.map_or(0, |key| key.saturating_add(1));
            let mut position = 0u64;
            self.for_each_match(query, end, |entry| {
                if wanted.contains(&position) {
                    entries.push(entry);
                }
                position = position.saturating_add(1);
            })
            .await?;
            entries.reverse();
        }

        Ok(AuditPage {
            entries,
            total,
            offset,
            limit,
        })
    }

    async fn unfiltered_page(
        &self,
        offset: u64,
        limit: u64,
        order: SortOrder,
    ) -> AuditResult<AuditPage> {
        let total = self
            .store
            .last_row()
            .await?
            .map_or(0, |row| row.sequence.saturating_add(1));
        let window_end = offset.saturating_add(limit).min(total);
        let window = match order {
            SortOrder::Ascending => offset..window_end,
            SortOrder::Descending => {
                total.saturating_sub(window_end)..total.saturating_sub(offset)
            },
        };

        let rows = self
            .store
            .read_rows(window, usize::try_from(limit).unwrap_or(usize::MAX))
            .await?;
        let mut entries: Vec<AuditEntry> = rows.into_iter().filter_map(readable).collect();
        if order == SortOrder::Descending {
            entries.reverse();
        }

        Ok(AuditPage {
            entries,
            total,
            offset,
            limit,
        })
    }

    /// Feed every readable match with a key below `end` to `visit`, in key
    /// order. Returns the last key read.
    async fn for_each_match<F>(
        &self,
        query: &AuditQuery,
        end: u64,
        mut visit: F,
    ) -> AuditResult<Option<u64>>
    where
        F: FnMut(AuditEntry) + Send,
    {
        let mut cursor = 0u64;
        let mut last_key = None;
        while cursor < end {
            let rows = self.store.read_rows(cursor..end, self.batch_size).await?;
            let Some(last) = rows.last().map(|row| row.sequence) else {
                break;
            };
            last_key = Some(last);
            for entry in rows.into_iter().filter_map(readable) {
                if query.matches(&entry) {
                    visit(entry);
                }
            }
            match last.checked_add(1) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(last_key)
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("batch_size", &self.batch_size)
            .field("max_limit", &self.max_limit)
            .finish_non_exhaustive()
    }
}

type Batch = stream::Iter<std::vec::IntoIter<AuditResult<AuditEntry>>>;

struct Cursor {
    store: Arc<dyn AuditStore>,
    query: AuditQuery,
    /// `None` once the last possible key has been read.
    next: Option<u64>,
    batch_size: usize,
}

impl Cursor {
    async fn next_batch(mut self) -> AuditResult<Option<(Batch, Self)>> {
        let Some(next) = self.next else {
            return Ok(None);
        };
        let rows = self.store.read_rows(next..u64::MAX, self.batch_size).await?;
        let Some(last) = rows.last().map(|row| row.sequence) else {
            return Ok(None);
        };
        self.next = last.checked_add(1);

        let matched: Vec<AuditResult<AuditEntry>> = rows
            .into_iter()
            .filter_map(readable)
            .filter(|entry| self.query.matches(entry))
            .map(Ok)
            .collect();
        Ok(Some((stream::iter(matched), self)))
    }
}

fn readable(row: StoredRow) -> Option<AuditEntry> {
    match row.entry {
        Ok(entry) => Some(entry),
        Err(reason) => {
            warn!(sequence = row.sequence, reason = %reason, "Skipping unreadable audit entry");
            None
        },
    }
}
