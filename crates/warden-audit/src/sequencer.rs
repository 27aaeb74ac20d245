//! The chain sequencer: the single point of total ordering.
//!
//! One spawned task owns the chain head. Producers send append requests
//! over a bounded channel and wait for the reply, so exactly one append is
//! in flight at any instant no matter how many producers there are.
//!
//! # Timeouts
//!
//! A deadline only bounds the wait for a turn. Each request carries a claim
//! flag: the owner claims it before starting work, and a producer whose
//! deadline passes first marks it abandoned. Whichever side wins decides
//! the outcome, so a timed-out append is never committed and a claimed
//! append always reports its real result.
//!
//! # Failures
//!
//! The head only moves after the store reports the entry durable. A failed
//! persist leaves the head untouched and the next append reuses the same
//! sequence and `previous_hash`.
//!
//! A write can land and still report failure. The next append then finds
//! its sequence taken, reloads the head from storage and retries once on
//! top of the stray entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use warden_crypto::ContentHash;

use crate::anchor::{RootAnchor, merkle_root};
use crate::clock::Clock;
use crate::codec::{self, CanonicalEntry};
use crate::entry::{AuditEntry, EntryFields, GENESIS_HASH};
use crate::error::{AuditError, AuditResult};
use crate::keys::KeyManager;
use crate::store::{AuditStore, StoredRow};

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Sequence and hash of the last committed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    /// Sequence of the last committed entry.
    pub sequence: u64,
    /// Its `entry_hash`.
    pub entry_hash: ContentHash,
}

impl ChainHead {
    fn of(entry: &AuditEntry) -> Self {
        Self {
            sequence: entry.sequence,
            entry_hash: entry.entry_hash,
        }
    }

    /// Head at the highest stored row. The sequence comes from the key.
    fn recover(row: Option<StoredRow>) -> AuditResult<Option<Self>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let sequence = row.sequence;
        let entry = row.into_entry()?;
        if entry.sequence != sequence {
            warn!(
                sequence,
                recorded = entry.sequence,
                "Latest audit entry records a different sequence than its key"
            );
        }
        Ok(Some(Self {
            sequence,
            entry_hash: entry.entry_hash,
        }))
    }
}

/// Sequencer tuning.
#[derive(Debug, Clone, Copy)]
pub struct SequencerOptions {
    /// Pending appends the queue holds before producers wait to enqueue.
    pub queue_capacity: usize,
    /// Record a root anchor every N entries. 0 disables anchors.
    pub anchor_interval: u64,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            anchor_interval: 1000,
        }
    }
}

struct AppendRequest {
    fields: EntryFields,
    deadline: Instant,
    enqueued: Instant,
    claim: Arc<AtomicU8>,
    reply: oneshot::Sender<AuditResult<AuditEntry>>,
}

enum Command {
    Append(Box<AppendRequest>),
    Shutdown,
}

/// Handle to the task that owns the chain head.
pub struct ChainSequencer {
    tx: mpsc::Sender<Command>,
    head: watch::Receiver<Option<ChainHead>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChainSequencer {
    /// Recover the head from `store` and start the owner task.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NoActiveKey`] if `keys` cannot sign,
    /// [`AuditError::Corrupt`] if the latest row does not decode, or a
    /// storage error if the head cannot be read.
    pub async fn spawn(
        store: Arc<dyn AuditStore>,
        keys: Arc<KeyManager>,
        clock: Arc<dyn Clock>,
        options: SequencerOptions,
    ) -> AuditResult<Self> {
        let active = keys.active_key()?;
        let head = ChainHead::recover(store.last_row().await?)?;

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (head_tx, head_rx) = watch::channel(head);

        let owner = ChainOwner {
            store,
            keys,
            clock,
            head,
            head_tx,
            anchor_interval: options.anchor_interval,
        };
        let task = tokio::spawn(owner.run(rx));

        info!(
            head = ?head.map(|h| h.sequence),
            key_id = %active.key_id,
            "Audit sequencer started"
        );

        Ok(Self {
            tx,
            head: head_rx,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    /// Append an entry to the chain.
    ///
    /// Waits for this request's turn until `deadline`. Once the owner has
    /// started on the request it runs to completion regardless of the
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`AuditError::Encoding`] if the content is out of bounds; checked
    ///   before queueing
    /// - [`AuditError::Timeout`] if the turn did not come before `deadline`;
    ///   nothing was committed
    /// - [`AuditError::Persistence`] if the store did not commit the entry
    /// - [`AuditError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    pub async fn append(&self, fields: EntryFields, deadline: Instant) -> AuditResult<AuditEntry> {
        codec::validate_fields(&fields)?;

        let enqueued = Instant::now();
        let claim = Arc::new(AtomicU8::new(PENDING));
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let request = AppendRequest {
            fields,
            deadline,
            enqueued,
            claim: Arc::clone(&claim),
            reply: reply_tx,
        };

        match tokio::time::timeout_at(deadline, self.tx.send(Command::Append(Box::new(request))))
            .await
        {
            Ok(Ok(())) => {},
            Ok(Err(_)) => return Err(AuditError::ShuttingDown),
            Err(_) => return Err(timeout_error(enqueued)),
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(reply) => reply.map_err(|_| AuditError::ShuttingDown)?,
            Err(_) => {
                if claim
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Err(timeout_error(enqueued));
                }
                // In flight: wait for the real result.
                reply_rx.await.map_err(|_| AuditError::ShuttingDown)?
            },
        }
    }

    /// The last committed entry, as seen by the owner task.
    #[must_use]
    pub fn head(&self) -> Option<ChainHead> {
        *self.head.borrow()
    }

    /// Whether the owner task still accepts appends.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Finish queued appends, stop accepting new ones and join the task.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Audit sequencer task failed");
        }
    }
}

impl std::fmt::Debug for ChainSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSequencer")
            .field("head", &self.head())
            .finish_non_exhaustive()
    }
}

fn persistence_failure(sequence: u64, err: &AuditError) -> AuditError {
    error!(sequence, error = %err, "Audit entry not persisted; head unchanged");
    AuditError::Persistence {
        sequence,
        reason: err.to_string(),
    }
}

fn timeout_error(enqueued: Instant) -> AuditError {
    AuditError::Timeout {
        waited_ms: u64::try_from(enqueued.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

/// State owned by the sequencer task.
struct ChainOwner {
    store: Arc<dyn AuditStore>,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    head: Option<ChainHead>,
    head_tx: watch::Sender<Option<ChainHead>>,
    anchor_interval: u64,
}

impl ChainOwner {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Append(request) => self.handle(*request).await,
                Command::Shutdown => break,
            }
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            if let Command::Append(request) = command {
                let _ = request.reply.send(Err(AuditError::ShuttingDown));
            }
        }
        info!(head = ?self.head.map(|h| h.sequence), "Audit sequencer stopped");
    }

    async fn handle(&mut self, request: AppendRequest) {
        if request
            .claim
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(id = %request.fields.id, "Skipping append abandoned by its producer");
            return;
        }
        if Instant::now() >= request.deadline {
            let _ = request.reply.send(Err(timeout_error(request.enqueued)));
            return;
        }

        let result = self.commit(request.fields).await;
        let _ = request.reply.send(result);
    }

    async fn commit(&mut self, fields: EntryFields) -> AuditResult<AuditEntry> {
        let mut entry = self.seal(fields)?;
        match self.store.persist_entry(&entry).await {
            Ok(()) => {},
            Err(AuditError::SequenceTaken { sequence }) => {
                self.reload_head().await?;
                warn!(
                    sequence,
                    head = ?self.head.map(|h| h.sequence),
                    "Sequence already committed; reloaded chain head"
                );
                entry = self.seal(EntryFields::from(entry))?;
                self.store
                    .persist_entry(&entry)
                    .await
                    .map_err(|e| persistence_failure(entry.sequence, &e))?;
            },
            Err(e) => return Err(persistence_failure(entry.sequence, &e)),
        }

        let head = ChainHead::of(&entry);
        self.head = Some(head);
        self.head_tx.send_replace(Some(head));
        debug!(
            sequence = entry.sequence,
            action = %entry.action_type,
            entry_hash = %entry.entry_hash,
            "Audit entry committed"
        );

        self.maybe_anchor(entry.sequence).await;
        Ok(entry)
    }

    /// Hash and sign `fields` as the entry after the current head.
    fn seal(&self, fields: EntryFields) -> AuditResult<AuditEntry> {
        let (sequence, previous_hash) = match self.head {
            None => (0, GENESIS_HASH),
            Some(head) => {
                let next = head.sequence.checked_add(1).ok_or_else(|| {
                    AuditError::Persistence {
                        sequence: head.sequence,
                        reason: "sequence space exhausted".into(),
                    }
                })?;
                (next, head.entry_hash)
            },
        };

        let timestamp = self.clock.now();
        let entry_hash = codec::compute_entry_hash(&CanonicalEntry {
            id: &fields.id,
            sequence,
            timestamp: &timestamp,
            action_type: &fields.action_type,
            actor: &fields.actor,
            context: &fields.context,
            outcome: fields.outcome,
            previous_hash: &previous_hash,
        })?;
        // One read of the key lock: the id and the signature always match.
        let (signing_key_id, signature) = self.keys.sign(&entry_hash)?;

        Ok(AuditEntry {
            id: fields.id,
            sequence,
            timestamp,
            action_type: fields.action_type,
            actor: fields.actor,
            context: fields.context,
            outcome: fields.outcome,
            previous_hash,
            entry_hash,
            signature,
            signing_key_id,
        })
    }

    async fn reload_head(&mut self) -> AuditResult<()> {
        let head = ChainHead::recover(self.store.last_row().await?)?;
        self.head = head;
        self.head_tx.send_replace(head);
        Ok(())
    }

    /// Record an anchor when `sequence` closes an interval. Failures are
    /// logged; the entry itself is already durable.
    async fn maybe_anchor(&self, sequence: u64) {
        let interval = self.anchor_interval;
        let Some(next) = sequence.checked_add(1) else {
            return;
        };
        if interval == 0 || next.checked_rem(interval) != Some(0) {
            return;
        }

        let start = next.saturating_sub(interval);
        let entries = match self.store.read_entries(start..next).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(start, end = sequence, error = %e, "Failed to read entries for anchor");
                return;
            },
        };
        if u64::try_from(entries.len()).ok() != Some(interval) {
            warn!(start, end = sequence, found = entries.len(), "Anchor range incomplete");
            return;
        }

        let leaves: Vec<ContentHash> = entries.iter().map(|e| e.entry_hash).collect();
        let anchor = RootAnchor {
            sequence_start: start,
            sequence_end: sequence,
            root_hash: merkle_root(&leaves),
            created_at: self.clock.now(),
        };
        match self.store.persist_anchor(&anchor).await {
            Ok(()) => info!(start, end = sequence, root = %anchor.root_hash, "Recorded root anchor"),
            Err(e) => warn!(start, end = sequence, error = %e, "Failed to persist root anchor"),
        }
    }
}
