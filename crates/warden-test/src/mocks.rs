//! Failure-injecting collaborators.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;
use warden_audit::{
    AuditEntry, AuditError, AuditResult, AuditStore, KvAuditStore, RootAnchor, StoredRow,
};

/// An [`AuditStore`] that fails on request.
///
/// Wraps an in-memory [`KvAuditStore`]. Clones share the store and the
/// failure switches.
#[derive(Debug, Clone)]
pub struct FailingStore {
    inner: Arc<KvAuditStore>,
    state: Arc<FailState>,
}

#[derive(Debug)]
struct FailState {
    fail_next: AtomicU32,
    fail_after_write: AtomicU32,
    fail_reads: AtomicBool,
    attempts: AtomicU64,
    row_reads: AtomicU64,
    gate: Semaphore,
    gated: AtomicBool,
}

impl FailingStore {
    /// A store that succeeds until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::wrapping(Arc::new(KvAuditStore::in_memory()))
    }

    /// Inject failures in front of an existing store.
    #[must_use]
    pub fn wrapping(inner: Arc<KvAuditStore>) -> Self {
        Self {
            inner,
            state: Arc::new(FailState {
                fail_next: AtomicU32::new(0),
                fail_after_write: AtomicU32::new(0),
                fail_reads: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
                row_reads: AtomicU64::new(0),
                gate: Semaphore::new(0),
                gated: AtomicBool::new(false),
            }),
        }
    }

    /// Fail the next `count` calls to `persist_entry`.
    pub fn fail_next(&self, count: u32) {
        self.state.fail_next.store(count, Ordering::Release);
    }

    /// Let the next `count` entries reach storage, then report failure.
    pub fn fail_after_write(&self, count: u32) {
        self.state.fail_after_write.store(count, Ordering::Release);
    }

    /// Make every read fail until switched off.
    pub fn fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::Release);
    }

    /// Hold every `persist_entry` until [`release`](Self::release) grants
    /// it a permit.
    pub fn hold_writes(&self) {
        self.state.gated.store(true, Ordering::Release);
    }

    /// Let `count` held writes through.
    pub fn release(&self, count: usize) {
        self.state.gate.add_permits(count);
    }

    /// Stop holding writes and let every waiting one through.
    pub fn open_gate(&self) {
        self.state.gated.store(false, Ordering::Release);
        self.state.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Calls to `persist_entry` so far, failed ones included.
    #[must_use]
    pub fn persist_attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::Acquire)
    }

    /// Calls to `read_rows` so far.
    #[must_use]
    pub fn row_reads(&self) -> u64 {
        self.state.row_reads.load(Ordering::Acquire)
    }

    /// The wrapped store, for inspecting or tampering with raw rows.
    #[must_use]
    pub fn inner(&self) -> &Arc<KvAuditStore> {
        &self.inner
    }

    fn check_reads(&self) -> AuditResult<()> {
        if self.state.fail_reads.load(Ordering::Acquire) {
            return Err(AuditError::Storage("injected read failure".into()));
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for FailingStore {
    async fn persist_entry(&self, entry: &AuditEntry) -> AuditResult<()> {
        self.state.attempts.fetch_add(1, Ordering::AcqRel);
        if self.state.gated.load(Ordering::Acquire) {
            let permit = self
                .state
                .gate
                .acquire()
                .await
                .map_err(|e| AuditError::Storage(e.to_string()))?;
            permit.forget();
        }
        if self
            .state
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuditError::Storage("injected write failure".into()));
        }
        self.inner.persist_entry(entry).await?;
        if self
            .state
            .fail_after_write
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuditError::Storage("injected failure after write".into()));
        }
        Ok(())
    }

    async fn read_rows(&self, range: Range<u64>, limit: usize) -> AuditResult<Vec<StoredRow>> {
        self.check_reads()?;
        self.state.row_reads.fetch_add(1, Ordering::AcqRel);
        self.inner.read_rows(range, limit).await
    }

    async fn last_row(&self) -> AuditResult<Option<StoredRow>> {
        self.check_reads()?;
        self.inner.last_row().await
    }

    async fn get_entry(&self, id: &Uuid) -> AuditResult<Option<AuditEntry>> {
        self.check_reads()?;
        self.inner.get_entry(id).await
    }

    async fn persist_anchor(&self, anchor: &RootAnchor) -> AuditResult<()> {
        self.inner.persist_anchor(anchor).await
    }

    async fn read_anchors(&self) -> AuditResult<Vec<RootAnchor>> {
        self.check_reads()?;
        self.inner.read_anchors().await
    }

    async fn close(&self) -> AuditResult<()> {
        self.inner.close().await
    }
}
