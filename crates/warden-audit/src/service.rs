//! The audit facade.
//!
//! [`AuditService`] is what the rest of the system holds. It turns typed
//! calls into [`EntryFields`], hands them to the sequencer and applies the
//! failure policy:
//!
//! - **fail-open** (default): a failed append is logged on the
//!   `warden_audit::failures` target, counted, and the caller gets
//!   `Ok(None)`
//! - **mandatory**: a failed append is returned as
//!   [`AuditError::Unavailable`] and the caller decides what to do

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;
use warden_crypto::KeyId;

use crate::clock::{Clock, SystemClock};
use crate::entry::{
    ActionType, AuditContext, AuditEntry, ContextValue, EntryFields, HandlerAction, Outcome,
    Severity,
};
use crate::error::{AuditError, AuditResult};
use crate::keys::{KeyManager, KeyRecord};
use crate::query::{AuditPage, AuditQuery, QueryService, SortOrder};
use crate::sequencer::{ChainHead, ChainSequencer, SequencerOptions};
use crate::store::AuditStore;
use crate::verifier::{IntegrityAssessment, VerificationReport, Verifier, VerifyRange};

/// Tracing target for fail-open audit failures.
pub const FAILURE_TARGET: &str = "warden_audit::failures";

/// Actor recorded for the service's own lifecycle events.
const SERVICE_ACTOR: &str = "audit_service";
/// Actor recorded for conscience decisions.
const CONSCIENCE_ACTOR: &str = "conscience_system";
/// Upper bound on a single append wait.
const MAX_APPEND_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Service tuning and failure policy.
#[derive(Debug, Clone)]
pub struct AuditOptions {
    /// Propagate append failures instead of logging them.
    pub mandatory: bool,
    /// How long a producer waits for its turn.
    pub append_timeout: Duration,
    /// Pending appends the sequencer queue holds.
    pub queue_capacity: usize,
    /// Record a root anchor every N entries. 0 disables anchors.
    pub anchor_interval: u64,
    /// Entries read per store call by the verifier and queries.
    pub query_batch_size: usize,
    /// Largest page a query may return.
    pub max_query_limit: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            mandatory: false,
            append_timeout: Duration::from_secs(5),
            queue_capacity: 4096,
            anchor_interval: 1000,
            query_batch_size: 256,
            max_query_limit: 1000,
        }
    }
}

/// A system event to record with [`AuditService::log_event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Who raised the event.
    pub actor: String,
    /// What the event is about.
    pub entity_id: Option<String>,
    /// How it ended.
    pub outcome: Outcome,
    /// How much attention it deserves.
    pub severity: Severity,
    /// Extra typed fields.
    pub metadata: BTreeMap<String, ContextValue>,
}

impl AuditEvent {
    /// A successful, low-severity event raised by `actor`.
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            entity_id: None,
            outcome: Outcome::Success,
            severity: Severity::Low,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the entity.
    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Set the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Add a metadata field.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a conscience check, as passed to
/// [`AuditService::log_conscience_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConscienceResult {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Why the conscience decided as it did.
    pub reason: Option<String>,
    /// Risk label such as `low` or `high`.
    pub risk_level: Option<String>,
    /// Changes the conscience asked for, if any.
    pub modifications: Option<serde_json::Value>,
}

/// Counters for the lifetime of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Entries committed by this instance.
    pub entries_committed: u64,
    /// Appends that failed for any reason.
    pub failures: u64,
    /// Of those, appends that timed out.
    pub timeouts: u64,
    /// Sequence of the last committed entry.
    pub head_sequence: Option<u64>,
    /// Key currently signing new entries.
    pub active_key_id: Option<KeyId>,
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Builder for [`AuditService`].
pub struct AuditServiceBuilder {
    store: Arc<dyn AuditStore>,
    keys: Option<Arc<KeyManager>>,
    clock: Arc<dyn Clock>,
    options: AuditOptions,
}

impl AuditServiceBuilder {
    /// Use this key manager. Without one, an ephemeral key is generated.
    #[must_use]
    pub fn keys(mut self, keys: Arc<KeyManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Use this time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use these options.
    #[must_use]
    pub fn options(mut self, options: AuditOptions) -> Self {
        self.options = options;
        self
    }

    /// Recover the chain head and start the sequencer.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NoActiveKey`] if the key manager cannot sign,
    /// or a storage error if the head cannot be read.
    pub async fn start(self) -> AuditResult<AuditService> {
        let keys = match self.keys {
            Some(keys) => keys,
            None => {
                warn!("No key manager configured; signing with an ephemeral key");
                Arc::new(KeyManager::ephemeral())
            },
        };

        let sequencer = ChainSequencer::spawn(
            Arc::clone(&self.store),
            Arc::clone(&keys),
            self.clock,
            SequencerOptions {
                queue_capacity: self.options.queue_capacity,
                anchor_interval: self.options.anchor_interval,
            },
        )
        .await?;

        let verifier = Verifier::new(
            Arc::clone(&self.store),
            Arc::clone(&keys),
            self.options.query_batch_size,
        );
        let queries = QueryService::new(
            Arc::clone(&self.store),
            self.options.query_batch_size,
            self.options.max_query_limit,
        );

        info!(
            mandatory = self.options.mandatory,
            timeout_ms = u64::try_from(self.options.append_timeout.as_millis()).unwrap_or(u64::MAX),
            persistent_keys = keys.is_persistent(),
            "Audit service started"
        );

        Ok(AuditService {
            sequencer,
            verifier,
            queries,
            store: self.store,
            keys,
            options: self.options,
            counters: Counters::default(),
        })
    }
}

/// The audit facade.
pub struct AuditService {
    sequencer: ChainSequencer,
    verifier: Verifier,
    queries: QueryService,
    store: Arc<dyn AuditStore>,
    keys: Arc<KeyManager>,
    options: AuditOptions,
    counters: Counters,
}

impl AuditService {
    /// Start building a service over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn AuditStore>) -> AuditServiceBuilder {
        AuditServiceBuilder {
            store,
            keys: None,
            clock: Arc::new(SystemClock),
            options: AuditOptions::default(),
        }
    }

    // -- Recording --

    /// Record a handler action. Its severity is added to the metadata.
    ///
    /// # Errors
    ///
    /// Only in mandatory mode: [`AuditError::Unavailable`] wrapping the
    /// append failure.
    pub async fn log_action(
        &self,
        action: HandlerAction,
        actor: impl Into<String>,
        context: AuditContext,
        outcome: Outcome,
    ) -> AuditResult<Option<AuditEntry>> {
        let context = context.with_metadata("severity", action.severity().as_str());
        self.record(EntryFields::new(
            ActionType::Handler(action),
            actor,
            context,
            outcome,
        ))
        .await
    }

    /// Record a named system event.
    ///
    /// # Errors
    ///
    /// Only in mandatory mode: [`AuditError::Unavailable`] wrapping the
    /// append failure.
    pub async fn log_event(
        &self,
        event_type: impl Into<String>,
        event: AuditEvent,
    ) -> AuditResult<Option<AuditEntry>> {
        let mut context = AuditContext::new();
        context.entity_id = event.entity_id;
        context.metadata = event.metadata;
        let context = context.with_metadata("severity", event.severity.as_str());

        self.record(EntryFields::new(
            ActionType::SystemEvent(event_type.into()),
            event.actor,
            context,
            event.outcome,
        ))
        .await
    }

    /// Record a conscience decision about `action_type`.
    ///
    /// Denied decisions are recorded as high-severity failures.
    ///
    /// # Errors
    ///
    /// Only in mandatory mode: [`AuditError::Unavailable`] wrapping the
    /// append failure.
    pub async fn log_conscience_event(
        &self,
        conscience_name: &str,
        action_type: &str,
        result: ConscienceResult,
    ) -> AuditResult<Option<AuditEntry>> {
        let (outcome, severity) = if result.allowed {
            (Outcome::Success, Severity::Low)
        } else {
            (Outcome::Failure, Severity::High)
        };
        let modifications = result
            .modifications
            .as_ref()
            .map_or_else(|| "{}".to_string(), serde_json::Value::to_string);

        let mut context = AuditContext::new()
            .with_entity(conscience_name)
            .with_metadata("conscience_name", conscience_name)
            .with_metadata("allowed", result.allowed)
            .with_metadata(
                "risk_level",
                result.risk_level.unwrap_or_else(|| "unknown".to_string()),
            )
            .with_metadata("modifications", modifications)
            .with_metadata("severity", severity.as_str());
        if let Some(reason) = result.reason {
            context = context.with_metadata("reason", reason);
        }

        self.record(EntryFields::new(
            ActionType::ConscienceEvent(action_type.to_string()),
            CONSCIENCE_ACTOR,
            context,
            outcome,
        ))
        .await
    }

    /// Append pre-built fields under the service's failure policy.
    ///
    /// # Errors
    ///
    /// Only in mandatory mode: [`AuditError::Unavailable`] wrapping the
    /// append failure.
    pub async fn record(&self, fields: EntryFields) -> AuditResult<Option<AuditEntry>> {
        let action = fields.action_type.to_string();
        match self
            .sequencer
            .append(fields, deadline_after(self.options.append_timeout))
            .await
        {
            Ok(entry) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            },
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if matches!(e, AuditError::Timeout { .. }) {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                if self.options.mandatory {
                    return Err(AuditError::Unavailable(Box::new(e)));
                }
                error!(
                    target: FAILURE_TARGET,
                    action = %action,
                    error = %e,
                    "Audit entry dropped"
                );
                Ok(None)
            },
        }
    }

    // -- Verification --

    /// Verify the whole chain.
    ///
    /// # Errors
    ///
    /// Returns an error only if entries cannot be read; tampering is in
    /// the report.
    pub async fn verify_audit_integrity(&self) -> AuditResult<VerificationReport> {
        self.verifier.verify(VerifyRange::all()).await
    }

    /// Verify part of the chain.
    ///
    /// # Errors
    ///
    /// Returns an error only if entries cannot be read.
    pub async fn verify_range(&self, range: VerifyRange) -> AuditResult<VerificationReport> {
        self.verifier.verify(range).await
    }

    /// Verify the whole chain and attach recommendations.
    ///
    /// # Errors
    ///
    /// Returns an error only if entries cannot be read.
    pub async fn assess(&self) -> AuditResult<IntegrityAssessment> {
        self.verifier.assess().await
    }

    // -- Queries --

    /// The latest `limit` entries about `entity_id`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn get_audit_trail(
        &self,
        entity_id: &str,
        limit: u64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let query = AuditQuery::new().for_entity(entity_id);
        let page = self
            .queries
            .page(&query, 0, limit, SortOrder::Descending)
            .await?;
        Ok(page.entries)
    }

    /// Lazy ascending stream of entries matching `query`.
    #[must_use]
    pub fn query(&self, query: AuditQuery) -> BoxStream<'static, AuditResult<AuditEntry>> {
        self.queries.stream(query)
    }

    /// One page of entries matching `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read.
    pub async fn query_page(
        &self,
        query: &AuditQuery,
        offset: u64,
        limit: u64,
        order: SortOrder,
    ) -> AuditResult<AuditPage> {
        self.queries.page(query, offset, limit, order).await
    }

    /// Look up one entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::EntryNotFound`] if no committed entry has `id`.
    pub async fn get_entry(&self, id: &Uuid) -> AuditResult<AuditEntry> {
        self.store
            .get_entry(id)
            .await?
            .ok_or_else(|| AuditError::EntryNotFound {
                entry_id: id.to_string(),
            })
    }

    // -- Keys and lifecycle --

    /// Retire the active key and start signing with a new one.
    ///
    /// The rotation itself is recorded as a `signing_key_rotated` event
    /// signed by the new key.
    ///
    /// # Errors
    ///
    /// Returns an error if the new key cannot be stored. A failure to
    /// record the event follows the usual failure policy.
    pub async fn rotate_signing_key(&self) -> AuditResult<KeyRecord> {
        let previous = self.keys.active_key().ok().map(|r| r.key_id);
        let record = self.keys.rotate_key()?;
        info!(
            previous = ?previous.as_ref().map(KeyId::as_str),
            key_id = %record.key_id,
            "Signing key rotated"
        );

        let mut event = AuditEvent::new(SERVICE_ACTOR)
            .with_severity(Severity::High)
            .with_metadata("new_key_id", record.key_id.as_str());
        if let Some(previous) = previous {
            event = event.with_metadata("previous_key_id", previous.as_str());
        }
        self.log_event("signing_key_rotated", event).await?;
        Ok(record)
    }

    /// Counters and head position.
    #[must_use]
    pub fn stats(&self) -> AuditStats {
        AuditStats {
            entries_committed: self.counters.committed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            head_sequence: self.sequencer.head().map(|h| h.sequence),
            active_key_id: self.keys.active_key().ok().map(|r| r.key_id),
        }
    }

    /// The last committed entry's sequence and hash.
    #[must_use]
    pub fn head(&self) -> Option<ChainHead> {
        self.sequencer.head()
    }

    /// Record `audit_service_shutdown`, drain the queue and stop the
    /// sequencer. Later appends fail with [`AuditError::ShuttingDown`].
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.sequencer.is_running() {
            let event = AuditEvent::new(SERVICE_ACTOR).with_metadata(
                "entries_committed",
                i64::try_from(self.counters.committed.load(Ordering::Relaxed)).unwrap_or(i64::MAX),
            );
            if let Err(e) = self.log_event("audit_service_shutdown", event).await {
                warn!(error = %e, "Failed to record audit shutdown");
            }
        }
        self.sequencer.shutdown().await;
    }

    /// The verifier over this service's store.
    #[must_use]
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// The key manager signing new entries.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Whether failures propagate.
    #[must_use]
    pub fn is_mandatory(&self) -> bool {
        self.options.mandatory
    }
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("options", &self.options)
            .field("head", &self.sequencer.head())
            .finish_non_exhaustive()
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_APPEND_TIMEOUT))
        .unwrap_or(now)
}
