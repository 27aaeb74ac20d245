//! JSON-RPC API definition for the audit query surface.
//!
//! Uses jsonrpsee proc macros to define the interface. The gateway
//! implements the server side; dashboards and tools use the generated
//! client.

use chrono::{DateTime, Utc};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_audit::{ActionType, AuditContext, AuditEntry, Outcome, VerificationReport};
use warden_crypto::{ContentHash, KeyId, Signature};

// ---------- Wire types ----------

/// One audit entry as served to external readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryView {
    /// Entry identifier.
    pub id: Uuid,
    /// Position in the chain.
    pub sequence: u64,
    /// Filter label of the action (`MEMORIZE`, `conscience_check`, ...).
    pub action: String,
    /// Full typed action.
    pub action_type: ActionType,
    /// Who performed it.
    pub actor: String,
    /// When it was committed.
    pub timestamp: DateTime<Utc>,
    /// Typed context.
    pub context: AuditContext,
    /// How it ended.
    pub outcome: Outcome,
    /// `previous_hash` of the entry.
    pub hash_chain: ContentHash,
    /// Hash of the entry's content.
    pub entry_hash: ContentHash,
    /// Signature over `entry_hash`.
    pub signature: Signature,
    /// Key that produced `signature`.
    pub signing_key_id: KeyId,
}

impl From<AuditEntry> for AuditEntryView {
    fn from(entry: AuditEntry) -> Self {
        Self {
            action: entry.action_type.label().to_string(),
            id: entry.id,
            sequence: entry.sequence,
            action_type: entry.action_type,
            actor: entry.actor,
            timestamp: entry.timestamp,
            context: entry.context,
            outcome: entry.outcome,
            hash_chain: entry.previous_hash,
            entry_hash: entry.entry_hash,
            signature: entry.signature,
            signing_key_id: entry.signing_key_id,
        }
    }
}

/// A page of entries, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntriesResponse {
    /// Entries in descending sequence order.
    pub entries: Vec<AuditEntryView>,
    /// Matching entries across all pages.
    pub total: u64,
    /// Matches skipped before this page.
    pub offset: u64,
    /// Page size after clamping.
    pub limit: u64,
}

// ---------- RPC API ----------

/// The audit query API.
#[rpc(server, client, namespace = "audit")]
pub trait AuditRpc {
    /// Entries matching the filters, newest first.
    ///
    /// `hours` restricts to entries committed in the last N hours.
    #[method(name = "entries")]
    async fn entries(
        &self,
        entity_id: Option<String>,
        hours: Option<u32>,
        action_types: Option<Vec<String>>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<AuditEntriesResponse, ErrorObjectOwned>;

    /// Verify the whole chain.
    #[method(name = "verify")]
    async fn verify(&self) -> Result<VerificationReport, ErrorObjectOwned>;

    /// One entry by id.
    #[method(name = "entry")]
    async fn entry(&self, id: Uuid) -> Result<AuditEntryView, ErrorObjectOwned>;
}

/// Application error codes.
pub mod error_codes {
    /// No entry with the requested id.
    pub const ENTRY_NOT_FOUND: i32 = -32001;
    /// The audit service is shutting down.
    pub const SHUTTING_DOWN: i32 = -32003;
    /// Internal audit error.
    pub const INTERNAL_ERROR: i32 = -32004;
    /// Invalid request (bad parameters, etc.).
    pub const INVALID_REQUEST: i32 = -32005;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warden_audit::{HandlerAction, KeyManager, KvAuditStore};

    use super::*;

    #[tokio::test]
    async fn test_view_exposes_previous_hash_as_hash_chain() {
        let service = warden_test::service_over(
            Arc::new(KvAuditStore::in_memory()),
            Arc::new(KeyManager::ephemeral()),
            warden_audit::AuditOptions::default(),
        )
        .await;
        let first = service
            .log_action(
                HandlerAction::Recall,
                "recall_handler",
                warden_test::sample_context(),
                Outcome::Success,
            )
            .await
            .unwrap()
            .unwrap();
        let second = service
            .log_action(
                HandlerAction::Speak,
                "speak_handler",
                warden_test::sample_context(),
                Outcome::Success,
            )
            .await
            .unwrap()
            .unwrap();

        let view = AuditEntryView::from(second.clone());
        assert_eq!(view.action, "SPEAK");
        assert_eq!(view.hash_chain, first.entry_hash);
        assert_eq!(view.signature, second.signature);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["hash_chain"], first.entry_hash.to_hex());
        assert_eq!(json["outcome"], "success");
    }
}
