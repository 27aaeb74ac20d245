//! Shared helpers for integration tests.

use std::sync::Arc;

use warden_audit::{AuditOptions, AuditService, KeyManager, KvAuditStore};
use warden_storage::KvStore as _;

/// Raw namespace holding committed entries.
pub const ENTRIES_NAMESPACE: &str = "audit:entries";

/// An in-memory service plus the store under it, for tampering.
#[allow(dead_code)]
pub async fn service_with_store(options: AuditOptions) -> (AuditService, Arc<KvAuditStore>) {
    let store = Arc::new(KvAuditStore::in_memory());
    let service = warden_test::service_over(
        Arc::clone(&store) as Arc<dyn warden_audit::AuditStore>,
        Arc::new(KeyManager::ephemeral()),
        options,
    )
    .await;
    (service, store)
}

/// Rewrite one JSON field of a stored entry, bypassing the chain.
#[allow(dead_code)]
pub async fn tamper_field(
    store: &KvAuditStore,
    sequence: u64,
    field: &str,
    value: serde_json::Value,
) {
    let key = format!("{sequence:020}");
    let raw = store
        .kv()
        .get(ENTRIES_NAMESPACE, &key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no entry stored at sequence {sequence}"));
    let mut json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    json[field] = value;
    store
        .kv()
        .set(ENTRIES_NAMESPACE, &key, serde_json::to_vec(&json).unwrap())
        .await
        .unwrap();
}

/// Remove a stored entry, bypassing the chain.
#[allow(dead_code)]
pub async fn delete_entry(store: &KvAuditStore, sequence: u64) {
    let removed = store
        .kv()
        .delete(ENTRIES_NAMESPACE, &format!("{sequence:020}"))
        .await
        .unwrap();
    assert!(removed, "no entry stored at sequence {sequence}");
}
