//! Restart behaviour over the persistent store and key directory.

use std::path::Path;
use std::sync::Arc;

use warden_audit::{
    AuditOptions, AuditService, AuditStore, HandlerAction, KeyManager, KvAuditStore, Outcome,
};
use warden_storage::{KvStore as _, SurrealKvStore};
use warden_test::sample_context;

async fn open_service(dir: &Path) -> (AuditService, Arc<SurrealKvStore>) {
    let kv = Arc::new(SurrealKvStore::open(dir.join("audit")).unwrap());
    let store: Arc<dyn AuditStore> = Arc::new(KvAuditStore::new(Arc::clone(&kv) as _));
    let keys = Arc::new(KeyManager::open(dir.join("keys")).unwrap());
    let service = warden_test::service_over(store, keys, AuditOptions::default()).await;
    (service, kv)
}

#[tokio::test]
async fn test_chain_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (service, kv) = open_service(dir.path()).await;
    for action in [HandlerAction::Memorize, HandlerAction::Recall] {
        service
            .log_action(action, "handler", sample_context(), Outcome::Success)
            .await
            .unwrap();
    }
    service.shutdown().await;
    let head_before = service.head().unwrap();
    // Two actions plus the shutdown event.
    assert_eq!(head_before.sequence, 2);
    drop(service);
    kv.close().await.unwrap();
    drop(kv);

    let (service, kv) = open_service(dir.path()).await;
    assert_eq!(service.head(), Some(head_before));

    let next = service
        .log_action(HandlerAction::Speak, "handler", sample_context(), Outcome::Success)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.sequence, 3);
    assert_eq!(next.previous_hash, head_before.entry_hash);

    let report = service.verify_audit_integrity().await.unwrap();
    assert!(report.verified, "issues: {:?}", report.issues);
    assert_eq!(report.total_entries, 4);

    service.shutdown().await;
    drop(service);
    kv.close().await.unwrap();
}

#[tokio::test]
async fn test_rotated_keys_verify_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (service, kv) = open_service(dir.path()).await;
    service
        .log_action(HandlerAction::Tool, "handler", sample_context(), Outcome::Success)
        .await
        .unwrap();
    service.rotate_signing_key().await.unwrap();
    service.shutdown().await;
    drop(service);
    kv.close().await.unwrap();
    drop(kv);

    // A verify-only key ring is enough to check every signature.
    let kv = Arc::new(SurrealKvStore::open(dir.path().join("audit")).unwrap());
    let store: Arc<dyn AuditStore> = Arc::new(KvAuditStore::new(Arc::clone(&kv) as _));
    let keys = Arc::new(KeyManager::verify_only_from_dir(dir.path().join("keys")).unwrap());
    assert_eq!(keys.records().unwrap().len(), 2);

    let verifier = warden_audit::Verifier::new(store, keys, 16);
    let report = verifier.verify(warden_audit::VerifyRange::all()).await.unwrap();
    assert!(report.verified, "issues: {:?}", report.issues);
    assert_eq!(report.total_entries, 3);

    kv.close().await.unwrap();
}
