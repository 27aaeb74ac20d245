//! Service builders and logging setup for tests.

use std::sync::{Arc, Once};

use warden_audit::{AuditOptions, AuditService, AuditStore, KeyManager, KvAuditStore};

use crate::clock::ManualClock;

static LOGGING: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn setup_test_logging() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// In-memory service with an ephemeral key and default options.
///
/// # Panics
///
/// Panics if the service cannot start.
pub async fn memory_service() -> AuditService {
    memory_service_with(AuditOptions::default()).await
}

/// In-memory service with an ephemeral key.
///
/// # Panics
///
/// Panics if the service cannot start.
pub async fn memory_service_with(options: AuditOptions) -> AuditService {
    service_over(
        Arc::new(KvAuditStore::in_memory()),
        Arc::new(KeyManager::ephemeral()),
        options,
    )
    .await
}

/// Service over a caller-supplied store, with an ephemeral key.
///
/// # Panics
///
/// Panics if the service cannot start.
pub async fn memory_service_over(store: impl AuditStore + 'static) -> AuditService {
    service_over(
        Arc::new(store),
        Arc::new(KeyManager::ephemeral()),
        AuditOptions::default(),
    )
    .await
}

/// Service over the given store and keys, stamped by a [`ManualClock`].
///
/// # Panics
///
/// Panics if the service cannot start.
pub async fn service_over(
    store: Arc<dyn AuditStore>,
    keys: Arc<KeyManager>,
    options: AuditOptions,
) -> AuditService {
    setup_test_logging();
    AuditService::builder(store)
        .keys(keys)
        .clock(Arc::new(ManualClock::fixed()))
        .options(options)
        .start()
        .await
        .unwrap_or_else(|e| panic!("audit service failed to start: {e}"))
}

#[cfg(test)]
mod tests {
    use warden_audit::{Clock, HandlerAction, Outcome};

    use super::*;
    use crate::fixtures::sample_context;
    use crate::mocks::FailingStore;

    #[tokio::test]
    async fn test_memory_service_records() {
        let service = memory_service().await;
        let entry = service
            .log_action(HandlerAction::Speak, "speak_handler", sample_context(), Outcome::Success)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.timestamp, ManualClock::fixed().now());
    }

    #[tokio::test]
    async fn test_failing_store_is_fail_open() {
        let store = FailingStore::new();
        store.fail_next(1);
        let service = memory_service_over(store.clone()).await;
        let entry = service
            .log_action(HandlerAction::Speak, "speak_handler", sample_context(), Outcome::Success)
            .await
            .unwrap();
        assert!(entry.is_none());
        assert_eq!(store.persist_attempts(), 1);
    }
}
