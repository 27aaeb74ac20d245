//! The sequencer and service in front of a store that misbehaves.

#![allow(clippy::arithmetic_side_effects)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use warden_audit::{
    ActionType, AuditContext, AuditError, AuditOptions, AuditQuery, AuditStore, ChainSequencer,
    EntryFields, HandlerAction, KeyManager, Outcome, SequencerOptions, SortOrder, SystemClock,
};
use warden_test::{FailingStore, sample_context, sample_event};

fn fields(action: HandlerAction) -> EntryFields {
    EntryFields::new(
        ActionType::Handler(action),
        "test_handler",
        AuditContext::new().with_entity("thought-1"),
        Outcome::Success,
    )
}

fn far() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

async fn sequencer_over(store: &FailingStore) -> ChainSequencer {
    ChainSequencer::spawn(
        Arc::new(store.clone()),
        Arc::new(KeyManager::ephemeral()),
        Arc::new(SystemClock),
        SequencerOptions {
            queue_capacity: 64,
            anchor_interval: 0,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_failed_persist_does_not_advance_head() {
    let store = FailingStore::new();
    let sequencer = sequencer_over(&store).await;

    let first = sequencer.append(fields(HandlerAction::Tool), far()).await.unwrap();
    store.fail_next(1);

    let err = sequencer
        .append(fields(HandlerAction::Tool), far())
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Persistence { sequence: 1, .. }));
    assert_eq!(sequencer.head().unwrap().sequence, 0);

    let retried = sequencer.append(fields(HandlerAction::Tool), far()).await.unwrap();
    assert_eq!(retried.sequence, 1);
    assert_eq!(retried.previous_hash, first.entry_hash);
    assert_eq!(store.read_entries(0..10).await.unwrap().len(), 2);
    sequencer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_timeout_commits_nothing() {
    let store = FailingStore::new();
    store.hold_writes();
    let sequencer = Arc::new(sequencer_over(&store).await);

    // Holds the owner inside persist until the gate opens.
    let blocker = {
        let sequencer = Arc::clone(&sequencer);
        tokio::spawn(async move { sequencer.append(fields(HandlerAction::Speak), far()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = fields(HandlerAction::Defer);
    let late_id = late.id;
    let err = sequencer
        .append(late, Instant::now() + Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Timeout { .. }));

    store.open_gate();
    assert_eq!(blocker.await.unwrap().unwrap().sequence, 0);

    let next = sequencer.append(fields(HandlerAction::Speak), far()).await.unwrap();
    assert_eq!(next.sequence, 1);
    assert!(store.get_entry(&late_id).await.unwrap().is_none());
    assert_eq!(store.read_entries(0..10).await.unwrap().len(), 2);
    sequencer.shutdown().await;
}

#[tokio::test]
async fn test_consecutive_failures_leave_one_entry() {
    let store = FailingStore::new();
    store.fail_next(2);
    let service = warden_test::memory_service_over(store.clone()).await;
    for _ in 0..3 {
        service
            .log_action(HandlerAction::Speak, "h", sample_context(), Outcome::Success)
            .await
            .unwrap();
    }
    assert_eq!(store.persist_attempts(), 3);
    assert_eq!(service.stats().failures, 2);
    assert_eq!(service.stats().head_sequence, Some(0));
    service.shutdown().await;
}

#[tokio::test]
async fn test_write_that_lands_then_fails_is_adopted() {
    let store = FailingStore::new();
    let service = warden_test::memory_service_over(store.clone()).await;
    service.log_event("first", sample_event()).await.unwrap();

    store.fail_after_write(1);
    let reported = service.log_event("second", sample_event()).await.unwrap();
    assert!(reported.is_none());
    assert_eq!(service.stats().head_sequence, Some(0));

    let third = service
        .log_event("third", sample_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.sequence, 2);
    assert_eq!(service.stats().head_sequence, Some(2));
    assert_eq!(service.stats().failures, 1);

    let report = service.verify_audit_integrity().await.unwrap();
    assert!(report.verified, "issues: {:?}", report.issues);
    assert_eq!(report.total_entries, 3);
    service.shutdown().await;
}

#[tokio::test]
async fn test_mandatory_write_that_lands_then_fails_recovers() {
    let store = FailingStore::new();
    let service = warden_test::service_over(
        Arc::new(store.clone()),
        Arc::new(KeyManager::ephemeral()),
        AuditOptions {
            mandatory: true,
            ..AuditOptions::default()
        },
    )
    .await;

    store.fail_after_write(1);
    let err = service.log_event("first", sample_event()).await.unwrap_err();
    assert!(matches!(err, AuditError::Unavailable(_)));

    let next = service
        .log_event("second", sample_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.sequence, 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_unfiltered_page_reads_only_its_window() {
    let store = FailingStore::new();
    let service = warden_test::service_over(
        Arc::new(store.clone()),
        Arc::new(KeyManager::ephemeral()),
        AuditOptions {
            query_batch_size: 4,
            ..AuditOptions::default()
        },
    )
    .await;
    for _ in 0..40 {
        service.log_event("tick", sample_event()).await.unwrap();
    }

    let before = store.row_reads();
    let page = service
        .query_page(&AuditQuery::new(), 0, 10, SortOrder::Descending)
        .await
        .unwrap();
    assert_eq!(store.row_reads() - before, 1);
    assert_eq!(page.total, 40);
    let sequences: Vec<u64> = page.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (30..40).rev().collect::<Vec<_>>());
    service.shutdown().await;
}
