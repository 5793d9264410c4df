//! Persistence retry under lock conflicts

mod fixtures;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use fixtures::*;
use helpers::*;
use resume_extract::db::retrying::Persistence;
use resume_extract::models::field::RawFields;
use resume_extract::models::resume::UserId;
use resume_extract::services::records::{commit_record, Stage};
use resume_extract::services::retry::RetryPolicy;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn raw_fields() -> RawFields {
    resume_extract::services::extraction::parse_completion(&short_reply("Acme")).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_two_deadlocks_then_success_applies_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(42, ACME_RESUME);
    store.inject_deadlocks(2);

    let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
    assert!(policy.delay_before(3) > policy.delay_before(2));
    let persistence = Persistence::new(store.clone(), policy);

    let started = Instant::now();
    let success = assert_ok!(
        commit_record(&validator("2026-10-18"), &persistence, UserId(42), &raw_fields()).await
    );

    assert_eq!(success.user_id, UserId(42));
    assert_eq!(store.apply_attempts(), 3);
    assert_eq!(store.applied(), 1);
    assert!(store.resume(42).unwrap().last_processed.is_some());
    // 100ms before attempt 2, 200ms before attempt 3
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_deadlock_reports_record_failure() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(9, ACME_RESUME);
    store.inject_deadlocks(10);

    let failure = commit_record(
        &validator("2026-10-18"),
        &persistence(Arc::clone(&store)),
        UserId(9),
        &raw_fields(),
    )
    .await
    .unwrap_err();

    assert_eq!(failure.stage, Stage::Persist);
    assert!(!failure.terminal);
    assert!(failure.message.contains("deadlock"));
    assert_eq!(store.apply_attempts(), 3);
    assert_eq!(store.applied(), 0);
    assert!(store.resume(9).unwrap().last_processed.is_none());
}

#[tokio::test]
async fn test_rejected_value_is_not_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(3, ACME_RESUME);
    store.reject_writes_for(3);

    let failure = assert_err!(
        commit_record(
            &validator("2026-10-18"),
            &persistence(Arc::clone(&store)),
            UserId(3),
            &raw_fields(),
        )
        .await
    );

    assert_eq!(store.apply_attempts(), 1);
    assert!(failure.message.contains("value too long"));
    assert!(!failure.terminal);
}
