use chrono::Duration as ChronoDuration;
use elasticsync_store::{
    ChangeLogSession, ChangeLogStore, ClaimStrategy, MemoryChangeLogStore,
    NotificationSubscription, RowFailure, RowReject, StoreError,
};
use elasticsync_types::{ChangeOperation, InstanceTag, TrackedEntity, WorkerId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

const SKIP_LOCKED: ClaimStrategy = ClaimStrategy::SkipLocked {
    claim_timeout: Duration::from_secs(60),
};

fn worker(n: usize) -> WorkerId {
    WorkerId::new(&InstanceTag::from_static("test"), n)
}

fn seeded(count: usize) -> MemoryChangeLogStore {
    let store = MemoryChangeLogStore::new();
    for i in 0..count {
        store.capture(
            "Customers",
            ChangeOperation::Insert,
            &i.to_string(),
            json!({ "Id": i }),
        );
    }
    store
}

fn failure(id: i64, delay_secs: u64, dead: bool) -> RowFailure {
    RowFailure {
        id,
        reason: "mapper_parsing_exception".into(),
        retry_delay: Duration::from_secs(delay_secs),
        dead_letter: dead,
    }
}

// ── Capture ──────────────────────────────────────────────────────

#[tokio::test]
async fn capture_assigns_increasing_ids() {
    let store = seeded(3);
    let ids: Vec<i64> = store.entries().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn capture_notifies_subscribers() {
    let store = MemoryChangeLogStore::new();
    let mut sub = store.subscribe().await.unwrap();
    store.capture("Orders", ChangeOperation::Update, "9", json!({}));
    assert_eq!(sub.recv().await.unwrap().table_name, "Orders");
}

#[tokio::test]
async fn install_records_tables() {
    let store = MemoryChangeLogStore::new();
    store
        .install(&[TrackedEntity::new("Customers"), TrackedEntity::new("Orders")])
        .await
        .unwrap();
    assert_eq!(store.installed_tables(), vec!["Customers", "Orders"]);
}

// ── Claiming ─────────────────────────────────────────────────────

#[tokio::test]
async fn claim_returns_oldest_first_up_to_batch() {
    let store = seeded(5);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    let batch = session.claim(3).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn single_worker_claim_does_not_stamp_lock() {
    let store = seeded(1);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    session.claim(10).await.unwrap();
    assert!(store.entry(1).unwrap().locked_by.is_none());
    // Unmarked rows are fetched again.
    assert_eq!(session.claim(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn skip_locked_claims_are_disjoint() {
    let store = seeded(10);
    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();

    let first: HashSet<i64> = a.claim(6).await.unwrap().iter().map(|e| e.id).collect();
    let second: HashSet<i64> = b.claim(6).await.unwrap().iter().map(|e| e.id).collect();

    assert_eq!(first.len(), 6);
    assert_eq!(second.len(), 4);
    assert!(first.is_disjoint(&second));
    assert_eq!(b.claim(6).await.unwrap().len(), 0);
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let store = seeded(200);
    let mut handles = Vec::new();
    for n in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut session = store.open_session(&worker(n), SKIP_LOCKED).await.unwrap();
            let mut mine = Vec::new();
            loop {
                let batch = session.claim(7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.iter().map(|e| e.id));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "row {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn skip_locked_claim_stamps_worker() {
    let store = seeded(1);
    let mut session = store.open_session(&worker(2), SKIP_LOCKED).await.unwrap();
    session.claim(1).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert_eq!(entry.locked_by.as_deref(), Some("test:worker_3"));
    assert_eq!(entry.processed_by.as_deref(), Some("test:worker_3"));
    assert!(entry.locked_at.is_some());
}

#[tokio::test]
async fn expired_claim_is_recovered() {
    let store = seeded(1);
    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();

    assert_eq!(a.claim(1).await.unwrap().len(), 1);
    assert_eq!(b.claim(1).await.unwrap().len(), 0);

    store.advance_clock(ChronoDuration::seconds(61));
    let recovered = b.claim(1).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].locked_by.as_deref(), Some("test:worker_2"));
}

#[tokio::test]
async fn injected_claim_failure() {
    let store = seeded(1);
    store.fail_next_claims(1);
    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    assert!(matches!(session.claim(1).await, Err(StoreError::Unavailable(_))));
    assert_eq!(session.claim(1).await.unwrap().len(), 1);
    assert_eq!(store.claim_calls(), 2);
}

#[tokio::test]
async fn injected_open_failure() {
    let store = seeded(1);
    store.fail_next_opens(1);
    assert!(matches!(
        store.open_session(&worker(0), SKIP_LOCKED).await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(store.open_session(&worker(0), SKIP_LOCKED).await.is_ok());
    assert_eq!(store.open_calls(), 2);
}

// ── Outcomes ─────────────────────────────────────────────────────

#[tokio::test]
async fn processed_rows_are_never_fetched_again() {
    let store = seeded(2);
    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    session.claim(2).await.unwrap();
    session.mark_processed(&[1, 2]).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert!(entry.processed);
    assert!(entry.locked_by.is_none());
    assert!(entry.last_attempt_at.is_some());

    store.advance_clock(ChronoDuration::hours(2));
    assert!(session.claim(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failure_backs_off_then_becomes_eligible() {
    let store = seeded(1);
    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    session.claim(1).await.unwrap();
    session.mark_failed(&[failure(1, 30, false)]).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_error.as_deref(), Some("mapper_parsing_exception"));
    assert!(entry.locked_by.is_none());
    assert!(entry.next_retry_at.unwrap() > entry.last_attempt_at.unwrap());

    assert!(session.claim(1).await.unwrap().is_empty());
    store.advance_clock(ChronoDuration::seconds(31));
    assert_eq!(session.claim(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_failure_dead_letters() {
    let store = seeded(1);
    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    session.claim(1).await.unwrap();
    session.mark_failed(&[failure(1, 5, true)]).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert!(entry.dead_letter);
    assert_eq!(entry.retry_count, 1);

    store.advance_clock(ChronoDuration::hours(2));
    assert!(session.claim(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn reject_dead_letters_immediately() {
    let store = seeded(2);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    session
        .dead_letter(&[RowReject::new(1, "no tracked entity for table Customers")])
        .await
        .unwrap();

    let entry = store.entry(1).unwrap();
    assert!(entry.dead_letter);
    assert_eq!(entry.retry_count, 0);
    let batch = session.claim(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, 2);
}

#[tokio::test]
async fn late_outcome_after_reclaim_is_ignored() {
    let store = seeded(1);
    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();
    a.claim(1).await.unwrap();

    store.advance_clock(ChronoDuration::seconds(61));
    assert_eq!(b.claim(1).await.unwrap().len(), 1);
    b.mark_processed(&[1]).await.unwrap();

    a.mark_failed(&[failure(1, 5, true)]).await.unwrap();
    a.dead_letter(&[RowReject::new(1, "late")]).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert!(entry.processed);
    assert!(!entry.dead_letter);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.last_error, None);
}

#[tokio::test]
async fn late_failure_keeps_live_claim() {
    let store = seeded(1);
    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();
    a.claim(1).await.unwrap();

    store.advance_clock(ChronoDuration::seconds(61));
    b.claim(1).await.unwrap();

    a.mark_failed(&[failure(1, 5, false)]).await.unwrap();
    a.mark_processed(&[1]).await.unwrap();
    let entry = store.entry(1).unwrap();
    assert_eq!(entry.locked_by.as_deref(), Some("test:worker_2"));
    assert_eq!(entry.retry_count, 0);
    assert!(!entry.processed);

    b.mark_processed(&[1]).await.unwrap();
    assert!(store.entry(1).unwrap().processed);
}

#[tokio::test]
async fn outcomes_never_leave_a_terminal_state() {
    let store = seeded(1);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    session.claim(1).await.unwrap();
    session.mark_processed(&[1]).await.unwrap();
    session.mark_failed(&[failure(1, 5, true)]).await.unwrap();

    let entry = store.entry(1).unwrap();
    assert!(entry.processed);
    assert!(!entry.dead_letter);
    assert_eq!(entry.retry_count, 0);
}

// ── Operator APIs ────────────────────────────────────────────────

#[tokio::test]
async fn stats_count_by_state() {
    let store = seeded(5);
    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    session.claim(4).await.unwrap();
    session.mark_processed(&[1]).await.unwrap();
    session.mark_failed(&[failure(2, 5, false)]).await.unwrap();
    session.dead_letter(&[RowReject::new(3, "bad payload")]).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.retrying, 1);
}

#[tokio::test]
async fn requeue_all_dead_letters() {
    let store = seeded(3);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    session
        .mark_failed(&[failure(1, 5, true), failure(2, 5, true)])
        .await
        .unwrap();

    let mut sub = store.subscribe().await.unwrap();
    assert_eq!(store.requeue_dead_letters(None).await.unwrap(), 2);
    assert!(sub.recv().await.is_ok());

    let entry = store.entry(1).unwrap();
    assert!(!entry.dead_letter);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(session.claim(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn requeue_selected_dead_letters() {
    let store = seeded(3);
    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    session
        .dead_letter(&[RowReject::new(1, "x"), RowReject::new(2, "y")])
        .await
        .unwrap();

    assert_eq!(store.requeue_dead_letters(Some(&[2, 3])).await.unwrap(), 1);
    assert!(store.entry(1).unwrap().dead_letter);
    assert!(!store.entry(2).unwrap().dead_letter);
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_ends_open_subscriptions() {
    let store = MemoryChangeLogStore::new();
    let mut old = store.subscribe().await.unwrap();
    store.disconnect_listeners();
    assert!(matches!(old.recv().await, Err(StoreError::Subscription(_))));

    let mut fresh = store.subscribe().await.unwrap();
    store.capture("Orders", ChangeOperation::Insert, "1", json!({}));
    assert_eq!(fresh.recv().await.unwrap().table_name, "Orders");
    assert_eq!(store.subscription_count(), 2);
}
