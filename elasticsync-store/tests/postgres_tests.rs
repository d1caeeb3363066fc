//! Tests against a live Postgres. Run with
//! `DATABASE_URL=postgres://... cargo test -p elasticsync-store --features pg-tests`.

#![cfg(feature = "pg-tests")]

use elasticsync_store::installer::CHANGE_LOG_TABLE;
use elasticsync_store::{
    ChangeLogSession, ChangeLogStore, ClaimStrategy, NotificationSubscription, PgChangeLogStore,
    RowFailure, RowReject,
};
use elasticsync_types::{ChangeOperation, InstanceTag, TrackedEntity, WorkerId};
use serial_test::serial;
use std::collections::HashSet;
use std::time::Duration;

const SKIP_LOCKED: ClaimStrategy = ClaimStrategy::SkipLocked {
    claim_timeout: Duration::from_secs(60),
};

fn worker(n: usize) -> WorkerId {
    WorkerId::new(&InstanceTag::from_static("pg"), n)
}

async fn fresh_store() -> PgChangeLogStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for pg-tests");
    let store = PgChangeLogStore::connect(&url).await.unwrap();
    sqlx::raw_sql(
        r#"DROP SCHEMA IF EXISTS esnet CASCADE;
           DROP TABLE IF EXISTS "Customers";
           CREATE TABLE "Customers" ("Id" INT PRIMARY KEY, "Name" TEXT);
           DROP TABLE IF EXISTS orders;
           CREATE TABLE orders (id INT PRIMARY KEY, total NUMERIC);"#,
    )
    .execute(store.pool())
    .await
    .unwrap();
    store
        .install(&[TrackedEntity::new("Customers"), TrackedEntity::new("orders")])
        .await
        .unwrap();
    store
}

async fn insert_customers(store: &PgChangeLogStore, count: i32) {
    for id in 1..=count {
        sqlx::query(r#"INSERT INTO "Customers" ("Id", "Name") VALUES ($1, $2)"#)
            .bind(id)
            .bind(format!("customer {id}"))
            .execute(store.pool())
            .await
            .unwrap();
    }
}

// ── Install ──────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn install_is_idempotent() {
    let store = fresh_store().await;
    store
        .install(&[TrackedEntity::new("Customers"), TrackedEntity::new("orders")])
        .await
        .unwrap();

    let triggers: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_trigger WHERE tgname LIKE 'elastic_sync_trg_%' AND NOT tgisinternal",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(triggers, 6);
}

#[tokio::test]
#[serial]
async fn trigger_captures_introspected_key() {
    let store = fresh_store().await;
    insert_customers(&store, 1).await;
    sqlx::query(r#"DELETE FROM "Customers" WHERE "Id" = 1"#)
        .execute(store.pool())
        .await
        .unwrap();

    let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT table_name, operation, record_id FROM {CHANGE_LOG_TABLE} ORDER BY id"
    ))
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            ("Customers".into(), "INSERT".into(), "1".into()),
            ("Customers".into(), "DELETE".into(), "1".into()),
        ]
    );
}

#[tokio::test]
#[serial]
async fn key_introspection_ignores_other_schemas() {
    let store = fresh_store().await;
    sqlx::raw_sql(
        r#"DROP SCHEMA IF EXISTS shadow CASCADE;
           CREATE SCHEMA shadow;
           CREATE TABLE shadow.orders (code TEXT PRIMARY KEY);"#,
    )
    .execute(store.pool())
    .await
    .unwrap();
    store.install(&[TrackedEntity::new("orders")]).await.unwrap();

    sqlx::query("INSERT INTO orders (id, total) VALUES (7, 1.5)")
        .execute(store.pool())
        .await
        .unwrap();
    let record_id: String = sqlx::query_scalar(&format!(
        "SELECT record_id FROM {CHANGE_LOG_TABLE} WHERE table_name = 'orders'"
    ))
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(record_id, "7");

    sqlx::raw_sql("DROP SCHEMA shadow CASCADE")
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn trigger_notifies_listeners() {
    let store = fresh_store().await;
    let mut sub = store.subscribe().await.unwrap();
    insert_customers(&store, 1).await;

    let notification = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.table_name, "Customers");
}

// ── Claiming ─────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn concurrent_sessions_claim_disjoint_rows() {
    let store = fresh_store().await;
    insert_customers(&store, 20).await;

    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();
    let (first, second) = tokio::join!(a.claim(15), b.claim(15));

    let first: HashSet<i64> = first.unwrap().iter().map(|e| e.id).collect();
    let second: HashSet<i64> = second.unwrap().iter().map(|e| e.id).collect();
    assert!(first.is_disjoint(&second));
    assert_eq!(first.len() + second.len(), 20);
}

#[tokio::test]
#[serial]
async fn claimed_rows_are_ordered_and_stamped() {
    let store = fresh_store().await;
    insert_customers(&store, 5).await;

    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let batch = session.claim(5).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert!(batch.iter().all(|e| e.locked_by.as_deref() == Some("pg:worker_1")));
}

#[tokio::test]
#[serial]
async fn failure_and_success_update_state() {
    let store = fresh_store().await;
    insert_customers(&store, 2).await;

    let mut session = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let batch = session.claim(2).await.unwrap();
    session.mark_processed(&[batch[0].id]).await.unwrap();
    session
        .mark_failed(&[RowFailure {
            id: batch[1].id,
            reason: "rejected".into(),
            retry_delay: Duration::from_secs(300),
            dead_letter: false,
        }])
        .await
        .unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.retrying, 1);
    assert_eq!(stats.claimed, 0);

    // Backing off.
    assert!(session.claim(10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn late_outcome_after_reclaim_is_ignored() {
    let store = fresh_store().await;
    insert_customers(&store, 1).await;

    let mut a = store.open_session(&worker(0), SKIP_LOCKED).await.unwrap();
    let mut b = store.open_session(&worker(1), SKIP_LOCKED).await.unwrap();
    let id = a.claim(1).await.unwrap()[0].id;

    sqlx::query(&format!(
        "UPDATE {CHANGE_LOG_TABLE} SET locked_at = now() - interval '2 minutes'"
    ))
    .execute(store.pool())
    .await
    .unwrap();
    assert_eq!(b.claim(1).await.unwrap().len(), 1);

    // A's stale failure must not clear B's live claim.
    a.mark_failed(&[RowFailure {
        id,
        reason: "late".into(),
        retry_delay: Duration::from_secs(5),
        dead_letter: true,
    }])
    .await
    .unwrap();
    let (locked_by, dead_letter): (Option<String>, bool) = sqlx::query_as(&format!(
        "SELECT locked_by, dead_letter FROM {CHANGE_LOG_TABLE} WHERE id = $1"
    ))
    .bind(id)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(locked_by.as_deref(), Some("pg:worker_2"));
    assert!(!dead_letter);

    b.mark_processed(&[id]).await.unwrap();
    a.dead_letter(&[RowReject::new(id, "late")]).await.unwrap();

    let (processed, dead_letter, retry_count): (bool, bool, i32) = sqlx::query_as(&format!(
        "SELECT processed, dead_letter, retry_count FROM {CHANGE_LOG_TABLE} WHERE id = $1"
    ))
    .bind(id)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(processed);
    assert!(!dead_letter);
    assert_eq!(retry_count, 0);
}

#[tokio::test]
#[serial]
async fn requeue_restores_dead_letters() {
    let store = fresh_store().await;
    insert_customers(&store, 1).await;

    let mut session = store
        .open_session(&worker(0), ClaimStrategy::SingleWorker)
        .await
        .unwrap();
    let batch = session.claim(1).await.unwrap();
    session
        .mark_failed(&[RowFailure {
            id: batch[0].id,
            reason: "rejected".into(),
            retry_delay: Duration::from_secs(5),
            dead_letter: true,
        }])
        .await
        .unwrap();
    assert!(session.claim(1).await.unwrap().is_empty());

    assert_eq!(store.requeue_dead_letters(None).await.unwrap(), 1);
    let again = session.claim(1).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].retry_count, 0);
    assert_eq!(again[0].operation, ChangeOperation::Insert);
}
