//! Postgres-backed change log.
//!
//! The installer and operator queries go through a small `PgPool`. Each
//! worker session owns a dedicated `PgConnection`, and notifications arrive
//! through a `PgListener`. Connection strings may carry credentials and are
//! never logged.

use crate::error::{StoreError, StoreResult};
use crate::installer::{
    self, CaptureTarget, CHANGE_LOG_TABLE, FALLBACK_PRIMARY_KEY, INSTALL_LOCK_KEY, NOTIFY_CHANNEL,
};
use crate::store::{
    ChangeLogSession, ChangeLogStats, ChangeLogStore, ClaimStrategy, Notification,
    NotificationSubscription, RowFailure, RowReject,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elasticsync_types::{ChangeLogEntry, ChangeOperation, TrackedEntity, WorkerId};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{Connection, Executor, FromRow, PgConnection, PgPool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const COLUMNS: &str = "id, table_name, operation, record_id, payload, processed, retry_count, \
     last_error, dead_letter, locked_by, locked_at, processed_by, last_attempt_at, \
     next_retry_at, created_at";

const POOL_SIZE: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Row shape of the change-log table.
#[derive(Debug, Clone, FromRow)]
struct ChangeLogRow {
    id: i64,
    table_name: String,
    operation: String,
    record_id: String,
    payload: serde_json::Value,
    processed: bool,
    retry_count: i32,
    last_error: Option<String>,
    dead_letter: bool,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    processed_by: Option<String>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ChangeLogRow {
    fn into_entry(self) -> Result<ChangeLogEntry, RowReject> {
        let operation = ChangeOperation::from_str(&self.operation)
            .map_err(|e| RowReject::new(self.id, e.to_string()))?;
        Ok(ChangeLogEntry {
            id: self.id,
            table_name: self.table_name,
            operation,
            record_id: self.record_id,
            payload: self.payload,
            processed: self.processed,
            retry_count: self.retry_count,
            last_error: self.last_error,
            dead_letter: self.dead_letter,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            processed_by: self.processed_by,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
        })
    }
}

/// Change log stored in Postgres.
#[derive(Clone)]
pub struct PgChangeLogStore {
    pool: PgPool,
    connect_options: PgConnectOptions,
}

impl PgChangeLogStore {
    /// Connects to the database named by `connection_string`.
    pub async fn connect(connection_string: &str) -> StoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(connection_string)?;
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(connect_options.clone())
            .await?;
        Ok(Self {
            pool,
            connect_options,
        })
    }

    /// Returns the pool used for installer and operator queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolves key columns: configured, else introspected, else `id`.
    async fn resolve_targets(
        conn: &mut PgConnection,
        entities: &[TrackedEntity],
    ) -> StoreResult<Vec<CaptureTarget>> {
        let mut targets = Vec::with_capacity(entities.len());
        for entity in entities {
            let primary_key = match &entity.primary_key {
                Some(pk) => pk.clone(),
                None => {
                    let found = introspect_primary_key(&mut *conn, &entity.table).await?;
                    found.unwrap_or_else(|| {
                        warn!(
                            table = %entity.table,
                            "no primary key found, capturing {FALLBACK_PRIMARY_KEY:?}"
                        );
                        FALLBACK_PRIMARY_KEY.to_string()
                    })
                }
            };
            debug!(table = %entity.table, %primary_key, "resolved capture target");
            targets.push(CaptureTarget::new(entity.table.clone(), primary_key));
        }
        Ok(targets)
    }
}

/// First primary-key column of `table`, resolved through the search path the
/// same way the capture trigger's `ON` clause is.
async fn introspect_primary_key(conn: &mut PgConnection, table: &str) -> StoreResult<Option<String>> {
    let column = sqlx::query_scalar::<_, String>(
        r#"SELECT a.attname::text
           FROM pg_index i
           JOIN pg_attribute a
             ON a.attrelid = i.indrelid
            AND a.attnum = ANY(i.indkey)
           WHERE i.indrelid = to_regclass(quote_ident($1))
             AND i.indisprimary
           ORDER BY array_position(i.indkey::int2[], a.attnum)
           LIMIT 1"#,
    )
    .bind(table)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(column)
}

#[async_trait]
impl ChangeLogStore for PgChangeLogStore {
    async fn install(&self, entities: &[TrackedEntity]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(INSTALL_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let targets = Self::resolve_targets(&mut *tx, entities).await?;
        let script = installer::install_script(&targets);
        (&mut *tx)
            .execute(sqlx::raw_sql(&script))
            .await
            .map_err(|e| StoreError::Ddl(e.to_string()))?;
        tx.commit().await?;

        info!(tables = targets.len(), "capture triggers installed");
        Ok(())
    }

    async fn open_session(
        &self,
        worker: &WorkerId,
        strategy: ClaimStrategy,
    ) -> StoreResult<Box<dyn ChangeLogSession>> {
        let conn = PgConnection::connect_with(&self.connect_options).await?;
        debug!(worker = %worker, "opened worker session");
        Ok(Box::new(PgSession {
            conn,
            worker: worker.clone(),
            strategy,
        }))
    }

    async fn subscribe(&self) -> StoreResult<Box<dyn NotificationSubscription>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        debug!(channel = NOTIFY_CHANNEL, "listening for changes");
        Ok(Box::new(PgSubscription { listener }))
    }

    async fn stats(&self) -> StoreResult<ChangeLogStats> {
        let (pending, claimed, retrying, processed, dead_lettered) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(&format!(
                r#"SELECT
                    COUNT(*) FILTER (WHERE NOT processed AND NOT dead_letter),
                    COUNT(*) FILTER (WHERE NOT processed AND NOT dead_letter AND locked_by IS NOT NULL),
                    COUNT(*) FILTER (WHERE NOT processed AND NOT dead_letter AND retry_count > 0),
                    COUNT(*) FILTER (WHERE processed),
                    COUNT(*) FILTER (WHERE dead_letter)
                   FROM {CHANGE_LOG_TABLE}"#
            ))
            .fetch_one(&self.pool)
            .await?;
        Ok(ChangeLogStats {
            pending,
            claimed,
            retrying,
            processed,
            dead_lettered,
        })
    }

    async fn requeue_dead_letters(&self, ids: Option<&[i64]>) -> StoreResult<u64> {
        let ids: Option<Vec<i64>> = ids.map(<[i64]>::to_vec);
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"UPDATE {CHANGE_LOG_TABLE}
               SET dead_letter = FALSE,
                   retry_count = 0,
                   next_retry_at = NULL,
                   locked_by = NULL,
                   locked_at = NULL
               WHERE dead_letter AND NOT processed
                 AND ($1::bigint[] IS NULL OR id = ANY($1))"#
        ))
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            sqlx::query("SELECT pg_notify($1, '')")
                .bind(NOTIFY_CHANNEL)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(requeued, "requeued dead-lettered rows");
        Ok(requeued)
    }
}

/// One worker's dedicated connection.
pub struct PgSession {
    conn: PgConnection,
    worker: WorkerId,
    strategy: ClaimStrategy,
}

impl PgSession {
    /// Claim stamp that outcome writes must match; `None` in single-worker mode.
    fn owner(&self) -> Option<String> {
        match self.strategy {
            ClaimStrategy::SingleWorker => None,
            ClaimStrategy::SkipLocked { .. } => Some(self.worker.to_string()),
        }
    }

    fn report_skipped(&self, outcome: &str, requested: usize, applied: u64) {
        let skipped = (requested as u64).saturating_sub(applied);
        if skipped > 0 {
            warn!(
                worker = %self.worker,
                skipped,
                outcome,
                "claim lost before outcome was recorded, rows left to their new owner"
            );
        }
    }

    async fn fetch(&mut self, batch_size: usize) -> StoreResult<Vec<ChangeLogRow>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = match self.strategy {
            ClaimStrategy::SingleWorker => {
                sqlx::query_as::<_, ChangeLogRow>(&format!(
                    r#"SELECT {COLUMNS}
                       FROM {CHANGE_LOG_TABLE}
                       WHERE NOT processed AND NOT dead_letter
                         AND (next_retry_at IS NULL OR next_retry_at <= now())
                       ORDER BY id
                       LIMIT $1"#
                ))
                .bind(limit)
                .fetch_all(&mut self.conn)
                .await?
            }
            ClaimStrategy::SkipLocked { claim_timeout } => {
                sqlx::query_as::<_, ChangeLogRow>(&format!(
                    r#"WITH candidates AS (
                           SELECT id
                           FROM {CHANGE_LOG_TABLE}
                           WHERE NOT processed AND NOT dead_letter
                             AND (next_retry_at IS NULL OR next_retry_at <= now())
                             AND (locked_by IS NULL
                                  OR locked_at < now() - make_interval(secs => $3))
                           ORDER BY id
                           LIMIT $1
                           FOR UPDATE SKIP LOCKED
                       )
                       UPDATE {CHANGE_LOG_TABLE} AS log
                       SET locked_by = $2, locked_at = now(), processed_by = $2
                       FROM candidates
                       WHERE log.id = candidates.id
                       RETURNING {returning}"#,
                    returning = qualified_columns("log")
                ))
                .bind(limit)
                .bind(self.worker.as_str())
                .bind(claim_timeout.as_secs_f64())
                .fetch_all(&mut self.conn)
                .await?
            }
        };
        Ok(rows)
    }
}

/// Outcome guard: the row is still pending and, when `$param` is set, still
/// claimed by that worker.
fn owned_by(param: usize) -> String {
    format!(
        "NOT log.processed AND NOT log.dead_letter \
         AND (${param}::text IS NULL OR log.locked_by = ${param})"
    )
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl ChangeLogSession for PgSession {
    fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    async fn claim(&mut self, batch_size: usize) -> StoreResult<Vec<ChangeLogEntry>> {
        let rows = self.fetch(batch_size).await?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut malformed = Vec::new();
        for row in rows {
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(reject) => malformed.push(reject),
            }
        }
        if !malformed.is_empty() {
            warn!(worker = %self.worker, count = malformed.len(), "dead-lettering malformed rows");
            self.dead_letter(&malformed).await?;
        }

        // UPDATE ... RETURNING does not preserve the CTE's order.
        entries.sort_by_key(|entry| entry.id);
        Ok(entries)
    }

    async fn mark_processed(&mut self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let owner = self.owner();
        let result = sqlx::query(&format!(
            r#"UPDATE {CHANGE_LOG_TABLE} AS log
               SET processed = TRUE,
                   last_attempt_at = now(),
                   locked_by = NULL,
                   locked_at = NULL,
                   next_retry_at = NULL
               WHERE log.id = ANY($1) AND {owned}"#,
            owned = owned_by(2)
        ))
        .bind(ids)
        .bind(owner)
        .execute(&mut self.conn)
        .await?;
        self.report_skipped("processed", ids.len(), result.rows_affected());
        Ok(())
    }

    async fn mark_failed(&mut self, failures: &[RowFailure]) -> StoreResult<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = failures.iter().map(|f| f.id).collect();
        let reasons: Vec<String> = failures.iter().map(|f| f.reason.clone()).collect();
        let delays: Vec<f64> = failures.iter().map(|f| f.retry_delay.as_secs_f64()).collect();
        let dead: Vec<bool> = failures.iter().map(|f| f.dead_letter).collect();
        let owner = self.owner();

        let result = sqlx::query(&format!(
            r#"UPDATE {CHANGE_LOG_TABLE} AS log
               SET retry_count = log.retry_count + 1,
                   last_error = f.reason,
                   last_attempt_at = now(),
                   locked_by = NULL,
                   locked_at = NULL,
                   dead_letter = f.dead,
                   next_retry_at = CASE WHEN f.dead THEN NULL
                                        ELSE now() + make_interval(secs => f.delay) END
               FROM UNNEST($1::bigint[], $2::text[], $3::float8[], $4::bool[])
                    AS f(id, reason, delay, dead)
               WHERE log.id = f.id AND {owned}"#,
            owned = owned_by(5)
        ))
        .bind(ids)
        .bind(reasons)
        .bind(delays)
        .bind(dead)
        .bind(owner)
        .execute(&mut self.conn)
        .await?;
        self.report_skipped("failed", failures.len(), result.rows_affected());
        Ok(())
    }

    async fn dead_letter(&mut self, rejects: &[RowReject]) -> StoreResult<()> {
        if rejects.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = rejects.iter().map(|r| r.id).collect();
        let reasons: Vec<String> = rejects.iter().map(|r| r.reason.clone()).collect();
        let owner = self.owner();

        let result = sqlx::query(&format!(
            r#"UPDATE {CHANGE_LOG_TABLE} AS log
               SET dead_letter = TRUE,
                   last_error = f.reason,
                   last_attempt_at = now(),
                   locked_by = NULL,
                   locked_at = NULL,
                   next_retry_at = NULL
               FROM UNNEST($1::bigint[], $2::text[]) AS f(id, reason)
               WHERE log.id = f.id AND {owned}"#,
            owned = owned_by(3)
        ))
        .bind(ids)
        .bind(reasons)
        .bind(owner)
        .execute(&mut self.conn)
        .await?;
        self.report_skipped("dead-lettered", rejects.len(), result.rows_affected());
        Ok(())
    }
}

/// `LISTEN` on the change-log channel.
pub struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl NotificationSubscription for PgSubscription {
    async fn recv(&mut self) -> StoreResult<Notification> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        Ok(Notification {
            table_name: notification.payload().to_string(),
        })
    }
}
