//! Capture DDL.
//!
//! Generates the idempotent script that provisions the change-log table,
//! the trigger function and one trigger per tracked table and operation.
//! Every identifier taken from configuration is quoted.

use elasticsync_types::{ChangeOperation, TrackedEntity};

/// Schema holding the capture objects.
pub const SCHEMA: &str = "esnet";
/// Fully qualified change-log table.
pub const CHANGE_LOG_TABLE: &str = "esnet.elastic_sync_change_log";
/// Fully qualified trigger function.
pub const CAPTURE_FUNCTION: &str = "esnet.elastic_sync_log_change";
/// Notification channel the trigger function signals on.
pub const NOTIFY_CHANNEL: &str = "elastic_sync_change_log_channel";
/// Key for the transaction-scoped advisory lock serializing installers.
pub const INSTALL_LOCK_KEY: i64 = 0x0E1A_5715_C0DE;
/// Primary-key column assumed when none is configured or discoverable.
pub const FALLBACK_PRIMARY_KEY: &str = "id";

/// Postgres truncates identifiers beyond this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A table to attach capture triggers to, with its resolved key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub table: String,
    pub primary_key: String,
}

impl CaptureTarget {
    pub fn new(table: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into(),
        }
    }

    /// Uses the configured key, else [`FALLBACK_PRIMARY_KEY`].
    pub fn from_entity(entity: &TrackedEntity) -> Self {
        Self::new(
            entity.table.clone(),
            entity
                .primary_key
                .clone()
                .unwrap_or_else(|| FALLBACK_PRIMARY_KEY.to_string()),
        )
    }
}

/// Quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Trigger name for one table and operation: `elastic_sync_trg_<table>_<op>`.
pub fn trigger_name(table: &str, operation: ChangeOperation) -> String {
    let op = operation.as_str().to_lowercase();
    let prefix = format!("elastic_sync_trg_{}", table.to_lowercase());
    // Keep the operation suffix intact when the table name is long.
    let budget = MAX_IDENTIFIER_LEN - op.len() - 1;
    let mut cut = prefix.len().min(budget);
    while !prefix.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &prefix[..cut], op)
}

/// Change-log table, upgrade columns, indices and the trigger function.
pub fn base_script() -> String {
    format!(
        r#"CREATE SCHEMA IF NOT EXISTS {SCHEMA};

CREATE TABLE IF NOT EXISTS {CHANGE_LOG_TABLE} (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    record_id TEXT NOT NULL,
    payload JSONB NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    dead_letter BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

ALTER TABLE {CHANGE_LOG_TABLE}
    ADD COLUMN IF NOT EXISTS locked_by TEXT,
    ADD COLUMN IF NOT EXISTS locked_at TIMESTAMPTZ,
    ADD COLUMN IF NOT EXISTS processed_by TEXT,
    ADD COLUMN IF NOT EXISTS last_attempt_at TIMESTAMPTZ,
    ADD COLUMN IF NOT EXISTS next_retry_at TIMESTAMPTZ;

CREATE INDEX IF NOT EXISTS ix_elastic_sync_change_log_pending
    ON {CHANGE_LOG_TABLE} (processed, dead_letter, next_retry_at, created_at);
CREATE INDEX IF NOT EXISTS ix_elastic_sync_change_log_processed
    ON {CHANGE_LOG_TABLE} (processed);
CREATE INDEX IF NOT EXISTS ix_elastic_sync_change_log_record_id
    ON {CHANGE_LOG_TABLE} (record_id);
CREATE INDEX IF NOT EXISTS ix_elastic_sync_change_log_operation
    ON {CHANGE_LOG_TABLE} (operation);

CREATE OR REPLACE FUNCTION {CAPTURE_FUNCTION}() RETURNS trigger
LANGUAGE plpgsql AS $capture$
DECLARE
    row_image JSONB;
BEGIN
    IF TG_OP = 'DELETE' THEN
        row_image := to_jsonb(OLD);
    ELSE
        row_image := to_jsonb(NEW);
    END IF;

    INSERT INTO {CHANGE_LOG_TABLE} (table_name, operation, record_id, payload)
    VALUES (TG_TABLE_NAME, TG_OP, COALESCE(row_image ->> TG_ARGV[0], ''), row_image);

    PERFORM pg_notify('{NOTIFY_CHANNEL}', TG_TABLE_NAME);
    RETURN NULL;
END;
$capture$;
"#
    )
}

/// Drops stale capture triggers on one table and (re)attaches the current ones.
pub fn trigger_script(target: &CaptureTarget) -> String {
    let table = quote_ident(&target.table);
    let table_literal = quote_literal(&table);
    let key = quote_literal(&target.primary_key);
    let current: Vec<String> = ChangeOperation::ALL
        .iter()
        .map(|op| quote_literal(&trigger_name(&target.table, *op)))
        .collect();

    let mut script = format!(
        r#"DO $stale$
DECLARE
    stale RECORD;
BEGIN
    FOR stale IN
        SELECT t.tgname
        FROM pg_trigger t
        JOIN pg_proc p ON p.oid = t.tgfoid
        JOIN pg_namespace n ON n.oid = p.pronamespace
        WHERE t.tgrelid = {table_literal}::regclass
          AND NOT t.tgisinternal
          AND n.nspname = '{SCHEMA}'
          AND p.proname = 'elastic_sync_log_change'
          AND t.tgname NOT IN ({names})
    LOOP
        EXECUTE format('DROP TRIGGER %I ON %s', stale.tgname, {table_literal});
    END LOOP;
END;
$stale$;
"#,
        names = current.join(", ")
    );

    for op in ChangeOperation::ALL {
        let name = quote_ident(&trigger_name(&target.table, op));
        script.push_str(&format!(
            "DROP TRIGGER IF EXISTS {name} ON {table};\n\
             CREATE TRIGGER {name} AFTER {op} ON {table} \
             FOR EACH ROW EXECUTE FUNCTION {CAPTURE_FUNCTION}({key});\n",
            op = op.as_str()
        ));
    }
    script
}

/// The whole install script for a set of resolved targets.
pub fn install_script(targets: &[CaptureTarget]) -> String {
    let mut script = base_script();
    for target in targets {
        script.push('\n');
        script.push_str(&trigger_script(target));
    }
    script
}
