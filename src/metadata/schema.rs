//! Forward-only schema migrations. Each migration is idempotent DDL plus
//! an optional data backfill, applied in order inside one transaction
//! and recorded in `schema_migrations`.

use rusqlite::Transaction;

use crate::error::Result;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub apply: fn(&Transaction) -> Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base schema",
        apply: migration_1_base_schema,
    },
    Migration {
        version: 2,
        description: "backfill DELETE_MARKER for orphan objects_current rows",
        apply: migration_2_backfill_delete_markers,
    },
];

fn migration_1_base_schema(tx: &Transaction) -> Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS buckets (
            bucket TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            versioning TEXT NOT NULL DEFAULT 'UNSET'
        );

        CREATE TABLE IF NOT EXISTS bucket_policies (
            bucket TEXT PRIMARY KEY REFERENCES buckets(bucket),
            policy_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS versions (
            version_id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            etag TEXT,
            size INTEGER NOT NULL,
            content_type TEXT,
            last_modified_utc TEXT NOT NULL,
            hlc_ts TEXT NOT NULL,
            site_id TEXT NOT NULL,
            state TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_versions_bucket_key ON versions(bucket, key);
        CREATE INDEX IF NOT EXISTS idx_versions_hlc ON versions(hlc_ts);

        CREATE TABLE IF NOT EXISTS objects_current (
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            version_id TEXT NOT NULL,
            PRIMARY KEY (bucket, key)
        );

        CREATE TABLE IF NOT EXISTS segments (
            segment_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            sealed_at TEXT,
            footer_checksum TEXT
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            access_key TEXT PRIMARY KEY,
            secret_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            policy TEXT,
            inflight_limit INTEGER,
            created_at TEXT NOT NULL,
            label TEXT,
            last_used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS api_key_bucket_allow (
            access_key TEXT NOT NULL REFERENCES api_keys(access_key),
            bucket TEXT NOT NULL,
            PRIMARY KEY (access_key, bucket)
        );

        CREATE TABLE IF NOT EXISTS multipart_uploads (
            upload_id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            state TEXT NOT NULL,
            content_type TEXT
        );

        CREATE TABLE IF NOT EXISTS multipart_parts (
            upload_id TEXT NOT NULL REFERENCES multipart_uploads(upload_id),
            part_number INTEGER NOT NULL,
            version_id TEXT NOT NULL,
            etag TEXT NOT NULL,
            size INTEGER NOT NULL,
            last_modified TEXT NOT NULL,
            PRIMARY KEY (upload_id, part_number)
        );

        CREATE TABLE IF NOT EXISTS oplog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id TEXT NOT NULL,
            hlc_ts TEXT NOT NULL,
            op_type TEXT NOT NULL,
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            version_id TEXT,
            payload_json TEXT NOT NULL,
            bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (site_id, hlc_ts)
        );
        CREATE INDEX IF NOT EXISTS idx_oplog_hlc ON oplog(hlc_ts);

        CREATE TABLE IF NOT EXISTS hlc_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_hlc TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        INSERT OR IGNORE INTO hlc_state (id, last_hlc, updated_at)
            VALUES (1, '0000000000000000000-0000000000', '');

        CREATE TABLE IF NOT EXISTS replication_global (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_pull_hlc TEXT,
            last_push_hlc TEXT
        );
        INSERT OR IGNORE INTO replication_global (id, last_pull_hlc, last_push_hlc)
            VALUES (1, NULL, NULL);

        CREATE TABLE IF NOT EXISTS replication_remotes (
            remote_url TEXT PRIMARY KEY,
            last_pull_hlc TEXT,
            last_push_hlc TEXT
        );

        CREATE TABLE IF NOT EXISTS maintenance_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL
        );
        INSERT OR IGNORE INTO maintenance_state (id, state) VALUES (1, 'off');

        CREATE TABLE IF NOT EXISTS ops_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            summary_json TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Any `objects_current` row pointing at a version whose state is
/// missing or not one of the known enum values is synthesized into a
/// DELETE_MARKER so lookups return a definite state rather than an
/// error. A decision recorded in DESIGN.md: DELETE_MARKER, not ACTIVE,
/// is the "forget" representation here.
fn migration_2_backfill_delete_markers(tx: &Transaction) -> Result<()> {
    tx.execute_batch(
        "
        UPDATE versions
           SET state = 'DELETE_MARKER'
         WHERE version_id IN (
             SELECT oc.version_id
               FROM objects_current oc
               LEFT JOIN versions v ON v.version_id = oc.version_id
              WHERE v.version_id IS NULL
                 OR v.state NOT IN ('ACTIVE','DAMAGED','DELETED','DELETE_MARKER','CONFLICT')
         );
        ",
    )?;
    Ok(())
}

pub fn run_migrations(conn: &mut rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let applied: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= applied {
            continue;
        }
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!(version = migration.version, description = migration.description, "applied migration");
    }
    Ok(())
}
