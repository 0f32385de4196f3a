pub mod oplog;
pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;

use crate::barrier::{CommitClosure, MetaFlusher};
use crate::clock::{self, Hlc};
use crate::error::{Result, SeglakeError};
pub use oplog::{dedup_and_sort, DeletePayload, OpType, OplogEntry, PutPayload};
pub use types::{
    ApiKey, Bucket, BucketVersioning, MultipartPart, MultipartUpload, MultipartUploadState,
    SegmentRow, VersionRow, VersionState,
};

fn now_iso8601() -> String {
    let now = std::time::SystemTime::now();
    let since_epoch = now.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    httpdate_from_secs(since_epoch.as_secs())
}

/// Minimal UTC timestamp formatter: `YYYY-MM-DDTHH:MM:SSZ`. Avoids a
/// chrono dependency for what is purely an opaque, sortable string in
/// this schema.
pub fn httpdate_from_secs(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let rem = total_secs % 86_400;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let (y, mo, d) = civil_from_days(days as i64);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
}

// Howard Hinnant's civil_from_days algorithm, days since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// HLC sequencer: reads `last_hlc`, advances it past the wallclock, and
/// persists the new value, all inside the caller's transaction so the
/// advance is atomic with whatever it stamps.
pub fn hlc_next(tx: &Transaction) -> Result<Hlc> {
    let last: String = tx.query_row("SELECT last_hlc FROM hlc_state WHERE id = 1", [], |r| r.get(0))?;
    let prev = Hlc::parse(&last).unwrap_or(Hlc::MIN);
    let next = clock::step(&prev, clock::wallclock_nanos());
    tx.execute(
        "UPDATE hlc_state SET last_hlc = ?1, updated_at = ?2 WHERE id = 1",
        params![next.format(), now_iso8601()],
    )?;
    Ok(next)
}

/// Ratchet `last_hlc` forward to `at_least` without issuing a new
/// logical tick — used when applying replicated oplog entries, which
/// carry their own HLC from the originating site.
pub fn hlc_advance_to(tx: &Transaction, at_least: &Hlc) -> Result<()> {
    let last: String = tx.query_row("SELECT last_hlc FROM hlc_state WHERE id = 1", [], |r| r.get(0))?;
    let prev = Hlc::parse(&last).unwrap_or(Hlc::MIN);
    if *at_least > prev {
        tx.execute(
            "UPDATE hlc_state SET last_hlc = ?1, updated_at = ?2 WHERE id = 1",
            params![at_least.format(), now_iso8601()],
        )?;
    }
    Ok(())
}

/// Row-level view of `versions.hlc_ts`/`site_id` used to break last-
/// writer-wins ties.
fn hlc_site_key(hlc_ts: &str, site_id: &str) -> (String, String) {
    (hlc_ts.to_string(), site_id.to_string())
}

pub struct MetadataStore {
    write_conn: Mutex<Connection>,
    read_conns: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    pub site_id: String,
    pub db_path: PathBuf,
}

impl MetadataStore {
    pub fn open(db_path: &Path, site_id: String, read_pool_size: usize) -> Result<Self> {
        let mut write_conn = Connection::open(db_path)?;
        apply_pragmas(&write_conn)?;
        schema::run_migrations(&mut write_conn)?;

        let mut read_conns = Vec::with_capacity(read_pool_size.max(1));
        for _ in 0..read_pool_size.max(1) {
            let conn = Connection::open(db_path)?;
            apply_pragmas(&conn)?;
            read_conns.push(Mutex::new(conn));
        }

        Ok(Self {
            write_conn: Mutex::new(write_conn),
            read_conns,
            next_reader: AtomicUsize::new(0),
            site_id,
            db_path: db_path.to_path_buf(),
        })
    }

    async fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.read_conns.len();
        let conn = self.read_conns[idx].lock().await;
        f(&conn)
    }

    /// Runs a closure against the single write connection. `pub(crate)`
    /// so callers outside this module (ops modes issuing ad hoc
    /// transactions, e.g. `rebuild-index`) can reuse the same connection
    /// pooling the named operations use internally.
    pub(crate) async fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.write_conn.lock().await;
        f(&mut conn)
    }

    /// `PRAGMA wal_checkpoint(TRUNCATE)` — after this, the WAL file is
    /// empty and `meta.db` alone reflects all committed state.
    pub async fn flush(&self) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        })
        .await
    }

    pub async fn current_hlc(&self) -> Result<Hlc> {
        self.with_reader(|conn| {
            let last: String = conn.query_row("SELECT last_hlc FROM hlc_state WHERE id = 1", [], |r| r.get(0))?;
            Ok(Hlc::parse(&last).unwrap_or(Hlc::MIN))
        })
        .await
    }

    // ---- buckets ----------------------------------------------------

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let bucket = bucket.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO buckets (bucket, created_at, versioning) VALUES (?1, ?2, 'UNSET')",
                params![bucket, now_iso8601()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let bucket = bucket.to_string();
        self.with_reader(move |conn| {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM buckets WHERE bucket = ?1",
                [&bucket],
                |r| r.get(0),
            )?;
            Ok(exists > 0)
        })
        .await
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT bucket, created_at, versioning FROM buckets ORDER BY bucket")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(bucket, created_at, versioning)| Bucket {
                    bucket,
                    created_at,
                    versioning: BucketVersioning::parse(&versioning).unwrap_or(BucketVersioning::Unset),
                })
                .collect())
        })
        .await
    }

    pub async fn set_bucket_versioning(&self, bucket: &str, versioning: BucketVersioning) -> Result<()> {
        let bucket = bucket.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "UPDATE buckets SET versioning = ?1 WHERE bucket = ?2",
                params![versioning.as_str(), bucket],
            )?;
            Ok(())
        })
        .await
    }

    /// Removes the bucket row, every current version pointer, and every
    /// version row for the bucket. Callers must have already deleted
    /// segment/manifest files for any versions this touches.
    pub async fn force_delete_bucket(&self, bucket: &str) -> Result<()> {
        let bucket = bucket.to_string();
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM objects_current WHERE bucket = ?1", [&bucket])?;
            tx.execute("DELETE FROM versions WHERE bucket = ?1", [&bucket])?;
            tx.execute("DELETE FROM bucket_policies WHERE bucket = ?1", [&bucket])?;
            tx.execute("DELETE FROM buckets WHERE bucket = ?1", [&bucket])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Upserts a bucket's policy document (opaque JSON; evaluation is an
    /// outer-layer concern, not this store's).
    pub async fn put_bucket_policy(&self, bucket: &str, policy_json: &str) -> Result<()> {
        let (bucket, policy_json) = (bucket.to_string(), policy_json.to_string());
        self.with_writer(move |conn| {
            let now = now_iso8601();
            conn.execute(
                "INSERT INTO bucket_policies (bucket, policy_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket) DO UPDATE SET policy_json = excluded.policy_json, updated_at = excluded.updated_at",
                params![bucket, policy_json, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>> {
        let bucket = bucket.to_string();
        self.with_reader(move |conn| {
            conn.query_row("SELECT policy_json FROM bucket_policies WHERE bucket = ?1", [&bucket], |r| r.get(0))
                .optional()
                .map_err(SeglakeError::from)
        })
        .await
    }

    // ---- objects / versions ------------------------------------------

    pub async fn list_objects(&self, bucket: &str, prefix: &str, after: &str, limit: i64) -> Result<Vec<(String, String)>> {
        let (bucket, prefix, after) = (bucket.to_string(), prefix.to_string(), after.to_string());
        self.with_reader(move |conn| {
            let like_prefix = format!("{}%", escape_like(&prefix));
            let mut stmt = conn.prepare(
                "SELECT key, version_id FROM objects_current
                  WHERE bucket = ?1 AND key LIKE ?2 ESCAPE '\\' AND key > ?3
                  ORDER BY key LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(params![bucket, like_prefix, after, limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_version(&self, version_id: &str) -> Result<Option<VersionRow>> {
        let version_id = version_id.to_string();
        self.with_reader(move |conn| read_version(conn, &version_id)).await
    }

    pub async fn get_current_version(&self, bucket: &str, key: &str) -> Result<Option<VersionRow>> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.with_reader(move |conn| {
            let version_id: Option<String> = conn
                .query_row(
                    "SELECT version_id FROM objects_current WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |r| r.get(0),
                )
                .optional()?;
            match version_id {
                Some(id) => read_version(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    /// Records a brand-new PUT: version row, `objects_current` pointer,
    /// oplog entry, and HLC advance, all inside the caller's barrier
    /// transaction.
    pub fn record_put_tx(
        tx: &Transaction,
        site_id: &str,
        bucket: &str,
        key: &str,
        version_id: &str,
        etag: &str,
        size: i64,
        content_type: Option<&str>,
    ) -> Result<Hlc> {
        let hlc = hlc_next(tx)?;
        let now = now_iso8601();
        tx.execute(
            "INSERT INTO versions (version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'ACTIVE')",
            params![version_id, bucket, key, etag, size, content_type, now, hlc.format(), site_id],
        )?;
        tx.execute(
            "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
            params![bucket, key, version_id],
        )?;
        let payload = serde_json::to_value(PutPayload {
            etag: etag.to_string(),
            size,
            last_modified: now.clone(),
            content_type: content_type.map(str::to_string),
        })
        .expect("PutPayload always serializes");
        tx.execute(
            "INSERT INTO oplog (site_id, hlc_ts, op_type, bucket, key, version_id, payload_json, bytes, created_at)
             VALUES (?1, ?2, 'put', ?3, ?4, ?5, ?6, ?7, ?8)",
            params![site_id, hlc.format(), bucket, key, version_id, payload.to_string(), size, now],
        )?;
        Ok(hlc)
    }

    /// Replays a PUT at a caller-supplied HLC (used by `rebuild-index`).
    /// Only updates `objects_current` when `is_current` is set.
    pub fn record_put_with_hlc(
        tx: &Transaction,
        hlc: &Hlc,
        site_id: &str,
        bucket: &str,
        key: &str,
        version_id: &str,
        etag: &str,
        size: i64,
        content_type: Option<&str>,
        is_current: bool,
    ) -> Result<()> {
        let now = now_iso8601();
        tx.execute(
            "INSERT OR REPLACE INTO versions (version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'ACTIVE')",
            params![version_id, bucket, key, etag, size, content_type, now, hlc.format(), site_id],
        )?;
        if is_current {
            tx.execute(
                "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
                params![bucket, key, version_id],
            )?;
        }
        hlc_advance_to(tx, hlc)?;
        Ok(())
    }

    pub async fn record_segment(&self, segment_id: &str, state: &str, size: i64, sealed: bool) -> Result<()> {
        let (segment_id, state) = (segment_id.to_string(), state.to_string());
        self.with_writer(move |conn| {
            let now = now_iso8601();
            conn.execute(
                "INSERT INTO segments (segment_id, state, size, created_at, sealed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(segment_id) DO UPDATE SET
                   state = excluded.state,
                   size = excluded.size,
                   sealed_at = CASE WHEN excluded.state = 'SEALED' THEN COALESCE(segments.sealed_at, excluded.sealed_at) ELSE segments.sealed_at END",
                params![segment_id, state, size, now, if sealed { Some(now.clone()) } else { None }],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_segment(&self, segment_id: &str) -> Result<Option<SegmentRow>> {
        let segment_id = segment_id.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT segment_id, state, size, created_at, sealed_at, footer_checksum FROM segments WHERE segment_id = ?1",
                [&segment_id],
                |row| {
                    Ok(SegmentRow {
                        segment_id: row.get(0)?,
                        state: row.get(1)?,
                        size: row.get(2)?,
                        created_at: row.get(3)?,
                        sealed_at: row.get(4)?,
                        footer_checksum: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(SeglakeError::from)
        })
        .await
    }

    pub async fn list_open_segments(&self) -> Result<Vec<SegmentRow>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT segment_id, state, size, created_at, sealed_at, footer_checksum FROM segments WHERE state = 'OPEN'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SegmentRow {
                        segment_id: row.get(0)?,
                        state: row.get(1)?,
                        size: row.get(2)?,
                        created_at: row.get(3)?,
                        sealed_at: row.get(4)?,
                        footer_checksum: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Marks `version_id` DELETED, then promotes whichever remaining
    /// ACTIVE/DELETE_MARKER version for `(bucket,key)` has the next-
    /// highest HLC, or clears `objects_current` if none remain.
    pub async fn delete_object_version(&self, bucket: &str, key: &str, version_id: &str) -> Result<()> {
        let site_id = self.site_id.clone();
        let (bucket, key, version_id) = (bucket.to_string(), key.to_string(), version_id.to_string());
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE versions SET state = 'DELETED' WHERE version_id = ?1",
                [&version_id],
            )?;
            let next: Option<String> = tx
                .query_row(
                    "SELECT version_id FROM versions
                      WHERE bucket = ?1 AND key = ?2 AND state IN ('ACTIVE','DELETE_MARKER')
                      ORDER BY hlc_ts DESC LIMIT 1",
                    params![bucket, key],
                    |r| r.get(0),
                )
                .optional()?;
            match next {
                Some(next_id) => {
                    tx.execute(
                        "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
                         ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
                        params![bucket, key, next_id],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM objects_current WHERE bucket = ?1 AND key = ?2", params![bucket, key])?;
                }
            }
            let hlc = hlc_next(&tx)?;
            let now = now_iso8601();
            let payload = serde_json::to_value(DeletePayload { last_modified: now.clone() }).unwrap();
            tx.execute(
                "INSERT INTO oplog (site_id, hlc_ts, op_type, bucket, key, version_id, payload_json, bytes, created_at)
                 VALUES (?1, ?2, 'delete', ?3, ?4, ?5, ?6, 0, ?7)",
                params![site_id, hlc.format(), bucket, key, version_id, payload.to_string(), now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Versioned-bucket delete: appends a DELETE_MARKER version instead
    /// of removing history.
    pub async fn delete_object_marker(&self, bucket: &str, key: &str) -> Result<String> {
        let site_id = self.site_id.clone();
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            let version_id = crate::id::new_id();
            let hlc = hlc_next(&tx)?;
            let now = now_iso8601();
            tx.execute(
                "INSERT INTO versions (version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state)
                 VALUES (?1, ?2, ?3, NULL, 0, NULL, ?4, ?5, ?6, 'DELETE_MARKER')",
                params![version_id, bucket, key, now, hlc.format(), site_id],
            )?;
            tx.execute(
                "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
                params![bucket, key, version_id],
            )?;
            let payload = serde_json::to_value(DeletePayload { last_modified: now.clone() }).unwrap();
            tx.execute(
                "INSERT INTO oplog (site_id, hlc_ts, op_type, bucket, key, version_id, payload_json, bytes, created_at)
                 VALUES (?1, ?2, 'delete', ?3, ?4, ?5, ?6, 0, ?7)",
                params![site_id, hlc.format(), bucket, key, version_id, payload.to_string(), now],
            )?;
            tx.commit()?;
            Ok(version_id)
        })
        .await
    }

    pub async fn mark_damaged(&self, version_id: &str) -> Result<()> {
        let version_id = version_id.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "UPDATE versions SET state = 'DAMAGED' WHERE version_id = ?1",
                [&version_id],
            )?;
            Ok(())
        })
        .await
    }

    // ---- oplog / replication -----------------------------------------

    pub async fn list_oplog_since(&self, since_hlc: &Hlc, limit: i64) -> Result<(Vec<OplogEntry>, Hlc)> {
        let since = since_hlc.format();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT site_id, hlc_ts, op_type, bucket, key, version_id, payload_json, bytes
                   FROM oplog WHERE hlc_ts > ?1 ORDER BY hlc_ts ASC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![since, limit], |row| {
                    let op_type_str: String = row.get(2)?;
                    let op_type = if op_type_str == "put" { OpType::Put } else { OpType::Delete };
                    let payload_str: String = row.get(6)?;
                    Ok(OplogEntry {
                        site_id: row.get(0)?,
                        hlc_ts: row.get(1)?,
                        op_type,
                        bucket: row.get(3)?,
                        key: row.get(4)?,
                        version_id: row.get(5)?,
                        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                        bytes: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let last_hlc = entries
                .last()
                .and_then(|e| Hlc::parse(&e.hlc_ts))
                .unwrap_or_else(|| Hlc::parse(&since).unwrap_or(Hlc::MIN));
            Ok((entries, last_hlc))
        })
        .await
    }

    /// Dedups by `(site_id, hlc_ts)`, applies put/delete effects in HLC
    /// order, and advances the local HLC to `max(last_hlc, entry.hlc_ts)`.
    /// Idempotent: re-applying an already-seen entry changes nothing and
    /// does not count toward `applied`.
    pub async fn apply_oplog_entries(&self, entries: Vec<OplogEntry>) -> Result<u32> {
        let ordered = dedup_and_sort(entries);
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            let mut applied = 0u32;
            for entry in ordered {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO oplog (site_id, hlc_ts, op_type, bucket, key, version_id, payload_json, bytes, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        entry.site_id,
                        entry.hlc_ts,
                        entry.op_type.as_str(),
                        entry.bucket,
                        entry.key,
                        entry.version_id,
                        entry.payload.to_string(),
                        entry.bytes,
                        now_iso8601(),
                    ],
                )?;
                if inserted == 0 {
                    continue; // already applied previously
                }
                apply_one_entry(&tx, &entry)?;
                let hlc = Hlc::parse(&entry.hlc_ts).ok_or_else(|| SeglakeError::fatal("non-monotonic or malformed oplog HLC"))?;
                hlc_advance_to(&tx, &hlc)?;
                applied += 1;
            }
            tx.commit()?;
            Ok(applied)
        })
        .await
    }

    pub async fn get_remote_watermarks(&self, remote_url: &str) -> Result<(Option<Hlc>, Option<Hlc>)> {
        let remote_url = remote_url.to_string();
        self.with_reader(move |conn| {
            let row: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT last_pull_hlc, last_push_hlc FROM replication_remotes WHERE remote_url = ?1",
                    [&remote_url],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                Some((pull, push)) => (
                    pull.and_then(|s| Hlc::parse(&s)),
                    push.and_then(|s| Hlc::parse(&s)),
                ),
                None => (None, None),
            })
        })
        .await
    }

    pub async fn set_remote_pull_watermark(&self, remote_url: &str, hlc: &Hlc) -> Result<()> {
        let (remote_url, hlc_fmt) = (remote_url.to_string(), hlc.format());
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO replication_remotes (remote_url, last_pull_hlc) VALUES (?1, ?2)
                 ON CONFLICT(remote_url) DO UPDATE SET last_pull_hlc = excluded.last_pull_hlc",
                params![remote_url, hlc_fmt],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_remote_push_watermark(&self, remote_url: &str, hlc: &Hlc) -> Result<()> {
        let (remote_url, hlc_fmt) = (remote_url.to_string(), hlc.format());
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO replication_remotes (remote_url, last_push_hlc) VALUES (?1, ?2)
                 ON CONFLICT(remote_url) DO UPDATE SET last_push_hlc = excluded.last_push_hlc",
                params![remote_url, hlc_fmt],
            )?;
            Ok(())
        })
        .await
    }

    // ---- ops runs -----------------------------------------------------

    pub async fn record_ops_run(&self, mode: &str, started_at: &str, finished_at: &str, summary_json: &str) -> Result<()> {
        let (mode, started_at, finished_at, summary_json) =
            (mode.to_string(), started_at.to_string(), finished_at.to_string(), summary_json.to_string());
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO ops_runs (mode, started_at, finished_at, summary_json) VALUES (?1, ?2, ?3, ?4)",
                params![mode, started_at, finished_at, summary_json],
            )?;
            Ok(())
        })
        .await
    }

    /// Recent gc-run/gc-rewrite-run summaries with a derived reclaim
    /// rate; `gc-plan`/`gc-rewrite-plan` dry runs are excluded.
    pub async fn list_gc_trends(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT mode, finished_at, summary_json FROM ops_runs
                  WHERE mode NOT IN ('gc-plan', 'gc-rewrite-plan')
                    AND mode IN ('gc-run', 'gc-rewrite-run')
                  ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(mode, finished_at, summary)| {
                    let mut value: serde_json::Value = serde_json::from_str(&summary).unwrap_or(serde_json::json!({}));
                    let reclaimed = value.get("reclaimed_bytes").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let rewritten = value.get("rewritten_bytes").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let rate = if reclaimed + rewritten > 0.0 { reclaimed / (reclaimed + rewritten) } else { 0.0 };
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert("mode".to_string(), serde_json::json!(mode));
                        obj.insert("finished_at".to_string(), serde_json::json!(finished_at));
                        obj.insert("reclaim_rate".to_string(), serde_json::json!(rate));
                    }
                    value
                })
                .collect())
        })
        .await
    }

    // ---- api keys / multipart: enough surface for the engine facade ---

    pub async fn create_api_key(&self, key: ApiKey) -> Result<()> {
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO api_keys (access_key, secret_hash, salt, enabled, policy, inflight_limit, created_at, label, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key.access_key,
                    key.secret_hash,
                    key.salt,
                    key.enabled as i64,
                    key.policy,
                    key.inflight_limit,
                    key.created_at,
                    key.label,
                    key.last_used_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_api_key(&self, access_key: &str) -> Result<Option<ApiKey>> {
        let access_key = access_key.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT access_key, secret_hash, salt, enabled, policy, inflight_limit, created_at, label, last_used_at
                   FROM api_keys WHERE access_key = ?1",
                [&access_key],
                |row| {
                    Ok(ApiKey {
                        access_key: row.get(0)?,
                        secret_hash: row.get(1)?,
                        salt: row.get(2)?,
                        enabled: row.get::<_, i64>(3)? != 0,
                        policy: row.get(4)?,
                        inflight_limit: row.get(5)?,
                        created_at: row.get(6)?,
                        label: row.get(7)?,
                        last_used_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(SeglakeError::from)
        })
        .await
    }

    pub async fn revoke_api_key(&self, access_key: &str) -> Result<()> {
        let access_key = access_key.to_string();
        self.with_writer(move |conn| {
            conn.execute("UPDATE api_keys SET enabled = 0 WHERE access_key = ?1", [&access_key])?;
            Ok(())
        })
        .await
    }

    pub async fn allow_bucket_for_key(&self, access_key: &str, bucket: &str) -> Result<()> {
        let (access_key, bucket) = (access_key.to_string(), bucket.to_string());
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO api_key_bucket_allow (access_key, bucket) VALUES (?1, ?2)
                 ON CONFLICT(access_key, bucket) DO NOTHING",
                params![access_key, bucket],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn bucket_allowed_for_key(&self, access_key: &str, bucket: &str) -> Result<bool> {
        let (access_key, bucket) = (access_key.to_string(), bucket.to_string());
        self.with_reader(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM api_key_bucket_allow WHERE access_key = ?1 AND bucket = ?2",
                params![access_key, bucket],
                |r| r.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn create_multipart_upload(&self, upload: MultipartUpload) -> Result<()> {
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO multipart_uploads (upload_id, bucket, key, created_at, state, content_type) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![upload.upload_id, upload.bucket, upload.key, upload.created_at, upload.state.as_str(), upload.content_type],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn put_multipart_part(&self, part: MultipartPart) -> Result<()> {
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO multipart_parts (upload_id, part_number, version_id, etag, size, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(upload_id, part_number) DO UPDATE SET
                   version_id = excluded.version_id, etag = excluded.etag, size = excluded.size, last_modified = excluded.last_modified",
                params![part.upload_id, part.part_number, part.version_id, part.etag, part.size, part.last_modified],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_multipart_parts(&self, upload_id: &str) -> Result<Vec<MultipartPart>> {
        let upload_id = upload_id.to_string();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_id, part_number, version_id, etag, size, last_modified
                   FROM multipart_parts WHERE upload_id = ?1 ORDER BY part_number ASC",
            )?;
            let rows = stmt
                .query_map([&upload_id], |row| {
                    Ok(MultipartPart {
                        upload_id: row.get(0)?,
                        part_number: row.get(1)?,
                        version_id: row.get(2)?,
                        etag: row.get(3)?,
                        size: row.get(4)?,
                        last_modified: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_multipart_state(&self, upload_id: &str, state: MultipartUploadState) -> Result<()> {
        let upload_id = upload_id.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "UPDATE multipart_uploads SET state = ?1 WHERE upload_id = ?2",
                params![state.as_str(), upload_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_stale_multipart_uploads(&self, older_than_iso: &str) -> Result<Vec<MultipartUpload>> {
        let older_than_iso = older_than_iso.to_string();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_id, bucket, key, created_at, state, content_type
                   FROM multipart_uploads WHERE created_at < ?1",
            )?;
            let rows = stmt
                .query_map([&older_than_iso], |row| {
                    let state: String = row.get(4)?;
                    Ok(MultipartUpload {
                        upload_id: row.get(0)?,
                        bucket: row.get(1)?,
                        key: row.get(2)?,
                        created_at: row.get(3)?,
                        state: MultipartUploadState::parse(&state).unwrap_or(MultipartUploadState::Active),
                        content_type: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- maintenance state machine ------------------------------------

    pub async fn maintenance_state(&self) -> Result<String> {
        self.with_reader(|conn| {
            Ok(conn.query_row("SELECT state FROM maintenance_state WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
    }

    pub async fn set_maintenance_state(&self, state: &str) -> Result<()> {
        let state = state.to_string();
        self.with_writer(move |conn| {
            conn.execute("UPDATE maintenance_state SET state = ?1 WHERE id = 1", [&state])?;
            Ok(())
        })
        .await
    }
}

fn read_version(conn: &Connection, version_id: &str) -> Result<Option<VersionRow>> {
    conn.query_row(
        "SELECT version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state
           FROM versions WHERE version_id = ?1",
        [version_id],
        |row| {
            let state: String = row.get(9)?;
            Ok(VersionRow {
                version_id: row.get(0)?,
                bucket: row.get(1)?,
                key: row.get(2)?,
                etag: row.get(3)?,
                size: row.get(4)?,
                content_type: row.get(5)?,
                last_modified_utc: row.get(6)?,
                hlc_ts: row.get(7)?,
                site_id: row.get(8)?,
                state: VersionState::parse(&state).unwrap_or(VersionState::DeleteMarker),
            })
        },
    )
    .optional()
    .map_err(SeglakeError::from)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Apply one already-inserted oplog entry's side effect against
/// `versions`/`objects_current`, respecting last-writer-wins by HLC
/// with site_id as the tiebreak. DAMAGED/CONFLICT rows are never
/// promoted into `objects_current`.
fn apply_one_entry(tx: &Transaction, entry: &OplogEntry) -> Result<()> {
    let current: Option<(String, String)> = tx
        .query_row(
            "SELECT v.hlc_ts, v.site_id FROM objects_current oc
               JOIN versions v ON v.version_id = oc.version_id
              WHERE oc.bucket = ?1 AND oc.key = ?2",
            params![entry.bucket, entry.key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let incoming_key = hlc_site_key(&entry.hlc_ts, &entry.site_id);
    let wins = match &current {
        None => true,
        Some((hlc_ts, site_id)) => incoming_key > hlc_site_key(hlc_ts, site_id),
    };

    match entry.op_type {
        OpType::Put => {
            let payload: PutPayload = serde_json::from_value(entry.payload.clone())
                .map_err(|e| SeglakeError::fatal(format!("malformed put oplog payload: {e}")))?;
            let version_id = entry
                .version_id
                .clone()
                .ok_or_else(|| SeglakeError::fatal("put oplog entry missing version_id"))?;
            tx.execute(
                "INSERT OR REPLACE INTO versions (version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'ACTIVE')",
                params![
                    version_id,
                    entry.bucket,
                    entry.key,
                    payload.etag,
                    payload.size,
                    payload.content_type,
                    payload.last_modified,
                    entry.hlc_ts,
                    entry.site_id,
                ],
            )?;
            if wins {
                tx.execute(
                    "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
                     ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
                    params![entry.bucket, entry.key, version_id],
                )?;
            }
        }
        OpType::Delete => {
            let version_id = entry.version_id.clone().unwrap_or_else(crate::id::new_id);
            tx.execute(
                "INSERT OR REPLACE INTO versions (version_id, bucket, key, etag, size, content_type, last_modified_utc, hlc_ts, site_id, state)
                 VALUES (?1, ?2, ?3, NULL, 0, NULL, ?4, ?5, ?6, 'DELETE_MARKER')",
                params![version_id, entry.bucket, entry.key, now_iso8601(), entry.hlc_ts, entry.site_id],
            )?;
            if wins {
                tx.execute(
                    "INSERT INTO objects_current (bucket, key, version_id) VALUES (?1, ?2, ?3)
                     ON CONFLICT(bucket, key) DO UPDATE SET version_id = excluded.version_id",
                    params![entry.bucket, entry.key, version_id],
                )?;
            }
        }
    }
    Ok(())
}

impl MetaFlusher for MetadataStore {
    fn flush_commits<'a>(
        &'a self,
        commits: Vec<CommitClosure>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.with_writer(move |conn| {
                let tx = conn.transaction()?;
                for commit in commits {
                    commit(&tx)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
        })
    }
}

/// Convenience constructor for call sites that only need one
/// `MetadataStore` behind an `Arc` (the common case in the engine).
pub fn open_shared(db_path: &Path, site_id: String, read_pool_size: usize) -> Result<Arc<MetadataStore>> {
    Ok(Arc::new(MetadataStore::open(db_path, site_id, read_pool_size)?))
}
