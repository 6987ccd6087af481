//! Nimbus persistence: document tables plus an append-only write log in SQLite.
//!
//! Every mutation commits the document change and its log entry in one
//! transaction, so the log replays writes in exactly commit order. Documents
//! are opaque JSON here; identity columns are pulled out for indexing.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    fn code(self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
        }
    }

    fn from_code(code: &str) -> Result<Self> {
        match code {
            "i" => Ok(OpKind::Insert),
            "u" => Ok(OpKind::Update),
            "d" => Ok(OpKind::Delete),
            other => Err(anyhow!("unknown oplog op code: {}", other)),
        }
    }
}

/// One committed write. `doc` is the post-image, or the pre-image for deletes.
#[derive(Debug, Clone)]
pub struct OpEntry {
    pub seq: u64,
    pub op: OpKind,
    pub doc: Json,
}

/// Indexed identity columns a lookup may pin.
#[derive(Debug, Clone, Copy, Default)]
pub struct Query<'a> {
    pub name: Option<&'a str>,
    pub workspace: Option<&'a str>,
    pub uid: Option<&'a str>,
}

/// Identity of a document inside one database/collection.
#[derive(Debug, Clone, Copy)]
pub struct DocKey<'a> {
    pub db: &'a str,
    pub collection: &'a str,
    pub name: &'a str,
    pub workspace: &'a str,
}

/// Storage seam the object store is written against.
pub trait DocumentLog: Send + Sync {
    fn find(&self, db: &str, collection: &str, q: Query<'_>) -> Result<Vec<Json>>;
    /// Insert a new document; `Ok(None)` when the identity already exists.
    fn insert(&self, key: DocKey<'_>, uid: &str, doc: &Json) -> Result<Option<u64>>;
    /// Replace-or-insert keyed by identity; returns the log sequence.
    fn upsert(&self, key: DocKey<'_>, uid: &str, doc: &Json) -> Result<u64>;
    /// Physically remove; `Ok(None)` when nothing matched.
    fn remove(&self, db: &str, collection: &str, q: Query<'_>) -> Result<Option<u64>>;
    /// Latest assigned log sequence (0 before the first write).
    fn head(&self) -> Result<u64>;
    /// Highest sequence dropped by compaction.
    fn compacted_through(&self) -> Result<u64>;
    /// Log entries for one collection with `after < seq <= until`.
    fn read_log(&self, db: &str, collection: &str, after: u64, until: u64, limit: usize) -> Result<Vec<OpEntry>>;
    /// Drop all but the newest `keep` log entries; returns the number removed.
    fn compact(&self, keep: u64) -> Result<u64>;
    fn ping(&self) -> Result<()>;
}

/// SQLite-backed document log. Simple and synchronous; callers hold the
/// connection only for the duration of a single statement or transaction.
pub struct SqliteLog {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteLog {
    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let conn = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(conn)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                db         TEXT NOT NULL,
                collection TEXT NOT NULL,
                name       TEXT NOT NULL,
                workspace  TEXT NOT NULL DEFAULT '',
                uid        TEXT NOT NULL,
                body       TEXT NOT NULL,
                PRIMARY KEY (db, collection, name, workspace)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uq_documents_uid ON documents(db, collection, uid);
            CREATE TABLE IF NOT EXISTS oplog (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                db         TEXT NOT NULL,
                collection TEXT NOT NULL,
                op         TEXT NOT NULL,
                body       TEXT NOT NULL,
                ts         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oplog_ns ON oplog(db, collection, seq);
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )
        .context("creating document tables")?;
        Ok(Self { db: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn append_op(tx: &Transaction<'_>, db: &str, collection: &str, op: OpKind, body: &str) -> Result<u64> {
    tx.execute(
        "INSERT INTO oplog(db, collection, op, body, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![db, collection, op.code(), body, now_ms()],
    )?;
    Ok(tx.last_insert_rowid() as u64)
}

fn push_identity(sql: &mut String, args: &mut Vec<String>, q: Query<'_>) {
    for (col, val) in [("name", q.name), ("workspace", q.workspace), ("uid", q.uid)] {
        if let Some(v) = val {
            args.push(v.to_string());
            sql.push_str(&format!(" AND {} = ?{}", col, args.len()));
        }
    }
}

impl DocumentLog for SqliteLog {
    fn find(&self, db: &str, collection: &str, q: Query<'_>) -> Result<Vec<Json>> {
        let started = Instant::now();
        let mut sql = String::from("SELECT body FROM documents WHERE db = ?1 AND collection = ?2");
        let mut args = vec![db.to_string(), collection.to_string()];
        push_identity(&mut sql, &mut args, q);
        sql.push_str(" ORDER BY name, workspace");
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?).context("decoding stored document")?);
        }
        histogram!("persist_find_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn insert(&self, key: DocKey<'_>, uid: &str, doc: &Json) -> Result<Option<u64>> {
        let body = serde_json::to_string(doc)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "INSERT INTO documents(db, collection, name, workspace, uid, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(db, collection, name, workspace) DO NOTHING",
            params![key.db, key.collection, key.name, key.workspace, uid, body],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let seq = append_op(&tx, key.db, key.collection, OpKind::Insert, &body)?;
        tx.commit()?;
        counter!("persist_write_total", 1u64);
        Ok(Some(seq))
    }

    fn upsert(&self, key: DocKey<'_>, uid: &str, doc: &Json) -> Result<u64> {
        let body = serde_json::to_string(doc)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existed: bool = tx
            .query_row(
                "SELECT 1 FROM documents WHERE db = ?1 AND collection = ?2 AND name = ?3 AND workspace = ?4",
                params![key.db, key.collection, key.name, key.workspace],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO documents(db, collection, name, workspace, uid, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(db, collection, name, workspace) DO UPDATE SET uid = excluded.uid, body = excluded.body",
            params![key.db, key.collection, key.name, key.workspace, uid, body],
        )?;
        let op = if existed { OpKind::Update } else { OpKind::Insert };
        let seq = append_op(&tx, key.db, key.collection, op, &body)?;
        tx.commit()?;
        counter!("persist_write_total", 1u64);
        Ok(seq)
    }

    fn remove(&self, db: &str, collection: &str, q: Query<'_>) -> Result<Option<u64>> {
        let mut sql = String::from("SELECT name, workspace, body FROM documents WHERE db = ?1 AND collection = ?2");
        let mut args = vec![db.to_string(), collection.to_string()];
        push_identity(&mut sql, &mut args, q);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let victims: Vec<(String, String, String)> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut last = None;
        for (name, workspace, body) in victims.iter() {
            tx.execute(
                "DELETE FROM documents WHERE db = ?1 AND collection = ?2 AND name = ?3 AND workspace = ?4",
                params![db, collection, name, workspace],
            )?;
            last = Some(append_op(&tx, db, collection, OpKind::Delete, body)?);
        }
        tx.commit()?;
        if last.is_some() {
            counter!("persist_write_total", victims.len() as u64);
        }
        Ok(last)
    }

    fn head(&self) -> Result<u64> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = 'oplog'", [], |row| row.get(0))
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    fn compacted_through(&self) -> Result<u64> {
        let conn = self.conn()?;
        let v: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'compacted_through'", [], |row| row.get(0))
            .optional()?;
        Ok(v.unwrap_or(0) as u64)
    }

    fn read_log(&self, db: &str, collection: &str, after: u64, until: u64, limit: usize) -> Result<Vec<OpEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, op, body FROM oplog
             WHERE db = ?1 AND collection = ?2 AND seq > ?3 AND seq <= ?4
             ORDER BY seq LIMIT ?5",
        )?;
        let rows = stmt.query_map(params![db, collection, after as i64, until as i64, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, op, body) = row?;
            out.push(OpEntry {
                seq: seq as u64,
                op: OpKind::from_code(&op)?,
                doc: serde_json::from_str(&body).context("decoding oplog entry")?,
            });
        }
        Ok(out)
    }

    fn compact(&self, keep: u64) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cutoff: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) - ?1 FROM oplog",
            params![keep as i64],
            |row| row.get(0),
        )?;
        if cutoff <= 0 {
            return Ok(0);
        }
        let removed = tx.execute("DELETE FROM oplog WHERE seq <= ?1", params![cutoff])?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('compacted_through', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![cutoff],
        )?;
        tx.commit()?;
        debug!(removed, cutoff, "oplog compacted");
        counter!("persist_compacted_total", removed as u64);
        Ok(removed as u64)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).context("sqlite ping")?;
        Ok(())
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
