use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use crawler_core::CrawlerError;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Create the `data_sources` and `crawl_jobs` tables (idempotent).
///
/// The partial unique index on in-flight jobs is what makes single-flight
/// hold even when two writers race past their pre-checks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS data_sources (
            id               TEXT    NOT NULL PRIMARY KEY,
            name             TEXT    NOT NULL,
            source_type      TEXT    NOT NULL,
            config           TEXT    NOT NULL,   -- JSON DataSourceConfig
            schedule_enabled INTEGER NOT NULL DEFAULT 0,
            cron_expression  TEXT,
            status           TEXT    NOT NULL DEFAULT 'inactive',
            documents_count  INTEGER NOT NULL DEFAULT 0,
            last_crawl       TEXT,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS crawl_jobs (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT    NOT NULL UNIQUE,
            source_id           TEXT    NOT NULL,
            source_type         TEXT    NOT NULL,
            config_snapshot     TEXT    NOT NULL,   -- JSON, frozen at creation
            status              TEXT    NOT NULL,
            progress            INTEGER NOT NULL DEFAULT 0,
            documents_processed INTEGER NOT NULL DEFAULT 0,
            errors              TEXT    NOT NULL DEFAULT '[]',
            failure_kind        TEXT,
            attempt             INTEGER NOT NULL DEFAULT 1,
            retry_of            TEXT,
            triggered_by        TEXT    NOT NULL,
            enqueued_at         TEXT    NOT NULL,
            started_at          TEXT,
            finished_at         TEXT
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_crawl_jobs_in_flight
            ON crawl_jobs (source_id) WHERE status IN ('queued', 'running');
        CREATE INDEX IF NOT EXISTS idx_crawl_jobs_source
            ON crawl_jobs (source_id, seq);
        CREATE INDEX IF NOT EXISTS idx_crawl_jobs_status
            ON crawl_jobs (status, seq);
        ",
    )?;
    Ok(())
}

/// Shared SQLite handle for the registry and the job store.
///
/// Both tables live in one database so cross-table checks (a delete that
/// must see in-flight jobs, a failure that must enqueue its retry) run
/// under a single lock.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A panic while holding the lock cannot leave a half-applied statement
    /// behind (SQLite rolls it back), so a poisoned lock is safe to reuse.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current time at the precision we persist.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

/// Read a text column holding one of the domain enums.
pub(crate) fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CrawlerError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}
