//! Key-addressed buffer storage shared between processes.

use rusqlite::Error::FromSqlConversionFailure;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::MetricsError;
use crate::metrics::measurable::{Metadata, merge_metadata};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS buffer_counters (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value INTEGER NOT NULL,
        metadata TEXT,
        PRIMARY KEY (key, field)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS buffer_lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        entry TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_buffer_lists_key
        ON buffer_lists(key, id);

    CREATE TABLE IF NOT EXISTS buffer_leases (
        key TEXT PRIMARY KEY NOT NULL,
        leased_at INTEGER NOT NULL
    ) WITHOUT ROWID;
"#;

/// One counter in a hash-style buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterEntry {
    pub field: String,
    pub value: i64,
    pub metadata: Option<Metadata>,
}

/// Operations the shared pending buffer needs from its backing store.
///
/// Keys name independent buffers. A key holds counters (field -> value) and/or
/// an ordered list of entries.
pub trait RemoteStore: Send + Sync {
    /// Whether [`increment`](Self::increment) is atomic and available.
    fn supports_increment(&self) -> bool;

    /// Add `by` to counter `field` under `key`, shallow-merging `metadata` into it.
    fn increment(
        &self,
        key: &str,
        field: &str,
        by: i64,
        metadata: Option<&Metadata>,
    ) -> Result<(), MetricsError>;

    fn counters(&self, key: &str) -> Result<Vec<CounterEntry>, MetricsError>;

    /// Append to the list under `key`.
    fn append(&self, key: &str, entry: &str) -> Result<(), MetricsError>;

    /// The whole list under `key`, oldest first.
    fn range(&self, key: &str) -> Result<Vec<String>, MetricsError>;

    /// Atomically move everything under `from` onto `to`. Counters present under
    /// both keys are summed; list entries keep their order. The lease on `from`
    /// is dropped.
    fn rename(&self, from: &str, to: &str) -> Result<(), MetricsError>;

    /// Remove everything under `key`, including its lease.
    fn delete(&self, key: &str) -> Result<(), MetricsError>;

    /// Mark `key` as held by a live owner as of now.
    fn lease(&self, key: &str) -> Result<(), MetricsError>;

    /// Leased keys starting with `prefix` whose lease is at least `ttl` old.
    fn expired_leases(&self, prefix: &str, ttl: Duration) -> Result<Vec<String>, MetricsError>;
}

/// [`RemoteStore`] kept in a SQLite file, so every process opening the same
/// path shares the buffers.
pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteRemoteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let path = path.as_ref().to_path_buf();
        Self::connect(&path).map_err(|e| {
            MetricsError::BufferError(format!(
                "Could not open metric buffer at {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn connect(path: &Path) -> Result<Self, MetricsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, MetricsError> {
        let mut conn = self.lock();
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            });
        result.map_err(MetricsError::buffer)
    }
}

fn increment_in(
    tx: &Transaction<'_>,
    key: &str,
    field: &str,
    by: i64,
    metadata: Option<&Metadata>,
) -> rusqlite::Result<()> {
    let existing: Option<Option<String>> = tx
        .query_row(
            "SELECT metadata FROM buffer_counters WHERE key = ?1 AND field = ?2",
            params![key, field],
            |row| row.get(0),
        )
        .optional()?;
    let existing = existing.flatten().map(|json| parse_metadata(&json, 0)).transpose()?;

    let merged = merge_metadata(existing, metadata)
        .map(|m| serde_json::to_string(&m))
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    tx.execute(
        r#"
        INSERT INTO buffer_counters (key, field, value, metadata) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(key, field) DO UPDATE SET
            value = value + excluded.value,
            metadata = excluded.metadata
        "#,
        params![key, field, by, merged],
    )?;
    Ok(())
}

fn parse_metadata(json: &str, column: usize) -> rusqlite::Result<Metadata> {
    serde_json::from_str(json)
        .map_err(|e| FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RemoteStore for SqliteRemoteStore {
    fn supports_increment(&self) -> bool {
        true
    }

    fn increment(
        &self,
        key: &str,
        field: &str,
        by: i64,
        metadata: Option<&Metadata>,
    ) -> Result<(), MetricsError> {
        self.write(|tx| increment_in(tx, key, field, by, metadata))
    }

    fn counters(&self, key: &str) -> Result<Vec<CounterEntry>, MetricsError> {
        let conn = self.lock();
        let read = || -> rusqlite::Result<Vec<CounterEntry>> {
            let mut stmt = conn.prepare(
                "SELECT field, value, metadata FROM buffer_counters WHERE key = ?1 ORDER BY field",
            )?;
            let rows = stmt.query_map(params![key], |row| {
                let metadata: Option<String> = row.get(2)?;
                Ok(CounterEntry {
                    field: row.get(0)?,
                    value: row.get(1)?,
                    metadata: metadata.map(|json| parse_metadata(&json, 2)).transpose()?,
                })
            })?;
            rows.collect()
        };
        read().map_err(MetricsError::buffer)
    }

    fn append(&self, key: &str, entry: &str) -> Result<(), MetricsError> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO buffer_lists (key, entry) VALUES (?1, ?2)",
                params![key, entry],
            )?;
            Ok(())
        })
    }

    fn range(&self, key: &str) -> Result<Vec<String>, MetricsError> {
        let conn = self.lock();
        let read = || -> rusqlite::Result<Vec<String>> {
            let mut stmt =
                conn.prepare("SELECT entry FROM buffer_lists WHERE key = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            rows.collect()
        };
        read().map_err(MetricsError::buffer)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), MetricsError> {
        self.write(|tx| {
            let moved: Vec<(String, i64, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT field, value, metadata FROM buffer_counters WHERE key = ?1",
                )?;
                let rows = stmt.query_map(params![from], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            for (field, value, metadata) in moved {
                let metadata = metadata.map(|json| parse_metadata(&json, 2)).transpose()?;
                increment_in(tx, to, &field, value, metadata.as_ref())?;
            }

            tx.execute("DELETE FROM buffer_counters WHERE key = ?1", params![from])?;
            tx.execute(
                "UPDATE buffer_lists SET key = ?1 WHERE key = ?2",
                params![to, from],
            )?;
            tx.execute("DELETE FROM buffer_leases WHERE key = ?1", params![from])?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<(), MetricsError> {
        self.write(|tx| {
            tx.execute("DELETE FROM buffer_counters WHERE key = ?1", params![key])?;
            tx.execute("DELETE FROM buffer_lists WHERE key = ?1", params![key])?;
            tx.execute("DELETE FROM buffer_leases WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn lease(&self, key: &str) -> Result<(), MetricsError> {
        self.write(|tx| {
            tx.execute(
                r#"
                INSERT INTO buffer_leases (key, leased_at) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET leased_at = excluded.leased_at
                "#,
                params![key, unix_millis()],
            )?;
            Ok(())
        })
    }

    fn expired_leases(&self, prefix: &str, ttl: Duration) -> Result<Vec<String>, MetricsError> {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_millis().saturating_sub(ttl);

        let conn = self.lock();
        let read = || -> rusqlite::Result<Vec<String>> {
            let mut stmt = conn.prepare(
                r#"
                SELECT key FROM buffer_leases
                WHERE substr(key, 1, length(?1)) = ?1 AND leased_at <= ?2
                ORDER BY leased_at, key
                "#,
            )?;
            let rows = stmt.query_map(params![prefix, cutoff], |row| row.get(0))?;
            rows.collect()
        };
        read().map_err(MetricsError::buffer)
    }
}
