//! SQLite storage for aggregated metric rows.
//!
//! Every write goes through [`MetricsDatabase::record`], which finds or
//! creates the row for an identity and increments it inside one immediate
//! transaction, so concurrent writers never lose an increment.
//! [`MetricsDatabase::record_batch`] does the same for many identities at once.

use crate::error::MetricsError;
use crate::metrics::measurable::{Identity, Metadata, merge_metadata};
use crate::metrics::query::MetricQuery;
use rusqlite::Error::FromSqlConversionFailure;
use rusqlite::types::Type;
use rusqlite::{
    Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Current schema version (must match MIGRATIONS.len())
const SCHEMA_VERSION: usize = 1;

/// How long a writer waits for another connection's lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database migrations - each migration upgrades the schema by one version
const MIGRATIONS: &[&str] = &[
    // Migration 0 -> 1: Initial schema with metrics table
    r#"
    CREATE TABLE metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        category TEXT,
        measurable_type TEXT,
        measurable_id TEXT,
        year INTEGER NOT NULL,
        month INTEGER NOT NULL,
        day INTEGER NOT NULL,
        hour INTEGER,
        value INTEGER NOT NULL DEFAULT 0 CHECK (value >= 0),
        metadata TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX idx_metrics_name
        ON metrics(name);
    CREATE INDEX idx_metrics_category
        ON metrics(category);
    CREATE INDEX idx_metrics_measurable
        ON metrics(measurable_type, measurable_id);
    CREATE INDEX idx_metrics_date
        ON metrics(year, month, day);

    -- An empty BLOB never equals a TEXT value, so absent fields take part in
    -- uniqueness without colliding with empty strings.
    CREATE UNIQUE INDEX metrics_unique
        ON metrics(
            name,
            ifnull(category, x''),
            year,
            month,
            day,
            ifnull(hour, -1),
            ifnull(measurable_type, x''),
            ifnull(measurable_id, x'')
        );
    "#,
];

const SELECT_COLUMNS: &str = "id, name, category, year, month, day, hour, measurable_type, \
     measurable_id, value, metadata, created_at, updated_at";

/// A persisted aggregate row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: Option<u32>,
    pub measurable_type: Option<String>,
    pub measurable_id: Option<String>,
    pub value: i64,
    pub metadata: Option<Metadata>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Metric {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata_json: Option<String> = row.get(10)?;
        let metadata = metadata_json
            .map(|json| serde_json::from_str::<Metadata>(&json))
            .transpose()
            .map_err(|e| FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

        Ok(Metric {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            year: row.get(3)?,
            month: row.get(4)?,
            day: row.get(5)?,
            hour: row.get(6)?,
            measurable_type: row.get(7)?,
            measurable_id: row.get(8)?,
            value: row.get(9)?,
            metadata,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

/// Database wrapper for metric rows
pub struct MetricsDatabase {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MetricsDatabase {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=-2000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;

        Self::with_connection(conn, Some(path))
    }

    /// Private in-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self, MetricsError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(mut conn: Connection, path: Option<PathBuf>) -> Result<Self, MetricsError> {
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a transaction open:
        // rusqlite rolls back when the Transaction is dropped.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add `value` to the row for `identity`, creating it first if needed, and
    /// merge `metadata` into it. Returns the row as committed.
    pub fn record(
        &self,
        identity: &Identity,
        value: i64,
        metadata: Option<&Metadata>,
    ) -> Result<Metric, MetricsError> {
        let now = unix_now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let metric = apply_increment(&tx, identity, value, metadata, now)?;
        tx.commit()?;
        Ok(metric)
    }

    /// Apply every `(identity, value, metadata)` group in one transaction.
    ///
    /// Either all groups land or none do, so a failed batch can be retried
    /// without counting any group twice.
    pub fn record_batch(
        &self,
        groups: &[(Identity, i64, Option<Metadata>)],
    ) -> Result<Vec<Metric>, MetricsError> {
        let now = unix_now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut metrics = Vec::with_capacity(groups.len());
        for (identity, value, metadata) in groups {
            metrics.push(apply_increment(&tx, identity, *value, metadata.as_ref(), now)?);
        }

        tx.commit()?;
        Ok(metrics)
    }

    /// Row for an identity, if one has been recorded
    pub fn find(&self, identity: &Identity) -> Result<Option<Metric>, MetricsError> {
        let conn = self.lock();
        let metric = conn
            .query_row(
                &format!(
                    "SELECT {} FROM metrics WHERE {}",
                    SELECT_COLUMNS, IDENTITY_PREDICATE
                ),
                &identity_params(identity),
                Metric::from_row,
            )
            .optional()?;
        Ok(metric)
    }

    /// Rows matching `query`, oldest bucket first
    pub fn get(&self, query: &MetricQuery) -> Result<Vec<Metric>, MetricsError> {
        let (clause, values) = query.to_sql();
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metrics{} ORDER BY year, month, day, hour, id",
            SELECT_COLUMNS, clause
        ))?;

        let rows = stmt.query_map(params_from_iter(values), Metric::from_row)?;

        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?);
        }

        Ok(metrics)
    }

    /// Sum of `value` over rows matching `query`
    pub fn sum(&self, query: &MetricQuery) -> Result<i64, MetricsError> {
        let (clause, values) = query.to_sql();
        let conn = self.lock();
        let sum: i64 = conn.query_row(
            &format!("SELECT COALESCE(SUM(value), 0) FROM metrics{}", clause),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// Number of rows matching `query`
    pub fn count(&self, query: &MetricQuery) -> Result<usize, MetricsError> {
        let (clause, values) = query.to_sql();
        let conn = self.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM metrics{}", clause),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// NULL-safe equality over every identity column (`IS` treats NULL = NULL)
const IDENTITY_PREDICATE: &str = "name = ?1 AND category IS ?2 AND year = ?3 AND month = ?4 \
     AND day = ?5 AND hour IS ?6 AND measurable_type IS ?7 AND measurable_id IS ?8";

fn identity_params(identity: &Identity) -> [&dyn ToSql; 8] {
    [
        &identity.name,
        &identity.category,
        &identity.year,
        &identity.month,
        &identity.day,
        &identity.hour,
        &identity.measurable_type,
        &identity.measurable_id,
    ]
}

fn find_id(conn: &Connection, identity: &Identity) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        &format!("SELECT id FROM metrics WHERE {}", IDENTITY_PREDICATE),
        &identity_params(identity),
        |row| row.get(0),
    )
    .optional()
}

/// Find-or-create the row for `identity` and add `value` to it.
///
/// Must run inside an IMMEDIATE transaction: the write lock is held from the
/// lookup on, so no other writer can create the row between `find_id` and
/// `insert_empty`.
fn apply_increment(
    tx: &Transaction<'_>,
    identity: &Identity,
    value: i64,
    metadata: Option<&Metadata>,
    now: i64,
) -> Result<Metric, MetricsError> {
    let id = match find_id(tx, identity)? {
        Some(id) => id,
        None => insert_empty(tx, identity, now)?,
    };

    let existing: Option<String> = tx.query_row(
        "SELECT metadata FROM metrics WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let existing = existing
        .map(|json| serde_json::from_str::<Metadata>(&json))
        .transpose()?;
    let merged = merge_metadata(existing, metadata)
        .map(|m| serde_json::to_string(&m))
        .transpose()?;

    tx.execute(
        "UPDATE metrics SET value = value + ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
        params![value, merged, now, id],
    )?;

    let metric = tx.query_row(
        &format!("SELECT {} FROM metrics WHERE id = ?1", SELECT_COLUMNS),
        params![id],
        Metric::from_row,
    )?;
    Ok(metric)
}

fn insert_empty(conn: &Connection, identity: &Identity, now: i64) -> rusqlite::Result<i64> {
    conn.execute(
        r#"
        INSERT INTO metrics (
            name, category, year, month, day, hour,
            measurable_type, measurable_id, value, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)
        "#,
        params![
            identity.name,
            identity.category,
            identity.year,
            identity.month,
            identity.day,
            identity.hour,
            identity.measurable_type,
            identity.measurable_id,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Initialize schema and handle migrations
fn initialize_schema(conn: &mut Connection) -> Result<(), MetricsError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_metadata (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );
        "#,
    )?;

    // Version is read inside the write lock so concurrent openers of a new
    // file apply each migration once.
    loop {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current_version = schema_version(&tx)?;

        if current_version > SCHEMA_VERSION {
            return Err(MetricsError::Generic(format!(
                "Metrics database schema version {} is newer than supported version {}. \
                 Please upgrade tally to the latest version.",
                current_version, SCHEMA_VERSION
            )));
        }
        if current_version == SCHEMA_VERSION {
            tx.commit()?;
            break;
        }

        debug!(from = current_version, to = current_version + 1, "migrating metrics database");
        tx.execute_batch(MIGRATIONS[current_version])?;
        tx.execute(
            r#"
            INSERT INTO schema_metadata (key, value) VALUES ('version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![(current_version + 1).to_string()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Current schema version, 0 for a brand new database
fn schema_version(conn: &Connection) -> rusqlite::Result<usize> {
    let version = conn
        .query_row(
            "SELECT value FROM schema_metadata WHERE key = 'version'",
            [],
            |row| {
                let version_str: String = row.get(0)?;
                version_str
                    .parse::<usize>()
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            },
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::measurable::MetricData;
    use chrono::NaiveDate;
    use rusqlite::ErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_db() -> (MetricsDatabase, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = MetricsDatabase::open(temp_dir.path().join("test-metrics.db")).unwrap();
        (db, temp_dir)
    }

    fn identity(name: &str, category: Option<&str>) -> Identity {
        let date = NaiveDate::from_ymd_opt(2025, 10, 19)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        let mut metric = MetricData::new(name).with_date(date);
        metric.category = category.map(str::to_string);
        Identity::of(&metric)
    }

    #[test]
    fn test_initialize_schema() {
        let (db, _temp_dir) = create_test_db();

        let conn = db.lock();
        let version: String = conn
            .query_row(
                "SELECT value FROM schema_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metrics.db");

        {
            let db = MetricsDatabase::open(&path).unwrap();
            db.record(&identity("page_views", None), 3, None).unwrap();
        }

        let db = MetricsDatabase::open(&path).unwrap();
        let row = db.find(&identity("page_views", None)).unwrap().unwrap();
        assert_eq!(row.value, 3);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metrics.db");
        drop(MetricsDatabase::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE schema_metadata SET value = '99' WHERE key = 'version'",
            [],
        )
        .unwrap();
        drop(conn);

        assert!(MetricsDatabase::open(&path).is_err());
    }

    #[test]
    fn test_record_creates_then_increments() {
        let (db, _temp_dir) = create_test_db();
        let id = identity("page_views", Some("marketing"));

        let first = db.record(&id, 5, None).unwrap();
        assert_eq!(first.value, 5);
        assert_eq!(first.category.as_deref(), Some("marketing"));
        assert_eq!(first.hour, None);

        let second = db.record(&id, 3, None).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.value, 8);
        assert_eq!(db.count(&MetricQuery::new()).unwrap(), 1);
    }

    #[test]
    fn test_absent_and_empty_category_are_distinct_rows() {
        let (db, _temp_dir) = create_test_db();

        db.record(&identity("page_views", None), 1, None).unwrap();
        db.record(&identity("page_views", Some("")), 1, None).unwrap();
        db.record(&identity("page_views", None), 1, None).unwrap();

        assert_eq!(db.count(&MetricQuery::new()).unwrap(), 2);
        let absent = db.find(&identity("page_views", None)).unwrap().unwrap();
        assert_eq!(absent.value, 2);
    }

    #[test]
    fn test_unique_index_rejects_duplicate_null_identity() {
        let (db, _temp_dir) = create_test_db();
        let id = identity("page_views", None);
        db.record(&id, 1, None).unwrap();

        let conn = db.lock();
        let result = insert_empty(&conn, &id, unix_now());
        let code = match result {
            Err(rusqlite::Error::SqliteFailure(err, _)) => Some(err.code),
            _ => None,
        };
        assert_eq!(code, Some(ErrorCode::ConstraintViolation));
    }

    #[test]
    fn test_metadata_is_merged_last_write_wins() {
        let (db, _temp_dir) = create_test_db();
        let id = identity("signups", None);

        let first = json!({"plan": "free", "source": "ads"});
        let second = json!({"plan": "pro"});
        db.record(&id, 1, first.as_object()).unwrap();
        let row = db.record(&id, 1, second.as_object()).unwrap();

        assert_eq!(
            serde_json::Value::Object(row.metadata.unwrap()),
            json!({"plan": "pro", "source": "ads"})
        );
    }

    #[test]
    fn test_negative_total_is_rejected() {
        let (db, _temp_dir) = create_test_db();
        let id = identity("credits", None);

        db.record(&id, 2, None).unwrap();
        assert!(db.record(&id, -5, None).is_err());

        // The failed transaction rolled back
        assert_eq!(db.find(&id).unwrap().unwrap().value, 2);
    }

    #[test]
    fn test_record_batch_applies_every_group() {
        let (db, _temp_dir) = create_test_db();

        let rows = db
            .record_batch(&[
                (identity("a", None), 1, None),
                (identity("b", None), 4, None),
            ])
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(db.sum(&MetricQuery::new()).unwrap(), 5);
    }

    #[test]
    fn test_record_batch_is_all_or_nothing() {
        let (db, _temp_dir) = create_test_db();
        db.record(&identity("a", None), 1, None).unwrap();

        let result = db.record_batch(&[
            (identity("a", None), 1, None),
            (identity("b", None), -5, None),
            (identity("c", None), 1, None),
        ]);
        assert!(result.is_err());

        assert_eq!(db.find(&identity("a", None)).unwrap().unwrap().value, 1);
        assert!(db.find(&identity("b", None)).unwrap().is_none());
        assert!(db.find(&identity("c", None)).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_metadata_is_not_overwritten() {
        let (db, _temp_dir) = create_test_db();
        let id = identity("signups", None);
        db.record(&id, 1, json!({"plan": "free"}).as_object()).unwrap();
        db.lock()
            .execute("UPDATE metrics SET metadata = '{broken'", [])
            .unwrap();

        let result = db.record(&id, 1, json!({"plan": "pro"}).as_object());
        assert!(matches!(result, Err(MetricsError::JsonError(_))));
        assert!(db.find(&id).is_err());

        let stored: String = db
            .lock()
            .query_row("SELECT metadata FROM metrics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, "{broken");
    }

    #[test]
    fn test_in_memory_database() {
        let db = MetricsDatabase::open_in_memory().unwrap();
        db.record(&identity("x", None), 1, None).unwrap();
        assert!(db.path().is_none());
        assert_eq!(db.sum(&MetricQuery::new()).unwrap(), 1);
    }
}
