pub mod cache;
pub mod registry;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use statline_core::{CategoryId, Record};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub use registry::StoreRegistry;

pub const RECORD_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store name '{0}'")]
    InvalidStoreName(String),
}

/// Result of [`RecordStore::upsert_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub written: u64,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub primary_key: String,
    pub error: String,
}

/// Durable keyed collection of activity records.
///
/// Records are keyed by `primary_key`; `category_id` and `ts` carry their own
/// secondary indices. Writes are upserts, so replaying a sync is harmless.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > RECORD_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RECORD_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            self.conn
                .execute_batch(include_str!("../migrations/0001_records.sql"))?;
            self.conn.execute("PRAGMA user_version = 1", [])?;
        }

        Ok(())
    }

    pub fn upsert(&self, record: &Record) -> Result<(), StorageError> {
        upsert_row(&self.conn, record, &Utc::now().to_rfc3339())
    }

    /// Writes a batch in one transaction. Each record gets its own savepoint,
    /// so a record that fails is rolled back and reported while the rest of
    /// the batch commits.
    pub fn upsert_batch(&mut self, records: &[Record]) -> Result<BatchWrite, StorageError> {
        let stored_at = Utc::now().to_rfc3339();
        let mut tx = self.conn.transaction()?;
        let mut report = BatchWrite::default();
        for record in records {
            let savepoint = tx.savepoint()?;
            match upsert_row(&savepoint, record, &stored_at) {
                Ok(()) => {
                    savepoint.commit()?;
                    report.written += 1;
                }
                // Dropping the savepoint rolls it back.
                Err(err) => report.skipped.push(SkippedRecord {
                    primary_key: record.primary_key.clone(),
                    error: err.to_string(),
                }),
            }
        }
        tx.commit()?;
        Ok(report)
    }

    pub fn query_by_category(&self, category_id: CategoryId) -> Result<Vec<Record>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT primary_key, category_id, ts, payload_json
            FROM records
            WHERE category_id = ?1
            ORDER BY ts ASC, primary_key ASC
            ",
        )?;
        let rows = stmt.query_map([category_id], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Inclusive range scan. There is no compound `(category_id, ts)` index,
    /// so this filters the category scan in memory.
    pub fn query_by_category_and_range(
        &self,
        category_id: CategoryId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Record>, StorageError> {
        let mut records = self.query_by_category(category_id)?;
        records.retain(|record| record.timestamp >= from && record.timestamp <= to);
        Ok(records)
    }

    pub fn get(&self, primary_key: &str) -> Result<Option<Record>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT primary_key, category_id, ts, payload_json
                FROM records
                WHERE primary_key = ?1
                ",
                [primary_key],
                record_from_row,
            )
            .optional()?)
    }

    pub fn has_record(&self, primary_key: &str) -> Result<bool, StorageError> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE primary_key = ?1)",
            [primary_key],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    pub fn record_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    pub fn category_count(&self, category_id: CategoryId) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE category_id = ?1",
            [category_id],
            |row| row.get(0),
        )?)
    }

    pub fn category_counts(&self) -> Result<Vec<(CategoryId, i64)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT category_id, COUNT(*) FROM records GROUP BY category_id ORDER BY category_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    pub fn latest_timestamp(&self, category_id: CategoryId) -> Result<Option<i64>, StorageError> {
        Ok(self.conn.query_row(
            "SELECT MAX(ts) FROM records WHERE category_id = ?1",
            [category_id],
            |row| row.get(0),
        )?)
    }

    pub fn index_exists(&self, index_name: &str) -> Result<bool, StorageError> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            [index_name],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }
}

fn upsert_row(conn: &Connection, record: &Record, stored_at: &str) -> Result<(), StorageError> {
    let payload_json = serde_json::to_string(&record.payload)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    conn.execute(
        "
        INSERT INTO records (primary_key, category_id, ts, payload_json, stored_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(primary_key) DO UPDATE SET
            category_id=excluded.category_id,
            ts=excluded.ts,
            payload_json=excluded.payload_json,
            stored_at=excluded.stored_at
        ",
        params![
            record.primary_key,
            record.category_id,
            record.timestamp,
            payload_json,
            stored_at,
        ],
    )?;

    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let payload_json: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Record {
        primary_key: row.get(0)?,
        category_id: row.get(1)?,
        timestamp: row.get(2)?,
        payload,
    })
}

/// Cloneable handle to one store, shared by the sync side and the read side.
#[derive(Clone)]
pub struct SharedStore {
    name: Arc<str>,
    inner: Arc<Mutex<RecordStore>>,
}

impl SharedStore {
    pub fn new(name: impl Into<String>, store: RecordStore) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn in_memory(name: impl Into<String>) -> Result<Self, StorageError> {
        Ok(Self::new(name, RecordStore::open_in_memory()?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ptr_eq(&self, other: &SharedStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn with<T>(
        &self,
        op: impl FnOnce(&RecordStore) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.lock()?;
        op(&guard)
    }

    pub fn upsert(&self, record: &Record) -> Result<(), StorageError> {
        self.with(|store| store.upsert(record))
    }

    pub fn upsert_batch(&self, records: &[Record]) -> Result<BatchWrite, StorageError> {
        let mut guard = self.lock()?;
        guard.upsert_batch(records)
    }

    pub fn query_by_category(&self, category_id: CategoryId) -> Result<Vec<Record>, StorageError> {
        self.with(|store| store.query_by_category(category_id))
    }

    pub fn query_by_category_and_range(
        &self,
        category_id: CategoryId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Record>, StorageError> {
        self.with(|store| store.query_by_category_and_range(category_id, from, to))
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecordStore>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn record(key: &str, category_id: CategoryId, ts: i64, kills: i64) -> Record {
        Record::new(key, category_id, ts, json!({ "kills": kills }))
    }

    #[test]
    fn migration_creates_records_table_and_indices() {
        let store = RecordStore::open_in_memory().expect("open");
        assert_eq!(store.schema_version().expect("version"), RECORD_SCHEMA_VERSION);
        assert!(store.index_exists("idx_records_category").expect("category idx"));
        assert!(store.index_exists("idx_records_ts").expect("ts idx"));
        store.migrate().expect("migrate twice");
        assert_eq!(store.record_count().expect("count"), 0);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("raw open");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        match RecordStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 9);
                assert_eq!(supported, RECORD_SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected schema rejection"),
        }
    }

    #[test]
    fn upsert_same_key_keeps_one_row_with_latest_payload() {
        let store = RecordStore::open_in_memory().expect("open");
        store.upsert(&record("match-1", 4, 1_000, 2)).expect("first");
        store.upsert(&record("match-1", 4, 1_000, 9)).expect("second");

        assert_eq!(store.record_count().expect("count"), 1);
        let stored = store.get("match-1").expect("get").expect("present");
        assert_eq!(stored.payload, json!({"kills": 9}));
        assert!(store.has_record("match-1").expect("has"));
        assert!(!store.has_record("match-2").expect("has not"));
    }

    #[test]
    fn category_queries_are_time_ordered_and_isolated() {
        let store = RecordStore::open_in_memory().expect("open");
        store.upsert(&record("c", 1, 300, 1)).expect("c");
        store.upsert(&record("a", 1, 100, 1)).expect("a");
        store.upsert(&record("x", 2, 50, 1)).expect("x");
        store.upsert(&record("b", 1, 200, 1)).expect("b");

        let keys = store
            .query_by_category(1)
            .expect("query")
            .into_iter()
            .map(|record| record.primary_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(store.category_count(2).expect("count"), 1);
        assert_eq!(store.category_counts().expect("counts"), vec![(1, 3), (2, 1)]);
        assert_eq!(store.latest_timestamp(1).expect("latest"), Some(300));
        assert_eq!(store.latest_timestamp(99).expect("none"), None);
    }

    #[test]
    fn range_query_is_inclusive() {
        let store = RecordStore::open_in_memory().expect("open");
        for (key, ts) in [("a", 100), ("b", 200), ("c", 300), ("d", 400)] {
            store.upsert(&record(key, 5, ts, 1)).expect("upsert");
        }
        let keys = store
            .query_by_category_and_range(5, 200, 300)
            .expect("range")
            .into_iter()
            .map(|record| record.primary_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(store
            .query_by_category_and_range(5, 401, 500)
            .expect("empty range")
            .is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = RecordStore::open(file.path()).expect("open");
            store.upsert(&record("persisted", 3, 42, 7)).expect("upsert");
        }
        let reopened = RecordStore::open(file.path()).expect("reopen");
        assert_eq!(
            reopened.query_by_category(3).expect("query"),
            vec![record("persisted", 3, 42, 7)]
        );
    }

    #[test]
    fn shared_store_clones_see_the_same_rows() {
        let shared = SharedStore::in_memory("activity").expect("open");
        let clone = shared.clone();
        shared.upsert(&record("k", 8, 10, 1)).expect("upsert");
        assert_eq!(clone.query_by_category(8).expect("query").len(), 1);
        assert!(clone.ptr_eq(&shared));
        assert_eq!(clone.name(), "activity");
    }

    #[test]
    fn batch_commits_good_records_and_reports_rejected_ones() {
        let mut store = RecordStore::open_in_memory().expect("open");
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON records
                 WHEN NEW.primary_key = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger");

        let batch = vec![
            record("a", 6, 100, 1),
            record("bad", 6, 200, 1),
            record("c", 6, 300, 1),
        ];
        let report = store.upsert_batch(&batch).expect("batch");

        assert_eq!(report.written, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].primary_key, "bad");
        assert!(report.skipped[0].error.contains("rejected"));
        let keys = store
            .query_by_category(6)
            .expect("query")
            .into_iter()
            .map(|record| record.primary_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "c"]);
        assert!(store.conn.is_autocommit());
    }

    #[test]
    fn batch_upsert_overwrites_existing_keys_on_disk() {
        let file = NamedTempFile::new().expect("temp file");
        let shared = SharedStore::new("activity", RecordStore::open(file.path()).expect("open"));
        let first = (0..500)
            .map(|n| record(&format!("m-{n}"), 2, n, 1))
            .collect::<Vec<_>>();
        let second = (0..500)
            .map(|n| record(&format!("m-{n}"), 2, n, 5))
            .collect::<Vec<_>>();

        assert_eq!(shared.upsert_batch(&first).expect("first").written, 500);
        assert_eq!(shared.upsert_batch(&second).expect("second").written, 500);

        let reopened = RecordStore::open(file.path()).expect("reopen");
        assert_eq!(reopened.record_count().expect("count"), 500);
        let stored = reopened.get("m-499").expect("get").expect("present");
        assert_eq!(stored.payload, json!({"kills": 5}));
    }
}
