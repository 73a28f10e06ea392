//! Hot tier: recent records addressed by composite key
//!
//! Every record type (raw readings, interval buckets, delta records) is kept
//! as a JSON document in one `hot_records` table, partitioned logically by
//! `data_class`. Writes are keyed, so repeating a write updates in place.

use super::{CompositeKey, StoreError};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// One stored record: its key, version timestamp, and serialized body
#[derive(Debug, Clone, PartialEq)]
pub struct HotDocument {
    pub key: CompositeKey,
    /// Version instant (ms) used for keep-latest resolution and guarded deletes
    pub record_ms: i64,
    pub body: String,
}

/// Predicates pushed down to the hot store; the range is `[from_ms, to_ms)`
#[derive(Debug, Clone, Default)]
pub struct HotFilter {
    pub entity_id: Option<String>,
    pub sub_entity: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

impl HotFilter {
    pub fn matches(&self, key: &CompositeKey) -> bool {
        if let Some(entity) = &self.entity_id {
            if &key.entity_id != entity {
                return false;
            }
        }
        if let Some(sub) = &self.sub_entity {
            if &key.sub_entity != sub {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if key.bucket_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if key.bucket_ms >= to {
                return false;
            }
        }
        true
    }
}

/// Port for the hot tier
///
/// Implementations must make `insert_if_absent` atomic: two concurrent
/// aggregation runs for the same key must produce exactly one record.
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Insert or replace documents by key
    async fn upsert(&self, data_class: &str, docs: &[HotDocument]) -> Result<usize, StoreError>;

    /// Insert only when no document exists for the key; returns true if written
    async fn insert_if_absent(&self, data_class: &str, doc: &HotDocument) -> Result<bool, StoreError>;

    async fn contains(&self, data_class: &str, key: &CompositeKey) -> Result<bool, StoreError>;

    /// Documents matching the filter, ordered by bucket instant ascending
    async fn query(&self, data_class: &str, filter: &HotFilter) -> Result<Vec<HotDocument>, StoreError>;

    /// Documents whose bucket instant is strictly before `cutoff_ms`
    async fn select_older_than(&self, data_class: &str, cutoff_ms: i64) -> Result<Vec<HotDocument>, StoreError>;

    /// Delete documents that still carry the archived version
    ///
    /// A document rewritten after it was selected for archival keeps its
    /// newer version in the hot tier and is picked up by the next run.
    async fn delete_archived(
        &self,
        data_class: &str,
        archived: &[(CompositeKey, i64)],
    ) -> Result<usize, StoreError>;

    /// Most recent bucket instant recorded for an entity
    async fn latest_bucket_ms(&self, data_class: &str, entity_id: &str) -> Result<Option<i64>, StoreError>;

    fn backend_type(&self) -> &'static str;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order (00_, 01_, ...) and
/// executes them. Every file uses "IF NOT EXISTS" so reruns are no-ops.
pub fn run_schema_migrations(
    conn: &mut Connection,
    schema_dir: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(format!("Schema directory not found: {}", schema_dir).into());
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let filename = entry.file_name().to_string_lossy().to_string();
        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(entry.path())?;
        conn.execute_batch(&sql_content)?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// SQLite-backed hot store
pub struct SqliteHotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHotStore {
    /// Open (or create) the database, tune it, and apply the schema
    pub fn open(db_path: impl AsRef<Path>, schema_dir: &str) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&mut conn, schema_dir)
            .map_err(|e| StoreError::Database(format!("schema migration failed: {}", e)))?;

        log::info!("✅ Hot store ready at {}", db_path.display());
        Ok(Self::from_connection(conn))
    }

    /// Wrap a connection whose schema is already in place
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Shared handle for other SQLite-backed components (calibration thresholds)
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("hot store connection lock poisoned".to_string()))
    }

    fn row_to_document(row: &Row<'_>) -> rusqlite::Result<HotDocument> {
        Ok(HotDocument {
            key: CompositeKey {
                entity_id: row.get(0)?,
                sub_entity: row.get(1)?,
                interval: row.get(2)?,
                bucket_ms: row.get(3)?,
            },
            record_ms: row.get(4)?,
            body: row.get(5)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT entity_id, sub_entity, interval_type, bucket_ms, record_ms, body FROM hot_records";

#[async_trait]
impl HotStore for SqliteHotStore {
    async fn upsert(&self, data_class: &str, docs: &[HotDocument]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO hot_records (
                    data_class, entity_id, sub_entity, interval_type, bucket_ms, record_ms, body
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(data_class, entity_id, sub_entity, interval_type, bucket_ms) DO UPDATE SET
                    record_ms = excluded.record_ms,
                    body = excluded.body
                "#,
            )?;
            for doc in docs {
                stmt.execute(params![
                    data_class,
                    doc.key.entity_id,
                    doc.key.sub_entity,
                    doc.key.interval,
                    doc.key.bucket_ms,
                    doc.record_ms,
                    doc.body,
                ])?;
            }
        }
        tx.commit()?;
        Ok(docs.len())
    }

    async fn insert_if_absent(&self, data_class: &str, doc: &HotDocument) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO hot_records (
                data_class, entity_id, sub_entity, interval_type, bucket_ms, record_ms, body
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                data_class,
                doc.key.entity_id,
                doc.key.sub_entity,
                doc.key.interval,
                doc.key.bucket_ms,
                doc.record_ms,
                doc.body,
            ],
        )?;
        Ok(changed == 1)
    }

    async fn contains(&self, data_class: &str, key: &CompositeKey) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM hot_records
             WHERE data_class = ? AND entity_id = ? AND sub_entity = ? AND interval_type = ? AND bucket_ms = ?",
        )?;
        let found = stmt.exists(params![
            data_class,
            key.entity_id,
            key.sub_entity,
            key.interval,
            key.bucket_ms,
        ])?;
        Ok(found)
    }

    async fn query(&self, data_class: &str, filter: &HotFilter) -> Result<Vec<HotDocument>, StoreError> {
        let mut sql = format!("{} WHERE data_class = ?", SELECT_COLUMNS);
        let mut values = vec![Value::Text(data_class.to_string())];

        if let Some(entity) = &filter.entity_id {
            sql.push_str(" AND entity_id = ?");
            values.push(Value::Text(entity.clone()));
        }
        if let Some(sub) = &filter.sub_entity {
            sql.push_str(" AND sub_entity = ?");
            values.push(Value::Text(sub.clone()));
        }
        if let Some(from) = filter.from_ms {
            sql.push_str(" AND bucket_ms >= ?");
            values.push(Value::Integer(from));
        }
        if let Some(to) = filter.to_ms {
            sql.push_str(" AND bucket_ms < ?");
            values.push(Value::Integer(to));
        }
        sql.push_str(" ORDER BY bucket_ms ASC, entity_id ASC, sub_entity ASC");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(values), Self::row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    async fn select_older_than(&self, data_class: &str, cutoff_ms: i64) -> Result<Vec<HotDocument>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE data_class = ? AND bucket_ms < ? ORDER BY bucket_ms ASC",
            SELECT_COLUMNS
        ))?;
        let docs = stmt
            .query_map(params![data_class, cutoff_ms], Self::row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    async fn delete_archived(
        &self,
        data_class: &str,
        archived: &[(CompositeKey, i64)],
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM hot_records
                 WHERE data_class = ? AND entity_id = ? AND sub_entity = ?
                   AND interval_type = ? AND bucket_ms = ? AND record_ms = ?",
            )?;
            for (key, record_ms) in archived {
                deleted += stmt.execute(params![
                    data_class,
                    key.entity_id,
                    key.sub_entity,
                    key.interval,
                    key.bucket_ms,
                    record_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn latest_bucket_ms(&self, data_class: &str, entity_id: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(bucket_ms) FROM hot_records WHERE data_class = ? AND entity_id = ?",
                params![data_class, entity_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

/// In-process hot store used by tests and ephemeral runs
#[derive(Default)]
pub struct MemoryHotStore {
    records: Mutex<BTreeMap<(String, CompositeKey), HotDocument>>,
}

impl MemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, data_class: &str) -> usize {
        self.records
            .lock()
            .map(|records| records.keys().filter(|(class, _)| class == data_class).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, CompositeKey), HotDocument>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Database("memory hot store lock poisoned".to_string()))
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn upsert(&self, data_class: &str, docs: &[HotDocument]) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        for doc in docs {
            records.insert((data_class.to_string(), doc.key.clone()), doc.clone());
        }
        Ok(docs.len())
    }

    async fn insert_if_absent(&self, data_class: &str, doc: &HotDocument) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        let slot = (data_class.to_string(), doc.key.clone());
        if records.contains_key(&slot) {
            return Ok(false);
        }
        records.insert(slot, doc.clone());
        Ok(true)
    }

    async fn contains(&self, data_class: &str, key: &CompositeKey) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(&(data_class.to_string(), key.clone())))
    }

    async fn query(&self, data_class: &str, filter: &HotFilter) -> Result<Vec<HotDocument>, StoreError> {
        let mut docs: Vec<HotDocument> = self
            .lock()?
            .iter()
            .filter(|((class, key), _)| class == data_class && filter.matches(key))
            .map(|(_, doc)| doc.clone())
            .collect();
        docs.sort_by(|a, b| a.key.bucket_ms.cmp(&b.key.bucket_ms).then_with(|| a.key.cmp(&b.key)));
        Ok(docs)
    }

    async fn select_older_than(&self, data_class: &str, cutoff_ms: i64) -> Result<Vec<HotDocument>, StoreError> {
        let filter = HotFilter {
            to_ms: Some(cutoff_ms),
            ..HotFilter::default()
        };
        self.query(data_class, &filter).await
    }

    async fn delete_archived(
        &self,
        data_class: &str,
        archived: &[(CompositeKey, i64)],
    ) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let mut deleted = 0;
        for (key, record_ms) in archived {
            let slot = (data_class.to_string(), key.clone());
            if records.get(&slot).map(|doc| doc.record_ms) == Some(*record_ms) {
                records.remove(&slot);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn latest_bucket_ms(&self, data_class: &str, entity_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(class, key)| class == data_class && key.entity_id == entity_id)
            .map(|(_, key)| key.bucket_ms)
            .max())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
