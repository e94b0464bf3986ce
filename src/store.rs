//! # Local Document Store
//!
//! The queryable projection target: one SQLite file per base holding the
//! user documents, the per-key metadata, and the projection checkpoint.
//!
//! ```sql
//! db       (id TEXT PRIMARY KEY, data TEXT NOT NULL)   -- projected documents, JSON
//! meta     (id TEXT PRIMARY KEY, date_created TEXT, date_modified TEXT, changes INTEGER)
//! settings (id TEXT PRIMARY KEY, value TEXT NOT NULL)  -- "<stream>_last_processed_seq" → decimal
//! ```
//!
//! ## Atomic Application
//!
//! `apply_put` / `apply_delete` run the document write, the metadata write,
//! and the checkpoint advance in one transaction. A reader therefore
//! observes either none or all of an event's effects, and the checkpoint
//! never leads the data — replay after a crash re-applies the same event
//! onto the same key state (idempotent by construction).
//!
//! ## Async Bridging
//!
//! `rusqlite::Connection` is `!Sync`, so the store lives behind
//! `Arc<tokio::sync::Mutex<_>>` and every call crosses into
//! `spawn_blocking` with `blocking_lock` ([`StoreHandle`]).

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tokio::task;

use crate::error::{Error, Result};
use crate::predicate;
use crate::types::{MetaData, Record, Seq};

/// File name of the per-base database inside its data directory.
pub const STORE_FILE: &str = "store.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS db (
    id   TEXT PRIMARY KEY,
    data TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS meta (
    id            TEXT PRIMARY KEY,
    date_created  TEXT NOT NULL,
    date_modified TEXT NOT NULL,
    changes       INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS settings (
    id    TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
";

// =============================================================================
// Query Options
// =============================================================================

/// Pass-through options for [`DocStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum number of documents returned.
    pub limit: Option<usize>,

    /// Documents skipped before collecting results.
    pub offset: Option<usize>,

    /// `{field: 1}` ascending / `{field: -1}` descending, applied in order.
    pub sort: Option<JsonValue>,

    /// `{field: 1}` — restrict returned documents to the named fields.
    pub project: Option<JsonValue>,
}

// =============================================================================
// DocStore
// =============================================================================

/// Synchronous store over one base's SQLite file.
///
/// Owned exclusively by one base; all access is serialized through
/// [`StoreHandle`].
pub struct DocStore {
    conn: Connection,
    stream: String,
}

impl DocStore {
    /// Opens (creating if needed) the store under `dir`.
    pub fn open(dir: &Path, stream: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(STORE_FILE))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            stream: stream.to_string(),
        })
    }

    fn checkpoint_id(&self) -> String {
        format!("{}_last_processed_seq", self.stream)
    }

    /// The last fully applied sequence; missing or unparsable is zero.
    pub fn checkpoint(&self) -> Result<Seq> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE id = ?1",
                params![self.checkpoint_id()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value
            .and_then(|v| v.parse::<u64>().ok())
            .map(Seq::from_raw)
            .unwrap_or(Seq::ZERO))
    }

    /// Reads a live key's record, or `None`.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        let row = self
            .conn
            .query_row(
                "SELECT d.data, m.date_created, m.date_modified, m.changes
                 FROM db d JOIN meta m ON m.id = d.id
                 WHERE d.id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        MetaData {
                            date_created: row.get(1)?,
                            date_modified: row.get(2)?,
                            changes: row.get::<_, i64>(3)? as u64,
                        },
                    ))
                },
            )
            .optional()?;

        match row {
            Some((data, meta)) => Ok(Some(Record {
                meta,
                data: serde_json::from_str(&data)?,
            })),
            None => Ok(None),
        }
    }

    /// Applies a PUT: upserts the document and metadata, advances the
    /// checkpoint — one transaction. Returns the prior document (if any)
    /// and the resulting record.
    pub fn apply_put(
        &mut self,
        id: &str,
        data: &JsonValue,
        time_ms: i64,
        seq: Seq,
    ) -> Result<(Option<JsonValue>, Record)> {
        let checkpoint_id = self.checkpoint_id();
        let tx = self.conn.transaction()?;

        let old = read_document(&tx, id)?;

        let doc = project_document(id, data);
        tx.execute(
            "INSERT INTO db (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![id, serde_json::to_string(&doc)?],
        )?;

        let prior_meta: Option<MetaData> = tx
            .query_row(
                "SELECT date_created, date_modified, changes FROM meta WHERE id = ?1",
                params![id],
                |row| {
                    Ok(MetaData {
                        date_created: row.get(0)?,
                        date_modified: row.get(1)?,
                        changes: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        let meta = match prior_meta {
            Some(prior) => prior.touched(time_ms),
            None => MetaData::created(time_ms),
        };
        tx.execute(
            "INSERT INTO meta (id, date_created, date_modified, changes)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 date_created = excluded.date_created,
                 date_modified = excluded.date_modified,
                 changes = excluded.changes",
            params![id, meta.date_created, meta.date_modified, meta.changes as i64],
        )?;

        write_checkpoint(&tx, &checkpoint_id, seq)?;
        tx.commit()?;

        Ok((old, Record { meta, data: doc }))
    }

    /// Applies a DELETE: removes the document and metadata (both idempotent,
    /// absent is success), advances the checkpoint — one transaction.
    /// Returns the prior document, if any.
    pub fn apply_delete(&mut self, id: &str, seq: Seq) -> Result<Option<JsonValue>> {
        let checkpoint_id = self.checkpoint_id();
        let tx = self.conn.transaction()?;

        let old = read_document(&tx, id)?;
        tx.execute("DELETE FROM db WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM meta WHERE id = ?1", params![id])?;
        write_checkpoint(&tx, &checkpoint_id, seq)?;
        tx.commit()?;

        Ok(old)
    }

    /// Enumerates live keys, optionally filtered by an (unanchored) regex.
    pub fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let matcher = pattern
            .map(|p| Regex::new(p).map_err(|e| Error::BadPredicate(format!("pattern: {e}"))))
            .transpose()?;

        let mut stmt = self.conn.prepare("SELECT id FROM db")?;
        let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for id in ids {
            let id = id?;
            if matcher.as_ref().is_none_or(|re| re.is_match(&id)) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Runs a predicate query with limit/offset/sort/project options.
    pub fn query(&self, query: &JsonValue, options: &QueryOptions) -> Result<Vec<JsonValue>> {
        let mut docs: Vec<JsonValue> = self
            .all_documents()?
            .into_iter()
            .filter(|doc| predicate::matches(doc, query))
            .collect();

        if let Some(sort) = options.sort.as_ref().and_then(JsonValue::as_object) {
            docs.sort_by(|a, b| compare_by(a, b, sort));
        }

        let offset = options.offset.unwrap_or(0);
        let mut docs: Vec<JsonValue> = docs.into_iter().skip(offset).collect();
        if let Some(limit) = options.limit {
            docs.truncate(limit);
        }

        if let Some(fields) = options.project.as_ref().and_then(JsonValue::as_object) {
            for doc in &mut docs {
                *doc = project_fields(doc, fields);
            }
        }
        Ok(docs)
    }

    /// Number of documents matching the predicate.
    pub fn count(&self, query: &JsonValue) -> Result<u64> {
        Ok(self
            .all_documents()?
            .iter()
            .filter(|doc| predicate::matches(doc, query))
            .count() as u64)
    }

    fn all_documents(&self) -> Result<Vec<JsonValue>> {
        let mut stmt = self.conn.prepare("SELECT data FROM db")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }
}

fn read_document(conn: &Connection, id: &str) -> Result<Option<JsonValue>> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM db WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
}

fn write_checkpoint(conn: &Connection, checkpoint_id: &str, seq: Seq) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (id, value) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET value = excluded.value",
        params![checkpoint_id, seq.as_raw().to_string()],
    )?;
    Ok(())
}

/// The stored shape of a document: `{id, ...data}`. A payload `id` field
/// wins over the injected one, and non-object payloads are stored as-is.
fn project_document(id: &str, data: &JsonValue) -> JsonValue {
    match data {
        JsonValue::Object(fields) => {
            let mut merged = Map::new();
            merged.insert("id".to_string(), JsonValue::String(id.to_string()));
            for (k, v) in fields {
                merged.insert(k.clone(), v.clone());
            }
            JsonValue::Object(merged)
        }
        other => other.clone(),
    }
}

/// Multi-field comparator for sort specs; missing fields order first.
fn compare_by(a: &JsonValue, b: &JsonValue, sort: &Map<String, JsonValue>) -> Ordering {
    for (field, direction) in sort {
        let ord = match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => predicate::compare(x, y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = if direction.as_i64() == Some(-1) {
            ord.reverse()
        } else {
            ord
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project_fields(doc: &JsonValue, fields: &Map<String, JsonValue>) -> JsonValue {
    let mut out = Map::new();
    if let Some(source) = doc.as_object() {
        for (field, include) in fields {
            if include.as_i64() == Some(1) {
                if let Some(value) = source.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
    }
    JsonValue::Object(out)
}

// =============================================================================
// Async Handle
// =============================================================================

/// Clonable async façade over a [`DocStore`].
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<DocStore>>,
}

impl StoreHandle {
    pub fn new(store: DocStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DocStore) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task join: {e}")))?
    }

    pub async fn checkpoint(&self) -> Result<Seq> {
        self.run(|store| store.checkpoint()).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        self.run(move |store| store.get(&id)).await
    }

    pub async fn apply_put(
        &self,
        id: &str,
        data: JsonValue,
        time_ms: i64,
        seq: Seq,
    ) -> Result<(Option<JsonValue>, Record)> {
        let id = id.to_string();
        self.run(move |store| store.apply_put(&id, &data, time_ms, seq))
            .await
    }

    pub async fn apply_delete(&self, id: &str, seq: Seq) -> Result<Option<JsonValue>> {
        let id = id.to_string();
        self.run(move |store| store.apply_delete(&id, seq)).await
    }

    pub async fn keys(&self, pattern: Option<String>) -> Result<Vec<String>> {
        self.run(move |store| store.keys(pattern.as_deref())).await
    }

    pub async fn query(&self, query: JsonValue, options: QueryOptions) -> Result<Vec<JsonValue>> {
        self.run(move |store| store.query(&query, &options)).await
    }

    pub async fn count(&self, query: JsonValue) -> Result<u64> {
        self.run(move |store| store.count(&query)).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> DocStore {
        DocStore::open(dir.path(), "t").unwrap()
    }

    #[test]
    fn test_put_then_get_includes_id_and_meta() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let (old, record) = store
            .apply_put("user1", &json!({"name": "John"}), 1_000, Seq::from_raw(1))
            .unwrap();
        assert!(old.is_none());
        assert_eq!(record.data, json!({"id": "user1", "name": "John"}));
        assert_eq!(record.meta.changes, 1);

        let fetched = store.get("user1").unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_second_put_updates_meta_and_returns_old() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store
            .apply_put("k", &json!({"v": 1}), 1_000, Seq::from_raw(1))
            .unwrap();
        let (old, record) = store
            .apply_put("k", &json!({"v": 2}), 2_000, Seq::from_raw(2))
            .unwrap();

        assert_eq!(old, Some(json!({"id": "k", "v": 1})));
        assert_eq!(record.meta.changes, 2);
        assert_ne!(record.meta.date_created, record.meta.date_modified);
    }

    #[test]
    fn test_delete_removes_doc_and_meta() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store
            .apply_put("k", &json!({"v": 1}), 1_000, Seq::from_raw(1))
            .unwrap();
        let old = store.apply_delete("k", Seq::from_raw(2)).unwrap();
        assert_eq!(old, Some(json!({"id": "k", "v": 1})));
        assert!(store.get("k").unwrap().is_none());

        // Deleting an absent key is success with no prior value.
        assert!(store.apply_delete("k", Seq::from_raw(3)).unwrap().is_none());

        // A later put restarts the lineage.
        let (_, record) = store
            .apply_put("k", &json!({"v": 3}), 4_000, Seq::from_raw(4))
            .unwrap();
        assert_eq!(record.meta.changes, 1);
    }

    #[test]
    fn test_checkpoint_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(&dir);
            assert_eq!(store.checkpoint().unwrap(), Seq::ZERO);
            store
                .apply_put("k", &json!({"v": 1}), 1_000, Seq::from_raw(7))
                .unwrap();
            assert_eq!(store.checkpoint().unwrap().as_raw(), 7);
        }
        let store = open_store(&dir);
        assert_eq!(store.checkpoint().unwrap().as_raw(), 7);
        assert!(store.get("k").unwrap().is_some());
    }

    #[test]
    fn test_keys_with_and_without_pattern() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        for id in ["alpha", "beta", "alphabet"] {
            store
                .apply_put(id, &json!({}), 1_000, Seq::from_raw(1))
                .unwrap();
        }

        let mut all = store.keys(None).unwrap();
        all.sort();
        assert_eq!(all, vec!["alpha", "alphabet", "beta"]);

        // Substring semantics: "alpha" matches both alpha and alphabet.
        let mut filtered = store.keys(Some("alpha")).unwrap();
        filtered.sort();
        assert_eq!(filtered, vec!["alpha", "alphabet"]);

        assert!(matches!(
            store.keys(Some("(")),
            Err(Error::BadPredicate(_))
        ));
    }

    #[test]
    fn test_query_options() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        for (id, age) in [("a", 30), ("b", 20), ("c", 40), ("d", 10)] {
            store
                .apply_put(id, &json!({"age": age}), 1_000, Seq::from_raw(1))
                .unwrap();
        }

        let docs = store
            .query(
                &json!({"age": {"$gte": 20}}),
                &QueryOptions {
                    sort: Some(json!({"age": -1})),
                    offset: Some(1),
                    limit: Some(2),
                    project: Some(json!({"id": 1})),
                },
            )
            .unwrap();
        assert_eq!(docs, vec![json!({"id": "a"}), json!({"id": "b"})]);

        assert_eq!(store.count(&json!({"age": {"$lt": 25}})).unwrap(), 2);
        assert_eq!(store.count(&json!({})).unwrap(), 4);
    }
}
