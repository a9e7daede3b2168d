//! Persistent ANN index over chunk embeddings.
//!
//! Two logical collections (`active`, `archive`) backed by one SQLite
//! database with two identically-shaped tables, generalising the teacher's
//! single-table `db.rs` schema (see `ChunkRecord`/FTS5-trigger pattern there)
//! to the two-collection lifecycle §4.5/§4.11 require. `query`'s k-nearest
//! step is a brute-force scan over stored unit vectors — acceptable at the
//! single-user, tens-of-thousands-of-chunks scale this core targets.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// A metadata scalar, per §3's `map<string,scalar>`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&Json> for MetaValue {
    /// Non-scalar/null values are coerced per §4.5: `null` becomes `""`,
    /// everything else not already string/int/float/bool is stringified.
    fn from(value: &Json) -> Self {
        match value {
            Json::String(s) => MetaValue::Str(s.clone()),
            Json::Bool(b) => MetaValue::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetaValue::Int(i)
                } else {
                    MetaValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::Null => MetaValue::Str(String::new()),
            other => MetaValue::Str(other.to_string()),
        }
    }
}

impl From<&MetaValue> for Json {
    fn from(value: &MetaValue) -> Self {
        match value {
            MetaValue::Str(s) => Json::String(s.clone()),
            MetaValue::Int(i) => Json::Number((*i).into()),
            MetaValue::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            MetaValue::Bool(b) => Json::Bool(*b),
        }
    }
}

pub type Metadata = HashMap<String, MetaValue>;

fn metadata_to_json(metadata: &Metadata) -> Json {
    Json::Object(metadata.iter().map(|(k, v)| (k.clone(), v.into())).collect())
}

fn metadata_from_json(value: &Json) -> Metadata {
    value
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), MetaValue::from(v))).collect())
        .unwrap_or_default()
}

/// One stored chunk with its embedding, keyed globally by `chunk_id`.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
    pub content: String,
    pub metadata: Metadata,
}

/// One hit from `query`, carrying the similarity derived from distance.
#[derive(Debug, Clone)]
pub struct ChunkSearchResult {
    pub chunk_id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub metadata: Metadata,
    pub similarity: f32,
}

/// Which of the two disjoint collections an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Active,
    Archive,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Active => "chunks_active",
            Collection::Archive => "chunks_archive",
        }
    }

    fn fts_table(self) -> &'static str {
        match self {
            Collection::Active => "chunks_active_fts",
            Collection::Archive => "chunks_archive_fts",
        }
    }
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

/// Similarity bounded in (0,1], monotone decreasing in distance, per §4.5.
fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Persistent ANN index keyed by chunk id, with per-session bulk delete.
pub struct VectorStore {
    conn: RwLock<Connection>,
}

impl VectorStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: RwLock::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.write().expect("vector store lock poisoned");
        for collection in [Collection::Active, Collection::Archive] {
            let table = collection.table();
            let fts = collection.fts_table();
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    chunk_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    metadata TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_session ON {table}(session_id);

                CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(
                    content, content={table}, content_rowid=rowid
                );

                CREATE TRIGGER IF NOT EXISTS {table}_ai AFTER INSERT ON {table} BEGIN
                    INSERT INTO {fts}(rowid, content) VALUES (new.rowid, new.content);
                END;
                CREATE TRIGGER IF NOT EXISTS {table}_ad AFTER DELETE ON {table} BEGIN
                    INSERT INTO {fts}({fts}, rowid, content) VALUES('delete', old.rowid, old.content);
                END;
                CREATE TRIGGER IF NOT EXISTS {table}_au AFTER UPDATE ON {table} BEGIN
                    INSERT INTO {fts}({fts}, rowid, content) VALUES('delete', old.rowid, old.content);
                    INSERT INTO {fts}(rowid, content) VALUES (new.rowid, new.content);
                END;
                "#
            ))?;
        }
        Ok(())
    }

    /// Atomic batch insert/overwrite by `chunk_id`.
    pub fn add(&self, collection: Collection, records: &[ChunkRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.write().expect("vector store lock poisoned");
        let table = collection.table();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT OR REPLACE INTO {table} (chunk_id, session_id, chunk_index, content, embedding, metadata) \
                 VALUES (?, ?, ?, ?, ?, ?)"
            );
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                stmt.execute(params![
                    record.chunk_id,
                    record.session_id,
                    record.chunk_index as i64,
                    record.content,
                    embedding_to_bytes(&record.embedding),
                    metadata_to_json(&record.metadata).to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Brute-force k-nearest scan; `filter` requires exact equality on every
    /// given metadata key.
    pub fn query(
        &self,
        collection: Collection,
        vector: &[f32],
        k: usize,
        filter: Option<&Metadata>,
    ) -> anyhow::Result<Vec<ChunkSearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.read().expect("vector store lock poisoned");
        let table = collection.table();
        let sql = format!("SELECT chunk_id, session_id, chunk_index, content, embedding, metadata FROM {table}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let embedding_bytes: Vec<u8> = row.get(4)?;
            let metadata_text: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                bytes_to_embedding(&embedding_bytes),
                metadata_text,
            ))
        })?;

        let mut scored: Vec<ChunkSearchResult> = Vec::new();
        for row in rows {
            let (chunk_id, session_id, chunk_index, content, embedding, metadata_text) = row?;
            let metadata = metadata_from_json(&serde_json::from_str(&metadata_text).unwrap_or(Json::Null));

            if let Some(filter) = filter {
                let matches = filter.iter().all(|(key, value)| metadata.get(key) == Some(value));
                if !matches {
                    continue;
                }
            }

            let distance = euclidean_distance(vector, &embedding);
            scored.push(ChunkSearchResult {
                chunk_id,
                session_id,
                chunk_index: chunk_index as usize,
                content,
                metadata,
                similarity: distance_to_similarity(distance),
            });
        }

        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Returns the number of rows removed.
    pub fn delete_by_session(&self, collection: Collection, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.write().expect("vector store lock poisoned");
        let table = collection.table();
        let sql = format!("DELETE FROM {table} WHERE session_id = ?");
        let removed = conn.execute(&sql, params![session_id])?;
        Ok(removed)
    }

    /// Records for one session, ordered by `chunk_index`.
    pub fn get_by_session(&self, collection: Collection, session_id: &str) -> anyhow::Result<Vec<ChunkRecord>> {
        let conn = self.conn.read().expect("vector store lock poisoned");
        let table = collection.table();
        let sql = format!(
            "SELECT chunk_id, session_id, chunk_index, content, embedding, metadata FROM {table} \
             WHERE session_id = ? ORDER BY chunk_index"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![session_id], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get_by_id(&self, collection: Collection, chunk_id: &str) -> anyhow::Result<Option<ChunkRecord>> {
        let conn = self.conn.read().expect("vector store lock poisoned");
        let table = collection.table();
        let sql = format!(
            "SELECT chunk_id, session_id, chunk_index, content, embedding, metadata FROM {table} WHERE chunk_id = ?"
        );
        let record = conn
            .query_row(&sql, params![chunk_id], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ChunkRecord> {
        let embedding_bytes: Vec<u8> = row.get(4)?;
        let metadata_text: String = row.get(5)?;
        let metadata = metadata_from_json(&serde_json::from_str(&metadata_text).unwrap_or(Json::Null));
        Ok(ChunkRecord {
            chunk_id: row.get(0)?,
            session_id: row.get(1)?,
            chunk_index: row.get::<_, i64>(2)? as usize,
            content: row.get(3)?,
            embedding: bytes_to_embedding(&embedding_bytes),
            metadata,
        })
    }

    pub fn count(&self, collection: Collection) -> anyhow::Result<usize> {
        let conn = self.conn.read().expect("vector store lock poisoned");
        let table = collection.table();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn reset(&self, collection: Collection) -> anyhow::Result<()> {
        let conn = self.conn.write().expect("vector store lock poisoned");
        let table = collection.table();
        conn.execute(&format!("DELETE FROM {table}"), [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("vector.db")).unwrap();
        (dir, store)
    }

    fn record(session_id: &str, index: usize, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: format!("{session_id}_chunk_{index}"),
            session_id: session_id.to_string(),
            chunk_index: index,
            embedding: vector,
            content: format!("content {index}"),
            metadata: HashMap::from([("chunk_index".to_string(), MetaValue::Int(index as i64))]),
        }
    }

    #[test]
    fn add_then_query_returns_nearest_first() {
        let (_dir, store) = store();
        store
            .add(
                Collection::Active,
                &[
                    record("s1", 0, vec![1.0, 0.0]),
                    record("s1", 1, vec![0.0, 1.0]),
                ],
            )
            .unwrap();

        let results = store.query(Collection::Active, &[1.0, 0.0], 2, None).unwrap();
        assert_eq!(results[0].chunk_id, "s1_chunk_0");
        assert!(results[0].similarity > results[1].similarity);
    }

    #[test]
    fn overwrite_by_chunk_id_is_atomic_replace() {
        let (_dir, store) = store();
        store.add(Collection::Active, &[record("s1", 0, vec![1.0, 0.0])]).unwrap();
        store.add(Collection::Active, &[record("s1", 0, vec![0.0, 1.0])]).unwrap();
        assert_eq!(store.count(Collection::Active).unwrap(), 1);
        let stored = store.get_by_id(Collection::Active, "s1_chunk_0").unwrap().unwrap();
        assert_eq!(stored.embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn delete_by_session_removes_only_that_session() {
        let (_dir, store) = store();
        store
            .add(
                Collection::Active,
                &[record("s1", 0, vec![1.0, 0.0]), record("s2", 0, vec![0.0, 1.0])],
            )
            .unwrap();
        let removed = store.delete_by_session(Collection::Active, "s1").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(Collection::Active).unwrap(), 1);
    }

    #[test]
    fn get_by_session_orders_by_chunk_index() {
        let (_dir, store) = store();
        store
            .add(
                Collection::Active,
                &[record("s1", 2, vec![1.0]), record("s1", 0, vec![0.0]), record("s1", 1, vec![0.5])],
            )
            .unwrap();
        let records = store.get_by_session(Collection::Active, "s1").unwrap();
        let indices: Vec<usize> = records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn active_and_archive_are_disjoint_collections() {
        let (_dir, store) = store();
        store.add(Collection::Active, &[record("s1", 0, vec![1.0, 0.0])]).unwrap();
        assert_eq!(store.count(Collection::Archive).unwrap(), 0);
        store.add(Collection::Archive, &[record("s1", 0, vec![1.0, 0.0])]).unwrap();
        store.delete_by_session(Collection::Active, "s1").unwrap();
        assert_eq!(store.count(Collection::Active).unwrap(), 0);
        assert_eq!(store.count(Collection::Archive).unwrap(), 1);
    }

    #[test]
    fn metadata_filter_matches_exact_values_only() {
        let (_dir, store) = store();
        store
            .add(
                Collection::Active,
                &[record("s1", 0, vec![1.0, 0.0]), record("s1", 1, vec![1.0, 0.1])],
            )
            .unwrap();
        let filter = HashMap::from([("chunk_index".to_string(), MetaValue::Int(1))]);
        let results = store.query(Collection::Active, &[1.0, 0.0], 10, Some(&filter)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "s1_chunk_1");
    }

    #[test]
    fn reset_empties_the_collection() {
        let (_dir, store) = store();
        store.add(Collection::Active, &[record("s1", 0, vec![1.0])]).unwrap();
        store.reset(Collection::Active).unwrap();
        assert_eq!(store.count(Collection::Active).unwrap(), 0);
    }

    #[test]
    fn similarity_is_bounded_and_monotone_in_distance() {
        let (_dir, store) = store();
        store
            .add(
                Collection::Active,
                &[record("s1", 0, vec![1.0, 0.0]), record("s1", 1, vec![-1.0, 0.0])],
            )
            .unwrap();
        let results = store.query(Collection::Active, &[1.0, 0.0], 2, None).unwrap();
        for r in &results {
            assert!(r.similarity > 0.0 && r.similarity <= 1.0);
        }
        assert!(results[0].similarity > results[1].similarity);
    }
}
