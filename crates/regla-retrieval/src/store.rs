//! Chunk text storage with SQLite FTS5 full-text search.
//!
//! The vector index holds only ids and locations; this store owns the text.
//! It answers the lexical leg of a hybrid query and hydrates final results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use regla_core::{Chunk, ChunkMeta, ReglaError, Result};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A full-text match.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub meta: ChunkMeta,
    pub text: String,
    /// Excerpt with matched terms wrapped in `«` `»`.
    pub snippet: Option<String>,
}

/// Store statistics.
///
/// # Examples
///
/// ```
/// use regla_retrieval::store::StoreStats;
///
/// let stats = StoreStats { chunks: 120, documents: 4 };
/// assert_eq!(stats.chunks, 120);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub chunks: usize,
    pub documents: usize,
}

/// Text store consumed by the retriever.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Ranked full-text matches for `query`, at most `limit`.
    async fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>>;

    /// Texts for the given chunk ids. Unknown ids are absent from the map.
    async fn fetch_texts(&self, chunk_ids: &[String]) -> Result<HashMap<String, String>>;

    /// Insert chunks, replacing any with the same `chunk_id`.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Replace the whole store contents with `chunks`.
    async fn replace_all(&self, chunks: &[Chunk]) -> Result<()>;

    /// Every stored chunk, in insertion order.
    async fn all_chunks(&self) -> Result<Vec<Chunk>>;

    async fn store_stats(&self) -> Result<StoreStats>;
}

/// SQLite-backed [`DocumentStore`].
///
/// Queries run on the blocking pool; the connection sits behind a mutex.
///
/// # Examples
///
/// ```
/// use regla_retrieval::store::SqliteDocumentStore;
///
/// let store = SqliteDocumentStore::in_memory().unwrap();
/// assert_eq!(store.stats().unwrap().chunks, 0);
/// ```
#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// Open or create a store database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Database`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReglaError::Database(format!("failed to create store directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ReglaError::Database(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ReglaError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReglaError::Database("store connection poisoned".into()))
    }

    /// Full-text search; see [`DocumentStore::fts_search`].
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let safe_query = sanitize_fts_query(query);
        if safe_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT chunks.chunk_id, chunks.doc_id, chunks.heading_path,
                        chunks.page_start, chunks.page_end, chunks.text,
                        snippet(chunks_fts, 1, '«', '»', ' … ', 12)
                 FROM chunks_fts
                 JOIN chunks ON chunks.id = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(|e| ReglaError::Database(format!("failed to prepare FTS query: {e}")))?;

        let rows = stmt
            .query_map(params![safe_query, limit as i64], |row| {
                Ok(LexicalHit {
                    meta: ChunkMeta {
                        chunk_id: row.get(0)?,
                        doc_id: row.get(1)?,
                        heading_path: row.get(2)?,
                        page_start: row.get(3)?,
                        page_end: row.get(4)?,
                    },
                    text: row.get(5)?,
                    snippet: row.get(6)?,
                })
            })
            .map_err(|e| ReglaError::Database(format!("FTS query failed: {e}")))?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(
                row.map_err(|e| ReglaError::Database(format!("failed to read FTS row: {e}")))?,
            );
        }
        Ok(hits)
    }

    /// Texts by chunk id in a single query; see [`DocumentStore::fetch_texts`].
    pub fn texts(&self, chunk_ids: &[String]) -> Result<HashMap<String, String>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let sql = format!("SELECT chunk_id, text FROM chunks WHERE chunk_id IN ({placeholders})");

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ReglaError::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(chunk_ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ReglaError::Database(format!("failed to query texts: {e}")))?;

        let mut texts = HashMap::with_capacity(chunk_ids.len());
        for row in rows {
            let (id, text) =
                row.map_err(|e| ReglaError::Database(format!("failed to read row: {e}")))?;
            texts.insert(id, text);
        }
        Ok(texts)
    }

    /// Insert or update chunks in one transaction.
    pub fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| ReglaError::Database(format!("failed to begin transaction: {e}")))?;
        insert_chunks(&tx, chunks)?;
        tx.commit()
            .map_err(|e| ReglaError::Database(format!("failed to commit chunks: {e}")))
    }

    /// Drop every chunk and insert `chunks`, atomically.
    pub fn replace(&self, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| ReglaError::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute("DELETE FROM chunks", [])
            .map_err(|e| ReglaError::Database(format!("failed to clear chunks: {e}")))?;
        insert_chunks(&tx, chunks)?;
        tx.commit()
            .map_err(|e| ReglaError::Database(format!("failed to commit chunks: {e}")))
    }

    /// Chunk and document counts.
    /// Every chunk, oldest first; see [`DocumentStore::all_chunks`].
    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, doc_id, heading_path, page_start, page_end, text
                 FROM chunks ORDER BY id",
            )
            .map_err(|e| ReglaError::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Chunk {
                    meta: ChunkMeta {
                        chunk_id: row.get(0)?,
                        doc_id: row.get(1)?,
                        heading_path: row.get(2)?,
                        page_start: row.get(3)?,
                        page_end: row.get(4)?,
                    },
                    text: row.get(5)?,
                })
            })
            .map_err(|e| ReglaError::Database(format!("failed to list chunks: {e}")))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|e| ReglaError::Database(format!("failed to read row: {e}")))?);
        }
        Ok(chunks)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let (chunks, documents): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT doc_id) FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| ReglaError::Database(format!("failed to count chunks: {e}")))?;
        Ok(StoreStats {
            chunks: chunks as usize,
            documents: documents as usize,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let store = self.clone();
        let query = query.to_string();
        run_blocking(move || store.search(&query, limit)).await
    }

    async fn fetch_texts(&self, chunk_ids: &[String]) -> Result<HashMap<String, String>> {
        let store = self.clone();
        let ids = chunk_ids.to_vec();
        run_blocking(move || store.texts(&ids)).await
    }

    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let store = self.clone();
        let chunks = chunks.to_vec();
        run_blocking(move || store.upsert(&chunks)).await
    }

    async fn replace_all(&self, chunks: &[Chunk]) -> Result<()> {
        let store = self.clone();
        let chunks = chunks.to_vec();
        run_blocking(move || store.replace(&chunks)).await
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let store = self.clone();
        run_blocking(move || store.chunks()).await
    }

    async fn store_stats(&self) -> Result<StoreStats> {
        let store = self.clone();
        run_blocking(move || store.stats()).await
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ReglaError::Database(format!("store task failed: {e}")))?
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT NOT NULL UNIQUE,
            doc_id TEXT NOT NULL,
            heading_path TEXT NOT NULL,
            page_start INTEGER,
            page_end INTEGER,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS chunks_doc ON chunks(doc_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            heading_path, text,
            content='chunks', content_rowid='id',
            tokenize='unicode61 remove_diacritics 2'
        );

        -- Triggers to keep FTS in sync
        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, heading_path, text)
            VALUES (new.id, new.heading_path, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, heading_path, text)
            VALUES ('delete', old.id, old.heading_path, old.text);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, heading_path, text)
            VALUES ('delete', old.id, old.heading_path, old.text);
            INSERT INTO chunks_fts(rowid, heading_path, text)
            VALUES (new.id, new.heading_path, new.text);
        END;
        ",
    )
    .map_err(|e| ReglaError::Database(format!("failed to create schema: {e}")))
}

fn insert_chunks(conn: &Connection, chunks: &[Chunk]) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO chunks
             (chunk_id, doc_id, heading_path, page_start, page_end, text, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chunk_id) DO UPDATE SET
                doc_id = excluded.doc_id,
                heading_path = excluded.heading_path,
                page_start = excluded.page_start,
                page_end = excluded.page_end,
                text = excluded.text,
                content_hash = excluded.content_hash
             WHERE chunks.content_hash != excluded.content_hash
                OR chunks.heading_path != excluded.heading_path",
        )
        .map_err(|e| ReglaError::Database(format!("failed to prepare insert: {e}")))?;

    for chunk in chunks {
        if chunk.meta.chunk_id.is_empty() {
            return Err(ReglaError::InvalidInput(
                "chunk without chunk_id cannot be stored".into(),
            ));
        }
        let meta = &chunk.meta;
        stmt.execute(params![
            meta.chunk_id,
            meta.doc_id,
            meta.heading_path,
            meta.page_start,
            meta.page_end,
            chunk.text,
            content_hash(&chunk.text),
        ])
        .map_err(|e| ReglaError::Database(format!("failed to insert chunk: {e}")))?;
    }
    Ok(())
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Quote each word and join with `OR`, dropping FTS5 operators.
fn sanitize_fts_query(query: &str) -> String {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            let clean: String = w
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect();
    words.join(" OR ")
}
