//! Durable relational store — spec.md §4.1 and §6.
//!
//! Backed by SQLite through a pooled connection (r2d2 + rusqlite), the way
//! the retrieval pack's own chunk/embedding stores do it (see e.g.
//! `jamie8johnson-cqs`'s `Store`), rather than the teacher's thread-local
//! connection-per-thread pattern (spec.md §9 Design Notes explicitly calls
//! for this replacement). Single writer queue is modeled as "serialize
//! writes through one pooled connection acquisition + IMMEDIATE transaction
//! with busy-timeout + exponential backoff retry", which gives the same
//! observable guarantees as a dedicated writer thread without the extra
//! plumbing.

use crate::error::{EngineError, Result};
use crate::model::{ChunkEnvelope, ContentAnalysis, FileRecord, KeywordScore, ProcessingSession};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    file_path     TEXT PRIMARY KEY,
    size          INTEGER NOT NULL,
    mtime         REAL NOT NULL,
    content_hash  TEXT NOT NULL,
    file_type     TEXT NOT NULL,
    discovered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS text_chunks_v2 (
    id             INTEGER PRIMARY KEY,
    file_path      TEXT NOT NULL,
    chunk_index    INTEGER NOT NULL,
    chunk_envelope TEXT NOT NULL,
    chunk_strategy TEXT NOT NULL,
    chunk_size     INTEGER NOT NULL,
    total_chunks   INTEGER NOT NULL,
    file_hash      TEXT NOT NULL,
    file_type      TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    embedding      BLOB,
    UNIQUE(file_path, chunk_index),
    FOREIGN KEY(file_path) REFERENCES file_metadata(file_path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON text_chunks_v2(file_path);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    file_path UNINDEXED,
    chunk_index UNINDEXED,
    content
);

CREATE TRIGGER IF NOT EXISTS trg_chunks_ai AFTER INSERT ON text_chunks_v2 BEGIN
    INSERT INTO chunks_fts(rowid, file_path, chunk_index, content)
    VALUES (new.id, new.file_path, new.chunk_index, json_extract(new.chunk_envelope, '$.content'));
END;

CREATE TRIGGER IF NOT EXISTS trg_chunks_ad AFTER DELETE ON text_chunks_v2 BEGIN
    DELETE FROM chunks_fts WHERE rowid = old.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_chunks_au AFTER UPDATE ON text_chunks_v2 BEGIN
    DELETE FROM chunks_fts WHERE rowid = old.id;
    INSERT INTO chunks_fts(rowid, file_path, chunk_index, content)
    VALUES (new.id, new.file_path, new.chunk_index, json_extract(new.chunk_envelope, '$.content'));
END;

CREATE TABLE IF NOT EXISTS content_analysis (
    file_path TEXT PRIMARY KEY,
    keywords  TEXT NOT NULL,
    FOREIGN KEY(file_path) REFERENCES file_metadata(file_path) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS processing_stats (
    session_id          TEXT PRIMARY KEY,
    started_at          TEXT NOT NULL,
    ended_at            TEXT NOT NULL,
    discovered          INTEGER NOT NULL,
    processed           INTEGER NOT NULL,
    skipped             INTEGER NOT NULL,
    failed              INTEGER NOT NULL,
    interrupted         INTEGER NOT NULL,
    total_retries       INTEGER NOT NULL DEFAULT 0,
    max_attempts_reached INTEGER NOT NULL DEFAULT 0
);
"#;

/// Predicates for `list_files` (spec.md §6 `search_files`).
#[derive(Clone, Debug, Default)]
pub struct FileFilters {
    pub path_prefix: Option<String>,
    pub name_pattern: Option<String>,
    pub file_type: Option<String>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    pub modified_after: Option<f64>,
    pub modified_before: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub enum FileOrder {
    #[default]
    PathAsc,
    SizeDesc,
    ModifiedDesc,
}

#[derive(Clone, Debug)]
pub struct DirectorySummary {
    pub path: String,
    pub file_count: u64,
    pub total_size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_chunks: u64,
    pub total_embeddings: u64,
    pub total_size_bytes: u64,
    pub per_extension: BTreeMap<String, u64>,
}

/// Current coherence-protocol epochs, consumed by the ANN Index (spec.md §4.6).
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteEpochs {
    /// Bumped on every pure append of new chunk rows.
    pub append_epoch: u64,
    /// Bumped whenever existing chunk rows are deleted or replaced.
    pub invalidation_epoch: u64,
    /// Highest `text_chunks_v2.id` observed at the time of the read.
    pub max_chunk_id: i64,
}

pub struct Storage {
    pool: Pool<SqliteConnectionManager>,
    retry_cap: u32,
    append_epoch: AtomicU64,
    invalidation_epoch: AtomicU64,
    retry_count: AtomicU64,
    max_attempts_reached_count: AtomicU64,
}

/// Point-in-time snapshot of Storage's retry counters, diffed by callers
/// (the Scanner) to populate a session's `total_retries` /
/// `max_attempts_reached` summary fields (spec.md §3).
#[derive(Clone, Copy, Debug, Default)]
pub struct RetrySnapshot {
    pub retries: u64,
    pub max_attempts_reached: u64,
}

impl std::ops::Sub for RetrySnapshot {
    type Output = RetrySnapshot;
    fn sub(self, rhs: RetrySnapshot) -> RetrySnapshot {
        RetrySnapshot {
            retries: self.retries.saturating_sub(rhs.retries),
            max_attempts_reached: self.max_attempts_reached.saturating_sub(rhs.max_attempts_reached),
        }
    }
}

impl Storage {
    pub fn open(db_path: &Path, retry_cap: u32, busy_timeout_ms: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms as u64))?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });
        let pool = Pool::builder().max_size(16).build(manager).map_err(|e| {
            EngineError::StorageCorrupt(format!("failed to build connection pool: {e}"))
        })?;

        {
            let conn = pool.get().map_err(EngineError::Pool)?;
            conn.execute_batch(SCHEMA).map_err(|e| {
                EngineError::StorageCorrupt(format!("schema initialization failed: {e}"))
            })?;
        }

        Ok(Self {
            pool,
            retry_cap,
            append_epoch: AtomicU64::new(0),
            invalidation_epoch: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            max_attempts_reached_count: AtomicU64::new(0),
        })
    }

    pub fn retry_snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            retries: self.retry_count.load(Ordering::SeqCst),
            max_attempts_reached: self.max_attempts_reached_count.load(Ordering::SeqCst),
        }
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(EngineError::Pool)
    }

    /// Exponential backoff with jitter, ~10ms doubling up to ~1s, per spec.md §4.1.
    fn backoff_delay(attempt: u32) -> Duration {
        let base_ms = 10u64.saturating_mul(1u64 << attempt.min(6));
        let capped = base_ms.min(1000);
        let jitter = rand::random::<u64>() % (capped / 2).max(1);
        Duration::from_millis(capped / 2 + jitter)
    }

    /// Run a write closure inside an IMMEDIATE transaction, retrying on
    /// lock contention with exponential backoff (spec.md §4.1 retry
    /// semantics: attempts 1-3 debug, beyond that warn).
    fn with_write<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let conn = self.conn()?;
            let result = (|| -> rusqlite::Result<T> {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                let out = f(&conn);
                match out {
                    Ok(v) => {
                        conn.execute_batch("COMMIT")?;
                        Ok(v)
                    }
                    Err(e) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        Err(e)
                    }
                }
            })();

            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_contention(&e) && attempt < self.retry_cap => {
                    attempt += 1;
                    self.retry_count.fetch_add(1, Ordering::SeqCst);
                    if attempt <= 3 {
                        tracing::debug!(attempt, error = %e, "storage write contended, retrying");
                    } else {
                        tracing::warn!(attempt, error = %e, "storage write contended, retrying");
                    }
                    std::thread::sleep(Self::backoff_delay(attempt));
                    continue;
                }
                Err(e) if is_contention(&e) => {
                    self.max_attempts_reached_count.fetch_add(1, Ordering::SeqCst);
                    return Err(EngineError::StorageContended {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(map_fatal(e)),
            }
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Insert or update the file row; on hash change, cascades a delete of
    /// the file's existing envelopes and analysis (spec.md §4.1, §3).
    /// Returns whether the file was previously indexed with a different
    /// hash (i.e. a re-ingest is needed).
    pub fn upsert_file(
        &self,
        path: &str,
        size: u64,
        mtime: f64,
        hash: &str,
        file_type: &str,
        discovered_at: &str,
    ) -> Result<bool> {
        let hash = hash.to_string();
        let path_owned = path.to_string();
        let file_type = file_type.to_string();
        let discovered_at = discovered_at.to_string();
        let mut hash_changed = false;

        self.with_write(|conn| {
            let existing_hash: Option<String> = conn
                .query_row(
                    "SELECT content_hash FROM file_metadata WHERE file_path = ?1",
                    params![path_owned],
                    |r| r.get(0),
                )
                .optional()?;

            hash_changed = matches!(&existing_hash, Some(h) if h != &hash);

            if hash_changed {
                conn.execute(
                    "DELETE FROM text_chunks_v2 WHERE file_path = ?1",
                    params![path_owned],
                )?;
                conn.execute(
                    "DELETE FROM content_analysis WHERE file_path = ?1",
                    params![path_owned],
                )?;
            }

            conn.execute(
                "INSERT INTO file_metadata (file_path, size, mtime, content_hash, file_type, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(file_path) DO UPDATE SET
                    size = excluded.size,
                    mtime = excluded.mtime,
                    content_hash = excluded.content_hash,
                    file_type = excluded.file_type",
                params![path_owned, size as i64, mtime, hash, file_type, discovered_at],
            )?;
            Ok(())
        })?;

        if hash_changed {
            self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        }
        Ok(hash_changed)
    }

    /// Insert a file's full chunk batch atomically. Rejects a batch whose
    /// envelopes disagree on `total_chunks` (spec.md §4.1).
    pub fn insert_chunks(&self, path: &str, envelopes: &[ChunkEnvelope]) -> Result<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        let total = envelopes[0].metadata.total_chunks;
        if envelopes.iter().any(|e| e.metadata.total_chunks != total) {
            return Err(EngineError::InvalidQuery {
                message: "inconsistent total_chunks across envelope batch".to_string(),
                hint: "all envelopes for one insert_chunks call must share total_chunks"
                    .to_string(),
            });
        }

        let path_owned = path.to_string();
        self.with_write(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO text_chunks_v2
                    (file_path, chunk_index, chunk_envelope, chunk_strategy, chunk_size,
                     total_chunks, file_hash, file_type, created_at, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for env in envelopes {
                let json = serde_json::to_string(env).map_err(|e| {
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
                })?;
                let embedding_bytes = env.embedding.as_ref().map(|v| vector_to_bytes(v));
                stmt.execute(params![
                    path_owned,
                    env.metadata.chunk_index as i64,
                    json,
                    env.metadata.chunk_strategy.as_str(),
                    env.metadata.chunk_size as i64,
                    env.metadata.total_chunks as i64,
                    env.metadata.file_hash,
                    env.metadata.file_type,
                    env.metadata.created_at,
                    embedding_bytes,
                ])?;
            }
            Ok(())
        })?;

        self.append_epoch.fetch_add(envelopes.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Delete a file's chunk envelopes only, keeping its `file_metadata` row
    /// intact — used to force a clean re-ingest of an unchanged file
    /// (spec.md §4.5 Inputs: force-rescan).
    pub fn delete_chunks(&self, path: &str) -> Result<()> {
        let path_owned = path.to_string();
        self.with_write(|conn| {
            conn.execute("DELETE FROM text_chunks_v2 WHERE file_path = ?1", params![path_owned])?;
            Ok(())
        })?;
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Delete a file and (atomically, via FK cascade + explicit analysis
    /// delete) all its envelopes and analysis row (spec.md §8 Cascade).
    pub fn delete_file(&self, path: &str) -> Result<()> {
        let path_owned = path.to_string();
        self.with_write(|conn| {
            conn.execute("DELETE FROM content_analysis WHERE file_path = ?1", params![path_owned])?;
            conn.execute("DELETE FROM file_metadata WHERE file_path = ?1", params![path_owned])?;
            Ok(())
        })?;
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn upsert_analysis(&self, path: &str, keywords: &[KeywordScore]) -> Result<()> {
        let path_owned = path.to_string();
        let json = serde_json::to_string(keywords)
            .map_err(|e| EngineError::InvalidQuery { message: e.to_string(), hint: "keyword serialization".into() })?;
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO content_analysis (file_path, keywords) VALUES (?1, ?2)
                 ON CONFLICT(file_path) DO UPDATE SET keywords = excluded.keywords",
                params![path_owned, json],
            )?;
            Ok(())
        })
    }

    pub fn record_session(&self, session: &ProcessingSession) -> Result<()> {
        let session = session.clone();
        self.with_write(move |conn| {
            conn.execute(
                "INSERT INTO processing_stats
                    (session_id, started_at, ended_at, discovered, processed, skipped, failed,
                     interrupted, total_retries, max_attempts_reached)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.session_id,
                    session.started_at,
                    session.ended_at,
                    session.discovered as i64,
                    session.processed as i64,
                    session.skipped as i64,
                    session.failed as i64,
                    session.interrupted as i64,
                    session.total_retries as i64,
                    session.max_attempts_reached as i64,
                ],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Look up one chunk envelope by its storage row id, used by ANN Index
    /// search hits to recover the full envelope (spec.md §4.7 `semantic_search`).
    pub fn get_chunk_by_row_id(&self, row_id: i64) -> Result<Option<ChunkEnvelope>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT file_path, chunk_envelope FROM text_chunks_v2 WHERE id = ?1",
                params![row_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((path, json)) => deserialize_envelope(&json, row_id, &path).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_chunks(&self, path: &str, range: Option<(usize, usize)>) -> Result<Vec<ChunkEnvelope>> {
        let conn = self.conn()?;
        let (lo, hi) = range.unwrap_or((0, usize::MAX));
        let mut stmt = conn.prepare_cached(
            "SELECT id, chunk_envelope FROM text_chunks_v2
             WHERE file_path = ?1 AND chunk_index >= ?2 AND chunk_index <= ?3
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![path, lo as i64, hi as i64], |row| {
                let id: i64 = row.get(0)?;
                let json: String = row.get(1)?;
                Ok((id, json))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, json)| deserialize_envelope(&json, id, path))
            .collect()
    }

    pub fn get_chunk(&self, path: &str, chunk_index: usize) -> Result<ChunkEnvelope> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, chunk_envelope FROM text_chunks_v2 WHERE file_path = ?1 AND chunk_index = ?2",
                params![path, chunk_index as i64],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, json)) => deserialize_envelope(&json, id, path),
            None => Err(EngineError::NotFound(format!("{path}#{chunk_index}"))),
        }
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT file_path, size, mtime, content_hash, file_type, discovered_at
             FROM file_metadata WHERE file_path = ?1",
            params![path],
            |row| {
                Ok(FileRecord {
                    path: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                    mtime: row.get(2)?,
                    content_hash: row.get(3)?,
                    file_type: row.get(4)?,
                    discovered_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub fn get_analysis(&self, path: &str) -> Result<Option<ContentAnalysis>> {
        let conn = self.conn()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT keywords FROM content_analysis WHERE file_path = ?1",
                params![path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.map(|json| ContentAnalysis {
            file_path: path.to_string(),
            keywords: serde_json::from_str(&json).unwrap_or_default(),
        }))
    }

    pub fn chunk_count(&self, path: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM text_chunks_v2 WHERE file_path = ?1",
            params![path],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Full-text search over `chunks_fts`, delegating ranking to SQLite's
    /// native BM25 implementation (spec.md §4.1; Open Question in spec.md
    /// §9 resolved in DESIGN.md: default FTS5 bm25() weights, k1=1.2,
    /// b=0.75, tunable by a future weighted bm25() call).
    pub fn full_text_search(&self, query: &str, limit: usize) -> Result<Vec<(ChunkEnvelope, f64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT t.id, t.chunk_envelope, bm25(chunks_fts) AS rank,
                    snippet(chunks_fts, 2, '**', '**', '...', 32)
             FROM chunks_fts
             JOIN text_chunks_v2 t ON t.id = chunks_fts.rowid
             WHERE chunks_fts MATCH ?1
             ORDER BY rank ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![query, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let json: String = row.get(1)?;
                let rank: f64 = row.get(2)?;
                let snippet: String = row.get(3)?;
                Ok((id, json, rank, snippet))
            })
            .map_err(|e| invalid_query_or(e, query))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, json, rank, snippet) = row?;
            // FTS5 bm25() is more-negative-is-better; expose positive relevance.
            let envelope = deserialize_envelope_with_path(&json, id)?;
            out.push((envelope, -rank, snippet));
        }
        Ok(out)
    }

    /// Files whose keyword list intersects the argument, ranked by summed
    /// importance score (spec.md §4.1 `keyword_search`).
    pub fn keyword_search(&self, keywords: &[String], limit: usize) -> Result<Vec<(FileRecord, f64)>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, keywords FROM content_analysis",
        )?;
        let wanted: std::collections::HashSet<String> =
            keywords.iter().map(|k| k.to_lowercase()).collect();

        let mut scored: Vec<(String, f64)> = Vec::new();
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((path, json))
        })?;
        for row in rows {
            let (path, json) = row?;
            let kws: Vec<KeywordScore> = serde_json::from_str(&json).unwrap_or_default();
            let sum: f64 = kws
                .iter()
                .filter(|k| wanted.contains(&k.keyword.to_lowercase()))
                .map(|k| k.score)
                .sum();
            if sum > 0.0 {
                scored.push((path, sum));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut out = Vec::with_capacity(scored.len());
        for (path, score) in scored {
            if let Some(file) = self.get_file(&path)? {
                out.push((file, score));
            }
        }
        Ok(out)
    }

    pub fn list_files(&self, filters: &FileFilters, limit: usize, order: FileOrder) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT file_path, size, mtime, content_hash, file_type, discovered_at FROM file_metadata WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(p) = &filters.path_prefix {
            sql.push_str(" AND file_path LIKE ?");
            args.push(Box::new(format!("{}%", sql_escape_like(p))));
        }
        if let Some(pat) = &filters.name_pattern {
            sql.push_str(" AND file_path GLOB ?");
            args.push(Box::new(pat.clone()));
        }
        if let Some(ft) = &filters.file_type {
            sql.push_str(" AND file_type = ?");
            args.push(Box::new(ft.clone()));
        }
        if let Some(min) = filters.size_min {
            sql.push_str(" AND size >= ?");
            args.push(Box::new(min as i64));
        }
        if let Some(max) = filters.size_max {
            sql.push_str(" AND size <= ?");
            args.push(Box::new(max as i64));
        }
        if let Some(after) = filters.modified_after {
            sql.push_str(" AND mtime >= ?");
            args.push(Box::new(after));
        }
        if let Some(before) = filters.modified_before {
            sql.push_str(" AND mtime <= ?");
            args.push(Box::new(before));
        }

        sql.push_str(match order {
            FileOrder::PathAsc => " ORDER BY file_path ASC",
            FileOrder::SizeDesc => " ORDER BY size DESC",
            FileOrder::ModifiedDesc => " ORDER BY mtime DESC",
        });
        sql.push_str(" LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            Ok(FileRecord {
                path: row.get(0)?,
                size: row.get::<_, i64>(1)? as u64,
                mtime: row.get(2)?,
                content_hash: row.get(3)?,
                file_type: row.get(4)?,
                discovered_at: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    pub fn list_directories(&self, root: Option<&str>, limit: usize) -> Result<Vec<DirectorySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, size FROM file_metadata WHERE ?1 IS NULL OR file_path LIKE ?2",
        )?;
        let like = root.map(|r| format!("{}%", sql_escape_like(r)));
        let rows = stmt.query_map(params![root, like], |row| {
            let path: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            Ok((path, size as u64))
        })?;

        let mut dirs: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for row in rows {
            let (path, size) = row?;
            let dir = path.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
            let entry = dirs.entry(dir).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += size;
        }

        let mut out: Vec<DirectorySummary> = dirs
            .into_iter()
            .map(|(path, (file_count, total_size))| DirectorySummary { path, file_count, total_size })
            .collect();
        out.sort_by(|a, b| b.file_count.cmp(&a.file_count));
        out.truncate(limit);
        Ok(out)
    }

    pub fn get_stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;
        let total_files: i64 = conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |r| r.get(0))?;
        let total_chunks: i64 = conn.query_row("SELECT COUNT(*) FROM text_chunks_v2", [], |r| r.get(0))?;
        let total_embeddings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM text_chunks_v2 WHERE embedding IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let total_size_bytes: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM file_metadata", [], |r| r.get(0))?;

        let mut stmt = conn.prepare("SELECT file_type, COUNT(*) FROM file_metadata GROUP BY file_type")?;
        let rows = stmt.query_map([], |row| {
            let ext: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((ext, count as u64))
        })?;
        let per_extension = rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        Ok(StorageStats {
            total_files: total_files as u64,
            total_chunks: total_chunks as u64,
            total_embeddings: total_embeddings as u64,
            total_size_bytes: total_size_bytes as u64,
            per_extension,
        })
    }

    /// Ordered (chunk_row_id, vector) stream, consumed by the ANN Index
    /// build (spec.md §4.1 `embeddings_cursor`).
    pub fn embeddings_cursor(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        self.embeddings_cursor_after(0)
    }

    pub fn embeddings_cursor_after(&self, after_id: i64) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM text_chunks_v2
             WHERE embedding IS NOT NULL AND id > ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![after_id], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, bytes_to_vector(&blob)))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    pub fn epochs(&self) -> Result<WriteEpochs> {
        let conn = self.conn()?;
        let max_id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM text_chunks_v2", [], |r| r.get(0))?;
        Ok(WriteEpochs {
            append_epoch: self.append_epoch.load(Ordering::SeqCst),
            invalidation_epoch: self.invalidation_epoch.load(Ordering::SeqCst),
            max_chunk_id: max_id.unwrap_or(0),
        })
    }

    pub fn db_file_size(&self, db_path: &Path) -> u64 {
        std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0)
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn map_fatal(e: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(f, ref msg) = e {
        if f.code == rusqlite::ErrorCode::DatabaseCorrupt || f.code == rusqlite::ErrorCode::NotADatabase {
            return EngineError::StorageCorrupt(msg.clone().unwrap_or_else(|| e.to_string()));
        }
    }
    EngineError::Sqlite(e)
}

fn invalid_query_or(e: rusqlite::Error, query: &str) -> rusqlite::Error {
    tracing::debug!(query, error = %e, "full_text_search query rejected by FTS5");
    e
}

fn sql_escape_like(s: &str) -> String {
    s.replace('%', "\\%").replace('_', "\\_")
}

pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn deserialize_envelope(json: &str, id: i64, path: &str) -> Result<ChunkEnvelope> {
    let mut env: ChunkEnvelope = serde_json::from_str(json).map_err(|e| {
        EngineError::StorageCorrupt(format!("malformed chunk_envelope for {path}: {e}"))
    })?;
    env.row_id = Some(id);
    env.file_path = path.to_string();
    Ok(env)
}

fn deserialize_envelope_with_path(json: &str, id: i64) -> Result<ChunkEnvelope> {
    let mut env: ChunkEnvelope = serde_json::from_str(json).map_err(|e| {
        EngineError::StorageCorrupt(format!("malformed chunk_envelope for row {id}: {e}"))
    })?;
    env.row_id = Some(id);
    env.file_path = env.metadata.filename.clone();
    Ok(env)
}

/// Compute a streaming content hash for a file, constant memory (spec.md §4.5).
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn resolve_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("engine.sqlite3")
}
