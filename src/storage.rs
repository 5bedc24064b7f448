use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SdlError};

/// Current schema version. Increment when schema changes.
const SCHEMA_VERSION: u32 = 1;

/// SQLite parameter limit headroom: id-list queries are chunked at this size.
const BATCH_CHUNK: usize = 500;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct RepoRecord {
    pub repo_id: String,
    pub root_path: String,
    pub config_json: String,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: i64,
    pub repo_id: String,
    pub rel_path: String,
    pub content_hash: String,
    pub language: String,
    pub byte_size: u64,
    pub last_indexed_at: u64,
    pub directory: String,
}

#[derive(Debug, Clone)]
pub struct SymbolRow {
    pub symbol_id: String,
    pub kind: String,
    pub name: String,
    pub exported: bool,
    pub visibility: Option<String>,
    pub language: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub ast_fingerprint: String,
    pub signature_json: Option<String>,
    pub summary: Option<String>,
    pub invariants_json: Option<String>,
    pub side_effects_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub row: SymbolRow,
    pub repo_id: String,
    pub file_id: i64,
    pub rel_path: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub from_symbol_id: String,
    pub to_symbol_id: String,
    pub edge_type: String,
    pub weight: f64,
    pub provenance: String,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub version_id: String,
    pub repo_id: String,
    pub created_at: u64,
    pub reason: Option<String>,
    pub prev_version_hash: Option<String>,
    pub version_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub symbol_id: String,
    pub ast_fingerprint: String,
    pub signature_json: Option<String>,
    pub summary: Option<String>,
    pub invariants_json: Option<String>,
    pub side_effects_json: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRow {
    pub symbol_id: String,
    pub fan_in: u32,
    pub fan_out: u32,
    pub churn_30d: u32,
    pub test_refs_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SliceHandleRecord {
    pub handle: String,
    pub repo_id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub min_version: String,
    pub max_version: String,
    pub slice_hash: String,
    pub spillover_ref: Option<String>,
}

/// Everything a file-level re-index writes, applied as one atomic unit.
#[derive(Debug)]
pub struct FileIndexMutation<'a> {
    pub repo_id: &'a str,
    pub rel_path: &'a str,
    pub content_hash: &'a str,
    pub language: &'a str,
    pub byte_size: u64,
    pub directory: &'a str,
    pub symbols: &'a [SymbolRow],
    pub removed_symbol_ids: &'a [String],
    pub edges: &'a [EdgeRow],
}

/// Relational ledger store. One writer connection owns the write lock; a
/// read-only connection serves queries, which under WAL never block the
/// writer (and vice versa). In-memory stores share the single connection.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl Storage {
    pub fn open(db_path: &Path, statement_cache: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SdlError::config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let writer = Connection::open(db_path)?;
        configure_pragmas(&writer)?;
        writer.set_prepared_statement_cache_capacity(statement_cache);

        let stored_version = get_user_version(&writer)?;
        if stored_version != 0 && stored_version != SCHEMA_VERSION {
            return Err(SdlError::config(format!(
                "schema version mismatch: expected {SCHEMA_VERSION}, found {stored_version}; delete {} and re-register",
                db_path.display()
            )));
        }
        create_schema(&writer)?;
        set_user_version(&writer, SCHEMA_VERSION)?;

        let reader = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        reader.execute_batch("PRAGMA busy_timeout = 5000;")?;
        reader.set_prepared_statement_cache_capacity(statement_cache);

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// In-memory store for tests: reads and writes share one connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_pragmas(&conn)?;
        create_schema(&conn)?;
        set_user_version(&conn, SCHEMA_VERSION)?;
        Ok(Self { writer: Mutex::new(conn), reader: None, path: None })
    }

    fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.reader {
            Some(r) => f(&r.lock().unwrap()),
            None => f(&self.writer.lock().unwrap()),
        }
    }

    fn with_write<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        f(&mut self.writer.lock().unwrap())
    }

    // -- Repos --

    pub fn register_repo(&self, repo_id: &str, root_path: &str, config_json: &str) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO repos (repo_id, root_path, config_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(repo_id) DO UPDATE SET root_path = ?2, config_json = ?3",
                params![repo_id, root_path, config_json, now_unix_ms() as i64],
            )?;
            tx.execute(
                "INSERT INTO audit_log (at, repo_id, op, detail) VALUES (?1, ?2, 'repo.register', ?3)",
                params![now_unix_ms() as i64, repo_id, root_path],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_repo(&self, repo_id: &str) -> Result<Option<RepoRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    "SELECT repo_id, root_path, config_json, created_at FROM repos WHERE repo_id = ?1",
                    params![repo_id],
                    |row| {
                        Ok(RepoRecord {
                            repo_id: row.get(0)?,
                            root_path: row.get(1)?,
                            config_json: row.get(2)?,
                            created_at: row.get::<_, i64>(3)? as u64,
                        })
                    },
                )
                .optional()?;
            Ok(rec)
        })
    }

    // -- Files --

    pub fn get_file(&self, repo_id: &str, rel_path: &str) -> Result<Option<FileRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    "SELECT file_id, repo_id, rel_path, content_hash, language, byte_size,
                            last_indexed_at, directory
                     FROM files WHERE repo_id = ?1 AND rel_path = ?2",
                    params![repo_id, rel_path],
                    row_to_file,
                )
                .optional()?;
            Ok(rec)
        })
    }

    pub fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT file_id, repo_id, rel_path, content_hash, language, byte_size,
                        last_indexed_at, directory
                 FROM files WHERE repo_id = ?1 ORDER BY rel_path",
            )?;
            let rows = stmt
                .query_map(params![repo_id], row_to_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Delete a file and everything it owns: symbols (FK cascade), their
    /// edges (both endpoints), metrics, and this file's emitted edges.
    pub fn delete_file(&self, repo_id: &str, rel_path: &str) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            delete_file_tx(&tx, repo_id, rel_path)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// One atomic unit per re-indexed file: prune removed symbols, upsert the
    /// post-image, re-emit the file's edges. Partial failure rolls the whole
    /// file back.
    pub fn apply_file_index(&self, m: &FileIndexMutation) -> Result<i64> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            let now = now_unix_ms() as i64;

            tx.execute(
                "INSERT INTO files (repo_id, rel_path, content_hash, language, byte_size, last_indexed_at, directory)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(repo_id, rel_path) DO UPDATE SET
                     content_hash = ?3, language = ?4, byte_size = ?5, last_indexed_at = ?6, directory = ?7",
                params![m.repo_id, m.rel_path, m.content_hash, m.language, m.byte_size as i64, now, m.directory],
            )?;
            let file_id: i64 = tx.query_row(
                "SELECT file_id FROM files WHERE repo_id = ?1 AND rel_path = ?2",
                params![m.repo_id, m.rel_path],
                |row| row.get(0),
            )?;

            for chunk in m.removed_symbol_ids.chunks(BATCH_CHUNK) {
                let ph = sql_placeholders(chunk.len());
                tx.execute(
                    &format!(
                        "DELETE FROM edges WHERE repo_id = ?1
                         AND (from_symbol_id IN ({ph}) OR to_symbol_id IN ({ph2}))",
                        ph = ph,
                        ph2 = sql_placeholders_offset(chunk.len(), 1 + chunk.len())
                    ),
                    rusqlite::params_from_iter(
                        std::iter::once(&m.repo_id as &dyn rusqlite::ToSql)
                            .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql))
                            .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
                    ),
                )?;
                tx.execute(
                    &format!("DELETE FROM symbol_metrics WHERE repo_id = ?1 AND symbol_id IN ({ph})"),
                    rusqlite::params_from_iter(
                        std::iter::once(&m.repo_id as &dyn rusqlite::ToSql)
                            .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
                    ),
                )?;
                tx.execute(
                    &format!("DELETE FROM symbols WHERE repo_id = ?1 AND symbol_id IN ({ph})"),
                    rusqlite::params_from_iter(
                        std::iter::once(&m.repo_id as &dyn rusqlite::ToSql)
                            .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
                    ),
                )?;
            }

            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbols (repo_id, symbol_id, file_id, kind, name, exported, visibility,
                                          language, start_line, start_col, end_line, end_col,
                                          ast_fingerprint, signature_json, summary, invariants_json,
                                          side_effects_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                     ON CONFLICT(repo_id, symbol_id) DO UPDATE SET
                         file_id = ?3, kind = ?4, name = ?5, exported = ?6, visibility = ?7,
                         language = ?8, start_line = ?9, start_col = ?10, end_line = ?11, end_col = ?12,
                         ast_fingerprint = ?13, signature_json = ?14, summary = ?15,
                         invariants_json = ?16, side_effects_json = ?17, updated_at = ?18",
                )?;
                for s in m.symbols {
                    stmt.execute(params![
                        m.repo_id,
                        s.symbol_id,
                        file_id,
                        s.kind,
                        s.name,
                        s.exported as i64,
                        s.visibility,
                        s.language,
                        s.start_line as i64,
                        s.start_col as i64,
                        s.end_line as i64,
                        s.end_col as i64,
                        s.ast_fingerprint,
                        s.signature_json,
                        s.summary,
                        s.invariants_json,
                        s.side_effects_json,
                        now,
                    ])?;
                }
            }

            tx.execute(
                "DELETE FROM edges WHERE repo_id = ?1 AND provenance = ?2",
                params![m.repo_id, m.rel_path],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO edges (repo_id, from_symbol_id, to_symbol_id, type, weight, provenance, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for e in m.edges {
                    stmt.execute(params![
                        m.repo_id,
                        e.from_symbol_id,
                        e.to_symbol_id,
                        e.edge_type,
                        e.weight,
                        e.provenance,
                        now,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(file_id)
        })
    }

    /// Pass-2 edge emission: replace every edge this file previously emitted
    /// with the resolved set, one atomic unit.
    pub fn replace_file_edges(&self, repo_id: &str, rel_path: &str, edges: &[EdgeRow]) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM edges WHERE repo_id = ?1 AND provenance = ?2",
                params![repo_id, rel_path],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO edges (repo_id, from_symbol_id, to_symbol_id, type, weight, provenance, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                let now = now_unix_ms() as i64;
                for e in edges {
                    stmt.execute(params![
                        repo_id,
                        e.from_symbol_id,
                        e.to_symbol_id,
                        e.edge_type,
                        e.weight,
                        e.provenance,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    // -- Symbols --

    pub fn load_symbols(&self, repo_id: &str) -> Result<Vec<SymbolRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SYMBOL_COLS} FROM symbols s JOIN files f ON f.file_id = s.file_id
                 WHERE s.repo_id = ?1 ORDER BY s.symbol_id"
            ))?;
            let rows = stmt
                .query_map(params![repo_id], row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn symbols_for_file(&self, repo_id: &str, rel_path: &str) -> Result<Vec<SymbolRecord>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SYMBOL_COLS} FROM symbols s JOIN files f ON f.file_id = s.file_id
                 WHERE s.repo_id = ?1 AND f.rel_path = ?2 ORDER BY s.symbol_id"
            ))?;
            let rows = stmt
                .query_map(params![repo_id, rel_path], row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get_symbol(&self, repo_id: &str, symbol_id: &str) -> Result<Option<SymbolRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    &format!(
                        "SELECT {SYMBOL_COLS} FROM symbols s JOIN files f ON f.file_id = s.file_id
                         WHERE s.repo_id = ?1 AND s.symbol_id = ?2"
                    ),
                    params![repo_id, symbol_id],
                    row_to_symbol,
                )
                .optional()?;
            Ok(rec)
        })
    }

    /// Batch fetch by id list, transparently chunked under the engine's
    /// parameter limit. Returns a map keyed by id; absent ids are omitted.
    pub fn get_symbols_by_ids(
        &self,
        repo_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SymbolRecord>> {
        let mut out = HashMap::with_capacity(ids.len());
        self.with_read(|conn| {
            for chunk in ids.chunks(BATCH_CHUNK) {
                let ph = sql_placeholders(chunk.len());
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SYMBOL_COLS} FROM symbols s JOIN files f ON f.file_id = s.file_id
                     WHERE s.repo_id = ?1 AND s.symbol_id IN ({ph})"
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(
                            std::iter::once(&repo_id as &dyn rusqlite::ToSql)
                                .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
                        ),
                        row_to_symbol,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for r in rows {
                    out.insert(r.row.symbol_id.clone(), r);
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Name search. The user pattern is wildcard-escaped before binding, so
    /// `%`/`_` in queries match literally.
    pub fn search_symbols(&self, repo_id: &str, query: &str, limit: usize) -> Result<Vec<SymbolRecord>> {
        let escaped = escape_like(query);
        let pattern = format!("%{escaped}%");
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SYMBOL_COLS} FROM symbols s JOIN files f ON f.file_id = s.file_id
                 WHERE s.repo_id = ?1 AND s.name LIKE ?2 ESCAPE '\\'
                 ORDER BY length(s.name), s.symbol_id LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![repo_id, pattern, limit as i64], row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // -- Edges --

    pub fn load_edges(&self, repo_id: &str) -> Result<Vec<EdgeRow>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT from_symbol_id, to_symbol_id, type, weight, provenance
                 FROM edges WHERE repo_id = ?1 ORDER BY from_symbol_id, to_symbol_id, type",
            )?;
            let rows = stmt
                .query_map(params![repo_id], |row| {
                    Ok(EdgeRow {
                        from_symbol_id: row.get(0)?,
                        to_symbol_id: row.get(1)?,
                        edge_type: row.get(2)?,
                        weight: row.get(3)?,
                        provenance: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // -- Versions & snapshots --

    pub fn latest_version(&self, repo_id: &str) -> Result<Option<VersionRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    "SELECT version_id, repo_id, created_at, reason, prev_version_hash, version_hash
                     FROM versions WHERE repo_id = ?1 ORDER BY created_at DESC, version_id DESC LIMIT 1",
                    params![repo_id],
                    row_to_version,
                )
                .optional()?;
            Ok(rec)
        })
    }

    pub fn get_version(&self, version_id: &str) -> Result<Option<VersionRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    "SELECT version_id, repo_id, created_at, reason, prev_version_hash, version_hash
                     FROM versions WHERE version_id = ?1",
                    params![version_id],
                    row_to_version,
                )
                .optional()?;
            Ok(rec)
        })
    }

    /// Version row + all snapshot rows + the computed hash, one atomic unit.
    /// Versions are never mutated after this call.
    pub fn insert_version_with_snapshots(
        &self,
        version: &VersionRecord,
        snapshots: &[SnapshotRow],
    ) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO versions (version_id, repo_id, created_at, reason, prev_version_hash, version_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    version.version_id,
                    version.repo_id,
                    version.created_at as i64,
                    version.reason,
                    version.prev_version_hash,
                    version.version_hash,
                ],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbol_versions (version_id, symbol_id, ast_fingerprint,
                                                  signature_json, summary, invariants_json, side_effects_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(version_id, symbol_id) DO UPDATE SET ast_fingerprint = ?3",
                )?;
                for s in snapshots {
                    stmt.execute(params![
                        version.version_id,
                        s.symbol_id,
                        s.ast_fingerprint,
                        s.signature_json,
                        s.summary,
                        s.invariants_json,
                        s.side_effects_json,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn snapshots_for_version(&self, version_id: &str) -> Result<HashMap<String, SnapshotRow>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol_id, ast_fingerprint, signature_json, summary, invariants_json, side_effects_json
                 FROM symbol_versions WHERE version_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![version_id], |row| {
                    Ok(SnapshotRow {
                        symbol_id: row.get(0)?,
                        ast_fingerprint: row.get(1)?,
                        signature_json: row.get(2)?,
                        summary: row.get(3)?,
                        invariants_json: row.get(4)?,
                        side_effects_json: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.into_iter().map(|r| (r.symbol_id.clone(), r)).collect())
        })
    }

    // -- Metrics --

    pub fn upsert_metrics(&self, repo_id: &str, rows: &[MetricsRow]) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbol_metrics (repo_id, symbol_id, fan_in, fan_out, churn_30d, test_refs_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(repo_id, symbol_id) DO UPDATE SET
                         fan_in = ?3, fan_out = ?4, churn_30d = ?5, test_refs_json = ?6, updated_at = ?7",
                )?;
                let now = now_unix_ms() as i64;
                for m in rows {
                    stmt.execute(params![
                        repo_id,
                        m.symbol_id,
                        m.fan_in as i64,
                        m.fan_out as i64,
                        m.churn_30d as i64,
                        m.test_refs_json,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_metrics(&self, repo_id: &str, ids: &[String]) -> Result<HashMap<String, MetricsRow>> {
        let mut out = HashMap::with_capacity(ids.len());
        self.with_read(|conn| {
            for chunk in ids.chunks(BATCH_CHUNK) {
                let ph = sql_placeholders(chunk.len());
                let mut stmt = conn.prepare(&format!(
                    "SELECT symbol_id, fan_in, fan_out, churn_30d, test_refs_json
                     FROM symbol_metrics WHERE repo_id = ?1 AND symbol_id IN ({ph})"
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(
                            std::iter::once(&repo_id as &dyn rusqlite::ToSql)
                                .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
                        ),
                        |row| {
                            Ok(MetricsRow {
                                symbol_id: row.get(0)?,
                                fan_in: row.get::<_, i64>(1)? as u32,
                                fan_out: row.get::<_, i64>(2)? as u32,
                                churn_30d: row.get::<_, i64>(3)? as u32,
                                test_refs_json: row.get(4)?,
                            })
                        },
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for r in rows {
                    out.insert(r.symbol_id.clone(), r);
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Churn is produced externally (VCS analysis); this is its ingestion point.
    pub fn set_churn(&self, repo_id: &str, symbol_id: &str, churn_30d: u32) -> Result<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO symbol_metrics (repo_id, symbol_id, fan_in, fan_out, churn_30d, updated_at)
                 VALUES (?1, ?2, 0, 0, ?3, ?4)
                 ON CONFLICT(repo_id, symbol_id) DO UPDATE SET churn_30d = ?3, updated_at = ?4",
                params![repo_id, symbol_id, churn_30d as i64, now_unix_ms() as i64],
            )?;
            Ok(())
        })
    }

    // -- Slice handles & spillover --

    pub fn insert_handle(&self, rec: &SliceHandleRecord) -> Result<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO slice_handles (handle, repo_id, created_at, expires_at, min_version, max_version, slice_hash, spillover_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rec.handle,
                    rec.repo_id,
                    rec.created_at as i64,
                    rec.expires_at as i64,
                    rec.min_version,
                    rec.max_version,
                    rec.slice_hash,
                    rec.spillover_ref,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_handle(&self, handle: &str) -> Result<Option<SliceHandleRecord>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row(
                    "SELECT handle, repo_id, created_at, expires_at, min_version, max_version, slice_hash, spillover_ref
                     FROM slice_handles WHERE handle = ?1",
                    params![handle],
                    |row| {
                        Ok(SliceHandleRecord {
                            handle: row.get(0)?,
                            repo_id: row.get(1)?,
                            created_at: row.get::<_, i64>(2)? as u64,
                            expires_at: row.get::<_, i64>(3)? as u64,
                            min_version: row.get(4)?,
                            max_version: row.get(5)?,
                            slice_hash: row.get(6)?,
                            spillover_ref: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(rec)
        })
    }

    /// Periodic sweep: expired handles and their spillover pages.
    pub fn sweep_expired_handles(&self, now_ms: u64) -> Result<usize> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM spillover_sets WHERE handle IN
                 (SELECT spillover_ref FROM slice_handles WHERE expires_at < ?1 AND spillover_ref IS NOT NULL)",
                params![now_ms as i64],
            )?;
            let n = tx.execute("DELETE FROM slice_handles WHERE expires_at < ?1", params![now_ms as i64])?;
            tx.commit()?;
            Ok(n)
        })
    }

    pub fn insert_spillover(&self, handle: &str, items_json: &[String]) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO spillover_sets (handle, ord, symbol_json) VALUES (?1, ?2, ?3)",
                )?;
                for (i, item) in items_json.iter().enumerate() {
                    stmt.execute(params![handle, i as i64, item])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Page of a spillover set: `(items, next_cursor)`.
    pub fn get_spillover_page(
        &self,
        handle: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<u64>)> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ord, symbol_json FROM spillover_sets
                 WHERE handle = ?1 AND ord >= ?2 ORDER BY ord LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![handle, cursor as i64, (page_size + 1) as i64], |row| {
                    Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let next = if rows.len() > page_size { Some(rows[page_size].0) } else { None };
            let items = rows.into_iter().take(page_size).map(|(_, j)| j).collect();
            Ok((items, next))
        })
    }

    // -- Content-addressed blobs --

    pub fn put_blob(&self, hash: &str, kind: &str, bytes: &[u8]) -> Result<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blobs (hash, kind, bytes) VALUES (?1, ?2, ?3)",
                params![hash, kind, bytes],
            )?;
            Ok(())
        })
    }

    pub fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        self.with_read(|conn| {
            let rec = conn
                .query_row("SELECT bytes FROM blobs WHERE hash = ?1", params![hash], |row| row.get(0))
                .optional()?;
            Ok(rec)
        })
    }

    // -- Audit --

    pub fn append_audit(&self, repo_id: &str, op: &str, detail: &str) -> Result<()> {
        self.with_write(|conn| {
            conn.execute(
                "INSERT INTO audit_log (at, repo_id, op, detail) VALUES (?1, ?2, ?3, ?4)",
                params![now_unix_ms() as i64, repo_id, op, detail],
            )?;
            Ok(())
        })
    }

    // -- Aggregates (computed on read) --

    pub fn counts(&self, repo_id: &str) -> Result<(u64, u64)> {
        self.with_read(|conn| {
            let files: i64 = conn.query_row(
                "SELECT COUNT(*) FROM files WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )?;
            let symbols: i64 = conn.query_row(
                "SELECT COUNT(*) FROM symbols WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )?;
            Ok((files as u64, symbols as u64))
        })
    }

    /// Per-directory rollup: `(directory, file_count, byte_total)`.
    pub fn directory_aggregates(&self, repo_id: &str) -> Result<Vec<(String, u64, u64)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT directory, COUNT(*), SUM(byte_size) FROM files
                 WHERE repo_id = ?1 GROUP BY directory ORDER BY directory",
            )?;
            let rows = stmt
                .query_map(params![repo_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn top_by_fan_in(&self, repo_id: &str, limit: usize) -> Result<Vec<(String, u32)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol_id, fan_in FROM symbol_metrics WHERE repo_id = ?1
                 ORDER BY fan_in DESC, symbol_id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![repo_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn top_by_churn(&self, repo_id: &str, limit: usize) -> Result<Vec<(String, u32)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol_id, churn_30d FROM symbol_metrics WHERE repo_id = ?1
                 ORDER BY churn_30d DESC, symbol_id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![repo_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn largest_files(&self, repo_id: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT rel_path, byte_size FROM files WHERE repo_id = ?1
                 ORDER BY byte_size DESC, rel_path LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![repo_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

const SYMBOL_COLS: &str = "s.symbol_id, s.repo_id, s.file_id, s.kind, s.name, s.exported, s.visibility,
    s.language, s.start_line, s.start_col, s.end_line, s.end_col, s.ast_fingerprint,
    s.signature_json, s.summary, s.invariants_json, s.side_effects_json, s.updated_at, f.rel_path";

fn row_to_symbol(row: &rusqlite::Row<'_>) -> rusqlite::Result<SymbolRecord> {
    Ok(SymbolRecord {
        row: SymbolRow {
            symbol_id: row.get(0)?,
            kind: row.get(3)?,
            name: row.get(4)?,
            exported: row.get::<_, i64>(5)? != 0,
            visibility: row.get(6)?,
            language: row.get(7)?,
            start_line: row.get::<_, i64>(8)? as u32,
            start_col: row.get::<_, i64>(9)? as u32,
            end_line: row.get::<_, i64>(10)? as u32,
            end_col: row.get::<_, i64>(11)? as u32,
            ast_fingerprint: row.get(12)?,
            signature_json: row.get(13)?,
            summary: row.get(14)?,
            invariants_json: row.get(15)?,
            side_effects_json: row.get(16)?,
        },
        repo_id: row.get(1)?,
        file_id: row.get(2)?,
        updated_at: row.get::<_, i64>(17)? as u64,
        rel_path: row.get(18)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        repo_id: row.get(1)?,
        rel_path: row.get(2)?,
        content_hash: row.get(3)?,
        language: row.get(4)?,
        byte_size: row.get::<_, i64>(5)? as u64,
        last_indexed_at: row.get::<_, i64>(6)? as u64,
        directory: row.get(7)?,
    })
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        version_id: row.get(0)?,
        repo_id: row.get(1)?,
        created_at: row.get::<_, i64>(2)? as u64,
        reason: row.get(3)?,
        prev_version_hash: row.get(4)?,
        version_hash: row.get(5)?,
    })
}

fn delete_file_tx(tx: &rusqlite::Transaction<'_>, repo_id: &str, rel_path: &str) -> Result<()> {
    let ids: Vec<String> = {
        let mut stmt = tx.prepare_cached(
            "SELECT s.symbol_id FROM symbols s JOIN files f ON f.file_id = s.file_id
             WHERE s.repo_id = ?1 AND f.rel_path = ?2",
        )?;
        let rows = stmt
            .query_map(params![repo_id, rel_path], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    for chunk in ids.chunks(BATCH_CHUNK) {
        let ph = sql_placeholders(chunk.len());
        tx.execute(
            &format!(
                "DELETE FROM edges WHERE repo_id = ?1 AND (from_symbol_id IN ({ph}) OR to_symbol_id IN ({}))",
                sql_placeholders_offset(chunk.len(), 1 + chunk.len())
            ),
            rusqlite::params_from_iter(
                std::iter::once(&repo_id as &dyn rusqlite::ToSql)
                    .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql))
                    .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
            ),
        )?;
        tx.execute(
            &format!("DELETE FROM symbol_metrics WHERE repo_id = ?1 AND symbol_id IN ({ph})"),
            rusqlite::params_from_iter(
                std::iter::once(&repo_id as &dyn rusqlite::ToSql)
                    .chain(chunk.iter().map(|s| s as &dyn rusqlite::ToSql)),
            ),
        )?;
    }
    tx.execute(
        "DELETE FROM edges WHERE repo_id = ?1 AND provenance = ?2",
        params![repo_id, rel_path],
    )?;
    // Symbol rows cascade via the file FK.
    tx.execute(
        "DELETE FROM files WHERE repo_id = ?1 AND rel_path = ?2",
        params![repo_id, rel_path],
    )?;
    Ok(())
}

fn sql_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&format!("?{}", i + 2));
    }
    s
}

fn sql_placeholders_offset(n: usize, offset: usize) -> String {
    let mut s = String::with_capacity(n * 4);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&format!("?{}", i + offset + 1));
    }
    s
}

/// Escape `%`, `_` and `\` in a user-supplied LIKE fragment.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\
         PRAGMA busy_timeout = 5000;\
         PRAGMA synchronous = NORMAL;\
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

fn get_user_version(conn: &Connection) -> Result<u32> {
    let v: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(v)
}

fn set_user_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS repos (
            repo_id     TEXT PRIMARY KEY,
            root_path   TEXT NOT NULL,
            config_json TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            file_id         INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_id         TEXT NOT NULL REFERENCES repos(repo_id) ON DELETE CASCADE,
            rel_path        TEXT NOT NULL,
            content_hash    TEXT NOT NULL,
            language        TEXT NOT NULL,
            byte_size       INTEGER NOT NULL,
            last_indexed_at INTEGER NOT NULL,
            directory       TEXT NOT NULL,
            UNIQUE(repo_id, rel_path)
        );

        CREATE INDEX IF NOT EXISTS idx_files_dir ON files(repo_id, directory);

        CREATE TABLE IF NOT EXISTS symbols (
            repo_id          TEXT NOT NULL,
            symbol_id        TEXT NOT NULL,
            file_id          INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            kind             TEXT NOT NULL,
            name             TEXT NOT NULL,
            exported         INTEGER NOT NULL,
            visibility       TEXT,
            language         TEXT NOT NULL,
            start_line       INTEGER NOT NULL,
            start_col        INTEGER NOT NULL,
            end_line         INTEGER NOT NULL,
            end_col          INTEGER NOT NULL,
            ast_fingerprint  TEXT NOT NULL,
            signature_json   TEXT,
            summary          TEXT,
            invariants_json  TEXT,
            side_effects_json TEXT,
            updated_at       INTEGER NOT NULL,
            PRIMARY KEY (repo_id, symbol_id)
        );

        CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);
        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(repo_id, name);

        CREATE TABLE IF NOT EXISTS edges (
            edge_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_id        TEXT NOT NULL,
            from_symbol_id TEXT NOT NULL,
            to_symbol_id   TEXT NOT NULL,
            type           TEXT NOT NULL,
            weight         REAL NOT NULL,
            provenance     TEXT NOT NULL,
            created_at     INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(repo_id, from_symbol_id);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(repo_id, to_symbol_id);
        CREATE INDEX IF NOT EXISTS idx_edges_prov ON edges(repo_id, provenance);

        CREATE TABLE IF NOT EXISTS versions (
            version_id        TEXT PRIMARY KEY,
            repo_id           TEXT NOT NULL REFERENCES repos(repo_id) ON DELETE CASCADE,
            created_at        INTEGER NOT NULL,
            reason            TEXT,
            prev_version_hash TEXT,
            version_hash      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_versions_repo ON versions(repo_id, created_at);

        CREATE TABLE IF NOT EXISTS symbol_versions (
            version_id        TEXT NOT NULL REFERENCES versions(version_id) ON DELETE CASCADE,
            symbol_id         TEXT NOT NULL,
            ast_fingerprint   TEXT NOT NULL,
            signature_json    TEXT,
            summary           TEXT,
            invariants_json   TEXT,
            side_effects_json TEXT,
            PRIMARY KEY (version_id, symbol_id)
        );

        CREATE TABLE IF NOT EXISTS symbol_metrics (
            repo_id        TEXT NOT NULL,
            symbol_id      TEXT NOT NULL,
            fan_in         INTEGER NOT NULL DEFAULT 0,
            fan_out        INTEGER NOT NULL DEFAULT 0,
            churn_30d      INTEGER NOT NULL DEFAULT 0,
            test_refs_json TEXT,
            updated_at     INTEGER NOT NULL,
            PRIMARY KEY (repo_id, symbol_id)
        );

        CREATE TABLE IF NOT EXISTS slice_handles (
            handle        TEXT PRIMARY KEY,
            repo_id       TEXT NOT NULL,
            created_at    INTEGER NOT NULL,
            expires_at    INTEGER NOT NULL,
            min_version   TEXT NOT NULL,
            max_version   TEXT NOT NULL,
            slice_hash    TEXT NOT NULL,
            spillover_ref TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_handles_expiry ON slice_handles(expires_at);

        CREATE TABLE IF NOT EXISTS spillover_sets (
            handle      TEXT NOT NULL,
            ord         INTEGER NOT NULL,
            symbol_json TEXT NOT NULL,
            PRIMARY KEY (handle, ord)
        );

        CREATE TABLE IF NOT EXISTS blobs (
            hash  TEXT PRIMARY KEY,
            kind  TEXT NOT NULL,
            bytes BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            at      INTEGER NOT NULL,
            repo_id TEXT NOT NULL,
            op      TEXT NOT NULL,
            detail  TEXT NOT NULL
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: &str, name: &str, fp: &str) -> SymbolRow {
        SymbolRow {
            symbol_id: id.to_string(),
            kind: "function".into(),
            name: name.into(),
            exported: true,
            visibility: Some("exported".into()),
            language: "typescript".into(),
            start_line: 0,
            start_col: 0,
            end_line: 1,
            end_col: 0,
            ast_fingerprint: fp.into(),
            signature_json: None,
            summary: None,
            invariants_json: None,
            side_effects_json: None,
        }
    }

    fn seed_file(store: &Storage) {
        store.register_repo("demo", "/tmp/demo", "{}").unwrap();
        store
            .apply_file_index(&FileIndexMutation {
                repo_id: "demo",
                rel_path: "a.ts",
                content_hash: "h1",
                language: "typescript",
                byte_size: 42,
                directory: "",
                symbols: &[sym("a.ts#f", "f", "fp_f"), sym("a.ts#g", "g", "fp_g")],
                removed_symbol_ids: &[],
                edges: &[EdgeRow {
                    from_symbol_id: "a.ts#f".into(),
                    to_symbol_id: "a.ts#g".into(),
                    edge_type: "call".into(),
                    weight: 1.0,
                    provenance: "a.ts".into(),
                }],
            })
            .unwrap();
    }

    #[test]
    fn upsert_is_idempotent_update() {
        let store = Storage::open_in_memory().unwrap();
        seed_file(&store);
        seed_file(&store); // second apply must not duplicate
        let syms = store.load_symbols("demo").unwrap();
        assert_eq!(syms.len(), 2);
        let edges = store.load_edges("demo").unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn cascading_delete_removes_symbols_and_edges() {
        let store = Storage::open_in_memory().unwrap();
        seed_file(&store);
        store.delete_file("demo", "a.ts").unwrap();
        assert!(store.load_symbols("demo").unwrap().is_empty());
        assert!(store.load_edges("demo").unwrap().is_empty());
        assert!(store.get_file("demo", "a.ts").unwrap().is_none());
    }

    #[test]
    fn removed_symbols_drop_their_edges() {
        let store = Storage::open_in_memory().unwrap();
        seed_file(&store);
        store
            .apply_file_index(&FileIndexMutation {
                repo_id: "demo",
                rel_path: "a.ts",
                content_hash: "h2",
                language: "typescript",
                byte_size: 20,
                directory: "",
                symbols: &[sym("a.ts#f", "f", "fp_f2")],
                removed_symbol_ids: &["a.ts#g".to_string()],
                edges: &[],
            })
            .unwrap();
        let syms = store.load_symbols("demo").unwrap();
        assert_eq!(syms.len(), 1);
        assert!(store.load_edges("demo").unwrap().is_empty());
    }

    #[test]
    fn batch_lookup_chunks_past_parameter_limit() {
        let store = Storage::open_in_memory().unwrap();
        store.register_repo("demo", "/tmp/demo", "{}").unwrap();
        let symbols: Vec<SymbolRow> =
            (0..1_200).map(|i| sym(&format!("m.ts#s{i}"), &format!("s{i}"), "fp")).collect();
        store
            .apply_file_index(&FileIndexMutation {
                repo_id: "demo",
                rel_path: "m.ts",
                content_hash: "h",
                language: "typescript",
                byte_size: 1,
                directory: "",
                symbols: &symbols,
                removed_symbol_ids: &[],
                edges: &[],
            })
            .unwrap();
        let ids: Vec<String> = symbols.iter().map(|s| s.symbol_id.clone()).collect();
        let got = store.get_symbols_by_ids("demo", &ids).unwrap();
        assert_eq!(got.len(), 1_200);
    }

    #[test]
    fn like_patterns_are_escaped() {
        let store = Storage::open_in_memory().unwrap();
        store.register_repo("demo", "/tmp/demo", "{}").unwrap();
        store
            .apply_file_index(&FileIndexMutation {
                repo_id: "demo",
                rel_path: "m.ts",
                content_hash: "h",
                language: "typescript",
                byte_size: 1,
                directory: "",
                symbols: &[sym("m.ts#pct", "pct_value", "fp"), sym("m.ts#x", "pctXvalue", "fp2")],
                removed_symbol_ids: &[],
                edges: &[],
            })
            .unwrap();
        // `_` must match literally, not as a single-char wildcard.
        let hits = store.search_symbols("demo", "pct_", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.name, "pct_value");
    }

    #[test]
    fn blob_store_deduplicates() {
        let store = Storage::open_in_memory().unwrap();
        store.put_blob("abc", "card", b"one").unwrap();
        store.put_blob("abc", "card", b"two").unwrap();
        assert_eq!(store.get_blob("abc").unwrap().unwrap(), b"one");
    }

    #[test]
    fn handle_sweep_removes_expired_and_spillover() {
        let store = Storage::open_in_memory().unwrap();
        let rec = SliceHandleRecord {
            handle: "h1".into(),
            repo_id: "demo".into(),
            created_at: 0,
            expires_at: 10,
            min_version: "demo-v1".into(),
            max_version: "demo-v1".into(),
            slice_hash: "s".into(),
            spillover_ref: Some("sp1".into()),
        };
        store.insert_handle(&rec).unwrap();
        store.insert_spillover("sp1", &["{}".to_string(), "{}".to_string()]).unwrap();
        let swept = store.sweep_expired_handles(100).unwrap();
        assert_eq!(swept, 1);
        assert!(store.get_handle("h1").unwrap().is_none());
        let (items, _) = store.get_spillover_page("sp1", 0, 10).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn spillover_pagination_cursors() {
        let store = Storage::open_in_memory().unwrap();
        let items: Vec<String> = (0..5).map(|i| format!("{{\"i\":{i}}}")).collect();
        store.insert_spillover("sp", &items).unwrap();
        let (page1, next) = store.get_spillover_page("sp", 0, 2).unwrap();
        assert_eq!(page1.len(), 2);
        let (page2, next2) = store.get_spillover_page("sp", next.unwrap(), 2).unwrap();
        assert_eq!(page2.len(), 2);
        let (page3, next3) = store.get_spillover_page("sp", next2.unwrap(), 2).unwrap();
        assert_eq!(page3.len(), 1);
        assert!(next3.is_none());
    }
}
