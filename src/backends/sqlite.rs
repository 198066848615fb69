//! Relational storage backend on SQLite.
//!
//! One `memories` table plus an optional FTS5 index kept in sync by
//! triggers. Every call is routed through a single background-thread
//! connection, so writers never contend on the file handle.
//!
//! When the linked SQLite lacks FTS5 the backend degrades to LIKE scans;
//! the schema and call sites are otherwise identical.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::MemoryStore;
use crate::core::{
    BackendFeatures, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch, MemoryQuery,
    MemoryStats,
};
use crate::error::{Result, StratumError};

/// SQLite backend configuration.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Database file path. Parent directories are created on initialize.
    pub path: PathBuf,
    /// Maintain an FTS5 index over content, synced via triggers.
    pub enable_fts: bool,
    /// Use WAL journaling.
    pub enable_wal: bool,
    /// Busy timeout for concurrent access.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("memories.db"),
            enable_fts: true,
            enable_wal: true,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Relational backend.
pub struct SqliteBackend {
    options: SqliteOptions,
    conn: Mutex<Option<Connection>>,
    // True once the FTS5 schema was created successfully.
    fts_active: AtomicBool,
}

/// Raw row image, converted to `MemoryItem` outside the connection thread.
type RawRow = (
    String, // id
    String, // project_name
    String, // content
    String, // category
    Option<String>, // tags json
    Option<String>, // metadata json
    String, // created_at
    String, // updated_at
);

const SELECT_COLUMNS: &str =
    "id, project_name, content, category, tags, metadata, created_at, updated_at";

impl SqliteBackend {
    /// Create a backend with the given options. No file is touched until
    /// `initialize` runs.
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            conn: Mutex::new(None),
            fts_active: AtomicBool::new(false),
        }
    }

    /// Create a backend for a database path with default options.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(SqliteOptions {
            path: path.into(),
            ..SqliteOptions::default()
        })
    }

    fn handle(&self) -> Result<Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                StratumError::read("sqlite", "database not initialized, call initialize() first")
            })
    }

    fn fts_enabled(&self) -> bool {
        self.fts_active.load(Ordering::Relaxed)
    }

    async fn create_schema(&self, conn: &Connection) -> Result<()> {
        let enable_wal = self.options.enable_wal;
        let busy_timeout = self.options.busy_timeout_ms;

        conn.call(move |conn| -> rusqlite::Result<()> {
            if enable_wal {
                conn.pragma_update(None, "journal_mode", "WAL")?;
            }
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", busy_timeout as i64)?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS memories (
                     id TEXT PRIMARY KEY,
                     project_name TEXT NOT NULL,
                     content TEXT NOT NULL,
                     category TEXT NOT NULL,
                     tags TEXT,
                     metadata TEXT,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_memories_project
                     ON memories(project_name);
                 CREATE INDEX IF NOT EXISTS idx_memories_project_category
                     ON memories(project_name, category);
                 CREATE INDEX IF NOT EXISTS idx_memories_created_at
                     ON memories(created_at);
                 CREATE TABLE IF NOT EXISTS schema_info (
                     version INTEGER PRIMARY KEY,
                     created_at TEXT NOT NULL
                 );",
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_info (version, created_at) VALUES (1, ?1)",
                [now_text()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StratumError::initialization("sqlite", e.to_string()))
    }

    async fn create_fts_schema(&self, conn: &Connection) -> Result<()> {
        conn.call(|conn| -> rusqlite::Result<()> {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                     id UNINDEXED,
                     project_name UNINDEXED,
                     content
                 );
                 CREATE TRIGGER IF NOT EXISTS memories_fts_insert
                 AFTER INSERT ON memories BEGIN
                     INSERT INTO memories_fts(id, project_name, content)
                     VALUES (new.id, new.project_name, new.content);
                 END;
                 CREATE TRIGGER IF NOT EXISTS memories_fts_update
                 AFTER UPDATE ON memories BEGIN
                     DELETE FROM memories_fts WHERE id = old.id;
                     INSERT INTO memories_fts(id, project_name, content)
                     VALUES (new.id, new.project_name, new.content);
                 END;
                 CREATE TRIGGER IF NOT EXISTS memories_fts_delete
                 AFTER DELETE ON memories BEGIN
                     DELETE FROM memories_fts WHERE id = old.id;
                 END;",
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StratumError::initialization("sqlite", e.to_string()))
    }
}

/// Quote free text as an FTS5 phrase so user input never hits the FTS
/// query parser as syntax.
fn fts_phrase(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StratumError::read("sqlite", format!("bad timestamp {raw:?}: {e}")))
}

fn item_from_raw(raw: RawRow) -> Result<MemoryItem> {
    let (id, project_name, content, category, tags, metadata, created_at, updated_at) = raw;
    let tags: Vec<String> = tags
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();
    let metadata = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();
    Ok(MemoryItem {
        id,
        project_name,
        content,
        category: MemoryCategory::parse(&category),
        tags,
        metadata,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn rows_to_items(rows: Vec<RawRow>) -> Vec<MemoryItem> {
    rows.into_iter()
        .filter_map(|raw| match item_from_raw(raw) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("skipping unreadable row: {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl MemoryStore for SqliteBackend {
    async fn initialize(&self) -> Result<()> {
        {
            let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Ok(());
            }
        }

        if let Some(parent) = self.options.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StratumError::initialization("sqlite", e.to_string()))?;
            }
        }

        let conn = Connection::open(self.options.path.clone())
            .await
            .map_err(|e| StratumError::initialization("sqlite", e.to_string()))?;

        self.create_schema(&conn).await?;

        if self.options.enable_fts {
            match self.create_fts_schema(&conn).await {
                Ok(()) => self.fts_active.store(true, Ordering::Relaxed),
                Err(e) => {
                    debug!("FTS5 unavailable, falling back to LIKE scans: {e}");
                    self.fts_active.store(false, Ordering::Relaxed);
                }
            }
        }

        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        debug!("sqlite backend initialized at {}", self.options.path.display());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let Ok(conn) = self.handle() else {
            return Ok(false);
        };
        let ok = conn
            .call(|conn| -> rusqlite::Result<bool> {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(true)
            })
            .await
            .unwrap_or(false);
        Ok(ok)
    }

    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        let conn = self.handle()?;

        let id = Uuid::new_v4().to_string();
        let item = MemoryItem::new(&id, project_name, draft.content, draft.category)
            .with_tags(draft.tags)
            .with_metadata(draft.metadata);

        let tags_json = serde_json::to_string(&item.tags)?;
        let metadata_json = serde_json::to_string(&item.metadata)?;
        let created = item
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let updated = item
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let row_id = id.clone();
        let project = project_name.to_string();
        let content = item.content.clone();
        let category = item.category.as_str().to_string();

        conn.call(move |conn| -> rusqlite::Result<()> {
            conn.execute(
                "INSERT INTO memories
                     (id, project_name, content, category, tags, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    row_id,
                    project,
                    content,
                    category,
                    tags_json,
                    metadata_json,
                    created,
                    updated
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StratumError::write("sqlite", e.to_string()))?;

        Ok(id)
    }

    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let conn = self.handle()?;
        let query = query.normalized();
        let use_fts = self.fts_enabled() && !query.query.trim().is_empty();

        let project = project_name.to_string();
        let text = query.query.trim().to_string();
        let category = query.category.map(|c| c.as_str().to_string());
        let tags = query.tags.clone().unwrap_or_default();
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);

        let rows: Vec<RawRow> = conn
            .call(move |conn| -> rusqlite::Result<Vec<RawRow>> {
                let mut sql;
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project)];

                if use_fts {
                    sql = format!(
                        "SELECT m.id, m.project_name, m.content, m.category, m.tags, m.metadata,
                                m.created_at, m.updated_at
                         FROM memories m
                         JOIN memories_fts fts ON m.id = fts.id
                         WHERE m.project_name = ?1 AND memories_fts MATCH ?{}",
                        params.len() + 1
                    );
                    params.push(Box::new(fts_phrase(&text)));
                } else {
                    sql = format!(
                        "SELECT {SELECT_COLUMNS} FROM memories WHERE project_name = ?1"
                    );
                    if !text.is_empty() {
                        sql.push_str(&format!(" AND content LIKE ?{}", params.len() + 1));
                        params.push(Box::new(format!("%{text}%")));
                    }
                }

                let col = |name: &str| if use_fts { format!("m.{name}") } else { name.to_string() };

                if let Some(category) = category {
                    sql.push_str(&format!(" AND {} = ?{}", col("category"), params.len() + 1));
                    params.push(Box::new(category));
                }
                for tag in tags {
                    sql.push_str(&format!(" AND {} LIKE ?{}", col("tags"), params.len() + 1));
                    params.push(Box::new(format!("%\"{tag}\"%")));
                }

                if use_fts {
                    sql.push_str(" ORDER BY bm25(memories_fts)");
                } else {
                    sql.push_str(&format!(
                        " ORDER BY {} DESC, rowid DESC",
                        col("created_at")
                    ));
                }
                sql.push_str(&format!(
                    " LIMIT ?{} OFFSET ?{}",
                    params.len() + 1,
                    params.len() + 2
                ));
                params.push(Box::new(limit));
                params.push(Box::new(offset));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_raw)?
                    .collect::<std::result::Result<Vec<RawRow>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| StratumError::read("sqlite", e.to_string()))?;

        let mut items = rows_to_items(rows);
        if !query.include_metadata {
            for item in &mut items {
                item.metadata.clear();
            }
        }
        Ok(items)
    }

    async fn get(&self, project_name: &str, memory_id: &str) -> Result<Option<MemoryItem>> {
        let conn = self.handle()?;
        let project = project_name.to_string();
        let id = memory_id.to_string();

        let raw: Option<RawRow> = conn
            .call(move |conn| -> rusqlite::Result<Option<RawRow>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM memories WHERE project_name = ?1 AND id = ?2"
                ))?;
                let mut rows = stmt
                    .query_map(rusqlite::params![project, id], row_to_raw)?
                    .collect::<std::result::Result<Vec<RawRow>, rusqlite::Error>>()?;
                Ok(rows.pop())
            })
            .await
            .map_err(|e| StratumError::read("sqlite", e.to_string()))?;

        raw.map(item_from_raw).transpose()
    }

    async fn update(
        &self,
        project_name: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<bool> {
        let Some(mut item) = self.get(project_name, memory_id).await? else {
            return Ok(false);
        };
        item.apply(&patch);

        let conn = self.handle()?;
        let tags_json = serde_json::to_string(&item.tags)?;
        let metadata_json = serde_json::to_string(&item.metadata)?;
        let updated = item
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let content = item.content;
        let id = item.id;

        let changed = conn
            .call(move |conn| -> rusqlite::Result<bool> {
                let n = conn.execute(
                    "UPDATE memories
                     SET content = ?1, tags = ?2, metadata = ?3, updated_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![content, tags_json, metadata_json, updated, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(|e| StratumError::write("sqlite", e.to_string()))?;

        Ok(changed)
    }

    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        let conn = self.handle()?;
        let project = project_name.to_string();
        let id = memory_id.to_string();

        let deleted = conn
            .call(move |conn| -> rusqlite::Result<bool> {
                let n = conn.execute(
                    "DELETE FROM memories WHERE project_name = ?1 AND id = ?2",
                    rusqlite::params![project, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(|e| StratumError::write("sqlite", e.to_string()))?;

        Ok(deleted)
    }

    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let conn = self.handle()?;
        let project = project_name.to_string();
        let category = category.map(|c| c.as_str().to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<RawRow> = conn
            .call(move |conn| -> rusqlite::Result<Vec<RawRow>> {
                let rows = match category {
                    Some(category) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {SELECT_COLUMNS} FROM memories
                             WHERE project_name = ?1 AND category = ?2
                             ORDER BY created_at DESC, rowid DESC LIMIT ?3"
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![project, category, limit], row_to_raw)?
                            .collect::<std::result::Result<Vec<RawRow>, rusqlite::Error>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {SELECT_COLUMNS} FROM memories
                             WHERE project_name = ?1
                             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![project, limit], row_to_raw)?
                            .collect::<std::result::Result<Vec<RawRow>, rusqlite::Error>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
            .map_err(|e| StratumError::read("sqlite", e.to_string()))?;

        Ok(rows_to_items(rows))
    }

    async fn stats(&self, project_name: &str) -> Result<MemoryStats> {
        let conn = self.handle()?;
        let project = project_name.to_string();

        let (total, by_category, newest, oldest) = conn
            .call(move |conn| -> rusqlite::Result<(u64, Vec<(String, u64)>, Option<String>, Option<String>)> {
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE project_name = ?1",
                    [&project],
                    |row| row.get::<_, i64>(0),
                )? as u64;

                let mut stmt = conn.prepare(
                    "SELECT category, COUNT(*) FROM memories
                     WHERE project_name = ?1 GROUP BY category",
                )?;
                let by_category = stmt
                    .query_map([&project], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                    })?
                    .collect::<std::result::Result<Vec<(String, u64)>, rusqlite::Error>>()?;

                let (newest, oldest): (Option<String>, Option<String>) = conn.query_row(
                    "SELECT MAX(created_at), MIN(created_at) FROM memories
                     WHERE project_name = ?1",
                    [&project],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                Ok((total, by_category, newest, oldest))
            })
            .await
            .map_err(|e| StratumError::read("sqlite", e.to_string()))?;

        Ok(MemoryStats {
            total,
            by_category: by_category.into_iter().collect(),
            newest: newest.as_deref().map(parse_timestamp).transpose()?,
            oldest: oldest.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let conn = self.handle()?;
        conn.call(|conn| -> rusqlite::Result<Vec<String>> {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT project_name FROM memories ORDER BY project_name",
            )?;
            let projects = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;
            Ok(projects)
        })
        .await
        .map_err(|e| StratumError::read("sqlite", e.to_string()))
    }

    async fn cleanup(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(conn) = conn {
            // Flush the WAL so the database file is self-contained on disk.
            let _ = conn
                .call(|conn| -> rusqlite::Result<()> {
                    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                    Ok(())
                })
                .await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    fn supports_similarity_search(&self) -> bool {
        false
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            similarity_search: false,
            bulk_operations: true,
            transactions: true,
        }
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}
