//! Durable record of resolved downloads.

use crate::events::now_ms;
use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title: String,
    pub channel: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub created_at_ms: i64,
    pub title: String,
    pub channel: String,
    pub url: String,
}

/// Append-only sink the executor writes to once per resolved task.
pub trait HistoryStore: Send + Sync {
    fn append(&self, entry: &HistoryEntry) -> Result<()>;
}

/// History kept in the `history` table of `<base>/db/history.sqlite`.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    paths: AppPaths,
}

impl SqliteHistory {
    /// Opens the database once so schema problems surface at start-up.
    pub fn new(paths: AppPaths) -> Result<Self> {
        let conn = open(&paths)?;
        migrate(&conn)?;
        Ok(Self { paths })
    }

    fn connection(&self) -> Result<Connection> {
        let conn = open(&self.paths)?;
        migrate(&conn)?;
        Ok(conn)
    }

    /// Most recent first.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
SELECT id, created_at_ms, title, channel, url
FROM history
ORDER BY created_at_ms DESC, rowid DESC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Case-insensitive substring match on title, channel or URL.
    pub fn search(&self, query: &str) -> Result<Vec<HistoryRecord>> {
        let conn = self.connection()?;
        let pattern = format!("%{}%", escape_like(query.trim()));
        let mut stmt = conn.prepare(
            r#"
SELECT id, created_at_ms, title, channel, url
FROM history
WHERE title LIKE ?1 ESCAPE '\' OR channel LIKE ?1 ESCAPE '\' OR url LIKE ?1 ESCAPE '\'
ORDER BY created_at_ms DESC, rowid DESC
"#,
        )?;
        let rows = stmt
            .query_map(params![pattern], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Returns whether a record was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute("DELETE FROM history WHERE id=?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        let conn = self.connection()?;
        let changed = conn.execute("DELETE FROM history", [])?;
        Ok(changed)
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO history(id, created_at_ms, title, channel, url) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                now_ms(),
                entry.title,
                entry.channel,
                entry.url
            ],
        )?;
        Ok(())
    }
}

/// Process-local history, for embedding without a database.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }
}

fn open(paths: &AppPaths) -> Result<Connection> {
    std::fs::create_dir_all(paths.db_dir())?;

    let conn = Connection::open_with_flags(
        paths.history_db_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
  id TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  title TEXT NOT NULL,
  channel TEXT NOT NULL,
  url TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_created ON history(created_at_ms);
"#,
    )?;

    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        created_at_ms: row.get(1)?,
        title: row.get(2)?,
        channel: row.get(3)?,
        url: row.get(4)?,
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
