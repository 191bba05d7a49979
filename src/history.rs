#![forbid(unsafe_code)]

//! Persistent download history backed by a small SQLite database inside the
//! downloads directory. The index is the source of truth for `/get_history`;
//! directory contents are never scanned.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

/// One completed download, as persisted and as returned by `/get_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub filename: String,
    pub videoid: String,
    pub title: String,
    pub format: String,
    pub size_bytes: i64,
    /// RFC 3339 UTC timestamp of when the download finished.
    pub created_at: String,
}

impl HistoryEntry {
    /// Builds an entry stamped with the current time.
    pub fn now(filename: &str, videoid: &str, title: &str, size_bytes: u64) -> Self {
        Self {
            filename: filename.to_owned(),
            videoid: videoid.to_owned(),
            title: title.to_owned(),
            format: "mp3".to_owned(),
            size_bytes: size_bytes as i64,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `PRAGMA journal_mode` returns a row, which `execute_batch` rejects,
    // so each pragma runs through `query` instead.
    conn.query("PRAGMA journal_mode=WAL", params![]).await?;
    conn.query("PRAGMA synchronous=NORMAL", params![]).await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            filename TEXT PRIMARY KEY,
            videoid TEXT NOT NULL,
            title TEXT NOT NULL,
            format TEXT NOT NULL DEFAULT 'mp3',
            size_bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_videoid ON downloads(videoid);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection holding the history index.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Opens (and if necessary creates) the history DB and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening history DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts one finished download. Re-downloading a file under the same
    /// name replaces its row, so the index never shows duplicates.
    pub async fn record(&self, entry: &HistoryEntry) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO downloads (
                    filename, videoid, title, format, size_bytes, created_at
                ) VALUES (
                    :filename, :videoid, :title, :format, :size_bytes, :created_at
                )
                ON CONFLICT(filename) DO UPDATE SET
                    videoid = excluded.videoid,
                    title = excluded.title,
                    format = excluded.format,
                    size_bytes = excluded.size_bytes,
                    created_at = excluded.created_at
                "#,
                params![
                    entry.filename.as_str(),
                    entry.videoid.as_str(),
                    entry.title.as_str(),
                    entry.format.as_str(),
                    entry.size_bytes,
                    entry.created_at.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Returns every recorded download, newest first.
    pub async fn list(&self) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT filename, videoid, title, format, size_bytes, created_at
                FROM downloads
                ORDER BY created_at DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &Row) -> Result<HistoryEntry> {
    Ok(HistoryEntry {
        filename: row.get(0)?,
        videoid: row.get(1)?,
        title: row.get(2)?,
        format: row.get(3)?,
        size_bytes: row.get(4)?,
        created_at: row.get(5)?,
    })
}
