//! SQLite database layer for clipboard storage
//!
//! Tables: `clip_items` (+ FTS5 index), `excluded_apps`, `pinboards`, `pinboard_items`.
//! Uses r2d2 connection pooling so readers never wait on each other under WAL.
//! Writers open IMMEDIATE transactions, which serializes them on the database lock.

use crate::interface::ContentType;
use crate::models::{decode_file_paths, encode_file_paths, ClipItem};
use chrono::{DateTime, TimeZone, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub fn format_db_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(DB_TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp string from the database
pub fn parse_db_timestamp(timestamp_str: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.f")
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Read a TEXT uuid column
pub(crate) fn get_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Read a TEXT timestamp column
pub(crate) fn get_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

// ─────────────────────────────────────────────────────────────────────────────
// SCHEMA
// ─────────────────────────────────────────────────────────────────────────────

/// Schema migrations, applied in order. `PRAGMA user_version` holds the count applied.
///
/// The FTS index is external-content keyed by `clip_items.rowid`, so the table
/// must never be VACUUMed (that may renumber implicit rowids).
const MIGRATIONS: &[&str] = &[
    // v1: clip history with full-text index
    r#"
    CREATE TABLE IF NOT EXISTS clip_items (
        id TEXT PRIMARY KEY NOT NULL,
        content_type TEXT NOT NULL,
        text_content TEXT,
        rich_content BLOB,
        image_path TEXT,
        file_paths TEXT,
        source_app_id TEXT,
        source_app_name TEXT,
        created_at TEXT NOT NULL,
        is_pinned INTEGER NOT NULL DEFAULT 0,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        hash TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_clip_items_created_at ON clip_items(created_at);
    CREATE INDEX IF NOT EXISTS idx_clip_items_hash ON clip_items(hash);
    CREATE INDEX IF NOT EXISTS idx_clip_items_content_type ON clip_items(content_type);

    CREATE VIRTUAL TABLE IF NOT EXISTS clip_items_fts USING fts5(
        text_content,
        source_app_name,
        content='clip_items',
        content_rowid='rowid'
    );

    CREATE TRIGGER IF NOT EXISTS clip_items_ai AFTER INSERT ON clip_items BEGIN
        INSERT INTO clip_items_fts(rowid, text_content, source_app_name)
        VALUES (new.rowid, new.text_content, new.source_app_name);
    END;

    CREATE TRIGGER IF NOT EXISTS clip_items_ad AFTER DELETE ON clip_items BEGIN
        INSERT INTO clip_items_fts(clip_items_fts, rowid, text_content, source_app_name)
        VALUES ('delete', old.rowid, old.text_content, old.source_app_name);
    END;

    CREATE TRIGGER IF NOT EXISTS clip_items_au AFTER UPDATE OF text_content, source_app_name ON clip_items BEGIN
        INSERT INTO clip_items_fts(clip_items_fts, rowid, text_content, source_app_name)
        VALUES ('delete', old.rowid, old.text_content, old.source_app_name);
        INSERT INTO clip_items_fts(rowid, text_content, source_app_name)
        VALUES (new.rowid, new.text_content, new.source_app_name);
    END;
    "#,
    // v2: excluded apps, seeded with password managers
    r#"
    CREATE TABLE IF NOT EXISTS excluded_apps (
        bundle_id TEXT PRIMARY KEY NOT NULL,
        app_name TEXT NOT NULL
    );

    INSERT OR IGNORE INTO excluded_apps (bundle_id, app_name) VALUES
        ('com.agilebits.onepassword7', '1Password 7'),
        ('com.1password.1password', '1Password'),
        ('com.apple.keychainaccess', 'Keychain Access');
    "#,
    // v3: pinboards
    r#"
    CREATE TABLE IF NOT EXISTS pinboards (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        icon TEXT,
        color TEXT,
        sort_order INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pinboard_items (
        pinboard_id TEXT NOT NULL REFERENCES pinboards(id) ON DELETE CASCADE,
        clip_id TEXT NOT NULL REFERENCES clip_items(id) ON DELETE CASCADE,
        sort_order INTEGER NOT NULL DEFAULT 0,
        added_at TEXT NOT NULL,
        PRIMARY KEY (pinboard_id, clip_id)
    );

    CREATE INDEX IF NOT EXISTS idx_pinboard_items_clip ON pinboard_items(clip_id);
    "#,
    // v4: user-assigned titles
    r#"
    ALTER TABLE clip_items ADD COLUMN custom_title TEXT;
    "#,
];

/// Columns of `clip_items` in the order `row_to_clip_item` reads them
const CLIP_COLUMNS: [&str; 13] = [
    "id",
    "content_type",
    "text_content",
    "rich_content",
    "image_path",
    "file_paths",
    "source_app_id",
    "source_app_name",
    "created_at",
    "is_pinned",
    "is_favorite",
    "hash",
    "custom_title",
];

/// Comma-separated clip columns, optionally qualified with a table alias
pub(crate) fn clip_columns(alias: Option<&str>) -> String {
    CLIP_COLUMNS
        .iter()
        .map(|col| match alias {
            Some(a) => format!("{}.{}", a, col),
            None => (*col).to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a row selected with [`clip_columns`] to a `ClipItem`
pub(crate) fn row_to_clip_item(row: &Row) -> rusqlite::Result<ClipItem> {
    let content_type_str: String = row.get(1)?;
    let content_type = ContentType::from_database_str(&content_type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown content type {:?}", content_type_str).into(),
        )
    })?;
    let file_paths: Option<String> = row.get(5)?;
    let file_paths = file_paths
        .map(|encoded| decode_file_paths(&encoded))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    Ok(ClipItem {
        id: get_uuid(row, 0)?,
        content_type,
        text_content: row.get(2)?,
        rich_content: row.get(3)?,
        image_path: row.get(4)?,
        file_paths,
        source_app_id: row.get(6)?,
        source_app_name: row.get(7)?,
        created_at: get_timestamp(row, 8)?,
        is_pinned: row.get(9)?,
        is_favorite: row.get(10)?,
        hash: row.get(11)?,
        custom_title: row.get(12)?,
    })
}

/// Insert a clip row (caller handles dedup)
pub(crate) fn insert_clip_item(conn: &Connection, item: &ClipItem) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO clip_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        clip_columns(None)
    );
    conn.execute(
        &sql,
        params![
            item.id.to_string(),
            item.content_type.as_str(),
            item.text_content,
            item.rich_content,
            item.image_path,
            item.file_paths.as_deref().map(encode_file_paths),
            item.source_app_id,
            item.source_app_name,
            format_db_timestamp(&item.created_at),
            item.is_pinned,
            item.is_favorite,
            item.hash,
            item.custom_title,
        ],
    )?;
    Ok(())
}

/// Thread-safe database wrapper using connection pooling
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open or create a database at the given path with connection pooling
    pub fn open<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA foreign_keys=ON;
                PRAGMA busy_timeout=5000;
                PRAGMA cache_size=-16000;
            ",
            )?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        info!(path = %path.as_ref().display(), "Opened clip database");
        Ok(db)
    }

    /// Open an in-memory database (tests and throwaway sessions)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA foreign_keys=ON;
            ",
            )?;
            Ok(())
        });

        // In-memory needs single connection to maintain state
        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Get a connection from the pool.
    ///
    /// Never hold one while calling another method that takes a connection:
    /// the in-memory pool has exactly one.
    pub(crate) fn get_conn(&self) -> DatabaseResult<DbConnection> {
        Ok(self.pool.get()?)
    }

    fn setup_schema(&self) -> DatabaseResult<()> {
        let mut conn = self.get_conn()?;
        let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        for (idx, migration) in MIGRATIONS.iter().enumerate().skip(applied.max(0) as usize) {
            let version = (idx + 1) as i64;
            let tx = conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
            info!(version, "Applied schema migration");
        }

        Ok(())
    }

    /// Number of migrations applied to this database
    pub fn schema_version(&self) -> DatabaseResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Get the database size in bytes
    pub fn database_size(&self) -> DatabaseResult<i64> {
        let conn = self.get_conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len() as i64);
        // Re-running is a no-op
        db.setup_schema().unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_excluded_apps_seeded() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM excluded_apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
        let name: String = conn
            .query_row(
                "SELECT app_name FROM excluded_apps WHERE bundle_id = 'com.apple.keychainaccess'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "Keychain Access");
    }

    #[test]
    fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bufr.sqlite");
        {
            let db = Database::open(&path).unwrap();
            let conn = db.get_conn().unwrap();
            insert_clip_item(&conn, &ClipItem::new_text("persisted")).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let conn = db.get_conn().unwrap();
        let text: String = conn
            .query_row("SELECT text_content FROM clip_items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(text, "persisted");
        assert!(db.database_size().unwrap() > 0);
    }

    #[test]
    fn test_clip_item_row_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.get_conn().unwrap();

        let mut item = ClipItem::new(ContentType::File, "hash".to_string());
        item.text_content = Some("a.txt, b.txt".to_string());
        item.file_paths = Some(vec!["/x/a.txt".to_string(), "/x/b.txt".to_string()]);
        item.source_app_name = Some("Finder".to_string());
        item.is_favorite = true;
        item.custom_title = Some("Docs".to_string());
        insert_clip_item(&conn, &item).unwrap();

        let sql = format!("SELECT {} FROM clip_items WHERE id = ?1", clip_columns(None));
        let loaded = conn
            .query_row(&sql, [item.id.to_string()], row_to_clip_item)
            .unwrap();
        assert_eq!(loaded, item);
    }

    #[test]
    fn test_fts_follows_updates_and_deletes() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        let item = ClipItem::new_text("alpha beta");
        insert_clip_item(&conn, &item).unwrap();

        let hits = |term: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM clip_items_fts WHERE clip_items_fts MATCH ?1",
                [term],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(hits("alpha"), 1);

        conn.execute(
            "UPDATE clip_items SET text_content = 'gamma' WHERE id = ?1",
            [item.id.to_string()],
        )
        .unwrap();
        assert_eq!(hits("alpha"), 0);
        assert_eq!(hits("gamma"), 1);

        conn.execute("DELETE FROM clip_items", []).unwrap();
        assert_eq!(hits("gamma"), 0);
    }

    #[test]
    fn test_timestamp_format_roundtrip() {
        let ts = crate::models::timestamp_now();
        let formatted = format_db_timestamp(&ts);
        assert_eq!(formatted.len(), "2024-01-01 00:00:00.000".len());
        assert_eq!(parse_db_timestamp(&formatted).unwrap(), ts);
        assert!(parse_db_timestamp("yesterday").is_err());
    }
}
