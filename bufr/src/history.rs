//! Clipboard history store
//!
//! Owns `clip_items` rows: dedup-by-hash insert, listing, FTS search, edits and
//! eviction. Image files of evicted rows are handed to a [`BlobReclaimer`] after
//! the deleting transaction commits; the store never touches the filesystem.

use crate::blob_store::{BlobRef, BlobStore};
use crate::database::{
    clip_columns, format_db_timestamp, insert_clip_item, row_to_clip_item, Database, DatabaseResult,
};
use crate::interface::ContentType;
use crate::models::{timestamp_now, ClipItem};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Rows kept in the cached listing and returned by a search
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Global fallback Tokio runtime for work spawned outside any runtime context.
/// Shared by every store and never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("bufr-fallback")
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

/// Current runtime if there is one, otherwise the global fallback
pub(crate) fn runtime_handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
}

// ─────────────────────────────────────────────────────────────────────────────
// BLOB RECLAMATION
// ─────────────────────────────────────────────────────────────────────────────

/// Receives image files orphaned by row deletion. Must not block.
pub trait BlobReclaimer: Send + Sync {
    fn reclaim(&self, blobs: Vec<BlobRef>);
}

/// Deletes reclaimed blobs on a background task
pub struct BlobJanitor {
    blobs: Arc<BlobStore>,
}

impl BlobJanitor {
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self { blobs }
    }
}

impl BlobReclaimer for BlobJanitor {
    fn reclaim(&self, refs: Vec<BlobRef>) {
        if refs.is_empty() {
            return;
        }
        let blobs = self.blobs.clone();
        runtime_handle().spawn(async move {
            let count = refs.len();
            futures::future::join_all(refs.iter().map(|r| blobs.delete(&r.filename, r.id))).await;
            debug!(count, "Reclaimed evicted image blobs");
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// STORE
// ─────────────────────────────────────────────────────────────────────────────

/// Build an FTS5 query matching every whitespace-separated token as a prefix.
/// Returns `None` when no token contains a searchable character.
fn fts_prefix_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn blob_refs(items: &[(Uuid, Option<String>)]) -> Vec<BlobRef> {
    items
        .iter()
        .filter_map(|(id, path)| {
            path.as_ref().map(|filename| BlobRef {
                filename: filename.clone(),
                id: *id,
            })
        })
        .collect()
}

/// Persistent, deduplicated clip history with a cached most-recent page
pub struct HistoryStore {
    db: Arc<Database>,
    reclaimer: Arc<dyn BlobReclaimer>,
    items: RwLock<Vec<ClipItem>>,
    page_size: usize,
    revision: AtomicU64,
}

impl HistoryStore {
    pub fn new(db: Arc<Database>, reclaimer: Arc<dyn BlobReclaimer>) -> Self {
        Self {
            db,
            reclaimer,
            items: RwLock::new(Vec::new()),
            page_size: DEFAULT_PAGE_SIZE,
            revision: AtomicU64::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Published state
    // ─────────────────────────────────────────────────────────────────────────

    /// Cached most-recent page, as of the last refresh
    pub fn items(&self) -> Vec<ClipItem> {
        self.items.read().clone()
    }

    /// Bumped on every insert and every time the cached page is replaced
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Reload the cached page from the database
    pub fn refresh(&self) -> DatabaseResult<()> {
        let page = self.fetch(self.page_size)?;
        *self.items.write() = page;
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Most recent items first
    pub fn fetch(&self, limit: usize) -> DatabaseResult<Vec<ClipItem>> {
        let conn = self.db.get_conn()?;
        let sql = format!(
            "SELECT {} FROM clip_items ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            clip_columns(None)
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([limit as i64], row_to_clip_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn fetch_by_type(&self, content_type: ContentType, limit: usize) -> DatabaseResult<Vec<ClipItem>> {
        let conn = self.db.get_conn()?;
        let sql = format!(
            "SELECT {} FROM clip_items WHERE content_type = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            clip_columns(None)
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![content_type.as_str(), limit as i64], row_to_clip_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Full-text search over text and source app name, every token matched as a prefix.
    /// An empty query returns the cached page.
    pub fn search(&self, query: &str) -> DatabaseResult<Vec<ClipItem>> {
        if query.trim().is_empty() {
            return Ok(self.items());
        }
        let Some(pattern) = fts_prefix_query(query) else {
            return Ok(Vec::new());
        };

        let conn = self.db.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM clip_items
               WHERE rowid IN (SELECT rowid FROM clip_items_fts WHERE clip_items_fts MATCH ?1)
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?2"#,
            clip_columns(None)
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![pattern, self.page_size as i64], row_to_clip_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn get(&self, id: Uuid) -> DatabaseResult<Option<ClipItem>> {
        let conn = self.db.get_conn()?;
        let sql = format!("SELECT {} FROM clip_items WHERE id = ?1", clip_columns(None));
        Ok(conn
            .query_row(&sql, [id.to_string()], row_to_clip_item)
            .optional()?)
    }

    pub fn find_by_hash(&self, hash: &str) -> DatabaseResult<Option<ClipItem>> {
        let conn = self.db.get_conn()?;
        let sql = format!("SELECT {} FROM clip_items WHERE hash = ?1 LIMIT 1", clip_columns(None));
        Ok(conn.query_row(&sql, [hash], row_to_clip_item).optional()?)
    }

    pub fn count(&self) -> DatabaseResult<usize> {
        let conn = self.db.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM clip_items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Image filenames referenced by any row
    pub fn image_filenames(&self) -> DatabaseResult<Vec<String>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare("SELECT image_path FROM clip_items WHERE image_path IS NOT NULL")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert with dedup. If a row with the same hash exists its `created_at`
    /// moves to now and that row is returned; nothing else changes.
    pub fn insert(&self, item: ClipItem) -> DatabaseResult<ClipItem> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!("SELECT {} FROM clip_items WHERE hash = ?1 LIMIT 1", clip_columns(None));
        let existing = tx
            .query_row(&sql, [&item.hash], row_to_clip_item)
            .optional()?;

        let stored = match existing {
            Some(mut existing) => {
                existing.created_at = timestamp_now();
                tx.execute(
                    "UPDATE clip_items SET created_at = ?1 WHERE id = ?2",
                    params![format_db_timestamp(&existing.created_at), existing.id.to_string()],
                )?;
                debug!(id = %existing.id, "Duplicate clip, bumped to top");
                existing
            }
            None => {
                insert_clip_item(&tx, &item)?;
                item
            }
        };

        tx.commit()?;
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    pub fn toggle_favorite(&self, id: Uuid) -> DatabaseResult<()> {
        self.execute_and_refresh(
            "UPDATE clip_items SET is_favorite = NOT is_favorite WHERE id = ?1",
            params![id.to_string()],
        )
    }

    pub fn toggle_pinned(&self, id: Uuid) -> DatabaseResult<()> {
        self.execute_and_refresh(
            "UPDATE clip_items SET is_pinned = NOT is_pinned WHERE id = ?1",
            params![id.to_string()],
        )
    }

    /// Replace the text of an item. The dedup hash keeps identifying the original copy.
    pub fn update_text_content(&self, id: Uuid, text: &str) -> DatabaseResult<()> {
        self.execute_and_refresh(
            "UPDATE clip_items SET text_content = ?1 WHERE id = ?2",
            params![text, id.to_string()],
        )
    }

    /// Set or clear (with `None` or an empty string) the custom title
    pub fn update_custom_title(&self, id: Uuid, title: Option<&str>) -> DatabaseResult<()> {
        let title = title.filter(|t| !t.is_empty());
        self.execute_and_refresh(
            "UPDATE clip_items SET custom_title = ?1 WHERE id = ?2",
            params![title, id.to_string()],
        )
    }

    /// Remove the row only; the caller owns blob cleanup
    pub fn delete(&self, id: Uuid) -> DatabaseResult<()> {
        self.execute_and_refresh("DELETE FROM clip_items WHERE id = ?1", params![id.to_string()])
    }

    /// Remove every row; the caller owns blob cleanup
    pub fn delete_all(&self) -> DatabaseResult<()> {
        self.execute_and_refresh("DELETE FROM clip_items", [])
    }

    fn execute_and_refresh<P: rusqlite::Params>(&self, sql: &str, params: P) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute(sql, params)?;
        }
        self.refresh()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Eviction
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete non-pinned items created more than `days` days ago.
    /// Returns the number of rows removed.
    pub fn delete_older_than(&self, days: u32) -> DatabaseResult<usize> {
        let cutoff = format_db_timestamp(&(timestamp_now() - chrono::Duration::days(days as i64)));

        let victims = {
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let victims = {
                let mut stmt = tx.prepare(
                    "SELECT id, image_path FROM clip_items WHERE is_pinned = 0 AND created_at < ?1",
                )?;
                let rows = stmt
                    .query_map([&cutoff], |row| {
                        Ok((crate::database::get_uuid(row, 0)?, row.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute(
                "DELETE FROM clip_items WHERE is_pinned = 0 AND created_at < ?1",
                [&cutoff],
            )?;
            tx.commit()?;
            victims
        };

        self.finish_eviction(&victims, "retention")
    }

    /// Trim history to `limit` rows by deleting the oldest non-pinned items.
    /// Pinned items are never removed, so the count may stay above the limit.
    pub fn enforce_history_limit(&self, limit: usize) -> DatabaseResult<usize> {
        let victims = {
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM clip_items", [], |row| row.get(0))?;
            let excess = (count as usize).saturating_sub(limit);
            if excess == 0 {
                return Ok(0);
            }
            let victims = {
                let mut stmt = tx.prepare(
                    r#"SELECT id, image_path FROM clip_items
                       WHERE is_pinned = 0
                       ORDER BY created_at ASC, rowid ASC
                       LIMIT ?1"#,
                )?;
                let rows = stmt
                    .query_map([excess as i64], |row| {
                        Ok((crate::database::get_uuid(row, 0)?, row.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            {
                let mut delete = tx.prepare("DELETE FROM clip_items WHERE id = ?1")?;
                for (id, _) in &victims {
                    delete.execute([id.to_string()])?;
                }
            }
            tx.commit()?;
            victims
        };

        self.finish_eviction(&victims, "history limit")
    }

    fn finish_eviction(&self, victims: &[(Uuid, Option<String>)], reason: &str) -> DatabaseResult<usize> {
        if victims.is_empty() {
            return Ok(0);
        }
        self.reclaimer.reclaim(blob_refs(victims));
        info!(removed = victims.len(), reason, "Evicted clip items");
        self.refresh()?;
        Ok(victims.len())
    }
}
