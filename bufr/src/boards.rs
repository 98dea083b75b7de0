//! Pinboard store
//!
//! Owns `pinboards` and `pinboard_items`. Clip rows are only ever read here;
//! deleting a board removes its memberships and nothing else.

use crate::database::{
    clip_columns, format_db_timestamp, get_timestamp, get_uuid, row_to_clip_item, Database,
    DatabaseResult,
};
use crate::models::{suggest_pinboard_color, timestamp_now, ClipItem, Pinboard, PinboardItem};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Row, TransactionBehavior};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const PINBOARD_COLUMNS: &str = "id, name, icon, color, sort_order, created_at";

fn row_to_pinboard(row: &Row) -> rusqlite::Result<Pinboard> {
    Ok(Pinboard {
        id: get_uuid(row, 0)?,
        name: row.get(1)?,
        icon: row.get(2)?,
        color: row.get(3)?,
        sort_order: row.get(4)?,
        created_at: get_timestamp(row, 5)?,
    })
}

pub struct BoardStore {
    db: Arc<Database>,
    pinboards: RwLock<Vec<Pinboard>>,
    assignment_version: AtomicU64,
}

impl BoardStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pinboards: RwLock::new(Vec::new()),
            assignment_version: AtomicU64::new(0),
        }
    }

    /// Cached board list, as of the last fetch
    pub fn pinboards(&self) -> Vec<Pinboard> {
        self.pinboards.read().clone()
    }

    /// Bumped on every membership mutation, including no-op adds
    pub fn assignment_version(&self) -> u64 {
        self.assignment_version.load(Ordering::SeqCst)
    }

    fn bump_assignment_version(&self) {
        self.assignment_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Load boards ordered by `sort_order` ascending, newest first on ties,
    /// and replace the cached list
    pub fn fetch_pinboards(&self) -> DatabaseResult<Vec<Pinboard>> {
        let boards = {
            let conn = self.db.get_conn()?;
            let sql = format!(
                "SELECT {} FROM pinboards ORDER BY sort_order ASC, created_at DESC",
                PINBOARD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let boards = stmt
                .query_map([], row_to_pinboard)?
                .collect::<Result<Vec<_>, _>>()?;
            boards
        };
        *self.pinboards.write() = boards.clone();
        Ok(boards)
    }

    pub fn get(&self, id: Uuid) -> DatabaseResult<Option<Pinboard>> {
        use rusqlite::OptionalExtension;
        let conn = self.db.get_conn()?;
        let sql = format!("SELECT {} FROM pinboards WHERE id = ?1", PINBOARD_COLUMNS);
        Ok(conn.query_row(&sql, [id.to_string()], row_to_pinboard).optional()?)
    }

    /// Create a board after every existing one
    pub fn create(&self, name: &str, icon: Option<String>, color: Option<String>) -> DatabaseResult<Pinboard> {
        let mut pinboard = Pinboard::new(name, icon, color);
        {
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let max_order: i64 =
                tx.query_row("SELECT COALESCE(MAX(sort_order), 0) FROM pinboards", [], |row| row.get(0))?;
            pinboard.sort_order = max_order + 1;
            tx.execute(
                &format!("INSERT INTO pinboards ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", PINBOARD_COLUMNS),
                params![
                    pinboard.id.to_string(),
                    pinboard.name,
                    pinboard.icon,
                    pinboard.color,
                    pinboard.sort_order,
                    format_db_timestamp(&pinboard.created_at),
                ],
            )?;
            tx.commit()?;
        }
        debug!(id = %pinboard.id, name = %pinboard.name, "Created pinboard");
        self.fetch_pinboards()?;
        Ok(pinboard)
    }

    /// Persist name, icon, color and sort order of an existing board
    pub fn update(&self, pinboard: &Pinboard) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute(
                "UPDATE pinboards SET name = ?1, icon = ?2, color = ?3, sort_order = ?4 WHERE id = ?5",
                params![
                    pinboard.name,
                    pinboard.icon,
                    pinboard.color,
                    pinboard.sort_order,
                    pinboard.id.to_string(),
                ],
            )?;
        }
        self.fetch_pinboards()?;
        Ok(())
    }

    /// Delete a board and its memberships. Clip items stay.
    pub fn delete(&self, id: Uuid) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute("DELETE FROM pinboards WHERE id = ?1", [id.to_string()])?;
        }
        self.bump_assignment_version();
        self.fetch_pinboards()?;
        Ok(())
    }

    pub fn delete_all(&self) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute("DELETE FROM pinboards", [])?;
        }
        self.bump_assignment_version();
        self.fetch_pinboards()?;
        Ok(())
    }

    /// Palette color not yet used by another board
    pub fn suggest_color(&self) -> &'static str {
        suggest_pinboard_color(&self.pinboards.read())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memberships
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a clip to a board. No-op if it is already there.
    pub fn add_clip(&self, clip_id: Uuid, pinboard_id: Uuid) -> DatabaseResult<()> {
        {
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM pinboard_items WHERE pinboard_id = ?1 AND clip_id = ?2)",
                params![pinboard_id.to_string(), clip_id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                let max_order: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(sort_order), 0) FROM pinboard_items WHERE pinboard_id = ?1",
                    [pinboard_id.to_string()],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO pinboard_items (pinboard_id, clip_id, sort_order, added_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        pinboard_id.to_string(),
                        clip_id.to_string(),
                        max_order + 1,
                        format_db_timestamp(&timestamp_now()),
                    ],
                )?;
            }
            tx.commit()?;
        }
        self.bump_assignment_version();
        Ok(())
    }

    /// Insert a membership with explicit ordering (used by import).
    /// Existing pairs are left untouched.
    pub fn insert_membership(
        &self,
        pinboard_id: Uuid,
        clip_id: Uuid,
        sort_order: i64,
        added_at: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute(
                "INSERT OR IGNORE INTO pinboard_items (pinboard_id, clip_id, sort_order, added_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    pinboard_id.to_string(),
                    clip_id.to_string(),
                    sort_order,
                    format_db_timestamp(&added_at),
                ],
            )?;
        }
        self.bump_assignment_version();
        Ok(())
    }

    pub fn remove_clip(&self, clip_id: Uuid, pinboard_id: Uuid) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute(
                "DELETE FROM pinboard_items WHERE pinboard_id = ?1 AND clip_id = ?2",
                params![pinboard_id.to_string(), clip_id.to_string()],
            )?;
        }
        self.bump_assignment_version();
        Ok(())
    }

    /// Clip items of a board in board order
    pub fn fetch_clips(&self, pinboard_id: Uuid) -> DatabaseResult<Vec<ClipItem>> {
        let conn = self.db.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM clip_items c
               JOIN pinboard_items p ON p.clip_id = c.id
               WHERE p.pinboard_id = ?1
               ORDER BY p.sort_order ASC, p.added_at DESC"#,
            clip_columns(Some("c"))
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([pinboard_id.to_string()], row_to_clip_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Raw membership rows of a board, in board order
    pub fn memberships(&self, pinboard_id: Uuid) -> DatabaseResult<Vec<PinboardItem>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT pinboard_id, clip_id, sort_order, added_at FROM pinboard_items
               WHERE pinboard_id = ?1
               ORDER BY sort_order ASC, added_at DESC"#,
        )?;
        let rows = stmt
            .query_map([pinboard_id.to_string()], |row| {
                Ok(PinboardItem {
                    pinboard_id: get_uuid(row, 0)?,
                    clip_id: get_uuid(row, 1)?,
                    sort_order: row.get(2)?,
                    added_at: get_timestamp(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ids of every board holding the clip
    pub fn pinboards_containing(&self, clip_id: Uuid) -> DatabaseResult<HashSet<Uuid>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare("SELECT pinboard_id FROM pinboard_items WHERE clip_id = ?1")?;
        let ids = stmt
            .query_map([clip_id.to_string()], |row| get_uuid(row, 0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}
