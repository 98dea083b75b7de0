//! Apps whose copies are never recorded

use crate::database::{Database, DatabaseResult};
use crate::models::ExcludedApp;
use parking_lot::RwLock;
use rusqlite::params;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct ExclusionManager {
    db: Arc<Database>,
    bundle_ids: RwLock<HashSet<String>>,
}

impl ExclusionManager {
    /// Create the manager and load the current list
    pub fn new(db: Arc<Database>) -> DatabaseResult<Self> {
        let manager = Self {
            db,
            bundle_ids: RwLock::new(HashSet::new()),
        };
        manager.load()?;
        Ok(manager)
    }

    /// Reload the cached bundle ids from the database
    pub fn load(&self) -> DatabaseResult<()> {
        let ids: HashSet<String> = self.list()?.into_iter().map(|app| app.bundle_id).collect();
        *self.bundle_ids.write() = ids;
        Ok(())
    }

    pub fn list(&self) -> DatabaseResult<Vec<ExcludedApp>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare("SELECT bundle_id, app_name FROM excluded_apps ORDER BY app_name COLLATE NOCASE")?;
        let apps = stmt
            .query_map([], |row| {
                Ok(ExcludedApp {
                    bundle_id: row.get(0)?,
                    app_name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(apps)
    }

    /// Add or rename an excluded app
    pub fn add(&self, bundle_id: &str, app_name: &str) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute(
                r#"INSERT INTO excluded_apps (bundle_id, app_name) VALUES (?1, ?2)
                   ON CONFLICT(bundle_id) DO UPDATE SET app_name = excluded.app_name"#,
                params![bundle_id, app_name],
            )?;
        }
        self.bundle_ids.write().insert(bundle_id.to_string());
        info!(bundle_id, "Excluded app from clipboard history");
        Ok(())
    }

    pub fn remove(&self, bundle_id: &str) -> DatabaseResult<()> {
        {
            let conn = self.db.get_conn()?;
            conn.execute("DELETE FROM excluded_apps WHERE bundle_id = ?1", [bundle_id])?;
        }
        self.bundle_ids.write().remove(bundle_id);
        Ok(())
    }

    /// Unknown frontmost apps are never excluded
    pub fn is_excluded(&self, bundle_id: Option<&str>) -> bool {
        bundle_id.is_some_and(|id| self.bundle_ids.read().contains(id))
    }
}
