//! Service wiring
//!
//! [`AppServices`] owns the database, stores and blob directory for one
//! support directory, and carries the user-facing operations that touch more
//! than one of them.

use crate::archive::{export_file_name, ArchiveError, ExportImportService, BULK_EXPORT_FILE_NAME};
use crate::blob_store::BlobStore;
use crate::boards::BoardStore;
use crate::config::{AppPaths, Settings};
use crate::database::Database;
use crate::exclusions::ExclusionManager;
use crate::history::{BlobJanitor, HistoryStore};
use crate::interface::{BufrError, FrontmostApp, Pasteboard, SoundPlayer};
use crate::models::Pinboard;
use crate::monitor::{ClipboardMonitor, IntervalTicks, MonitorConfig, MonitorServices};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What one maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub trimmed: usize,
    pub orphaned_blobs: usize,
}

pub struct AppServices {
    settings_path: Option<PathBuf>,
    export_dir: PathBuf,
    settings: RwLock<Settings>,
    db: Arc<Database>,
    history: Arc<HistoryStore>,
    boards: Arc<BoardStore>,
    blobs: Arc<BlobStore>,
    exclusions: Arc<ExclusionManager>,
    archive: ExportImportService,
    /// Monitors handed out by [`AppServices::monitor`], kept in step with settings
    monitors: parking_lot::Mutex<Vec<Weak<ClipboardMonitor>>>,
}

impl AppServices {
    /// Open with settings read from the support directory
    pub fn load(paths: &AppPaths) -> Result<Self, BufrError> {
        let settings = Settings::load(&paths.settings_path())?;
        Self::open(paths, settings)
    }

    pub fn open(paths: &AppPaths, settings: Settings) -> Result<Self, BufrError> {
        let db = Arc::new(Database::open(paths.database_path())?);
        let mut services = Self::wire(db, paths.blob_root(), paths.export_dir.clone(), settings)?;
        services.settings_path = Some(paths.settings_path());
        info!(support_dir = %paths.support_dir.display(), "Opened Bufr data");
        Ok(services)
    }

    /// In-memory database with blobs and exports under `root`; settings are not persisted
    pub fn in_memory(root: &Path, settings: Settings) -> Result<Self, BufrError> {
        let db = Arc::new(Database::open_in_memory()?);
        Self::wire(db, root, root.join("exports"), settings)
    }

    fn wire(db: Arc<Database>, blob_root: &Path, export_dir: PathBuf, settings: Settings) -> Result<Self, BufrError> {
        let blobs = Arc::new(BlobStore::open(blob_root)?);
        let history = Arc::new(
            HistoryStore::new(db.clone(), Arc::new(BlobJanitor::new(blobs.clone())))
                .with_page_size(settings.history_page_size),
        );
        let boards = Arc::new(BoardStore::new(db.clone()));
        let exclusions = Arc::new(ExclusionManager::new(db.clone())?);
        let archive = ExportImportService::new(history.clone(), boards.clone(), blobs.clone());

        history.refresh()?;
        boards.fetch_pinboards()?;

        Ok(Self {
            settings_path: None,
            export_dir,
            settings: RwLock::new(settings),
            db,
            history,
            boards,
            blobs,
            exclusions,
            archive,
            monitors: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn boards(&self) -> &Arc<BoardStore> {
        &self.boards
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn exclusions(&self) -> &Arc<ExclusionManager> {
        &self.exclusions
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace settings and persist them when backed by a support directory.
    /// Live monitors pick up the new capture options on their next tick.
    pub fn update_settings(&self, settings: Settings) -> Result<(), BufrError> {
        if let Some(path) = &self.settings_path {
            settings.save(path)?;
        }
        let config = MonitorConfig::from(&settings);
        *self.settings.write() = settings;

        let mut monitors = self.monitors.lock();
        monitors.retain(|weak| match weak.upgrade() {
            Some(monitor) => {
                monitor.set_config(config);
                true
            }
            None => false,
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Monitoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Monitor feeding this instance's stores, configured from current settings
    pub fn monitor(
        &self,
        pasteboard: Arc<dyn Pasteboard>,
        frontmost: Arc<dyn FrontmostApp>,
        sound: Arc<dyn SoundPlayer>,
    ) -> Arc<ClipboardMonitor> {
        let services = MonitorServices {
            pasteboard,
            frontmost,
            sound,
            history: self.history.clone(),
            blobs: self.blobs.clone(),
            exclusions: self.exclusions.clone(),
        };
        let monitor = Arc::new(ClipboardMonitor::new(services, MonitorConfig::from(&self.settings())));
        let mut monitors = self.monitors.lock();
        monitors.retain(|weak| weak.strong_count() > 0);
        monitors.push(Arc::downgrade(&monitor));
        monitor
    }

    /// Start `monitor` on the configured poll interval
    pub fn start_monitoring(&self, monitor: &Arc<ClipboardMonitor>) -> Option<JoinHandle<()>> {
        let interval = self.settings().poll_interval();
        monitor.start(Box::new(IntervalTicks::new(interval)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply retention, the history limit and orphan-blob cleanup.
    /// A failing step is logged and the remaining steps still run.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let settings = self.settings();
        let mut report = MaintenanceReport::default();

        if settings.retention_days > 0 {
            match self.history.delete_older_than(settings.retention_days) {
                Ok(removed) => report.expired = removed,
                Err(e) => error!(error = %e, "Retention cleanup failed"),
            }
        }

        if settings.history_limit > 0 {
            match self.history.enforce_history_limit(settings.history_limit) {
                Ok(removed) => report.trimmed = removed,
                Err(e) => error!(error = %e, "History limit enforcement failed"),
            }
        }

        let history = self.history.clone();
        let live = move || {
            history
                .image_filenames()
                .map(|names| names.into_iter().collect::<HashSet<String>>())
        };
        match self.blobs.collect_garbage(live).await {
            Ok(removed) => report.orphaned_blobs = removed,
            Err(e) => error!(error = %e, "Blob cleanup failed"),
        }

        info!(
            expired = report.expired,
            trimmed = report.trimmed,
            orphaned_blobs = report.orphaned_blobs,
            "Maintenance finished"
        );
        report
    }

    /// Delete an item, then its image. Returns `false` if no such item exists.
    pub async fn delete_item(&self, id: Uuid) -> Result<bool, BufrError> {
        let Some(item) = self.history.get(id)? else {
            return Ok(false);
        };
        self.history.delete(id)?;
        if let Some(blob) = item.blob_ref() {
            self.blobs.delete(&blob.filename, blob.id).await;
        }
        Ok(true)
    }

    /// Delete every item and every stored image. Boards survive, emptied.
    pub async fn clear_history(&self) -> Result<(), BufrError> {
        self.history.delete_all()?;
        self.blobs.delete_all().await?;
        info!("Cleared clipboard history");
        Ok(())
    }

    pub fn delete_all_boards(&self) -> Result<(), BufrError> {
        self.boards.delete_all()?;
        info!("Deleted all pinboards");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Export / import
    // ─────────────────────────────────────────────────────────────────────────

    /// Export one board into the export directory. Returns the archive path.
    pub async fn export_pinboard(&self, id: Uuid, cancel: &CancellationToken) -> Result<PathBuf, BufrError> {
        let pinboard = self
            .boards
            .get(id)?
            .ok_or_else(|| BufrError::NotFound(format!("pinboard {}", id)))?;
        let dest = self.export_dir.join(export_file_name(&pinboard));
        self.log_archive_result(
            self.archive.export_pinboard(&pinboard, &dest, cancel).await,
            "Export failed",
        )?;
        Ok(dest)
    }

    /// Export every non-empty board into one archive in the export directory
    pub async fn export_all(&self, cancel: &CancellationToken) -> Result<PathBuf, BufrError> {
        let pinboards = self.boards.fetch_pinboards()?;
        let dest = self.export_dir.join(BULK_EXPORT_FILE_NAME);
        self.log_archive_result(
            self.archive.export_all(&pinboards, &dest, cancel).await,
            "Bulk export failed",
        )?;
        Ok(dest)
    }

    pub async fn import(&self, archive: &Path, cancel: &CancellationToken) -> Result<Vec<Pinboard>, BufrError> {
        let boards = self.log_archive_result(
            self.archive.import(archive, cancel).await,
            "Import failed",
        )?;
        Ok(boards)
    }

    fn log_archive_result<T>(&self, result: Result<T, ArchiveError>, message: &str) -> Result<T, BufrError> {
        result.map_err(|e| {
            match &e {
                ArchiveError::Cancelled => info!("Archive operation cancelled"),
                ArchiveError::NoItemsToExport
                | ArchiveError::InvalidArchive
                | ArchiveError::UnsupportedVersion(_)
                | ArchiveError::JsonDecodingFailed(_) => warn!(error = %e, "{}", message),
                _ => error!(error = %e, "{}", message),
            }
            match e {
                ArchiveError::Cancelled => BufrError::Cancelled,
                other => BufrError::Archive(other),
            }
        })
    }
}
