//! Bufr Core - clipboard history capture and storage
//!
//! This library implements the capture pipeline and persistence layer of the
//! Bufr clipboard manager: pasteboard polling, content classification,
//! hash-based deduplication, SQLite (FTS5) history, image blobs, pinboards and
//! the `.bufr` export/import format.
//!
//! Platform access (pasteboard, frontmost app, sounds) sits behind the traits in
//! [`interface`] so the pipeline runs the same against fakes in tests.

pub mod app;
pub mod archive;
pub mod blob_store;
pub mod boards;
pub mod config;
pub mod content_detection;
pub mod database;
pub mod exclusions;
pub mod hashing;
pub mod history;
pub mod interface;
pub mod logging;
pub mod models;
pub mod monitor;

pub use interface::*;
pub use app::{AppServices, MaintenanceReport};
pub use archive::{ArchiveError, ExportImportService};
pub use blob_store::BlobStore;
pub use boards::BoardStore;
pub use config::{AppPaths, CopySound, Settings};
pub use content_detection::{MemorySnapshot, PasteboardSnapshot};
pub use history::HistoryStore;
pub use models::{ClipItem, ExcludedApp, Pinboard, PinboardItem};
pub use monitor::{ClipboardMonitor, MonitorState, TickOutcome};
