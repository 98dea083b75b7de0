//! Pinboard export and import
//!
//! A `.bufr` archive is a ZIP file holding one manifest at the root plus the
//! referenced image files:
//!
//! ```text
//! pinboard.json     single board
//! pinboards.json    one or more boards
//! images/{filename}
//! ```
//!
//! Dates are ISO-8601 in whole seconds (`2024-05-01T10:00:00Z`). Import sniffs
//! the container, so bzip2-compressed tar archives from earlier builds still
//! open.
//!
//! Import merges by content hash: items the store already has are referenced,
//! never duplicated. Every import creates new boards.

use crate::blob_store::{is_valid_filename, BlobError, BlobStore};
use crate::boards::BoardStore;
use crate::database::DatabaseError;
use crate::history::HistoryStore;
use crate::interface::ContentType;
use crate::models::{decode_file_paths, encode_file_paths, ClipItem, Pinboard, PinboardItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Newest manifest version this build reads and the one it writes
pub const CURRENT_VERSION: i64 = 1;

pub const ARCHIVE_EXTENSION: &str = "bufr";
pub const BULK_EXPORT_FILE_NAME: &str = "bufr_boards.bufr";

const SINGLE_MANIFEST: &str = "pinboard.json";
const BULK_MANIFEST: &str = "pinboards.json";
const IMAGES_DIR: &str = "images";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("The board is empty, nothing to export")]
    NoItemsToExport,
    #[error("Failed to create archive: {0}")]
    ArchiveCreationFailed(String),
    #[error("Failed to extract archive: {0}")]
    ArchiveExtractionFailed(String),
    #[error("Not a valid .bufr archive")]
    InvalidArchive,
    #[error("Unsupported archive format version: {0}")]
    UnsupportedVersion(i64),
    #[error("Failed to read archive data: {0}")]
    JsonDecodingFailed(#[source] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Blob storage error: {0}")]
    Blob(#[from] BlobError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cancelled")]
    Cancelled,
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

fn creation_failed(e: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::ArchiveCreationFailed(e.to_string())
}

fn extraction_failed(e: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::ArchiveExtractionFailed(e.to_string())
}

fn checkpoint(cancel: &CancellationToken) -> ArchiveResult<()> {
    if cancel.is_cancelled() {
        Err(ArchiveError::Cancelled)
    } else {
        Ok(())
    }
}

/// Archive file name for a single board; path separators become `_`
pub fn export_file_name(pinboard: &Pinboard) -> String {
    let name: String = pinboard
        .name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    let name = name.trim();
    let name = if name.is_empty() || name.chars().all(|c| c == '.') {
        "pinboard"
    } else {
        name
    };
    format!("{}.{}", name, ARCHIVE_EXTENSION)
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANIFEST FORMAT
// ═══════════════════════════════════════════════════════════════════════════════

/// Whole-second UTC timestamps; fractional seconds are dropped on write
mod iso8601_secs {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

fn current_version() -> i64 {
    CURRENT_VERSION
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Clip item as written to a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedClip {
    pub id: Uuid,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub rich_content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// JSON-encoded list of paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app_name: Option<String>,
    #[serde(serialize_with = "iso8601_secs::serialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_favorite: bool,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
}

impl From<&ClipItem> for ExportedClip {
    fn from(item: &ClipItem) -> Self {
        Self {
            id: item.id,
            content_type: item.content_type,
            text_content: item.text_content.clone(),
            rich_content: item.rich_content.clone(),
            image_path: item.image_path.clone(),
            file_paths: item.file_paths.as_deref().map(encode_file_paths),
            source_app_id: item.source_app_id.clone(),
            source_app_name: item.source_app_name.clone(),
            created_at: item.created_at,
            is_pinned: item.is_pinned,
            is_favorite: item.is_favorite,
            hash: item.hash.clone(),
            custom_title: item.custom_title.clone(),
        }
    }
}

impl ExportedClip {
    /// Row for this record. `image_path` is left empty; the importer fills it
    /// once the image is stored.
    fn into_clip_item(self) -> ArchiveResult<ClipItem> {
        let file_paths = self
            .file_paths
            .as_deref()
            .map(decode_file_paths)
            .transpose()
            .map_err(ArchiveError::JsonDecodingFailed)?;
        Ok(ClipItem {
            id: self.id,
            content_type: self.content_type,
            text_content: self.text_content,
            rich_content: self.rich_content,
            image_path: None,
            file_paths,
            source_app_id: self.source_app_id,
            source_app_name: self.source_app_name,
            created_at: self.created_at,
            is_pinned: self.is_pinned,
            is_favorite: self.is_favorite,
            hash: self.hash,
            custom_title: self.custom_title,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPinboard {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(serialize_with = "iso8601_secs::serialize")]
    pub created_at: DateTime<Utc>,
}

impl From<&Pinboard> for ExportedPinboard {
    fn from(pinboard: &Pinboard) -> Self {
        Self {
            id: pinboard.id,
            name: pinboard.name.clone(),
            icon: pinboard.icon.clone(),
            color: pinboard.color.clone(),
            sort_order: pinboard.sort_order,
            created_at: pinboard.created_at,
        }
    }
}

/// Board membership plus the item it points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedClipItem {
    pub clip_item: ExportedClip,
    pub sort_order: i64,
    #[serde(serialize_with = "iso8601_secs::serialize")]
    pub added_at: DateTime<Utc>,
}

/// A board and its items, as nested in a bulk manifest.
///
/// Each entry repeats `version` and `export_date` so it reads as a complete
/// single-board document; older bulk manifests without them still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardExport {
    #[serde(default = "current_version")]
    pub version: i64,
    #[serde(default = "chrono::Utc::now", serialize_with = "iso8601_secs::serialize")]
    pub export_date: DateTime<Utc>,
    pub pinboard: ExportedPinboard,
    pub items: Vec<ExportedClipItem>,
}

/// `pinboard.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinboardExport {
    pub version: i64,
    #[serde(serialize_with = "iso8601_secs::serialize")]
    pub export_date: DateTime<Utc>,
    pub pinboard: ExportedPinboard,
    pub items: Vec<ExportedClipItem>,
}

/// `pinboards.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkPinboardExport {
    pub version: i64,
    #[serde(serialize_with = "iso8601_secs::serialize")]
    pub export_date: DateTime<Utc>,
    pub pinboards: Vec<BoardExport>,
}

/// Read before the full document so a newer format is reported as such
/// rather than as a decode failure
#[derive(Deserialize)]
struct VersionProbe {
    version: i64,
}

fn check_version(json: &[u8]) -> ArchiveResult<()> {
    let probe: VersionProbe = serde_json::from_slice(json).map_err(ArchiveError::JsonDecodingFailed)?;
    if probe.version > CURRENT_VERSION {
        return Err(ArchiveError::UnsupportedVersion(probe.version));
    }
    Ok(())
}

/// Parse whichever manifest the staging directory holds. The bulk manifest wins.
fn read_manifest(staging: &Path) -> ArchiveResult<Vec<BoardExport>> {
    let bulk_path = staging.join(BULK_MANIFEST);
    let single_path = staging.join(SINGLE_MANIFEST);

    if bulk_path.is_file() {
        let json = fs::read(&bulk_path)?;
        check_version(&json)?;
        let bulk: BulkPinboardExport =
            serde_json::from_slice(&json).map_err(ArchiveError::JsonDecodingFailed)?;
        Ok(bulk.pinboards)
    } else if single_path.is_file() {
        let json = fs::read(&single_path)?;
        check_version(&json)?;
        let single: PinboardExport =
            serde_json::from_slice(&json).map_err(ArchiveError::JsonDecodingFailed)?;
        Ok(vec![BoardExport {
            version: single.version,
            export_date: single.export_date,
            pinboard: single.pinboard,
            items: single.items,
        }])
    } else {
        Err(ArchiveError::InvalidArchive)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTAINER
// ═══════════════════════════════════════════════════════════════════════════════

fn entry_options() -> zip::write::SimpleFileOptions {
    zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644)
}

/// ZIP the manifest and `images/` of `staging` into `dest`
fn pack(staging: &Path, manifest: &str, dest: &Path, cancel: &CancellationToken) -> ArchiveResult<()> {
    let file = File::create(dest).map_err(creation_failed)?;
    let mut zip = zip::ZipWriter::new(file);

    zip.start_file(manifest, entry_options()).map_err(creation_failed)?;
    zip.write_all(&fs::read(staging.join(manifest))?)
        .map_err(creation_failed)?;

    let images_dir = staging.join(IMAGES_DIR);
    for entry in fs::read_dir(&images_dir).map_err(creation_failed)? {
        checkpoint(cancel)?;
        let entry = entry.map_err(creation_failed)?;
        let name = format!("{}/{}", IMAGES_DIR, entry.file_name().to_string_lossy());
        zip.start_file(name, entry_options()).map_err(creation_failed)?;
        zip.write_all(&fs::read(entry.path())?).map_err(creation_failed)?;
    }

    zip.finish().map_err(creation_failed)?;
    Ok(())
}

/// Entry path made relative to the staging root, `None` if it would escape it
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Zip,
    TarBzip2,
}

/// Identify the container from its leading bytes
fn sniff_container(magic: &[u8]) -> Option<Container> {
    if magic.starts_with(b"PK\x03\x04") || magic.starts_with(b"PK\x05\x06") {
        Some(Container::Zip)
    } else if magic.starts_with(b"BZh") {
        Some(Container::TarBzip2)
    } else {
        None
    }
}

/// Write one extracted entry below `staging`
fn extract_entry(staging: &Path, path: &Path, content: &[u8]) -> ArchiveResult<()> {
    let Some(relative) = sanitize_entry_path(path) else {
        warn!(path = %path.display(), "Skipping archive entry outside the archive root");
        return Ok(());
    };
    let dest = staging.join(&relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&dest, content)?;
    debug!(path = %relative.display(), "Extracted archive entry");
    Ok(())
}

fn unpack(archive_path: &Path, staging: &Path) -> ArchiveResult<()> {
    let mut file = File::open(archive_path).map_err(extraction_failed)?;
    let mut magic = Vec::with_capacity(4);
    (&mut file).take(4).read_to_end(&mut magic).map_err(extraction_failed)?;
    file.rewind().map_err(extraction_failed)?;

    match sniff_container(&magic) {
        Some(Container::Zip) => unpack_zip(file, staging),
        Some(Container::TarBzip2) => unpack_tar_bz2(file, staging),
        None => Err(ArchiveError::ArchiveExtractionFailed(
            "unrecognized archive format".to_string(),
        )),
    }
}

fn unpack_zip(file: File, staging: &Path) -> ArchiveResult<()> {
    let mut archive = zip::ZipArchive::new(file).map_err(extraction_failed)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(extraction_failed)?;
        let name = entry.name().to_string();
        // Resource forks sequestered by macOS archivers
        if entry.is_dir() || name.starts_with("__MACOSX/") {
            continue;
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(extraction_failed)?;
        extract_entry(staging, Path::new(&name), &content)?;
    }
    Ok(())
}

fn unpack_tar_bz2(file: File, staging: &Path) -> ArchiveResult<()> {
    let decoder = bzip2::read::BzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries().map_err(extraction_failed)? {
        let mut entry = entry.map_err(extraction_failed)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(extraction_failed)?.into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(extraction_failed)?;
        extract_entry(staging, &path, &content)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ExportImportService {
    history: Arc<HistoryStore>,
    boards: Arc<BoardStore>,
    blobs: Arc<BlobStore>,
}

impl ExportImportService {
    pub fn new(history: Arc<HistoryStore>, boards: Arc<BoardStore>, blobs: Arc<BlobStore>) -> Self {
        Self { history, boards, blobs }
    }

    /// Board items in board order, joined with their membership rows
    fn board_export(&self, pinboard: &Pinboard) -> ArchiveResult<(BoardExport, Vec<ClipItem>)> {
        let memberships = self.boards.memberships(pinboard.id)?;
        let clips = self.boards.fetch_clips(pinboard.id)?;

        let by_clip: HashMap<Uuid, &PinboardItem> =
            memberships.iter().map(|m| (m.clip_id, m)).collect();
        let items = clips
            .iter()
            .filter_map(|clip| {
                by_clip.get(&clip.id).map(|membership| ExportedClipItem {
                    clip_item: ExportedClip::from(clip),
                    sort_order: membership.sort_order,
                    added_at: membership.added_at,
                })
            })
            .collect();

        Ok((
            BoardExport {
                version: CURRENT_VERSION,
                export_date: Utc::now(),
                pinboard: ExportedPinboard::from(pinboard),
                items,
            },
            clips,
        ))
    }

    /// Copy referenced images into the staging `images/` directory.
    /// A file already staged under the same name is kept.
    async fn stage_images(&self, clips: &[ClipItem], images_dir: &Path, cancel: &CancellationToken) -> ArchiveResult<()> {
        for clip in clips {
            let Some(filename) = clip.image_path.as_deref() else {
                continue;
            };
            checkpoint(cancel)?;
            if !is_valid_filename(filename) {
                warn!(id = %clip.id, "Skipping image with invalid filename");
                continue;
            }
            let dest = images_dir.join(filename);
            if dest.exists() {
                continue;
            }
            match self.blobs.load(filename).await {
                Some(bytes) => tokio::fs::write(&dest, bytes).await?,
                None => warn!(id = %clip.id, "Image missing from blob store, exporting without it"),
            }
        }
        Ok(())
    }

    /// Write the staged manifest, then archive the staging directory to `dest`.
    /// `dest` is removed if anything fails or the export is cancelled.
    async fn finish_export<T: Serialize>(
        &self,
        staging: &Path,
        manifest_name: &'static str,
        manifest: &T,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let json = serde_json::to_vec_pretty(manifest).map_err(creation_failed)?;
        tokio::fs::write(staging.join(manifest_name), json).await?;
        checkpoint(cancel)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = staging.to_path_buf();
        let dest_path = dest.to_path_buf();
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || pack(&staging, manifest_name, &dest_path, &token))
            .await
            .map_err(creation_failed)
            .and_then(|r| r)
            .and_then(|()| checkpoint(cancel));

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest.display(), error = %e, "Failed to remove partial archive");
                }
            }
        }
        result
    }

    fn staging_dir(prefix: &str) -> ArchiveResult<tempfile::TempDir> {
        let staging = tempfile::Builder::new().prefix(prefix).tempdir()?;
        fs::create_dir_all(staging.path().join(IMAGES_DIR))?;
        Ok(staging)
    }

    /// Export one board to `dest`
    pub async fn export_pinboard(
        &self,
        pinboard: &Pinboard,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let (board, clips) = self.board_export(pinboard)?;
        if board.items.is_empty() {
            return Err(ArchiveError::NoItemsToExport);
        }

        let staging = Self::staging_dir("bufr_export_")?;
        self.stage_images(&clips, &staging.path().join(IMAGES_DIR), cancel)
            .await?;

        let item_count = board.items.len();
        let manifest = PinboardExport {
            version: CURRENT_VERSION,
            export_date: board.export_date,
            pinboard: board.pinboard,
            items: board.items,
        };
        self.finish_export(staging.path(), SINGLE_MANIFEST, &manifest, dest, cancel)
            .await?;

        info!(name = %pinboard.name, items = item_count, "Exported pinboard");
        Ok(())
    }

    /// Export every non-empty board in `pinboards` to one archive.
    /// Returns the number of boards written.
    pub async fn export_all(
        &self,
        pinboards: &[Pinboard],
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<usize> {
        let staging = Self::staging_dir("bufr_export_all_")?;
        let images_dir = staging.path().join(IMAGES_DIR);

        let mut exported = Vec::new();
        for pinboard in pinboards {
            checkpoint(cancel)?;
            let (board, clips) = self.board_export(pinboard)?;
            if board.items.is_empty() {
                debug!(name = %pinboard.name, "Skipping empty pinboard");
                continue;
            }
            self.stage_images(&clips, &images_dir, cancel).await?;
            exported.push(board);
        }

        if exported.is_empty() {
            return Err(ArchiveError::NoItemsToExport);
        }

        let count = exported.len();
        let manifest = BulkPinboardExport {
            version: CURRENT_VERSION,
            export_date: Utc::now(),
            pinboards: exported,
        };
        self.finish_export(staging.path(), BULK_MANIFEST, &manifest, dest, cancel)
            .await?;

        info!(boards = count, "Exported pinboards");
        Ok(count)
    }

    /// Import every board in the archive. Each becomes a new board; items
    /// already in history (by hash) are shared rather than copied.
    ///
    /// Boards and items are written one at a time, so a failure partway leaves
    /// whatever was imported before it.
    pub async fn import(&self, archive: &Path, cancel: &CancellationToken) -> ArchiveResult<Vec<Pinboard>> {
        let staging = tempfile::Builder::new().prefix("bufr_import_").tempdir()?;

        let archive_path = archive.to_path_buf();
        let staging_path = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&archive_path, &staging_path))
            .await
            .map_err(extraction_failed)??;
        checkpoint(cancel)?;

        let boards = read_manifest(staging.path())?;
        let images_dir = staging.path().join(IMAGES_DIR);

        let mut imported = Vec::with_capacity(boards.len());
        let result = async {
            for board in boards {
                checkpoint(cancel)?;
                imported.push(self.import_board(board, &images_dir, cancel).await?);
            }
            Ok::<(), ArchiveError>(())
        }
        .await;

        self.boards.fetch_pinboards()?;
        self.history.refresh()?;
        result?;

        info!(boards = imported.len(), "Imported pinboards");
        Ok(imported)
    }

    async fn import_board(
        &self,
        board: BoardExport,
        images_dir: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Pinboard> {
        let source = board.pinboard;
        let pinboard = self.boards.create(&source.name, source.icon, source.color)?;

        for exported in board.items {
            checkpoint(cancel)?;
            let clip_id = self.import_clip(exported.clip_item, images_dir).await?;
            self.boards
                .insert_membership(pinboard.id, clip_id, exported.sort_order, exported.added_at)?;
        }

        debug!(id = %pinboard.id, name = %pinboard.name, "Imported pinboard");
        Ok(pinboard)
    }

    /// Id of the row holding this item, inserting it if the hash is new
    async fn import_clip(&self, exported: ExportedClip, images_dir: &Path) -> ArchiveResult<Uuid> {
        if let Some(existing) = self.history.find_by_hash(&exported.hash)? {
            return Ok(existing.id);
        }

        let staged_image = exported
            .image_path
            .as_deref()
            .filter(|name| is_valid_filename(name))
            .map(|name| images_dir.join(name))
            .filter(|path| path.is_file());

        let mut item = exported.into_clip_item()?;
        // Never reuse the archived id: it may collide with a blob already on disk
        item.id = Uuid::new_v4();

        let Some(image_path) = staged_image else {
            return Ok(self.history.insert(item)?.id);
        };

        let bytes = tokio::fs::read(&image_path).await?;
        let filename = self.blobs.save(bytes, item.id).await?;
        item.image_path = Some(filename.clone());
        let id = item.id;

        match self.history.insert(item) {
            Ok(stored) => {
                if stored.id == id {
                    self.blobs.commit(&filename);
                } else {
                    self.blobs.delete(&filename, id).await;
                }
                Ok(stored.id)
            }
            Err(e) => {
                self.blobs.delete(&filename, id).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::history::BlobJanitor;
    use std::io::Write;

    struct Fixture {
        dir: tempfile::TempDir,
        history: Arc<HistoryStore>,
        boards: Arc<BoardStore>,
        service: ExportImportService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let blobs = Arc::new(BlobStore::open(dir.path().join("blobs")).unwrap());
        let history = Arc::new(HistoryStore::new(
            db.clone(),
            Arc::new(BlobJanitor::new(blobs.clone())),
        ));
        let boards = Arc::new(BoardStore::new(db));
        let service = ExportImportService::new(history.clone(), boards.clone(), blobs);
        Fixture {
            dir,
            history,
            boards,
            service,
        }
    }

    /// Hand-build an archive holding a single manifest
    fn write_archive(path: &Path, manifest_name: &str, json: &str) {
        let file = File::create(path).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, manifest_name, json.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_export_file_name() {
        let mut board = Pinboard::new("Work/Notes: Q3", None, None);
        assert_eq!(export_file_name(&board), "Work_Notes_ Q3.bufr");
        board.name = "  ".to_string();
        assert_eq!(export_file_name(&board), "pinboard.bufr");
        board.name = "..".to_string();
        assert_eq!(export_file_name(&board), "pinboard.bufr");
    }

    #[test]
    fn test_manifest_field_encoding() {
        let mut item = ClipItem::new(ContentType::RichText, "abc".to_string());
        item.text_content = Some("bold".to_string());
        item.rich_content = Some(b"{\\rtf1}".to_vec());
        item.file_paths = Some(vec!["/tmp/a.txt".to_string()]);

        let value = serde_json::to_value(ExportedClip::from(&item)).unwrap();
        assert_eq!(value["content_type"], "rich_text");
        assert_eq!(value["rich_content"], "e1xydGYxfQ==");
        assert_eq!(value["file_paths"], r#"["/tmp/a.txt"]"#);
        assert!(value.get("image_path").is_none());
        assert!(value.get("custom_title").is_none());

        let decoded: ExportedClip = serde_json::from_value(value).unwrap();
        let restored = decoded.into_clip_item().unwrap();
        assert_eq!(restored.rich_content, item.rich_content);
        assert_eq!(restored.file_paths, item.file_paths);
        assert_eq!(restored.created_at.timestamp(), item.created_at.timestamp());
    }

    #[test]
    fn test_dates_written_in_whole_seconds() {
        let created = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.789Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut item = ClipItem::new_text("x");
        item.created_at = created;
        let manifest = PinboardExport {
            version: CURRENT_VERSION,
            export_date: created,
            pinboard: ExportedPinboard::from(&Pinboard::new("Dates", None, None)),
            items: vec![ExportedClipItem {
                clip_item: ExportedClip::from(&item),
                sort_order: 0,
                added_at: created,
            }],
        };

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["export_date"], "2024-05-01T10:00:00Z");
        assert_eq!(value["items"][0]["added_at"], "2024-05-01T10:00:00Z");
        assert_eq!(value["items"][0]["clip_item"]["created_at"], "2024-05-01T10:00:00Z");
        let board_created = value["pinboard"]["created_at"].as_str().unwrap();
        assert!(!board_created.contains('.'), "{}", board_created);
    }

    #[test]
    fn test_sniff_container() {
        assert_eq!(sniff_container(b"PK\x03\x04rest"), Some(Container::Zip));
        assert_eq!(sniff_container(b"PK\x05\x06"), Some(Container::Zip));
        assert_eq!(sniff_container(b"BZh9"), Some(Container::TarBzip2));
        assert_eq!(sniff_container(b"this"), None);
        assert_eq!(sniff_container(b""), None);
    }

    #[test]
    fn test_legacy_manifest_without_fractional_seconds() {
        let json = r#"{
            "version": 1,
            "export_date": "2024-05-01T10:00:00Z",
            "pinboard": {"id": "6F1C2B9E-7C57-4B7B-9E0B-8E0F6D3A2C11", "name": "Old", "sort_order": 1, "created_at": "2024-04-01T09:00:00Z"},
            "items": [{
                "clip_item": {
                    "id": "0D7C1B2A-3E4F-4A5B-8C9D-0E1F2A3B4C5D",
                    "content_type": "text",
                    "text_content": "hi",
                    "created_at": "2024-04-02T09:00:00Z",
                    "is_pinned": false,
                    "is_favorite": true,
                    "hash": "deadbeef"
                },
                "sort_order": 1,
                "added_at": "2024-04-03T09:00:00Z"
            }]
        }"#;
        let export: PinboardExport = serde_json::from_str(json).unwrap();
        assert_eq!(export.pinboard.name, "Old");
        assert_eq!(export.items.len(), 1);
        assert!(export.items[0].clip_item.is_favorite);
    }

    #[test]
    fn test_version_probe() {
        assert!(check_version(br#"{"version": 1}"#).is_ok());
        assert!(matches!(
            check_version(br#"{"version": 999, "anything": "else"}"#),
            Err(ArchiveError::UnsupportedVersion(999))
        ));
        assert!(matches!(
            check_version(b"not json"),
            Err(ArchiveError::JsonDecodingFailed(_))
        ));
    }

    #[test]
    fn test_sanitize_entry_path() {
        assert_eq!(sanitize_entry_path(Path::new("./images/a.png")), Some(PathBuf::from("images/a.png")));
        assert_eq!(sanitize_entry_path(Path::new("../evil")), None);
        assert_eq!(sanitize_entry_path(Path::new("/etc/passwd")), None);
        assert_eq!(sanitize_entry_path(Path::new(".")), None);
    }

    #[tokio::test]
    async fn test_export_empty_board_fails() {
        let f = fixture();
        let board = f.boards.create("Empty", None, None).unwrap();
        let dest = f.dir.path().join("empty.bufr");
        let err = f
            .service
            .export_pinboard(&board, &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NoItemsToExport));
        assert!(!dest.exists());

        let err = f
            .service
            .export_all(&[board], &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NoItemsToExport));
    }

    #[tokio::test]
    async fn test_cancelled_export_leaves_no_file() {
        let f = fixture();
        let board = f.boards.create("Board", None, None).unwrap();
        let item = f.history.insert(ClipItem::new_text("one")).unwrap();
        f.boards.add_clip(item.id, board.id).unwrap();

        let dest = f.dir.path().join("cancelled.bufr");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.service.export_pinboard(&board, &dest, &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_export_all_skips_empty_boards() {
        let f = fixture();
        let full = f.boards.create("Full", None, None).unwrap();
        let empty = f.boards.create("Empty", None, None).unwrap();
        let item = f.history.insert(ClipItem::new_text("kept")).unwrap();
        f.boards.add_clip(item.id, full.id).unwrap();

        let dest = f.dir.path().join(BULK_EXPORT_FILE_NAME);
        let count = f
            .service
            .export_all(&[full, empty], &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let imported = f.service.import(&dest, &CancellationToken::new()).await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].name, "Full");
    }

    #[tokio::test]
    async fn test_missing_manifest_is_invalid() {
        let f = fixture();
        let path = f.dir.path().join("nothing.bufr");
        write_archive(&path, "readme.txt", "hello");
        let err = f.service.import(&path, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArchive));
    }

    #[tokio::test]
    async fn test_garbage_file_fails_extraction() {
        let f = fixture();
        let path = f.dir.path().join("garbage.bufr");
        File::create(&path)
            .unwrap()
            .write_all(b"this is not an archive at all")
            .unwrap();
        let err = f.service.import(&path, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::ArchiveExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_newer_version_rejected_before_any_write() {
        let f = fixture();
        let path = f.dir.path().join("future.bufr");
        write_archive(
            &path,
            BULK_MANIFEST,
            r#"{"version": 999, "export_date": "2030-01-01T00:00:00Z", "pinboards": []}"#,
        );
        let err = f.service.import(&path, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedVersion(999)));
        assert!(f.boards.fetch_pinboards().unwrap().is_empty());
        assert_eq!(f.history.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_manifest_preferred_over_single() {
        let f = fixture();
        let path = f.dir.path().join("both.bufr");

        let file = File::create(&path).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, json) in [
            (
                SINGLE_MANIFEST,
                r#"{"version": 1, "export_date": "2024-01-01T00:00:00Z",
                    "pinboard": {"id": "6F1C2B9E-7C57-4B7B-9E0B-8E0F6D3A2C11", "name": "Single", "sort_order": 0, "created_at": "2024-01-01T00:00:00Z"},
                    "items": []}"#,
            ),
            (
                BULK_MANIFEST,
                r#"{"version": 1, "export_date": "2024-01-01T00:00:00Z", "pinboards": [
                    {"pinboard": {"id": "6F1C2B9E-7C57-4B7B-9E0B-8E0F6D3A2C12", "name": "Bulk", "sort_order": 0, "created_at": "2024-01-01T00:00:00Z"},
                     "items": []}]}"#,
            ),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(json.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, json.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let imported = f.service.import(&path, &CancellationToken::new()).await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].name, "Bulk");
    }

    #[tokio::test]
    async fn test_membership_order_preserved_on_import() {
        let f = fixture();
        let board = f.boards.create("Ordered", None, Some("#FF9500".to_string())).unwrap();
        let first = f.history.insert(ClipItem::new_text("first")).unwrap();
        let second = f.history.insert(ClipItem::new_text("second")).unwrap();
        f.boards.add_clip(first.id, board.id).unwrap();
        f.boards.add_clip(second.id, board.id).unwrap();
        let original = f.boards.memberships(board.id).unwrap();

        let dest = f.dir.path().join(export_file_name(&board));
        f.service
            .export_pinboard(&board, &dest, &CancellationToken::new())
            .await
            .unwrap();
        let imported = f.service.import(&dest, &CancellationToken::new()).await.unwrap();
        let copy = &imported[0];
        assert_ne!(copy.id, board.id);
        assert_eq!(copy.color.as_deref(), Some("#FF9500"));

        let restored = f.boards.memberships(copy.id).unwrap();
        assert_eq!(restored.len(), 2);
        for (a, b) in original.iter().zip(&restored) {
            assert_eq!(a.clip_id, b.clip_id);
            assert_eq!(a.sort_order, b.sort_order);
            assert_eq!(a.added_at.timestamp(), b.added_at.timestamp());
        }
        // Both boards point at the same rows
        assert_eq!(f.history.count().unwrap(), 2);
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(6, 3));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// Laid out the way macOS `ditto -c -k` packs a staging directory
    fn write_ditto_zip(path: &Path, manifest_name: &str, json: &str, images: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file(manifest_name, options).unwrap();
        zip.write_all(json.as_bytes()).unwrap();
        zip.add_directory("images/", zip::write::SimpleFileOptions::default())
            .unwrap();
        for (name, bytes) in images {
            zip.start_file(format!("images/{}", name), zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.start_file("__MACOSX/._pinboard.json", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"resource fork").unwrap();
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_imports_zip_written_by_macos_app() {
        let f = fixture();
        let image = png_bytes();
        let json = r##"{
  "export_date" : "2025-02-03T14:05:06Z",
  "items" : [
    {
      "added_at" : "2025-02-01T08:00:00Z",
      "clip_item" : {
        "content_type" : "image",
        "created_at" : "2025-01-30T12:00:00Z",
        "custom_title" : "Diagram",
        "hash" : "a1b2c3",
        "id" : "3F2504E0-4F89-11D3-9A0C-0305E82C3301",
        "image_path" : "3F2504E0-4F89-11D3-9A0C-0305E82C3301.png",
        "is_favorite" : false,
        "is_pinned" : true,
        "source_app_id" : "com.apple.Preview",
        "source_app_name" : "Preview"
      },
      "sort_order" : 0
    },
    {
      "added_at" : "2025-02-01T08:01:00Z",
      "clip_item" : {
        "content_type" : "rich_text",
        "created_at" : "2025-01-31T12:00:00Z",
        "file_paths" : null,
        "hash" : "d4e5f6",
        "id" : "7C9E6679-7425-40DE-944B-E07FC1F90AE7",
        "is_favorite" : true,
        "is_pinned" : false,
        "rich_content" : "e1xydGYxfQ==",
        "text_content" : "bold"
      },
      "sort_order" : 1
    }
  ],
  "pinboard" : {
    "color" : "#FF3B30",
    "created_at" : "2025-01-01T00:00:00Z",
    "icon" : "pin",
    "id" : "9B2D1A5E-1C2B-4D3E-8F40-5A6B7C8D9E0F",
    "name" : "From Mac",
    "sort_order" : 3
  },
  "version" : 1
}"##;
        let path = f.dir.path().join("From Mac.bufr");
        write_ditto_zip(
            &path,
            SINGLE_MANIFEST,
            json,
            &[("3F2504E0-4F89-11D3-9A0C-0305E82C3301.png", image.as_slice())],
        );

        let imported = f.service.import(&path, &CancellationToken::new()).await.unwrap();
        assert_eq!(imported.len(), 1);
        let board = &imported[0];
        assert_eq!(board.name, "From Mac");
        assert_eq!(board.icon.as_deref(), Some("pin"));

        let memberships = f.boards.memberships(board.id).unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].added_at.to_rfc3339(), "2025-02-01T08:00:00+00:00");

        let clips = f.boards.fetch_clips(board.id).unwrap();
        let picture = clips.iter().find(|c| c.hash == "a1b2c3").unwrap();
        assert_eq!(picture.custom_title.as_deref(), Some("Diagram"));
        assert!(picture.is_pinned);
        let filename = picture.image_path.as_deref().unwrap();
        assert_eq!(f.service.blobs.load(filename).await, Some(image));

        let rich = clips.iter().find(|c| c.hash == "d4e5f6").unwrap();
        assert_eq!(rich.rich_content.as_deref(), Some(b"{\\rtf1}".as_slice()));
        assert_eq!(rich.file_paths, None);
    }

    #[tokio::test]
    async fn test_export_writes_zip_with_whole_second_dates() {
        let f = fixture();
        let board = f.boards.create("Zipped", None, None).unwrap();
        let item = f.history.insert(ClipItem::new_text("zip me")).unwrap();
        f.boards.add_clip(item.id, board.id).unwrap();

        let dest = f.dir.path().join("zipped.bufr");
        f.service
            .export_pinboard(&board, &dest, &CancellationToken::new())
            .await
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut json = String::new();
        archive
            .by_name(SINGLE_MANIFEST)
            .unwrap()
            .read_to_string(&mut json)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for date in [
            &value["export_date"],
            &value["pinboard"]["created_at"],
            &value["items"][0]["added_at"],
            &value["items"][0]["clip_item"]["created_at"],
        ] {
            let date = date.as_str().unwrap();
            assert!(date.ends_with('Z') && !date.contains('.'), "{}", date);
        }
    }

    #[tokio::test]
    async fn test_legacy_tar_bz2_archive_still_imports() {
        let f = fixture();
        let path = f.dir.path().join("legacy.bufr");
        write_archive(
            &path,
            BULK_MANIFEST,
            r#"{"version": 1, "export_date": "2024-01-01T00:00:00.250Z", "pinboards": [
                {"pinboard": {"id": "6F1C2B9E-7C57-4B7B-9E0B-8E0F6D3A2C12", "name": "Legacy", "sort_order": 0, "created_at": "2024-01-01T00:00:00.250Z"},
                 "items": []}]}"#,
        );
        let imported = f.service.import(&path, &CancellationToken::new()).await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].name, "Legacy");
    }
}
