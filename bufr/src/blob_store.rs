//! File-based blob storage for clipboard images
//!
//! Layout under the support directory:
//!   images/{id}.png            original bytes as captured
//!   thumbnails/{id}_thumb.png  longest side capped at 400px
//!
//! Directories are private to the user (0700) and files are 0600. All operations
//! are serialized through one async lock and run their I/O on the blocking pool.
//!
//! A saved image stays pending until the caller commits it (its row is in the
//! database) or deletes it. Garbage collection never removes a pending image.

use image::{GenericImageView, ImageFormat};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest side of a generated thumbnail, in pixels
pub const THUMBNAIL_MAX_SIDE: u32 = 400;

const IMAGES_DIR: &str = "images";
const THUMBNAILS_DIR: &str = "thumbnails";

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blob task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Could not list referenced images: {0}")]
    LiveSet(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Reference to a stored image, handed out when a row is evicted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub filename: String,
    pub id: Uuid,
}

/// Name of the original image file for an item id
pub fn image_filename(id: Uuid) -> String {
    format!("{}.png", id)
}

fn thumbnail_filename(id: Uuid) -> String {
    format!("{}_thumb.png", id)
}

/// Reject names that could escape the blob directory
pub fn is_valid_filename(filename: &str) -> bool {
    !filename.is_empty() && !filename.contains('/') && !filename.contains("..")
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove blob file"),
    }
}

/// Decode an image and encode a PNG whose longest side is at most 400px
pub fn render_thumbnail(data: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(data)?;
    let (width, height) = img.dimensions();
    let img = if width > THUMBNAIL_MAX_SIDE || height > THUMBNAIL_MAX_SIDE {
        img.thumbnail(THUMBNAIL_MAX_SIDE, THUMBNAIL_MAX_SIDE)
    } else {
        img
    };
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Image and thumbnail files owned by the app.
///
/// Knows nothing about clip items; callers pass the item id used to name files.
pub struct BlobStore {
    images_dir: PathBuf,
    thumbnails_dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
    /// Saved but not yet committed by the caller
    pending: Mutex<HashSet<String>>,
}

impl BlobStore {
    /// Open the store rooted at `root`, creating `images/` and `thumbnails/`
    pub fn open<P: AsRef<Path>>(root: P) -> BlobResult<Self> {
        let root = root.as_ref();
        let images_dir = root.join(IMAGES_DIR);
        let thumbnails_dir = root.join(THUMBNAILS_DIR);
        create_private_dir(&images_dir)?;
        create_private_dir(&thumbnails_dir)?;
        Ok(Self {
            images_dir,
            thumbnails_dir,
            lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(HashSet::new()),
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn thumbnails_dir(&self) -> &Path {
        &self.thumbnails_dir
    }

    /// Resolve a stored image filename to its path, `None` for unsafe names
    pub fn image_path(&self, filename: &str) -> Option<PathBuf> {
        is_valid_filename(filename).then(|| self.images_dir.join(filename))
    }

    /// Write `{id}.png` and derive its thumbnail. Returns the image filename.
    ///
    /// The image is pending until [`commit`](Self::commit) or
    /// [`delete`](Self::delete). Thumbnail failures are logged and do not fail
    /// the save.
    pub async fn save(&self, data: Vec<u8>, id: Uuid) -> BlobResult<String> {
        let _guard = self.lock.lock().await;
        let filename = image_filename(id);
        let image_path = self.images_dir.join(&filename);
        let thumb_path = self.thumbnails_dir.join(thumbnail_filename(id));

        tokio::task::spawn_blocking(move || -> BlobResult<()> {
            write_private_file(&image_path, &data)?;
            match render_thumbnail(&data) {
                Ok(thumb) => {
                    if let Err(e) = write_private_file(&thumb_path, &thumb) {
                        debug!(id = %id, error = %e, "Failed to write thumbnail");
                    }
                }
                Err(e) => debug!(id = %id, error = %e, "Failed to render thumbnail"),
            }
            Ok(())
        })
        .await??;

        self.pending.lock().insert(filename.clone());
        debug!(id = %id, "Stored image blob");
        Ok(filename)
    }

    /// The row referencing `filename` is committed; garbage collection may
    /// judge the image by the database from now on.
    pub fn commit(&self, filename: &str) {
        self.pending.lock().remove(filename);
    }

    pub fn is_pending(&self, filename: &str) -> bool {
        self.pending.lock().contains(filename)
    }

    /// Read an image by filename. `None` if the name is invalid or the file is missing.
    pub async fn load(&self, filename: &str) -> Option<Vec<u8>> {
        let path = self.image_path(filename)?;
        let _guard = self.lock.lock().await;
        Self::read_optional(path).await
    }

    pub async fn load_thumbnail(&self, id: Uuid) -> Option<Vec<u8>> {
        let path = self.thumbnails_dir.join(thumbnail_filename(id));
        let _guard = self.lock.lock().await;
        Self::read_optional(path).await
    }

    async fn read_optional(path: PathBuf) -> Option<Vec<u8>> {
        let result = tokio::task::spawn_blocking(move || fs::read(&path)).await;
        match result {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "Failed to read blob file");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Blob read task failed");
                None
            }
        }
    }

    /// Best-effort removal of an image and its thumbnail
    pub async fn delete(&self, filename: &str, id: Uuid) {
        let Some(image_path) = self.image_path(filename) else {
            warn!(filename, "Refusing to delete blob with invalid filename");
            return;
        };
        let thumb_path = self.thumbnails_dir.join(thumbnail_filename(id));
        let _guard = self.lock.lock().await;
        self.pending.lock().remove(filename);
        let result = tokio::task::spawn_blocking(move || {
            remove_if_present(&image_path);
            remove_if_present(&thumb_path);
        })
        .await;
        if let Err(e) = result {
            warn!(id = %id, error = %e, "Blob delete task failed");
        }
    }

    /// Wipe both directories and recreate them empty
    pub async fn delete_all(&self) -> BlobResult<()> {
        let _guard = self.lock.lock().await;
        let images_dir = self.images_dir.clone();
        let thumbnails_dir = self.thumbnails_dir.clone();
        tokio::task::spawn_blocking(move || -> BlobResult<()> {
            for dir in [&images_dir, &thumbnails_dir] {
                match fs::remove_dir_all(dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                create_private_dir(dir)?;
            }
            Ok(())
        })
        .await??;
        debug!("Removed all image blobs");
        Ok(())
    }

    /// Remove image files (and their thumbnails) that are neither pending nor
    /// named by `live`. Returns the number of images removed.
    ///
    /// `live` runs under the store lock after the pending set is read, so a
    /// save committed while the scan is prepared is seen by one or the other.
    pub async fn collect_garbage<F, E>(&self, live: F) -> BlobResult<usize>
    where
        F: FnOnce() -> Result<HashSet<String>, E> + Send + 'static,
        E: std::fmt::Display,
    {
        let _guard = self.lock.lock().await;
        let pending = self.pending.lock().clone();
        let images_dir = self.images_dir.clone();
        let thumbnails_dir = self.thumbnails_dir.clone();
        let removed = tokio::task::spawn_blocking(move || -> BlobResult<usize> {
            let live = live().map_err(|e| BlobError::LiveSet(e.to_string()))?;
            let mut removed = 0;
            for entry in fs::read_dir(&images_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if live.contains(&name) || pending.contains(&name) {
                    continue;
                }
                remove_if_present(&entry.path());
                if let Some(stem) = name.strip_suffix(".png") {
                    remove_if_present(&thumbnails_dir.join(format!("{}_thumb.png", stem)));
                }
                removed += 1;
            }
            Ok(removed)
        })
        .await??;
        if removed > 0 {
            debug!(removed, "Removed orphaned image blobs");
        }
        Ok(removed)
    }
}
