//! Bufr public interface
//!
//! Shared enums, the umbrella error type, and the collaborator traits that the
//! host application implements (pasteboard access, frontmost app lookup, sounds).

use crate::content_detection::PasteboardSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of payload a clip item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    RichText,
    Image,
    File,
    Url,
    Color,
}

impl ContentType {
    pub const ALL: [ContentType; 6] = [
        ContentType::Text,
        ContentType::RichText,
        ContentType::Image,
        ContentType::File,
        ContentType::Url,
        ContentType::Color,
    ];

    /// Value stored in `clip_items.content_type` and in archives
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::RichText => "rich_text",
            ContentType::Image => "image",
            ContentType::File => "file",
            ContentType::Url => "url",
            ContentType::Color => "color",
        }
    }

    pub fn from_database_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ContentType::Text => "Text",
            ContentType::RichText => "Rich Text",
            ContentType::Image => "Image",
            ContentType::File => "File",
            ContentType::Url => "Link",
            ContentType::Color => "Color",
        }
    }

    /// Whether the dedup hash is computed over `text_content`
    pub fn hashes_text(&self) -> bool {
        matches!(
            self,
            ContentType::Text | ContentType::RichText | ContentType::Url | ContentType::Color
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::from_database_str(&normalized).ok_or_else(|| {
            format!(
                "unknown content type '{}' (expected one of: text, rich_text, image, file, url, color)",
                s
            )
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for Bufr operations that cross component boundaries
#[derive(Debug, Error)]
pub enum BufrError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Blob storage error: {0}")]
    BlobError(String),
    #[error(transparent)]
    Archive(#[from] crate::archive::ArchiveError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<crate::database::DatabaseError> for BufrError {
    fn from(e: crate::database::DatabaseError) -> Self {
        BufrError::DatabaseError(e.to_string())
    }
}

impl From<crate::blob_store::BlobError> for BufrError {
    fn from(e: crate::blob_store::BlobError) -> Self {
        BufrError::BlobError(e.to_string())
    }
}

impl From<crate::config::ConfigError> for BufrError {
    fn from(e: crate::config::ConfigError) -> Self {
        BufrError::Config(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLABORATOR INTERFACES
// ═══════════════════════════════════════════════════════════════════════════════

/// System pasteboard as seen by the monitor
pub trait Pasteboard: Send + Sync {
    /// Monotonic counter bumped by the system on every pasteboard write
    fn change_count(&self) -> i64;

    /// Current pasteboard contents, or `None` if they could not be read
    fn snapshot(&self) -> Option<Box<dyn PasteboardSnapshot>>;
}

/// Application that owned focus when a copy happened
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrontmostAppInfo {
    pub bundle_id: Option<String>,
    pub name: Option<String>,
}

pub trait FrontmostApp: Send + Sync {
    fn frontmost(&self) -> FrontmostAppInfo;
}

/// Plays the copy confirmation sound
pub trait SoundPlayer: Send + Sync {
    fn play(&self, sound: crate::config::CopySound);
}

/// Sound player that does nothing (headless use and tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSoundPlayer;

impl SoundPlayer for SilentSoundPlayer {
    fn play(&self, _sound: crate::config::CopySound) {}
}
