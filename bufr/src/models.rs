//! Core data models for Bufr
//!
//! Rows of `clip_items`, `pinboards`, `pinboard_items` and `excluded_apps`.

use crate::blob_store::BlobRef;
use crate::content_detection::Classified;
use crate::hashing;
use crate::interface::{ContentType, FrontmostAppInfo};
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

/// Characters of `text_content` shown before "..." in list rows
const DISPLAY_TEXT_CHARS: usize = 80;

/// Colors offered when creating a pinboard
pub const PINBOARD_PALETTE: &[&str] = &[
    "#007AFF", "#FF3B30", "#FF9500", "#FFCC00", "#34C759", "#5AC8FA", "#AF52DE", "#FF2D55",
];

/// Current time truncated to milliseconds, the precision timestamps are stored with
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ─────────────────────────────────────────────────────────────────────────────
// CLIP ITEM
// ─────────────────────────────────────────────────────────────────────────────

/// One captured clipboard entry
#[derive(Debug, Clone, PartialEq)]
pub struct ClipItem {
    pub id: Uuid,
    pub content_type: ContentType,
    pub text_content: Option<String>,
    /// RTF (or HTML) bytes, only kept for rich text
    pub rich_content: Option<Vec<u8>>,
    /// Filename inside the blob store's images directory
    pub image_path: Option<String>,
    pub file_paths: Option<Vec<String>>,
    pub source_app_id: Option<String>,
    pub source_app_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_pinned: bool,
    pub is_favorite: bool,
    pub hash: String,
    pub custom_title: Option<String>,
}

impl ClipItem {
    /// Bare item of the given type; payload fields start empty
    pub fn new(content_type: ContentType, hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type,
            text_content: None,
            rich_content: None,
            image_path: None,
            file_paths: None,
            source_app_id: None,
            source_app_name: None,
            created_at: timestamp_now(),
            is_pinned: false,
            is_favorite: false,
            hash,
            custom_title: None,
        }
    }

    /// Plain text item with its dedup hash computed
    pub fn new_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let hash = hashing::content_hash(ContentType::Text, Some(text.as_str()), None, None);
        let mut item = Self::new(ContentType::Text, hash);
        item.text_content = Some(text);
        item
    }

    /// Item for a classified copy. Image bytes are not kept on the row;
    /// the caller stores them and fills `image_path`.
    pub fn from_classified(classified: Classified, hash: String, source: &FrontmostAppInfo) -> Self {
        let mut item = Self::new(classified.content_type, hash);
        item.text_content = classified.text_content;
        item.rich_content = classified.rich_content;
        item.file_paths = classified.file_paths;
        item.source_app_id = source.bundle_id.clone();
        item.source_app_name = source.name.clone();
        item
    }

    pub fn with_source(mut self, bundle_id: Option<String>, name: Option<String>) -> Self {
        self.source_app_id = bundle_id;
        self.source_app_name = name;
        self
    }

    /// First 80 characters of the text, with "..." when truncated
    pub fn display_text(&self) -> String {
        let text = self.text_content.as_deref().unwrap_or_default();
        if text.chars().count() > DISPLAY_TEXT_CHARS {
            let prefix: String = text.chars().take(DISPLAY_TEXT_CHARS).collect();
            format!("{}...", prefix)
        } else {
            text.to_string()
        }
    }

    /// Custom title if set, otherwise the content type's name
    pub fn display_title(&self) -> String {
        match self.custom_title.as_deref() {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self.content_type.display_name().to_string(),
        }
    }

    /// Blob backing this item, if it is an image with a stored file
    pub fn blob_ref(&self) -> Option<BlobRef> {
        self.image_path.as_ref().map(|filename| BlobRef {
            filename: filename.clone(),
            id: self.id,
        })
    }
}

/// JSON list encoding used for `file_paths` in the database and in archives
pub fn encode_file_paths(paths: &[String]) -> String {
    serde_json::to_string(paths).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_file_paths(encoded: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(encoded)
}

// ─────────────────────────────────────────────────────────────────────────────
// PINBOARDS
// ─────────────────────────────────────────────────────────────────────────────

/// Named, user-ordered collection of clip items
#[derive(Debug, Clone, PartialEq)]
pub struct Pinboard {
    pub id: Uuid,
    pub name: String,
    pub icon: Option<String>,
    /// Hex color string, e.g. "#007AFF"
    pub color: Option<String>,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

impl Pinboard {
    pub fn new(name: impl Into<String>, icon: Option<String>, color: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            icon,
            color,
            sort_order: 0,
            created_at: timestamp_now(),
        }
    }
}

/// Membership of a clip item in a pinboard
#[derive(Debug, Clone, PartialEq)]
pub struct PinboardItem {
    pub pinboard_id: Uuid,
    pub clip_id: Uuid,
    pub sort_order: i64,
    pub added_at: DateTime<Utc>,
}

/// App whose copies are never recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedApp {
    pub bundle_id: String,
    pub app_name: String,
}

/// First palette color no existing board uses, falling back to the first entry
pub fn suggest_pinboard_color(boards: &[Pinboard]) -> &'static str {
    PINBOARD_PALETTE
        .iter()
        .copied()
        .find(|candidate| {
            !boards.iter().any(|b| {
                b.color
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(candidate))
            })
        })
        .unwrap_or(PINBOARD_PALETTE[0])
}
