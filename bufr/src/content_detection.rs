//! Content classification for pasteboard snapshots
//!
//! Picks the content type of a copy (image > file > url > color > rich text > text)
//! and extracts the payload that gets persisted for that type.

use crate::interface::ContentType;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Strings at least this long are never treated as colors
const MAX_COLOR_LEN: usize = 50;

static HEX_COLOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#([0-9A-Fa-f]{3}|[0-9A-Fa-f]{6}|[0-9A-Fa-f]{8})$").unwrap()
});

static RGB_COLOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^rgba?\(\s*\d{1,3}\s*,\s*\d{1,3}\s*,\s*\d{1,3}\s*(,\s*[\d.]+\s*)?\)$").unwrap()
});

static HSL_COLOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^hsla?\(\s*\d{1,3}\s*,\s*\d{1,3}%\s*,\s*\d{1,3}%\s*(,\s*[\d.]+\s*)?\)$").unwrap()
});

/// Common protocols accepted as links when the pasteboard only offers a string
const LINK_PROTOCOLS: &[&str] = &["http://", "https://", "ftp://", "ftps://"];

// ─────────────────────────────────────────────────────────────────────────────
// SNAPSHOT
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the pasteboard at one change count.
///
/// Each accessor returns the representation if the pasteboard offers it.
pub trait PasteboardSnapshot: Send {
    fn png_data(&self) -> Option<Vec<u8>>;
    fn tiff_data(&self) -> Option<Vec<u8>>;
    /// Absolute paths of copied file URLs, in pasteboard order
    fn file_paths(&self) -> Option<Vec<String>>;
    fn url_string(&self) -> Option<String>;
    fn rtf_data(&self) -> Option<Vec<u8>>;
    fn html_data(&self) -> Option<Vec<u8>>;
    fn string(&self) -> Option<String>;
    /// True when the source marked the copy as concealed or transient (password managers)
    fn is_concealed(&self) -> bool;
}

/// In-memory snapshot, used by the CLI capture command and by tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub png: Option<Vec<u8>>,
    pub tiff: Option<Vec<u8>>,
    pub files: Option<Vec<String>>,
    pub url: Option<String>,
    pub rtf: Option<Vec<u8>>,
    pub html: Option<Vec<u8>>,
    pub string: Option<String>,
    pub concealed: bool,
}

impl MemorySnapshot {
    pub fn text(value: impl Into<String>) -> Self {
        Self { string: Some(value.into()), ..Self::default() }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self { png: Some(bytes), ..Self::default() }
    }

    pub fn files<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { files: Some(paths.into_iter().map(Into::into).collect()), ..Self::default() }
    }

    pub fn with_string(mut self, value: impl Into<String>) -> Self {
        self.string = Some(value.into());
        self
    }

    pub fn with_png(mut self, bytes: Vec<u8>) -> Self {
        self.png = Some(bytes);
        self
    }

    pub fn with_tiff(mut self, bytes: Vec<u8>) -> Self {
        self.tiff = Some(bytes);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_rtf(mut self, bytes: Vec<u8>) -> Self {
        self.rtf = Some(bytes);
        self
    }

    pub fn with_html(mut self, bytes: Vec<u8>) -> Self {
        self.html = Some(bytes);
        self
    }

    pub fn concealed(mut self) -> Self {
        self.concealed = true;
        self
    }
}

impl PasteboardSnapshot for MemorySnapshot {
    fn png_data(&self) -> Option<Vec<u8>> {
        self.png.clone()
    }

    fn tiff_data(&self) -> Option<Vec<u8>> {
        self.tiff.clone()
    }

    fn file_paths(&self) -> Option<Vec<String>> {
        self.files.clone()
    }

    fn url_string(&self) -> Option<String> {
        self.url.clone()
    }

    fn rtf_data(&self) -> Option<Vec<u8>> {
        self.rtf.clone()
    }

    fn html_data(&self) -> Option<Vec<u8>> {
        self.html.clone()
    }

    fn string(&self) -> Option<String> {
        self.string.clone()
    }

    fn is_concealed(&self) -> bool {
        self.concealed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLASSIFICATION
// ─────────────────────────────────────────────────────────────────────────────

/// Result of classifying a snapshot: the type plus the payload kept for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub content_type: ContentType,
    pub text_content: Option<String>,
    pub rich_content: Option<Vec<u8>>,
    pub image_data: Option<Vec<u8>>,
    pub file_paths: Option<Vec<String>>,
}

fn non_empty_bytes(data: Option<Vec<u8>>) -> Option<Vec<u8>> {
    data.filter(|bytes| !bytes.is_empty())
}

fn non_empty_string(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Detect the content type of a snapshot without extracting anything.
pub fn detect_type(snapshot: &dyn PasteboardSnapshot) -> ContentType {
    if non_empty_bytes(snapshot.png_data()).is_some() || non_empty_bytes(snapshot.tiff_data()).is_some() {
        return ContentType::Image;
    }

    if snapshot.file_paths().is_some_and(|paths| !paths.is_empty()) {
        return ContentType::File;
    }

    let string = non_empty_string(snapshot.string());

    if non_empty_string(snapshot.url_string()).is_some()
        || string.as_deref().is_some_and(is_valid_url)
    {
        return ContentType::Url;
    }

    if string.as_deref().is_some_and(is_color) {
        return ContentType::Color;
    }

    if non_empty_bytes(snapshot.rtf_data()).is_some() || non_empty_bytes(snapshot.html_data()).is_some() {
        return ContentType::RichText;
    }

    ContentType::Text
}

/// Classify a snapshot and extract its payload.
///
/// Returns `None` when nothing storable was extracted (no text, no image bytes,
/// no file paths); callers skip such copies.
pub fn classify(snapshot: &dyn PasteboardSnapshot) -> Option<Classified> {
    let content_type = detect_type(snapshot);

    let mut classified = Classified {
        content_type,
        text_content: None,
        rich_content: None,
        image_data: None,
        file_paths: None,
    };

    match content_type {
        ContentType::Text | ContentType::Color => {
            classified.text_content = non_empty_string(snapshot.string());
        }
        ContentType::RichText => {
            classified.text_content = non_empty_string(snapshot.string());
            classified.rich_content = non_empty_bytes(snapshot.rtf_data())
                .or_else(|| non_empty_bytes(snapshot.html_data()));
        }
        ContentType::Url => {
            classified.text_content = non_empty_string(snapshot.string())
                .or_else(|| non_empty_string(snapshot.url_string()));
        }
        ContentType::File => {
            let paths: Vec<String> = snapshot.file_paths().unwrap_or_default();
            classified.text_content = non_empty_string(Some(file_display_names(&paths)));
            classified.file_paths = Some(paths).filter(|p| !p.is_empty());
        }
        ContentType::Image => {
            classified.image_data = non_empty_bytes(snapshot.png_data())
                .or_else(|| non_empty_bytes(snapshot.tiff_data()));
        }
    }

    if classified.text_content.is_none()
        && classified.image_data.is_none()
        && classified.file_paths.is_none()
    {
        return None;
    }

    Some(classified)
}

/// Last path components joined with ", " (the searchable text of a file copy)
pub fn file_display_names(paths: &[String]) -> String {
    paths
        .iter()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.clone())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check if a string is a single-line link with a common protocol
pub fn is_valid_url(text: &str) -> bool {
    let trimmed = text.trim();

    if trimmed.is_empty() || trimmed.len() > 2000 || trimmed.contains(char::is_whitespace) {
        return false;
    }

    let lower = trimmed.to_lowercase();
    if !LINK_PROTOCOLS.iter().any(|p| lower.starts_with(p)) {
        return false;
    }

    url::Url::parse(trimmed).is_ok_and(|u| u.has_host())
}

/// Check if a string is a color value.
/// Supports hex (#RGB, #RRGGBB, #RRGGBBAA), rgb(), rgba(), hsl(), hsla()
pub fn is_color(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() >= MAX_COLOR_LEN {
        return false;
    }

    HEX_COLOR_REGEX.is_match(trimmed)
        || RGB_COLOR_REGEX.is_match(trimmed)
        || HSL_COLOR_REGEX.is_match(trimmed)
}

/// Parse a color string to RGBA u32 (0xRRGGBBAA format).
/// Returns None if the string is not a color accepted by [`is_color`].
pub fn parse_color_to_rgba(text: &str) -> Option<u32> {
    if !is_color(text) {
        return None;
    }
    let color = csscolorparser::parse(text.trim()).ok()?;
    let [r, g, b, a] = color.to_rgba8();
    Some(((r as u32) << 24) | ((g as u32) << 16) | ((b as u32) << 8) | (a as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_detection() {
        assert!(is_color("#FF5733"));
        assert!(is_color("#fff"));
        assert!(is_color("#FF573380"));
        assert!(is_color("  rgb(255, 87, 51) "));
        assert!(is_color("rgba(255,87,51,0.5)"));
        assert!(is_color("hsl(120, 50%, 50%)"));
        assert!(is_color("hsla(120, 50%, 50%, 0.3)"));
    }

    #[test]
    fn test_color_detection_rejects() {
        assert!(!is_color("#GG0000"));
        assert!(!is_color("#12345"));
        assert!(!is_color("red"));
        assert!(!is_color("rgb(255, 87)"));
        assert!(!is_color("hsl(120, 50, 50)"));
        assert!(!is_color(""));
        assert!(!is_color("#FF5733 and more"));
    }

    #[test]
    fn test_color_length_limit() {
        // 60 characters, otherwise well formed
        let padded = format!("rgb(255,{}87, 51)", " ".repeat(45));
        assert_eq!(padded.chars().count(), 60);
        assert!(!is_color(&padded));
    }

    #[test]
    fn test_parse_color_to_rgba() {
        assert_eq!(parse_color_to_rgba("#FF0000"), Some(0xFF0000FF));
        assert_eq!(parse_color_to_rgba("rgb(0, 255, 0)"), Some(0x00FF00FF));
        assert_eq!(parse_color_to_rgba("blue"), None);
    }

    #[test]
    fn test_url_common_protocols_accepted() {
        assert!(is_valid_url("http://example.com"));
        assert!(is_valid_url("https://example.com/path?q=1"));
        assert!(is_valid_url("ftp://files.example.com/doc.pdf"));
        assert!(is_valid_url("HTTPS://EXAMPLE.COM"));
    }

    #[test]
    fn test_url_exotic_or_multiline_rejected() {
        assert!(!is_valid_url("javascript:alert(1)"));
        assert!(!is_valid_url("file:///etc/passwd"));
        assert!(!is_valid_url("https://example.com\nsecond line"));
        assert!(!is_valid_url("see https://example.com"));
        assert!(!is_valid_url("https://"));
    }

    #[test]
    fn test_image_beats_string() {
        let snapshot = MemorySnapshot::png(vec![1, 2, 3]).with_string("caption");
        let classified = classify(&snapshot).unwrap();
        assert_eq!(classified.content_type, ContentType::Image);
        assert_eq!(classified.image_data, Some(vec![1, 2, 3]));
        assert_eq!(classified.text_content, None);
    }

    #[test]
    fn test_tiff_fallback() {
        let snapshot = MemorySnapshot::default().with_tiff(vec![9, 9]);
        let classified = classify(&snapshot).unwrap();
        assert_eq!(classified.content_type, ContentType::Image);
        assert_eq!(classified.image_data, Some(vec![9, 9]));
    }

    #[test]
    fn test_file_beats_url() {
        let snapshot = MemorySnapshot::files(["/Users/me/a.txt", "/Users/me/photos/b.png"])
            .with_url("https://example.com");
        let classified = classify(&snapshot).unwrap();
        assert_eq!(classified.content_type, ContentType::File);
        assert_eq!(classified.text_content.as_deref(), Some("a.txt, b.png"));
        assert_eq!(
            classified.file_paths,
            Some(vec!["/Users/me/a.txt".to_string(), "/Users/me/photos/b.png".to_string()])
        );
    }

    #[test]
    fn test_url_representation_and_bare_string() {
        let with_rep = MemorySnapshot::default().with_url("https://a.example");
        let classified = classify(&with_rep).unwrap();
        assert_eq!(classified.content_type, ContentType::Url);
        assert_eq!(classified.text_content.as_deref(), Some("https://a.example"));

        let bare = MemorySnapshot::text("https://b.example/page");
        assert_eq!(classify(&bare).unwrap().content_type, ContentType::Url);
    }

    #[test]
    fn test_color_beats_rich_text() {
        let snapshot = MemorySnapshot::text("#00FF00").with_rtf(b"{\\rtf1 #00FF00}".to_vec());
        let classified = classify(&snapshot).unwrap();
        assert_eq!(classified.content_type, ContentType::Color);
        assert_eq!(classified.rich_content, None);
    }

    #[test]
    fn test_rich_text_keeps_rtf_then_html() {
        let rtf = MemorySnapshot::text("bold").with_rtf(b"{\\rtf1 \\b bold}".to_vec());
        let classified = classify(&rtf).unwrap();
        assert_eq!(classified.content_type, ContentType::RichText);
        assert_eq!(classified.text_content.as_deref(), Some("bold"));
        assert_eq!(classified.rich_content, Some(b"{\\rtf1 \\b bold}".to_vec()));

        let html = MemorySnapshot::text("bold").with_html(b"<b>bold</b>".to_vec());
        assert_eq!(classify(&html).unwrap().rich_content, Some(b"<b>bold</b>".to_vec()));
    }

    #[test]
    fn test_plain_text() {
        let classified = classify(&MemorySnapshot::text("Hello World")).unwrap();
        assert_eq!(classified.content_type, ContentType::Text);
        assert_eq!(classified.text_content.as_deref(), Some("Hello World"));
        assert_eq!(classified.rich_content, None);
    }

    #[test]
    fn test_empty_snapshot_is_skipped() {
        assert!(classify(&MemorySnapshot::default()).is_none());
        assert!(classify(&MemorySnapshot::text("")).is_none());
        // rich data without a plain string has nothing searchable
        assert!(classify(&MemorySnapshot::default().with_rtf(b"{\\rtf1}".to_vec())).is_none());
    }
}
