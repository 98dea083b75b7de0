//! Configuration: on-disk locations and persisted user settings.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

/// Folder name under the platform data and documents directories
const APP_DIR_NAME: &str = "Bufr";

/// Overrides the support directory when set
pub const SUPPORT_DIR_ENV: &str = "BUFR_HOME";

/// Allowed retention periods in days; 0 keeps history forever
pub const RETENTION_STEPS: [u32; 5] = [1, 7, 30, 365, 0];

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Images larger than this are recorded without their bytes
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine the application support directory")]
    NoSupportDir,
}

// ─────────────────────────────────────────────────────────────────────────────
// PATHS
// ─────────────────────────────────────────────────────────────────────────────

/// Where the database, blobs, settings and exports live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub support_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl AppPaths {
    /// `$BUFR_HOME` if set, otherwise the platform data directory
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Ok(dir) = env::var(SUPPORT_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::with_support_dir(dir));
            }
        }
        let support_dir = dirs::data_dir()
            .ok_or(ConfigError::NoSupportDir)?
            .join(APP_DIR_NAME);
        let export_dir = dirs::document_dir()
            .map(|docs| docs.join(APP_DIR_NAME))
            .unwrap_or_else(|| support_dir.join("exports"));
        Ok(Self { support_dir, export_dir })
    }

    /// Everything under one directory, exports in `exports/`
    pub fn with_support_dir(dir: impl Into<PathBuf>) -> Self {
        let support_dir = dir.into();
        let export_dir = support_dir.join("exports");
        Self { support_dir, export_dir }
    }

    pub fn database_path(&self) -> PathBuf {
        self.support_dir.join("bufr.sqlite")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.support_dir.join("settings.json")
    }

    /// Root holding `images/` and `thumbnails/`
    pub fn blob_root(&self) -> &Path {
        &self.support_dir
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SETTINGS
// ─────────────────────────────────────────────────────────────────────────────

/// System sound played after a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CopySound {
    Basso,
    Blow,
    Bottle,
    Frog,
    Funk,
    Glass,
    Hero,
    Morse,
    Ping,
    Pop,
    Purr,
    Sosumi,
    Submarine,
    #[default]
    Tink,
}

impl CopySound {
    pub const ALL: [CopySound; 14] = [
        CopySound::Basso,
        CopySound::Blow,
        CopySound::Bottle,
        CopySound::Frog,
        CopySound::Funk,
        CopySound::Glass,
        CopySound::Hero,
        CopySound::Morse,
        CopySound::Ping,
        CopySound::Pop,
        CopySound::Purr,
        CopySound::Sosumi,
        CopySound::Submarine,
        CopySound::Tink,
    ];

    /// System sound name
    pub fn name(&self) -> &'static str {
        match self {
            CopySound::Basso => "Basso",
            CopySound::Blow => "Blow",
            CopySound::Bottle => "Bottle",
            CopySound::Frog => "Frog",
            CopySound::Funk => "Funk",
            CopySound::Glass => "Glass",
            CopySound::Hero => "Hero",
            CopySound::Morse => "Morse",
            CopySound::Ping => "Ping",
            CopySound::Pop => "Pop",
            CopySound::Purr => "Purr",
            CopySound::Sosumi => "Sosumi",
            CopySound::Submarine => "Submarine",
            CopySound::Tink => "Tink",
        }
    }
}

impl fmt::Display for CopySound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CopySound {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sound| sound.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown sound '{}'", s))
    }
}

/// Closest allowed retention step; ties go to the earlier step
pub fn closest_retention_step(days: i64) -> u32 {
    RETENTION_STEPS
        .iter()
        .copied()
        .min_by_key(|step| (*step as i64 - days).abs())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// User settings persisted as JSON next to the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Days of history to keep, one of [`RETENTION_STEPS`]; 0 keeps everything
    pub retention_days: u32,
    /// Maximum rows kept; 0 disables the limit. Pinned rows are never evicted.
    pub history_limit: usize,
    pub play_copy_sound: bool,
    pub copy_sound: CopySound,
    pub poll_interval_ms: u64,
    pub max_image_bytes: usize,
    pub history_page_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            play_copy_sound: false,
            copy_sound: CopySound::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            history_page_size: crate::history::DEFAULT_PAGE_SIZE,
        }
    }
}

impl Settings {
    /// Parse settings JSON. A legacy `auto_cleanup_days` value is carried over
    /// to the closest retention step when `retention_days` is absent.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(obj) = value.as_object_mut() {
            if let Some(legacy) = obj.remove("auto_cleanup_days") {
                if !obj.contains_key("retention_days") {
                    if let Some(days) = legacy.as_i64() {
                        let step = closest_retention_step(days);
                        info!(legacy_days = days, retention_days = step, "Migrated legacy cleanup setting");
                        obj.insert("retention_days".to_string(), step.into());
                    }
                }
            }
        }
        let mut settings: Settings = serde_json::from_value(value)?;
        settings.normalize();
        Ok(settings)
    }

    /// Snap out-of-range values back to something usable
    fn normalize(&mut self) {
        if !RETENTION_STEPS.contains(&self.retention_days) {
            let step = closest_retention_step(self.retention_days as i64);
            warn!(retention_days = self.retention_days, step, "Retention not an allowed step");
            self.retention_days = step;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        if self.history_page_size == 0 {
            self.history_page_size = crate::history::DEFAULT_PAGE_SIZE;
        }
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}
