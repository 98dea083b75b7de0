//! Clipboard monitor
//!
//! Polls the pasteboard change count on a tick source (500ms by default) and
//! runs the capture pipeline for each change:
//! classify -> hash -> (image: save blob, then insert | other: insert) -> refresh -> sound.
//!
//! Ticks are processed strictly in order: the polling task awaits each capture
//! before waiting for the next tick, and `tick()` itself is serialized.

use crate::blob_store::BlobStore;
use crate::config::{CopySound, Settings};
use crate::content_detection::{classify, Classified};
use crate::exclusions::ExclusionManager;
use crate::hashing::content_hash;
use crate::history::{runtime_handle, HistoryStore};
use crate::interface::{BufrError, FrontmostApp, FrontmostAppInfo, Pasteboard, SoundPlayer};
use crate::models::ClipItem;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Source marked the copy as concealed or transient
    Concealed,
    ExcludedApp,
    /// Nothing storable on the pasteboard
    Empty,
    /// Pasteboard contents could not be read
    Unreadable,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Unchanged,
    Skipped(SkipReason),
    Captured(ClipItem),
    /// Capture failed; already logged
    Failed,
}

// ─────────────────────────────────────────────────────────────────────────────
// TICK SOURCES
// ─────────────────────────────────────────────────────────────────────────────

/// Drives the polling loop
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick. Returning `false` ends monitoring.
    async fn next_tick(&mut self) -> bool;
}

/// Wall-clock ticks at a fixed period; late ticks are skipped, not bunched
pub struct IntervalTicks {
    period: Duration,
    interval: Option<tokio::time::Interval>,
}

impl IntervalTicks {
    pub fn new(period: Duration) -> Self {
        Self { period, interval: None }
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn next_tick(&mut self) -> bool {
        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;
        true
    }
}

/// Ticks delivered by hand through a [`TickHandle`]
pub struct ManualTicks {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl TickHandle {
    /// Queue one tick. `false` once the monitor loop has gone away.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

pub fn manual_ticks() -> (TickHandle, ManualTicks) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TickHandle { tx }, ManualTicks { rx })
}

#[async_trait]
impl TickSource for ManualTicks {
    async fn next_tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MONITOR
// ─────────────────────────────────────────────────────────────────────────────

/// Capture options that may change while monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub play_copy_sound: bool,
    pub copy_sound: CopySound,
    pub max_image_bytes: usize,
}

impl From<&Settings> for MonitorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            play_copy_sound: settings.play_copy_sound,
            copy_sound: settings.copy_sound,
            max_image_bytes: settings.max_image_bytes,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Collaborators the monitor reads from and writes to
pub struct MonitorServices {
    pub pasteboard: Arc<dyn Pasteboard>,
    pub frontmost: Arc<dyn FrontmostApp>,
    pub sound: Arc<dyn SoundPlayer>,
    pub history: Arc<HistoryStore>,
    pub blobs: Arc<BlobStore>,
    pub exclusions: Arc<ExclusionManager>,
}

pub struct ClipboardMonitor {
    services: MonitorServices,
    config: RwLock<MonitorConfig>,
    last_change_count: AtomicI64,
    tick_lock: tokio::sync::Mutex<()>,
    running: Mutex<Option<CancellationToken>>,
}

impl ClipboardMonitor {
    pub fn new(services: MonitorServices, config: MonitorConfig) -> Self {
        let last_change_count = services.pasteboard.change_count();
        Self {
            services,
            config: RwLock::new(config),
            last_change_count: AtomicI64::new(last_change_count),
            tick_lock: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.running.lock().is_some() {
            MonitorState::Monitoring
        } else {
            MonitorState::Idle
        }
    }

    pub fn config(&self) -> MonitorConfig {
        *self.config.read()
    }

    pub fn set_config(&self, config: MonitorConfig) {
        *self.config.write() = config;
    }

    /// Start polling. Returns `None` if already monitoring.
    ///
    /// Changes made to the pasteboard before this call are not captured.
    pub fn start(self: &Arc<Self>, mut ticks: Box<dyn TickSource>) -> Option<JoinHandle<()>> {
        let token = {
            let mut running = self.running.lock();
            if running.is_some() {
                return None;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };
        self.last_change_count
            .store(self.services.pasteboard.change_count(), Ordering::SeqCst);

        let monitor = Arc::clone(self);
        let handle = runtime_handle().spawn(async move {
            info!("Clipboard monitoring started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    more = ticks.next_tick() => {
                        if !more {
                            break;
                        }
                    }
                }
                monitor.tick().await;
            }
            if !token.is_cancelled() {
                // Tick source ran dry; nobody called stop()
                monitor.running.lock().take();
            }
            info!("Clipboard monitoring stopped");
        });
        Some(handle)
    }

    /// Stop polling. An in-flight capture finishes first.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }

    /// Check the pasteboard once and capture a change if there is one.
    pub async fn tick(&self) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;
        let services = &self.services;

        let current = services.pasteboard.change_count();
        if current == self.last_change_count.load(Ordering::SeqCst) {
            return TickOutcome::Unchanged;
        }
        self.last_change_count.store(current, Ordering::SeqCst);

        let Some(snapshot) = services.pasteboard.snapshot() else {
            debug!(change_count = current, "Pasteboard unreadable, skipping");
            return TickOutcome::Skipped(SkipReason::Unreadable);
        };

        if snapshot.is_concealed() {
            debug!(change_count = current, "Skipping concealed pasteboard content");
            return TickOutcome::Skipped(SkipReason::Concealed);
        }

        let app = services.frontmost.frontmost();
        if services.exclusions.is_excluded(app.bundle_id.as_deref()) {
            return TickOutcome::Skipped(SkipReason::ExcludedApp);
        }

        let Some(classified) = classify(snapshot.as_ref()) else {
            debug!(change_count = current, "Nothing to capture");
            return TickOutcome::Skipped(SkipReason::Empty);
        };

        let config = self.config();
        match self.capture(classified, &app, &config).await {
            Ok(item) => {
                if let Err(e) = services.history.refresh() {
                    warn!(error = %e, "Failed to refresh history after capture");
                }
                if config.play_copy_sound {
                    services.sound.play(config.copy_sound);
                }
                debug!(id = %item.id, content_type = %item.content_type, "Captured clip");
                TickOutcome::Captured(item)
            }
            Err(e) => {
                error!(error = %e, "Failed to save clip item");
                TickOutcome::Failed
            }
        }
    }

    async fn capture(
        &self,
        mut classified: Classified,
        app: &FrontmostAppInfo,
        config: &MonitorConfig,
    ) -> Result<ClipItem, BufrError> {
        let hash = content_hash(
            classified.content_type,
            classified.text_content.as_deref(),
            classified.image_data.as_deref(),
            classified.file_paths.as_deref(),
        );
        let image_data = classified.image_data.take();
        let mut item = ClipItem::from_classified(classified, hash, app);

        let Some(bytes) = image_data else {
            return self.insert(item).await;
        };

        if bytes.len() > config.max_image_bytes {
            warn!(size = bytes.len(), limit = config.max_image_bytes, "Image too large, keeping metadata only");
            return self.insert(item).await;
        }

        // Known image: skip the blob write, the insert only bumps recency
        if self.services.history.find_by_hash(&item.hash)?.is_some() {
            return self.insert(item).await;
        }

        let filename = self.services.blobs.save(bytes, item.id).await?;
        item.image_path = Some(filename.clone());
        let id = item.id;

        match self.insert(item).await {
            Ok(stored) => {
                if stored.id == id {
                    self.services.blobs.commit(&filename);
                } else {
                    // Lost a race with an identical capture; our blob is unreferenced
                    self.services.blobs.delete(&filename, id).await;
                }
                Ok(stored)
            }
            Err(e) => {
                self.services.blobs.delete(&filename, id).await;
                Err(e)
            }
        }
    }

    async fn insert(&self, item: ClipItem) -> Result<ClipItem, BufrError> {
        let history = Arc::clone(&self.services.history);
        tokio::task::spawn_blocking(move || history.insert(item))
            .await
            .map_err(|e| BufrError::DatabaseError(e.to_string()))?
            .map_err(BufrError::from)
    }
}
