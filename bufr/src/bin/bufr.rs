//! Command-line access to a Bufr support directory.
//!
//! Browses and edits the history, manages pinboards and exclusions, and runs
//! export/import and maintenance against the same database the app uses.
//!
//! Usage:
//!     bufr list --limit 20
//!     bufr capture "some text" --app com.apple.TextEdit
//!     bufr boards export <board-id>

use anyhow::{bail, Context, Result};
use bufr::content_detection::MemorySnapshot;
use bufr::interface::{ContentType, FrontmostApp, FrontmostAppInfo, Pasteboard, SilentSoundPlayer};
use bufr::monitor::TickOutcome;
use bufr::{logging, AppPaths, AppServices, ClipItem, CopySound, PasteboardSnapshot};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "bufr", about = "Bufr clipboard history", version)]
struct Cli {
    /// Support directory (defaults to BUFR_HOME, then the platform data dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Most recent items
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Only items of this type
        #[arg(short = 't', long = "type")]
        content_type: Option<ContentType>,
    },
    /// Full-text search over item text
    Search { query: String },
    /// Print one item in full
    Show { id: Uuid },
    /// Record text as if it had just been copied
    Capture {
        text: String,
        /// Bundle id of the source app
        #[arg(long)]
        app: Option<String>,
    },
    /// Record an image file as if it had just been copied
    CaptureImage {
        path: PathBuf,
        #[arg(long)]
        app: Option<String>,
    },
    Pin { id: Uuid },
    Favorite { id: Uuid },
    /// Set a custom title, or clear it when omitted
    Rename { id: Uuid, title: Option<String> },
    /// Replace the text of an item
    Edit { id: Uuid, text: String },
    Delete { id: Uuid },
    /// Delete every item and image
    Clear {
        #[arg(long)]
        yes: bool,
    },
    #[command(subcommand)]
    Boards(BoardCommands),
    #[command(subcommand)]
    Exclusions(ExclusionCommands),
    /// Import pinboards from a .bufr archive
    Import { path: PathBuf },
    /// Apply retention and history limit, remove orphaned images
    Maintenance,
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand, Debug)]
enum BoardCommands {
    List,
    Create {
        name: String,
        #[arg(long)]
        icon: Option<String>,
        /// Hex color; a free palette color when omitted
        #[arg(long)]
        color: Option<String>,
    },
    /// Items of a board in board order
    Show { board: Uuid },
    Add { board: Uuid, item: Uuid },
    Remove { board: Uuid, item: Uuid },
    Delete { board: Uuid },
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },
    /// Export one board to the export directory
    Export { board: Uuid },
    /// Export every non-empty board to one archive
    ExportAll,
}

#[derive(Subcommand, Debug)]
enum ExclusionCommands {
    List,
    Add { bundle_id: String, name: String },
    Remove { bundle_id: String },
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    Show,
    /// Days to keep history: 1, 7, 30, 365 or 0 for forever
    Retention { days: u32 },
    /// Maximum items kept; 0 for no limit
    Limit { items: usize },
    /// Turn the copy sound on (optionally choosing it) or off
    Sound {
        #[arg(value_parser = ["on", "off"])]
        state: String,
        name: Option<CopySound>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// ONE-SHOT CAPTURE
// ─────────────────────────────────────────────────────────────────────────────

/// Pasteboard holding a single pending copy
struct PendingCopy {
    change_count: AtomicI64,
    snapshot: MemorySnapshot,
}

impl Pasteboard for PendingCopy {
    fn change_count(&self) -> i64 {
        self.change_count.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Option<Box<dyn PasteboardSnapshot>> {
        Some(Box::new(self.snapshot.clone()) as Box<dyn PasteboardSnapshot>)
    }
}

struct FixedApp(FrontmostAppInfo);

impl FrontmostApp for FixedApp {
    fn frontmost(&self) -> FrontmostAppInfo {
        self.0.clone()
    }
}

/// Run one copy through the capture pipeline
async fn capture(app: &AppServices, snapshot: MemorySnapshot, bundle_id: Option<String>) -> Result<()> {
    let pasteboard = Arc::new(PendingCopy {
        change_count: AtomicI64::new(0),
        snapshot,
    });
    let frontmost = Arc::new(FixedApp(FrontmostAppInfo {
        bundle_id,
        name: None,
    }));
    let monitor = app.monitor(pasteboard.clone(), frontmost, Arc::new(SilentSoundPlayer));
    pasteboard.change_count.store(1, Ordering::SeqCst);

    match monitor.tick().await {
        TickOutcome::Captured(item) => {
            println!("{}", item.id);
            Ok(())
        }
        TickOutcome::Skipped(reason) => {
            println!("Not recorded: {:?}", reason);
            Ok(())
        }
        TickOutcome::Unchanged => Ok(()),
        TickOutcome::Failed => bail!("capture failed, see log output"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OUTPUT
// ─────────────────────────────────────────────────────────────────────────────

fn print_row(item: &ClipItem) {
    let mut flags = String::new();
    if item.is_pinned {
        flags.push('P');
    }
    if item.is_favorite {
        flags.push('*');
    }
    let summary = match item.content_type {
        ContentType::Image => item.image_path.clone().unwrap_or_else(|| "(image not stored)".to_string()),
        _ => item.display_text().replace('\n', " "),
    };
    println!(
        "{}  {}  {:<9} {:<2} {}",
        item.id,
        item.created_at.format("%Y-%m-%d %H:%M"),
        item.display_title(),
        flags,
        summary
    );
}

fn print_item(item: &ClipItem) {
    println!("id:        {}", item.id);
    println!("type:      {}", item.content_type.display_name());
    println!("created:   {}", item.created_at.to_rfc3339());
    if let Some(title) = &item.custom_title {
        println!("title:     {}", title);
    }
    if let Some(app) = item.source_app_name.as_ref().or(item.source_app_id.as_ref()) {
        println!("source:    {}", app);
    }
    println!("pinned:    {}", item.is_pinned);
    println!("favorite:  {}", item.is_favorite);
    println!("hash:      {}", item.hash);
    if let Some(path) = &item.image_path {
        println!("image:     {}", path);
    }
    if let Some(paths) = &item.file_paths {
        for path in paths {
            println!("file:      {}", path);
        }
    }
    if let Some(text) = &item.text_content {
        println!();
        println!("{}", text);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MAIN
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let paths = match cli.home {
        Some(dir) => AppPaths::with_support_dir(dir),
        None => AppPaths::resolve().context("Could not locate the support directory")?,
    };
    let app = AppServices::load(&paths)
        .with_context(|| format!("Failed to open {}", paths.support_dir.display()))?;

    match cli.command {
        Commands::List { limit, content_type } => {
            let items = match content_type {
                Some(content_type) => app.history().fetch_by_type(content_type, limit)?,
                None => app.history().fetch(limit)?,
            };
            items.iter().for_each(print_row);
        }
        Commands::Search { query } => {
            app.history().search(&query)?.iter().for_each(print_row);
        }
        Commands::Show { id } => {
            let item = app.history().get(id)?.with_context(|| format!("No item {}", id))?;
            print_item(&item);
            let boards = app.boards().pinboards_containing(id)?;
            for board in app.boards().pinboards().iter().filter(|b| boards.contains(&b.id)) {
                println!("board:     {}", board.name);
            }
        }
        Commands::Capture { text, app: bundle_id } => {
            capture(&app, MemorySnapshot::text(text), bundle_id).await?;
        }
        Commands::CaptureImage { path, app: bundle_id } => {
            let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            capture(&app, MemorySnapshot::png(bytes), bundle_id).await?;
        }
        Commands::Pin { id } => app.history().toggle_pinned(id)?,
        Commands::Favorite { id } => app.history().toggle_favorite(id)?,
        Commands::Rename { id, title } => app.history().update_custom_title(id, title.as_deref())?,
        Commands::Edit { id, text } => app.history().update_text_content(id, &text)?,
        Commands::Delete { id } => {
            if !app.delete_item(id).await? {
                bail!("No item {}", id);
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear history without --yes");
            }
            app.clear_history().await?;
        }
        Commands::Boards(command) => run_board_command(&app, command).await?,
        Commands::Exclusions(command) => match command {
            ExclusionCommands::List => {
                for excluded in app.exclusions().list()? {
                    println!("{:<40} {}", excluded.bundle_id, excluded.app_name);
                }
            }
            ExclusionCommands::Add { bundle_id, name } => app.exclusions().add(&bundle_id, &name)?,
            ExclusionCommands::Remove { bundle_id } => app.exclusions().remove(&bundle_id)?,
        },
        Commands::Import { path } => {
            let boards = app.import(&path, &CancellationToken::new()).await?;
            for board in boards {
                println!("{}  {}", board.id, board.name);
            }
        }
        Commands::Maintenance => {
            let report = app.run_maintenance().await;
            println!(
                "expired {}, trimmed {}, orphaned images {}",
                report.expired, report.trimmed, report.orphaned_blobs
            );
        }
        Commands::Settings(command) => {
            let mut settings = app.settings();
            match command {
                SettingsCommands::Show => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                    return Ok(());
                }
                SettingsCommands::Retention { days } => {
                    if !bufr::config::RETENTION_STEPS.contains(&days) {
                        bail!("Retention must be one of {:?}", bufr::config::RETENTION_STEPS);
                    }
                    settings.retention_days = days;
                }
                SettingsCommands::Limit { items } => settings.history_limit = items,
                SettingsCommands::Sound { state, name } => {
                    settings.play_copy_sound = state == "on";
                    if let Some(sound) = name {
                        settings.copy_sound = sound;
                    }
                }
            }
            app.update_settings(settings)?;
        }
    }

    Ok(())
}

async fn run_board_command(app: &AppServices, command: BoardCommands) -> Result<()> {
    let boards = app.boards();
    match command {
        BoardCommands::List => {
            for board in boards.fetch_pinboards()? {
                let count = boards.memberships(board.id)?.len();
                println!(
                    "{}  {:<7} {:>4}  {}",
                    board.id,
                    board.color.as_deref().unwrap_or("-"),
                    count,
                    board.name
                );
            }
        }
        BoardCommands::Create { name, icon, color } => {
            let color = color.unwrap_or_else(|| boards.suggest_color().to_string());
            let board = boards.create(&name, icon, Some(color))?;
            println!("{}", board.id);
        }
        BoardCommands::Show { board } => {
            boards.fetch_clips(board)?.iter().for_each(print_row);
        }
        BoardCommands::Add { board, item } => {
            if app.history().get(item)?.is_none() {
                bail!("No item {}", item);
            }
            if boards.get(board)?.is_none() {
                bail!("No board {}", board);
            }
            boards.add_clip(item, board)?;
        }
        BoardCommands::Remove { board, item } => boards.remove_clip(item, board)?,
        BoardCommands::Delete { board } => boards.delete(board)?,
        BoardCommands::DeleteAll { yes } => {
            if !yes {
                bail!("Refusing to delete all boards without --yes");
            }
            app.delete_all_boards()?;
        }
        BoardCommands::Export { board } => {
            let path = app.export_pinboard(board, &CancellationToken::new()).await?;
            println!("{}", path.display());
        }
        BoardCommands::ExportAll => {
            let path = app.export_all(&CancellationToken::new()).await?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
