mod capture;
mod clock;
mod config;
mod console;
mod coordinator;
mod countdown;
mod event;
mod hotkey;
mod matcher;
mod paths;
mod push;
mod sensor;
mod status;
mod vision;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::coordinator::Coordinator;
use crate::event::CoreEvent;
use crate::hotkey::HotkeyChannel;
use crate::paths::AppPaths;
use crate::sensor::LiveSensors;

/// How long to wait for the last status write after the coordinator exits.
const STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bomb-plant countdown daemon.
#[derive(Parser, Debug)]
#[command(name = "plantwatch", version, about)]
struct Cli {
    /// Config file to use; status and templates are kept beside it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Switch to this game profile before starting.
    #[arg(long, value_name = "NAME")]
    game: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Do not read commands from stdin.
    #[arg(long)]
    no_console: bool,
}

/// Initialize logging, writing to PLANTWATCH_LOG_PATH if set, otherwise stderr.
fn init_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    if let Ok(path) = std::env::var("PLANTWATCH_LOG_PATH") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ── App data directory ────────────────────────────────────────────────────
    let paths = match cli.config {
        Some(file) => AppPaths::from_config_file(file),
        None => AppPaths::default_location(),
    };
    if let Err(e) = std::fs::create_dir_all(paths.root()) {
        error!("Failed to create app data directory {}: {e}", paths.root().display());
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut initial_config = config::load_and_backfill(paths.config_file()).unwrap_or_else(|e| {
        warn!("[config] Error (using defaults): {e:#}");
        config::Config::default()
    });
    if let Some(game) = &cli.game {
        match initial_config.set_active_game(game) {
            Ok(()) => {
                if let Err(e) = config::save(paths.config_file(), &initial_config) {
                    warn!("[config] {e:#}");
                }
            }
            Err(e) => warn!("[config] {e}"),
        }
    }

    let (core_tx, core_rx) = mpsc::unbounded_channel::<CoreEvent>();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    // ── Background tasks ──────────────────────────────────────────────────────
    let status_task = tokio::spawn(status::run(ui_rx, paths.clone()));
    tokio::spawn(config::watch_config(paths.config_file().to_path_buf(), core_tx.clone()));

    if !cli.no_console {
        console::spawn(core_tx.clone());
    }

    // Graceful shutdown on Ctrl+C.
    {
        let tx = core_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(CoreEvent::Shutdown);
            }
        });
    }

    let hotkeys = HotkeyChannel::start(&initial_config.global.key_shortcuts, core_tx.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let factory = Box::new(LiveSensors::new(clock.clone()));

    info!("plantwatch v{} started", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", paths.config_file().display());

    // ── Event loop ────────────────────────────────────────────────────────────
    Coordinator::new(initial_config, &paths, factory, clock, hotkeys, core_tx, ui_tx)
        .run(core_rx)
        .await;

    if tokio::time::timeout(STATUS_DRAIN_TIMEOUT, status_task).await.is_err() {
        warn!("[status] Timed out flushing status");
    }
}
