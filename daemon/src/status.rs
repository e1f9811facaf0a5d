use chrono::Local;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::countdown::ColorClass;
use crate::event::UiEvent;
use crate::paths::AppPaths;
use crate::sensor::SensorKind;

/// What the overlay should currently show.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    /// Waiting for a plant.
    Idle,
    /// A countdown is on screen.
    Running,
    /// A sensor failed and needs attention.
    Error,
}

/// Runtime status written by the daemon to `status.toml`.
/// Overlays and scripts read this file (read-only) to render the timer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OverlayStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: TimerState,
    /// Display name of the active game profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_game: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorKind>,
    /// Text currently shown by the timer ("45", "0", "WAITING", "ERROR").
    pub display: String,
    pub color: ColorClass,
    /// Latest vision match score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// RFC 3339 timestamp of the detection that started the latest countdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_detection: Option<String>,
    /// Human-readable message for the latest sensor failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const WAITING_TEXT: &str = "WAITING";
pub const ERROR_TEXT: &str = "ERROR";

impl OverlayStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: TimerState::Idle,
            active_game: None,
            sensor: None,
            display: WAITING_TEXT.to_string(),
            color: ColorClass::Normal,
            confidence: None,
            last_detection: None,
            error: None,
        }
    }

    fn show_waiting(&mut self) {
        self.state = TimerState::Idle;
        self.display = WAITING_TEXT.to_string();
        self.color = ColorClass::Normal;
    }

    /// Folds one event into the status. Returns true when the file should be
    /// rewritten; per-sample confidence updates alone do not trigger a write.
    pub fn apply(&mut self, event: &UiEvent) -> bool {
        match event {
            UiEvent::Display { text, color } => {
                self.state = TimerState::Running;
                self.display = text.clone();
                self.color = *color;
                true
            }
            UiEvent::Reset => {
                self.show_waiting();
                true
            }
            UiEvent::Finished => {
                self.state = TimerState::Idle;
                true
            }
            UiEvent::Log(_) | UiEvent::DebugFrame(_) => false,
            UiEvent::CriticalError(message) => {
                self.state = TimerState::Error;
                self.display = ERROR_TEXT.to_string();
                self.color = ColorClass::Danger;
                self.error = Some(message.clone());
                true
            }
            UiEvent::Confidence(score) => {
                self.confidence = Some(*score);
                false
            }
            UiEvent::ProfileActivated { game, sensor } => {
                self.active_game = Some(game.clone());
                self.sensor = Some(*sensor);
                self.confidence = None;
                self.error = None;
                self.show_waiting();
                true
            }
            UiEvent::Detected { confidence } => {
                self.confidence = Some(*confidence);
                self.last_detection = Some(Local::now().to_rfc3339());
                true
            }
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking; a status write failure should
/// never crash the daemon.
pub fn write_status(path: &Path, status: &OverlayStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("[status] Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("[status] Failed to write status file: {e}");
            }
        }
        Err(e) => warn!("[status] Failed to serialize status: {e}"),
    }
}

fn save_debug_frame(path: PathBuf, frame: RgbImage) {
    if let Err(e) = frame.save(&path) {
        warn!("[status] Failed to save debug frame to {}: {e}", path.display());
    }
}

/// Presentation bridge: logs every event and mirrors the timer into
/// `status.toml` until all senders are dropped.
pub async fn run(mut rx: mpsc::UnboundedReceiver<UiEvent>, paths: AppPaths) {
    let status_path = paths.status_file();
    let mut status = OverlayStatus::new();
    write_status(&status_path, &status);

    while let Some(event) = rx.recv().await {
        match &event {
            UiEvent::Display { text, color } => debug!("[timer] {text} ({color:?})"),
            UiEvent::Reset => info!("[timer] Reset"),
            UiEvent::Finished => info!("[timer] Finished"),
            UiEvent::Log(message) => info!("{message}"),
            UiEvent::CriticalError(message) => error!("{message}"),
            UiEvent::Confidence(score) => debug!("[vision] Match {:.0}%", score * 100.0),
            UiEvent::ProfileActivated { game, sensor } => {
                info!("Active profile: {game} ({sensor:?} detection)")
            }
            UiEvent::Detected { confidence } => {
                info!("Bomb detected! Match: {:.0}%", confidence * 100.0)
            }
            UiEvent::DebugFrame(_) => {}
        }

        if let UiEvent::DebugFrame(frame) = event {
            let path = paths.debug_frame_file();
            let _ = tokio::task::spawn_blocking(move || save_debug_frame(path, frame)).await;
            continue;
        }

        if status.apply(&event) {
            write_status(&status_path, &status);
        }
    }
}
