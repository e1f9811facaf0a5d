use std::time::Instant;

use image::RgbImage;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::countdown::ColorClass;
use crate::hotkey::HotkeyAction;
use crate::sensor::SensorKind;

/// The watched game state was observed by a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    /// Match score in `[0, 1]`; push notifications always report 1.0.
    pub confidence: f32,
    pub timestamp: Instant,
}

/// Everything that flows into the coordinator. Producers run on their own
/// threads; the coordinator drains this channel in arrival order.
#[derive(Debug)]
pub enum CoreEvent {
    /// A sensor of generation `epoch` saw the event.
    Detection { epoch: u64, event: DetectionEvent },
    /// A bound global shortcut was pressed.
    Hotkey(HotkeyAction),
    /// Capture mode grabbed a key for `action`.
    KeyCaptured { action: HotkeyAction, key: String },
    /// The countdown with this session id ran out on its own.
    CountdownFinished { session: u64 },
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// An instruction from the presentation side.
    Command(ControlCommand),
    /// Ctrl+C or `quit`; stop every worker and exit.
    Shutdown,
}

/// Requests the presentation side can make of the core.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Capture the next key press anywhere and bind it to the action.
    Rebind(HotkeyAction),
    SwitchGame(String),
    ApplyPreset(String),
    SetConfidence(f32),
    SetDebug(bool),
    /// Same as the cancel shortcut.
    Cancel,
}

/// Fire-and-forget notifications for whatever renders the timer.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// New countdown text and its colour class.
    Display { text: String, color: ColorClass },
    /// The countdown was cancelled; show the waiting state.
    Reset,
    /// The countdown reached zero.
    Finished,
    Log(String),
    CriticalError(String),
    /// One match score per vision sample.
    Confidence(f32),
    /// Captured region with the best match outlined (debug mode only).
    DebugFrame(RgbImage),
    /// A sensor for `game` was (re)built.
    ProfileActivated { game: String, sensor: SensorKind },
    /// A detection started a countdown.
    Detected { confidence: f32 },
}

pub type CoreSender = mpsc::UnboundedSender<CoreEvent>;
pub type UiSender = mpsc::UnboundedSender<UiEvent>;
