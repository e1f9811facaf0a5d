/// The core event loop: owns the active sensor, the countdown and the config.
///
/// Every producer (sensors, countdown, hotkeys, config watcher, console) feeds
/// one channel; the coordinator handles events strictly in arrival order. At
/// most one sensor is alive at a time: a replacement is only started after its
/// predecessor has been stopped and joined. Detections carry the epoch of the
/// sensor that produced them, and anything from an older epoch is dropped.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{self, Config};
use crate::countdown::Countdown;
use crate::event::{ControlCommand, CoreEvent, CoreSender, DetectionEvent, UiEvent, UiSender};
use crate::hotkey::{HotkeyAction, HotkeyChannel};
use crate::paths::AppPaths;
use crate::sensor::{Sensor, SensorFactory, SensorSpec};

struct ActiveSensor {
    epoch: u64,
    spec: SensorSpec,
    sensor: Box<dyn Sensor>,
}

pub struct Coordinator {
    config: Config,
    config_path: PathBuf,
    templates_dir: PathBuf,
    factory: Box<dyn SensorFactory>,
    clock: Arc<dyn Clock>,
    hotkeys: Option<HotkeyChannel>,
    core: CoreSender,
    ui: UiSender,
    sensor: Option<ActiveSensor>,
    countdown: Option<Countdown>,
    /// Generation of the most recently built sensor.
    epoch: u64,
    /// Id of the most recently created countdown.
    sessions: u64,
    debug: bool,
}

impl Coordinator {
    pub fn new(
        config: Config,
        paths: &AppPaths,
        factory: Box<dyn SensorFactory>,
        clock: Arc<dyn Clock>,
        hotkeys: HotkeyChannel,
        core: CoreSender,
        ui: UiSender,
    ) -> Self {
        Self {
            config,
            config_path: paths.config_file().to_path_buf(),
            templates_dir: paths.templates_dir(),
            factory,
            clock,
            hotkeys: Some(hotkeys),
            core,
            ui,
            sensor: None,
            countdown: None,
            epoch: 0,
            sessions: 0,
            debug: false,
        }
    }

    /// Builds the sensor for the active profile.
    pub fn start(&mut self) {
        self.reconcile_sensor();
    }

    /// Starts the active sensor and drains `rx` until shutdown.
    pub async fn run(mut self, mut rx: UnboundedReceiver<CoreEvent>) {
        self.start();
        while let Some(event) = rx.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
        self.shutdown();
    }

    pub fn handle(&mut self, event: CoreEvent) -> ControlFlow<()> {
        match event {
            CoreEvent::Detection { epoch, event } => self.on_detection(epoch, event),
            CoreEvent::Hotkey(action) => self.on_hotkey(action),
            CoreEvent::KeyCaptured { action, key } => self.on_key_captured(action, &key),
            CoreEvent::CountdownFinished { session } => self.on_countdown_finished(session),
            CoreEvent::ConfigReloaded(config) => self.on_config_reloaded(config),
            CoreEvent::Command(command) => self.on_command(command),
            CoreEvent::Shutdown => {
                info!("Shutting down");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Stops the sensor, the countdown and the keyboard hook. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.stop_sensor();
        self.end_session();
        if let Some(hotkeys) = self.hotkeys.take() {
            join_blocking(|| hotkeys.stop());
        }
    }

    // ── Detections and countdown ──────────────────────────────────────────────

    fn on_detection(&mut self, epoch: u64, event: DetectionEvent) {
        if self.sensor.as_ref().map(|s| s.epoch) != Some(epoch) {
            debug!("[coordinator] Dropping detection from retired sensor {epoch}");
            return;
        }
        if self.countdown.as_ref().is_some_and(Countdown::is_running) {
            debug!("[coordinator] Countdown already running; ignoring detection");
            return;
        }

        let settings = match self.config.active_profile() {
            Ok(profile) => profile.timer_settings(),
            Err(e) => {
                warn!("[coordinator] {e}");
                return;
            }
        };

        self.sessions += 1;
        let mut countdown = Countdown::new(
            self.sessions,
            settings,
            self.clock.clone(),
            self.ui.clone(),
            self.core.clone(),
        );
        let _ = self.ui.send(UiEvent::Detected { confidence: event.confidence });
        match countdown.start(settings.duration) {
            Ok(()) => self.countdown = Some(countdown),
            Err(e) => {
                error!("[coordinator] Countdown failed to start: {e}");
                let _ = self.ui.send(UiEvent::CriticalError(e.to_string()));
            }
        }
    }

    fn on_hotkey(&mut self, action: HotkeyAction) {
        let step = self.config.global.manual_step_secs();
        let delta = match action {
            HotkeyAction::Increase => step,
            HotkeyAction::Decrease => -step,
            HotkeyAction::Cancel => {
                self.cancel_countdown();
                return;
            }
        };
        match &self.countdown {
            Some(countdown) if countdown.adjust(delta) => debug!(
                "[coordinator] Adjusted countdown by {delta:+.2}s ({:.1}s left)",
                countdown.remaining().as_secs_f64()
            ),
            _ => debug!("[coordinator] No countdown to adjust"),
        }
    }

    fn cancel_countdown(&mut self) {
        let cancelled = self
            .countdown
            .take()
            .is_some_and(|mut c| join_blocking(|| c.cancel()));
        if cancelled {
            let _ = self.ui.send(UiEvent::Log("Timer manually stopped.".to_string()));
        } else {
            // Nothing running; still clear a lingering "0" from the display.
            let _ = self.ui.send(UiEvent::Reset);
        }
    }

    fn on_countdown_finished(&mut self, session: u64) {
        if self.countdown.as_ref().is_some_and(|c| c.id() == session) {
            self.countdown = None;
            let _ = self
                .ui
                .send(UiEvent::Log("Timer finished. Ready for next event.".to_string()));
        }
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    fn on_config_reloaded(&mut self, new: Config) {
        if new == self.config {
            debug!("[config] Reloaded config is unchanged");
            return;
        }
        info!("[config] Config reloaded");
        let shortcuts_changed = new.global.key_shortcuts != self.config.global.key_shortcuts;
        let game_changed = new.active_game != self.config.active_game;
        self.config = new;

        if shortcuts_changed {
            self.register_hotkeys();
        }
        if game_changed {
            self.end_session();
        }
        self.reconcile_sensor();
    }

    fn on_key_captured(&mut self, action: HotkeyAction, key: &str) {
        self.config.global.key_shortcuts.set(action, key);
        self.persist();
        self.register_hotkeys();
        let _ = self
            .ui
            .send(UiEvent::Log(format!("Set '{}' to '{key}'", action.config_key())));
    }

    fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Rebind(action) => {
                if let Some(hotkeys) = &self.hotkeys {
                    hotkeys.capture_next(action);
                }
                self.log(format!("Press a key for '{}'...", action.config_key()));
            }
            ControlCommand::SwitchGame(key) => {
                if key.trim().eq_ignore_ascii_case(&self.config.active_game) {
                    self.log(format!("Already watching {}", self.config.active_display_name()));
                    return;
                }
                match self.config.set_active_game(&key) {
                    Ok(()) => {
                        self.persist();
                        self.end_session();
                        self.reconcile_sensor();
                        self.log(format!("Switched to {}", self.config.active_display_name()));
                    }
                    Err(e) => self.log(e.to_string()),
                }
            }
            ControlCommand::ApplyPreset(name) => match self.config.apply_preset(&name) {
                Ok(()) => {
                    self.persist();
                    self.reconcile_sensor();
                    self.log(format!("Applied preset {name}"));
                }
                Err(e) => self.log(e.to_string()),
            },
            ControlCommand::SetConfidence(value) => match self.config.set_confidence(value) {
                Ok(stored) => {
                    self.persist();
                    self.reconcile_sensor();
                    self.log(format!("Confidence threshold set to {:.0}%", stored * 100.0));
                }
                Err(e) => self.log(e.to_string()),
            },
            ControlCommand::SetDebug(enabled) => {
                self.debug = enabled;
                if let Some(active) = &self.sensor {
                    active.sensor.set_debug(enabled);
                }
                self.log(format!("Debug mode {}", if enabled { "ON" } else { "OFF" }));
            }
            ControlCommand::Cancel => self.cancel_countdown(),
        }
    }

    fn register_hotkeys(&self) {
        let Some(hotkeys) = &self.hotkeys else { return };
        let bound = hotkeys.register(&self.config.global.key_shortcuts);
        if bound < HotkeyAction::ALL.len() {
            self.log(format!(
                "Only {bound} of {} shortcuts could be bound; check the log",
                HotkeyAction::ALL.len()
            ));
        }
    }

    fn persist(&self) {
        if let Err(e) = config::save(&self.config_path, &self.config) {
            warn!("[config] Failed to save config: {e:#}");
        }
    }

    fn log(&self, message: String) {
        let _ = self.ui.send(UiEvent::Log(message));
    }

    // ── Sensor lifecycle ──────────────────────────────────────────────────────

    /// Cancels a running countdown because the game it belonged to is gone.
    fn end_session(&mut self) {
        if let Some(mut countdown) = self.countdown.take() {
            join_blocking(|| countdown.cancel());
        }
    }

    fn stop_sensor(&mut self) {
        if let Some(mut active) = self.sensor.take() {
            debug!("[coordinator] Stopping sensor {}", active.epoch);
            join_blocking(|| active.sensor.stop());
        }
    }

    /// Makes the running sensor match the active profile, rebuilding it only
    /// when its `SensorSpec` changed.
    fn reconcile_sensor(&mut self) {
        let spec = match self.config.active_profile() {
            Ok(profile) => profile.sensor_spec(&self.templates_dir),
            Err(e) => {
                self.stop_sensor();
                let _ = self.ui.send(UiEvent::CriticalError(e.to_string()));
                return;
            }
        };
        if self.sensor.as_ref().is_some_and(|active| active.spec == spec) {
            return;
        }

        // The old sensor is fully joined before its replacement exists.
        self.stop_sensor();
        self.epoch += 1;

        let mut sensor = match self.factory.build(&spec) {
            Ok(sensor) => sensor,
            Err(e) => {
                error!("[coordinator] Failed to build sensor: {e}");
                let _ = self.ui.send(UiEvent::CriticalError(e.to_string()));
                return;
            }
        };
        sensor.set_debug(self.debug);
        if let Err(e) = sensor.start(self.epoch, self.core.clone(), self.ui.clone()) {
            error!("[coordinator] Failed to start sensor: {e}");
            let _ = self.ui.send(UiEvent::CriticalError(e.to_string()));
            return;
        }

        info!(
            "[coordinator] Sensor {} started ({:?}) for {}",
            self.epoch,
            sensor.kind(),
            self.config.active_game
        );
        let _ = self.ui.send(UiEvent::ProfileActivated {
            game: self.config.active_display_name(),
            sensor: spec.kind(),
        });
        self.sensor = Some(ActiveSensor { epoch: self.epoch, spec, sensor });
    }
}

/// Runs `f`, which joins a worker thread, without stalling other tasks when
/// called from a multi-threaded runtime.
fn join_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
