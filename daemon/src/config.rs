use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::countdown::TimerSettings;
use crate::event::{CoreEvent, CoreSender};
use crate::hotkey::HotkeyAction;
use crate::push::PushSettings;
use crate::sensor::{SensorKind, SensorSpec};
use crate::vision::VisionSettings;

pub const DEFAULT_GAME: &str = "valorant";
pub const DEFAULT_MANUAL_ADJUSTMENT_MS: u32 = 100;
pub const DEFAULT_CONFIDENCE: f32 = 0.8;
pub const DEFAULT_GSI_PORT: u16 = 3000;
/// Preset assumed when the capture region matches none of a profile's presets.
pub const FALLBACK_PRESET: &str = "1080p";
/// Countdowns shorter than this are treated as misconfiguration.
pub const MIN_SPIKE_DURATION_SECS: f64 = 1.0;

/// Root configuration structure. Serialized to `<app dir>/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Key into `profiles` selecting the game being watched.
    pub active_game: String,
    pub global: GlobalConfig,
    pub profiles: BTreeMap<String, GameProfile>,
}

impl Default for Config {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("valorant".to_string(), GameProfile::valorant());
        profiles.insert("cs2".to_string(), GameProfile::cs2());
        Self {
            active_game: DEFAULT_GAME.to_string(),
            global: GlobalConfig::default(),
            profiles,
        }
    }
}

/// Settings that apply regardless of the active game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Amount a single increase/decrease shortcut shifts the countdown by.
    pub manual_adjustment_ms: u32,
    pub key_shortcuts: KeyShortcuts,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            manual_adjustment_ms: DEFAULT_MANUAL_ADJUSTMENT_MS,
            key_shortcuts: KeyShortcuts::default(),
        }
    }
}

impl GlobalConfig {
    pub fn manual_step_secs(&self) -> f64 {
        f64::from(self.manual_adjustment_ms) / 1000.0
    }
}

/// Key-combination strings for the three countdown shortcuts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyShortcuts {
    pub timer_up: String,
    pub timer_down: String,
    pub timer_stop: String,
}

impl Default for KeyShortcuts {
    fn default() -> Self {
        Self {
            timer_up: "page up".to_string(),
            timer_down: "page down".to_string(),
            timer_stop: "home".to_string(),
        }
    }
}

impl KeyShortcuts {
    pub fn get(&self, action: HotkeyAction) -> &str {
        match action {
            HotkeyAction::Increase => &self.timer_up,
            HotkeyAction::Decrease => &self.timer_down,
            HotkeyAction::Cancel => &self.timer_stop,
        }
    }

    pub fn set(&mut self, action: HotkeyAction, key: &str) {
        let slot = match action {
            HotkeyAction::Increase => &mut self.timer_up,
            HotkeyAction::Decrease => &mut self.timer_down,
            HotkeyAction::Cancel => &mut self.timer_stop,
        };
        *slot = key.to_string();
    }

    pub fn iter(&self) -> impl Iterator<Item = (HotkeyAction, &str)> {
        HotkeyAction::ALL.into_iter().map(|a| (a, self.get(a)))
    }
}

/// Screen rectangle in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub top: i32,
    pub left: i32,
    pub width: u32,
    pub height: u32,
}

/// Detection and timing parameters for one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameProfile {
    pub display_name: String,
    /// Which sensor watches for the plant.
    pub detection: SensorKind,
    pub monitor_region: CaptureRegion,
    /// Minimum match score treated as a detection. Clamped to [0, 1].
    pub visual_confidence: f32,
    /// Countdown length in seconds.
    pub spike_duration: f64,
    /// Remaining seconds at or below which the display turns "danger".
    pub defuse_warning_time: f64,
    /// File stem of the template image inside the templates directory.
    pub template: String,
    /// Named capture regions, one per supported resolution.
    pub presets: BTreeMap<String, CaptureRegion>,
    /// Local port the game-state integration posts to.
    pub gsi_port: u16,
}

impl Default for GameProfile {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            detection: SensorKind::Vision,
            monitor_region: CaptureRegion { top: 0, left: 0, width: 100, height: 100 },
            visual_confidence: DEFAULT_CONFIDENCE,
            spike_duration: 45.0,
            defuse_warning_time: 7.0,
            template: String::new(),
            presets: BTreeMap::new(),
            gsi_port: DEFAULT_GSI_PORT,
        }
    }
}

impl GameProfile {
    fn valorant() -> Self {
        let presets = BTreeMap::from([
            ("1080p".to_string(), CaptureRegion { top: 14, left: 918, width: 86, height: 81 }),
            ("1440p".to_string(), CaptureRegion { top: 21, left: 1225, width: 111, height: 108 }),
            ("768p".to_string(), CaptureRegion { top: 11, left: 654, width: 62, height: 56 }),
        ]);
        Self {
            display_name: "Valorant".to_string(),
            detection: SensorKind::Vision,
            monitor_region: presets[FALLBACK_PRESET],
            visual_confidence: DEFAULT_CONFIDENCE,
            spike_duration: 45.0,
            defuse_warning_time: 7.0,
            template: "valorant".to_string(),
            presets,
            gsi_port: DEFAULT_GSI_PORT,
        }
    }

    fn cs2() -> Self {
        Self {
            display_name: "CS2".to_string(),
            detection: SensorKind::Push,
            monitor_region: CaptureRegion { top: 0, left: 913, width: 94, height: 46 },
            visual_confidence: DEFAULT_CONFIDENCE,
            spike_duration: 40.0,
            defuse_warning_time: 10.0,
            template: "cs2_c4".to_string(),
            presets: BTreeMap::new(),
            gsi_port: DEFAULT_GSI_PORT,
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        if self.visual_confidence.is_nan() {
            return DEFAULT_CONFIDENCE;
        }
        self.visual_confidence.clamp(0.0, 1.0)
    }

    pub fn countdown_duration(&self) -> Duration {
        let secs = if self.spike_duration.is_finite() {
            self.spike_duration.max(MIN_SPIKE_DURATION_SECS)
        } else {
            MIN_SPIKE_DURATION_SECS
        };
        Duration::from_secs_f64(secs)
    }

    pub fn warning_threshold(&self) -> f64 {
        if self.defuse_warning_time.is_finite() {
            self.defuse_warning_time.max(0.0)
        } else {
            0.0
        }
    }

    /// Snapshot of the values a countdown needs for its whole lifetime.
    pub fn timer_settings(&self) -> TimerSettings {
        TimerSettings {
            duration: self.countdown_duration(),
            warning_threshold: self.warning_threshold(),
        }
    }

    /// Name of the preset whose region equals the current capture region.
    pub fn active_preset(&self) -> Option<&str> {
        self.presets
            .iter()
            .find(|(_, region)| **region == self.monitor_region)
            .map(|(name, _)| name.as_str())
    }

    /// `<template>_<preset>.png` for profiles with presets, `<template>.png` otherwise.
    pub fn template_path(&self, templates_dir: &Path) -> PathBuf {
        let file = if self.presets.is_empty() {
            format!("{}.png", self.template)
        } else {
            let preset = self.active_preset().unwrap_or(FALLBACK_PRESET);
            format!("{}_{}.png", self.template, preset)
        };
        templates_dir.join(file)
    }

    /// Snapshot of everything needed to build this profile's sensor.
    pub fn sensor_spec(&self, templates_dir: &Path) -> SensorSpec {
        match self.detection {
            SensorKind::Vision => SensorSpec::Vision(VisionSettings::new(
                self.monitor_region,
                self.confidence_threshold(),
                self.template_path(templates_dir),
            )),
            SensorKind::Push => SensorSpec::Push(PushSettings::localhost(self.gsi_port)),
        }
    }
}

impl Config {
    pub fn active_profile(&self) -> Result<&GameProfile> {
        self.profiles
            .get(&self.active_game)
            .ok_or_else(|| anyhow!("No profile named '{}' in config", self.active_game))
    }

    fn active_profile_mut(&mut self) -> Result<&mut GameProfile> {
        let key = self.active_game.clone();
        self.profiles
            .get_mut(&key)
            .ok_or_else(|| anyhow!("No profile named '{key}' in config"))
    }

    /// Display name of the active profile, falling back to its key.
    pub fn active_display_name(&self) -> String {
        match self.active_profile() {
            Ok(p) if !p.display_name.is_empty() => p.display_name.clone(),
            _ => self.active_game.clone(),
        }
    }

    pub fn set_active_game(&mut self, key: &str) -> Result<()> {
        let key = key.trim().to_lowercase();
        if !self.profiles.contains_key(&key) {
            let known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            bail!("Unknown game '{key}' (known: {})", known.join(", "));
        }
        self.active_game = key;
        Ok(())
    }

    /// Replaces the active profile's capture region with the named preset.
    pub fn apply_preset(&mut self, preset: &str) -> Result<()> {
        let game = self.active_game.clone();
        let profile = self.active_profile_mut()?;
        let region = *profile
            .presets
            .get(preset)
            .ok_or_else(|| anyhow!("No preset '{preset}' for {game}"))?;
        profile.monitor_region = region;
        Ok(())
    }

    /// Stores a clamped confidence threshold on the active profile.
    pub fn set_confidence(&mut self, value: f32) -> Result<f32> {
        if !value.is_finite() {
            bail!("Confidence must be a number between 0 and 1");
        }
        let clamped = value.clamp(0.0, 1.0);
        self.active_profile_mut()?.visual_confidence = clamped;
        Ok(clamped)
    }
}

/// Inserts every key of `defaults` that `target` lacks, recursing into tables
/// present in both. Existing values are never overwritten. Returns whether
/// anything was added.
pub fn backfill(target: &mut toml::Table, defaults: &toml::Table) -> bool {
    let mut changed = false;
    for (key, default) in defaults {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), default.clone());
                changed = true;
            }
            Some(toml::Value::Table(existing)) => {
                if let toml::Value::Table(default_table) = default {
                    changed |= backfill(existing, default_table);
                }
            }
            Some(_) => {}
        }
    }
    changed
}

/// Loads the config at `path`, back-filling missing keys from the defaults.
///
/// A missing file is created with the defaults. When back-filling added
/// anything, the merged document is written back immediately so the file on
/// disk always lists every setting. Returns an error if the file exists but
/// cannot be read or parsed.
pub fn load_and_backfill(path: &Path) -> Result<Config> {
    if !path.exists() {
        let config = Config::default();
        save(path, &config)?;
        info!("[config] Wrote default config to {}", path.display());
        return Ok(config);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    let defaults = toml::Table::try_from(Config::default())
        .context("Failed to serialize default config")?;

    let changed = backfill(&mut table, &defaults);
    let config: Config = toml::Value::Table(table)
        .try_into()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    if changed {
        save(path, &config)?;
        info!("[config] Back-filled missing settings in {}", path.display());
    }
    Ok(config)
}

/// Serializes `config` to TOML at `path`, creating the parent directory.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: CoreSender) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("[config] Failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let Some(watch_dir) = path.parent().map(Path::to_path_buf) else {
        warn!("[config] Config path has no parent directory");
        return;
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!("[config] Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_and_backfill(&path) {
                Ok(config) => {
                    if tx.send(CoreEvent::ConfigReloaded(config)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("[config] Failed to reload config: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_config_watches_valorant() {
        let c = Config::default();
        assert_eq!(c.active_game, DEFAULT_GAME);
        let p = c.active_profile().unwrap();
        assert_eq!(p.detection, SensorKind::Vision);
        assert_eq!(p.spike_duration, 45.0);
        assert_eq!(p.defuse_warning_time, 7.0);
        assert_eq!(p.active_preset(), Some("1080p"));
    }

    #[test]
    fn default_cs2_profile_uses_push_on_3000() {
        let c = Config::default();
        let cs2 = &c.profiles["cs2"];
        assert_eq!(cs2.detection, SensorKind::Push);
        assert_eq!(cs2.gsi_port, 3000);
        assert_eq!(cs2.spike_duration, 40.0);
    }

    #[test]
    fn global_defaults() {
        let g = GlobalConfig::default();
        assert_eq!(g.manual_adjustment_ms, 100);
        assert_eq!(g.manual_step_secs(), 0.1);
        assert_eq!(g.key_shortcuts.timer_up, "page up");
        assert_eq!(g.key_shortcuts.timer_down, "page down");
        assert_eq!(g.key_shortcuts.timer_stop, "home");
    }

    // ── key shortcuts ─────────────────────────────────────────────────────────

    #[test]
    fn key_shortcuts_get_and_set_by_action() {
        let mut k = KeyShortcuts::default();
        k.set(HotkeyAction::Cancel, "end");
        assert_eq!(k.get(HotkeyAction::Cancel), "end");
        assert_eq!(k.get(HotkeyAction::Increase), "page up");
        let all: Vec<_> = k.iter().collect();
        assert_eq!(all.len(), 3);
    }

    // ── profile snapshots ─────────────────────────────────────────────────────

    #[test]
    fn confidence_is_clamped() {
        let mut p = GameProfile::valorant();
        p.visual_confidence = 1.7;
        assert_eq!(p.confidence_threshold(), 1.0);
        p.visual_confidence = -0.2;
        assert_eq!(p.confidence_threshold(), 0.0);
    }

    #[test]
    fn duration_has_a_floor() {
        let mut p = GameProfile::valorant();
        p.spike_duration = 0.0;
        assert_eq!(p.countdown_duration(), Duration::from_secs(1));
        p.spike_duration = 40.5;
        assert_eq!(p.countdown_duration(), Duration::from_millis(40_500));
    }

    #[test]
    fn timer_settings_snapshot() {
        let s = GameProfile::valorant().timer_settings();
        assert_eq!(s.duration, Duration::from_secs(45));
        assert_eq!(s.warning_threshold, 7.0);
    }

    #[test]
    fn template_path_follows_active_preset() {
        let dir = Path::new("/t");
        let mut p = GameProfile::valorant();
        assert_eq!(p.template_path(dir), dir.join("valorant_1080p.png"));

        p.monitor_region = p.presets["768p"];
        assert_eq!(p.template_path(dir), dir.join("valorant_768p.png"));

        // A hand-calibrated region matches no preset.
        p.monitor_region.width += 1;
        assert_eq!(p.active_preset(), None);
        assert_eq!(p.template_path(dir), dir.join("valorant_1080p.png"));
    }

    #[test]
    fn template_path_without_presets() {
        let p = GameProfile::cs2();
        assert_eq!(p.template_path(Path::new("/t")), Path::new("/t").join("cs2_c4.png"));
    }

    #[test]
    fn sensor_spec_matches_detection_kind() {
        let c = Config::default();
        let dir = Path::new("/t");
        assert_eq!(c.profiles["valorant"].sensor_spec(dir).kind(), SensorKind::Vision);
        match c.profiles["cs2"].sensor_spec(dir) {
            SensorSpec::Push(s) => assert_eq!(s.addr.port(), 3000),
            other => panic!("expected push spec, got {other:?}"),
        }
    }

    // ── mutators ──────────────────────────────────────────────────────────────

    #[test]
    fn set_active_game_rejects_unknown() {
        let mut c = Config::default();
        assert!(c.set_active_game("apex").is_err());
        assert_eq!(c.active_game, "valorant");
        c.set_active_game("CS2").unwrap();
        assert_eq!(c.active_game, "cs2");
    }

    #[test]
    fn apply_preset_sets_region() {
        let mut c = Config::default();
        c.apply_preset("1440p").unwrap();
        let p = c.active_profile().unwrap();
        assert_eq!(p.monitor_region, p.presets["1440p"]);
        assert!(c.apply_preset("4k").is_err());
    }

    #[test]
    fn set_confidence_clamps_and_rejects_nan() {
        let mut c = Config::default();
        assert_eq!(c.set_confidence(0.65).unwrap(), 0.65);
        assert_eq!(c.set_confidence(3.0).unwrap(), 1.0);
        assert!(c.set_confidence(f32::NAN).is_err());
    }

    // ── backfill ──────────────────────────────────────────────────────────────

    #[test]
    fn backfill_adds_missing_keys_without_overwriting() {
        let mut target: toml::Table = toml::from_str("a = 1\n[t]\nx = 5\n").unwrap();
        let defaults: toml::Table = toml::from_str("a = 2\nb = 3\n[t]\nx = 0\ny = 0\n").unwrap();
        assert!(backfill(&mut target, &defaults));
        assert_eq!(target["a"].as_integer(), Some(1));
        assert_eq!(target["b"].as_integer(), Some(3));
        assert_eq!(target["t"]["x"].as_integer(), Some(5));
        assert_eq!(target["t"]["y"].as_integer(), Some(0));
    }

    #[test]
    fn backfill_reports_no_change_on_complete_table() {
        let defaults = toml::Table::try_from(Config::default()).unwrap();
        let mut target = defaults.clone();
        assert!(!backfill(&mut target, &defaults));
    }

    // ── load_and_backfill ─────────────────────────────────────────────────────

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = load_and_backfill(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_file_is_backfilled_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
active_game = "cs2"

[global]
manual_adjustment_ms = 250

[profiles.cs2]
spike_duration = 41.0
"#,
        );

        let config = load_and_backfill(&path).unwrap();
        assert_eq!(config.active_game, "cs2");
        assert_eq!(config.global.manual_adjustment_ms, 250);
        assert_eq!(config.global.key_shortcuts, KeyShortcuts::default());
        let cs2 = &config.profiles["cs2"];
        assert_eq!(cs2.spike_duration, 41.0);
        assert_eq!(cs2.detection, SensorKind::Push);
        assert!(config.profiles.contains_key("valorant"));

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("timer_stop"));
        assert!(on_disk.contains("defuse_warning_time"));
        let reparsed: Config = toml::from_str(&on_disk).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn complete_file_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save(&path, &Config::default()).unwrap();
        let marker = "# hand-written comment\n";
        let content = format!("{marker}{}", std::fs::read_to_string(&path).unwrap());
        std::fs::write(&path, &content).unwrap();

        load_and_backfill(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with(marker));
    }

    #[test]
    fn custom_profile_gets_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
active_game = "custom"

[profiles.custom]
display_name = "Custom"
template = "custom"
"#,
        );
        let config = load_and_backfill(&path).unwrap();
        let p = config.active_profile().unwrap();
        assert_eq!(p.display_name, "Custom");
        assert_eq!(p.visual_confidence, DEFAULT_CONFIDENCE);
        assert_eq!(p.gsi_port, DEFAULT_GSI_PORT);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "this is not valid toml ][[[");
        assert!(load_and_backfill(&path).is_err());
    }

    #[test]
    fn wrong_value_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[global]\nmanual_adjustment_ms = \"fast\"\n");
        assert!(load_and_backfill(&path).is_err());
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.global.key_shortcuts.set(HotkeyAction::Increase, "ctrl+up");
        save(&path, &config).unwrap();
        assert_eq!(load_and_backfill(&path).unwrap(), config);
    }
}
