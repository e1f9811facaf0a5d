use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::capture::FrameSource;
use crate::clock::Clock;
use crate::config::CaptureRegion;
use crate::event::{CoreEvent, CoreSender, DetectionEvent, UiEvent, UiSender};
use crate::matcher::{self, Template};
use crate::sensor::{Sensor, SensorError, SensorKind};

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
/// Detections closer together than this are collapsed into one.
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);
pub const ERROR_BACKOFF: Duration = Duration::from_secs(2);
/// Debug frames outline the best match only above this score.
pub const DEBUG_OUTLINE_MIN_SCORE: f32 = 0.4;

/// Snapshot of everything the vision sensor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionSettings {
    pub region: CaptureRegion,
    /// Scores strictly above this count as a detection.
    pub threshold: f32,
    pub template_path: PathBuf,
    pub sample_interval: Duration,
    pub suppression: Duration,
    pub error_backoff: Duration,
}

impl VisionSettings {
    pub fn new(region: CaptureRegion, threshold: f32, template_path: PathBuf) -> Self {
        Self {
            region,
            threshold,
            template_path,
            sample_interval: SAMPLE_INTERVAL,
            suppression: SUPPRESSION_WINDOW,
            error_backoff: ERROR_BACKOFF,
        }
    }
}

/// Turns a stream of scores into discrete detections.
#[derive(Debug)]
pub struct Debouncer {
    threshold: f32,
    window: Duration,
    last_fire: Option<Instant>,
}

impl Debouncer {
    pub fn new(threshold: f32, window: Duration) -> Self {
        Self { threshold, window, last_fire: None }
    }

    /// Returns true when `score` at `now` should be reported.
    pub fn observe(&mut self, score: f32, now: Instant) -> bool {
        if score <= self.threshold {
            return false;
        }
        if let Some(last) = self.last_fire {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last_fire = Some(now);
        true
    }
}

/// A stop flag whose waits wake as soon as it is set.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`. Returns true if the signal is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// One observation of the screen region.
#[derive(Debug)]
pub struct Sample {
    pub score: f32,
    pub location: (u32, u32),
    /// The captured region, only when a frame was asked for.
    pub frame: Option<RgbImage>,
}

/// Produces scores for the vision loop.
pub trait Sampler: Send {
    fn sample(&mut self, want_frame: bool) -> Result<Sample>;
}

/// Captures the configured region and matches the template against it.
struct ScreenSampler {
    source: Box<dyn FrameSource>,
    region: CaptureRegion,
    template: Template,
}

impl Sampler for ScreenSampler {
    fn sample(&mut self, want_frame: bool) -> Result<Sample> {
        let frame = self.source.grab(&self.region)?;
        let found = matcher::match_template(&frame, &self.template)?;
        let frame = want_frame.then(|| {
            let mut frame = frame;
            if found.score > DEBUG_OUTLINE_MIN_SCORE {
                matcher::draw_outline(
                    &mut frame,
                    found.location,
                    self.template.width(),
                    self.template.height(),
                );
            }
            frame
        });
        Ok(Sample { score: found.score, location: found.location, frame })
    }
}

/// Watches a screen region for the plant indicator.
pub struct VisionSensor {
    settings: VisionSettings,
    sampler: Option<Box<dyn Sampler>>,
    clock: Arc<dyn Clock>,
    debug: Arc<AtomicBool>,
    stop: StopSignal,
    worker: Option<JoinHandle<()>>,
}

impl VisionSensor {
    /// Loads the template and checks it fits the region. Both failures are fatal
    /// for this profile.
    pub fn new(
        settings: VisionSettings,
        source: Box<dyn FrameSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SensorError> {
        let template = Template::load(&settings.template_path)?;
        template.check_fits(settings.region.width, settings.region.height)?;
        info!(
            "[vision] Loaded template {} ({}x{})",
            settings.template_path.display(),
            template.width(),
            template.height()
        );
        let sampler = ScreenSampler { source, region: settings.region, template };
        Ok(Self::with_sampler(settings, Box::new(sampler), clock))
    }

    pub fn with_sampler(
        settings: VisionSettings,
        sampler: Box<dyn Sampler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            sampler: Some(sampler),
            clock,
            debug: Arc::new(AtomicBool::new(false)),
            stop: StopSignal::default(),
            worker: None,
        }
    }
}

impl Sensor for VisionSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Vision
    }

    fn start(&mut self, epoch: u64, core: CoreSender, ui: UiSender) -> Result<(), SensorError> {
        let Some(sampler) = self.sampler.take() else {
            debug!("[vision] start called twice; ignoring");
            return Ok(());
        };
        let worker = Worker {
            epoch,
            sampler,
            debouncer: Debouncer::new(self.settings.threshold, self.settings.suppression),
            settings: self.settings.clone(),
            clock: self.clock.clone(),
            debug: self.debug.clone(),
            stop: self.stop.clone(),
            core,
            ui,
        };
        let handle = thread::Builder::new()
            .name("vision-sensor".to_string())
            .spawn(move || worker.run())
            .map_err(SensorError::Spawn)?;
        self.worker = Some(handle);
        Ok(())
    }

    fn request_stop(&self) {
        self.stop.trigger();
    }

    fn stop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("[vision] Sensor thread panicked");
            }
        }
    }

    fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for VisionSensor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    epoch: u64,
    sampler: Box<dyn Sampler>,
    debouncer: Debouncer,
    settings: VisionSettings,
    clock: Arc<dyn Clock>,
    debug: Arc<AtomicBool>,
    stop: StopSignal,
    core: CoreSender,
    ui: UiSender,
}

impl Worker {
    fn run(mut self) {
        let _ = self.ui.send(UiEvent::Log("Scanning screen for bomb plant...".to_string()));
        debug!("[vision] Sensor {} running", self.epoch);

        while !self.stop.is_triggered() {
            let want_frame = self.debug.load(Ordering::Relaxed);
            match self.sampler.sample(want_frame) {
                Ok(sample) => {
                    if !self.observe(sample) {
                        break;
                    }
                }
                Err(e) if is_fatal(&e) => {
                    warn!("[vision] Stopping: {e:#}");
                    let _ = self.ui.send(UiEvent::CriticalError(e.to_string()));
                    break;
                }
                Err(e) => {
                    warn!("[vision] Sample failed: {e:#}");
                    let _ = self.ui.send(UiEvent::Log(format!("Error in vision sensor: {e:#}")));
                    if self.stop.wait(self.settings.error_backoff) {
                        break;
                    }
                    continue;
                }
            }
            if self.stop.wait(self.settings.sample_interval) {
                break;
            }
        }

        debug!("[vision] Sensor {} stopped", self.epoch);
    }

    /// Reports one sample. Returns false once the coordinator has gone away.
    fn observe(&mut self, sample: Sample) -> bool {
        let _ = self.ui.send(UiEvent::Confidence(sample.score));
        if let Some(frame) = sample.frame {
            let _ = self.ui.send(UiEvent::DebugFrame(frame));
        }

        let now = self.clock.now();
        if !self.debouncer.observe(sample.score, now) {
            return true;
        }
        debug!(
            "[vision] Detection at score {:.3} ({}, {})",
            sample.score, sample.location.0, sample.location.1
        );
        let event = DetectionEvent { confidence: sample.score, timestamp: now };
        self.core
            .send(CoreEvent::Detection { epoch: self.epoch, event })
            .is_ok()
    }
}

/// Errors that retrying cannot fix.
fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SensorError>(),
        Some(SensorError::TemplateLargerThanRegion { .. })
    )
}
