use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture;
use crate::clock::Clock;
use crate::event::{CoreSender, UiSender};
use crate::push::{PushSensor, PushSettings};
use crate::vision::{VisionSensor, VisionSettings};

/// How a profile learns that the bomb was planted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Template matching against a screen region.
    Vision,
    /// The game posts its state to a local HTTP listener.
    Push,
}

/// Everything needed to build a sensor. Two equal specs produce equivalent
/// sensors, so the coordinator only rebuilds when the `SensorSpec` changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorSpec {
    Vision(VisionSettings),
    Push(PushSettings),
}

impl SensorSpec {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorSpec::Vision(_) => SensorKind::Vision,
            SensorSpec::Push(_) => SensorKind::Push,
        }
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to load template {}: {source}", .path.display())]
    TemplateLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(
        "Template ({template_width}x{template_height}) is larger than the capture region \
         ({region_width}x{region_height}); check the resolution preset"
    )]
    TemplateLargerThanRegion {
        template_width: u32,
        template_height: u32,
        region_width: u32,
        region_height: u32,
    },

    #[error("Port {} is already in use or unavailable: {source}", .addr.port())]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start sensor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A detection source running on its own worker.
///
/// `start` launches the worker, which sends `CoreEvent::Detection` tagged with
/// `epoch` on `core` and presentation updates on `ui`. After `stop` returns the
/// worker has exited and no further events from it will be sent.
pub trait Sensor: Send {
    fn kind(&self) -> SensorKind;

    fn start(&mut self, epoch: u64, core: CoreSender, ui: UiSender) -> Result<(), SensorError>;

    /// Signals the worker to exit without waiting for it.
    fn request_stop(&self);

    /// Signals the worker and joins it. Calling it again is a no-op.
    fn stop(&mut self);

    /// Turns per-sample debug frames on or off. Sensors without frames ignore it.
    fn set_debug(&self, _enabled: bool) {}
}

/// Builds sensors from specs. The coordinator owns one so tests can swap in fakes.
pub trait SensorFactory: Send {
    fn build(&self, spec: &SensorSpec) -> Result<Box<dyn Sensor>, SensorError>;
}

/// Builds the real screen-capture and HTTP sensors.
pub struct LiveSensors {
    clock: Arc<dyn Clock>,
}

impl LiveSensors {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl SensorFactory for LiveSensors {
    fn build(&self, spec: &SensorSpec) -> Result<Box<dyn Sensor>, SensorError> {
        match spec {
            SensorSpec::Vision(settings) => Ok(Box::new(VisionSensor::new(
                settings.clone(),
                capture::screen(),
                self.clock.clone(),
            )?)),
            SensorSpec::Push(settings) => {
                Ok(Box::new(PushSensor::new(settings.clone(), self.clock.clone())))
            }
        }
    }
}
