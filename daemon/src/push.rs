/// Game-state-integration listener.
///
/// The game POSTs its JSON state to a local HTTP endpoint whenever something
/// changes. Each payload whose `round.bomb` reads "planted" produces a
/// detection with confidence 1.0. Every request is answered `200 OK` with an
/// empty body, including malformed ones, so the game keeps posting.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::event::{CoreEvent, CoreSender, DetectionEvent, UiEvent, UiSender};
use crate::sensor::{Sensor, SensorError, SensorKind};

/// Bodies declared larger than this are answered without being read.
pub const MAX_BODY_BYTES: usize = 1 << 20;
const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq)]
pub struct PushSettings {
    pub addr: SocketAddr,
}

impl PushSettings {
    pub fn localhost(port: u16) -> Self {
        Self { addr: SocketAddr::from(([127, 0, 0, 1], port)) }
    }
}

/// Returns true when the payload reports the bomb as planted.
pub fn is_planted(body: &[u8]) -> bool {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    match payload.pointer("/round/bomb") {
        Some(Value::String(state)) => state == "planted",
        Some(Value::Bool(planted)) => *planted,
        _ => false,
    }
}

pub struct PushSensor {
    settings: PushSettings,
    clock: Arc<dyn Clock>,
    stop_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
    #[cfg(test)]
    local_addr: Option<SocketAddr>,
}

impl PushSensor {
    pub fn new(settings: PushSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            stop_tx: None,
            worker: None,
            #[cfg(test)]
            local_addr: None,
        }
    }

    /// The bound address once started. Differs from the configured one when
    /// port 0 was requested.
    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Sensor for PushSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Push
    }

    fn start(&mut self, epoch: u64, core: CoreSender, ui: UiSender) -> Result<(), SensorError> {
        if self.worker.is_some() {
            debug!("[push] start called twice; ignoring");
            return Ok(());
        }

        let addr = self.settings.addr;
        let bind_error = |source: io::Error| SensorError::Bind { addr, source };
        let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        #[cfg(test)]
        {
            self.local_addr = listener.local_addr().ok();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let server = Server { epoch, clock: self.clock.clone(), core, ui };
        let handle = thread::Builder::new()
            .name("push-sensor".to_string())
            .spawn(move || server.run(listener, stop_rx))
            .map_err(SensorError::Spawn)?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(handle);
        Ok(())
    }

    fn request_stop(&self) {
        if let Some(tx) = &self.stop_tx {
            let _ = tx.send(true);
        }
    }

    fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("[push] Listener thread panicked");
            }
        }
        self.stop_tx = None;
    }
}

impl Drop for PushSensor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct Server {
    epoch: u64,
    clock: Arc<dyn Clock>,
    core: CoreSender,
    ui: UiSender,
}

impl Server {
    /// Runs the listener on a private single-threaded runtime until stopped.
    /// Connection tasks still in flight are dropped with the runtime.
    fn run(self, listener: std::net::TcpListener, stop_rx: watch::Receiver<bool>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = self
                    .ui
                    .send(UiEvent::CriticalError(format!("Failed to start GSI listener: {e}")));
                return;
            }
        };
        runtime.block_on(self.serve(listener, stop_rx));
    }

    async fn serve(self, listener: std::net::TcpListener, mut stop_rx: watch::Receiver<bool>) {
        let listener = match TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                let _ = self
                    .ui
                    .send(UiEvent::CriticalError(format!("Failed to start GSI listener: {e}")));
                return;
            }
        };
        if let Ok(addr) = listener.local_addr() {
            let _ = self.ui.send(UiEvent::Log(format!(
                "GSI listener running on port {}. Waiting for game data...",
                addr.port()
            )));
        }

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                debug!("[push] Connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("[push] Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        debug!("[push] Listener {} stopped", self.epoch);
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(stream);
        // Unreadable requests are still answered.
        let body = match tokio::time::timeout(READ_TIMEOUT, read_body(&mut reader)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                debug!("[push] Could not read request: {e}");
                None
            }
            Err(_) => {
                debug!("[push] Request timed out");
                None
            }
        };

        if body.as_deref().is_some_and(is_planted) {
            self.report();
        }

        let stream = reader.get_mut();
        stream.write_all(RESPONSE).await?;
        stream.shutdown().await
    }

    fn report(&self) {
        let event = DetectionEvent { confidence: 1.0, timestamp: self.clock.now() };
        let _ = self.core.send(CoreEvent::Detection { epoch: self.epoch, event });
    }
}

/// Reads the request head and, when its Content-Length is acceptable, the body.
/// Returns `None` for requests whose body should not be parsed.
async fn read_body(reader: &mut BufReader<TcpStream>) -> io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut head_bytes = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        head_bytes += n;
        if head_bytes > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        if text.is_empty() {
            break;
        }
        if let Some((name, value)) = text.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    match content_length {
        Some(len) if len <= MAX_BODY_BYTES => {
            let mut body = vec![0; len];
            reader.read_exact(&mut body).await?;
            Ok(Some(body))
        }
        Some(len) => {
            debug!("[push] Ignoring {len}-byte body");
            Ok(None)
        }
        None => Ok(None),
    }
}
