/// The single authority over "time remaining" for one detected event.
///
/// A [`Countdown`] walks `Idle → Running → {Expired, Cancelled}` exactly once;
/// the coordinator creates a fresh instance for every qualifying detection.
/// While running, a dedicated tick thread wakes every [`TICK_INTERVAL`],
/// compares `end_time` against the clock and emits a display update whenever
/// the rounded second changes.
///
/// `end_time` and `status` live behind one mutex. The tick thread holds it only
/// to read and compare; emission and sleeping happen with the lock released.
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::event::{CoreEvent, CoreSender, UiEvent, UiSender};

pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// At or below this many seconds the display turns "warn".
pub const WARN_SECS: f64 = 10.0;
/// At or below this many seconds the display turns "mid".
pub const MID_SECS: f64 = 20.0;

/// Colour classification of the remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorClass {
    Normal,
    Mid,
    Warn,
    Danger,
}

/// Classifies `remaining` seconds. The warning threshold wins over the fixed
/// 10 s / 20 s bands, so a profile with a 12 s threshold goes straight from
/// "mid" to "danger".
pub fn classify(remaining: f64, warning_threshold: f64) -> ColorClass {
    if remaining <= warning_threshold {
        ColorClass::Danger
    } else if remaining <= WARN_SECS {
        ColorClass::Warn
    } else if remaining <= MID_SECS {
        ColorClass::Mid
    } else {
        ColorClass::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountdownStatus {
    Idle,
    Running,
    Expired,
    Cancelled,
}

/// Profile values copied out of the configuration when a session starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSettings {
    pub duration: Duration,
    pub warning_threshold: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum CountdownError {
    #[error("countdown can only be started from idle (currently {0:?})")]
    NotIdle(CountdownStatus),
    #[error("failed to spawn tick thread: {0}")]
    Spawn(String),
}

#[derive(Debug)]
struct Session {
    status: CountdownStatus,
    end_time: Option<Instant>,
}

struct Shared {
    session: Mutex<Session>,
    clock: Arc<dyn Clock>,
    warning_threshold: f64,
}

impl Shared {
    /// Recovers the session from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What one tick decided, computed under the lock and acted on outside it.
#[derive(Debug, PartialEq)]
enum Tick {
    /// Keep going; `Some` carries a new rounded second to show.
    Continue(Option<i64>),
    /// `end_time` has passed; the session is now Expired.
    Expired,
    /// Someone else ended the session.
    Stopped,
}

pub struct Countdown {
    id: u64,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    ui: UiSender,
    core: CoreSender,
}

impl Countdown {
    /// Creates an idle countdown. `id` is echoed back in
    /// [`CoreEvent::CountdownFinished`] so the coordinator can tell sessions apart.
    pub fn new(
        id: u64,
        settings: TimerSettings,
        clock: Arc<dyn Clock>,
        ui: UiSender,
        core: CoreSender,
    ) -> Self {
        Self {
            id,
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    status: CountdownStatus::Idle,
                    end_time: None,
                }),
                clock,
                warning_threshold: settings.warning_threshold,
            }),
            worker: None,
            ui,
            core,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> CountdownStatus {
        self.shared.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == CountdownStatus::Running
    }

    /// Absolute deadline, set once the countdown has started.
    #[cfg(test)]
    pub fn end_time(&self) -> Option<Instant> {
        self.shared.lock().end_time
    }

    /// Time left, clamped at zero. Zero once the session is over.
    pub fn remaining(&self) -> Duration {
        let session = self.shared.lock();
        match (session.status, session.end_time) {
            (CountdownStatus::Running, Some(end)) => {
                end.saturating_duration_since(self.shared.clock.now())
            }
            _ => Duration::ZERO,
        }
    }

    /// Sets `end_time = now + duration` and starts the tick thread.
    pub fn start(&mut self, duration: Duration) -> Result<(), CountdownError> {
        {
            let mut session = self.shared.lock();
            if session.status != CountdownStatus::Idle {
                return Err(CountdownError::NotIdle(session.status));
            }
            session.end_time = Some(self.shared.clock.now() + duration);
            session.status = CountdownStatus::Running;
        }

        let shared = Arc::clone(&self.shared);
        let ui = self.ui.clone();
        let core = self.core.clone();
        let id = self.id;
        let spawned = std::thread::Builder::new()
            .name(format!("countdown-{id}"))
            .spawn(move || run_ticks(id, shared, ui, core));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Never leave a Running session without a tick loop behind it.
                self.shared.lock().status = CountdownStatus::Cancelled;
                Err(CountdownError::Spawn(e.to_string()))
            }
        }
    }

    /// Shifts the deadline by `delta_secs` (negative pulls it closer).
    /// Returns `false` without touching anything unless the session is running.
    pub fn adjust(&self, delta_secs: f64) -> bool {
        let mut session = self.shared.lock();
        if session.status != CountdownStatus::Running {
            return false;
        }
        let Some(end) = session.end_time else {
            return false;
        };
        let shift = Duration::from_secs_f64(delta_secs.abs());
        session.end_time = Some(if delta_secs >= 0.0 {
            end + shift
        } else {
            end.checked_sub(shift).unwrap_or(end)
        });
        true
    }

    /// Ends a running session, waits for the tick thread to exit, then emits
    /// [`UiEvent::Reset`]. Returns `false` if there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        {
            let mut session = self.shared.lock();
            if session.status != CountdownStatus::Running {
                return false;
            }
            session.status = CountdownStatus::Cancelled;
        }
        self.join();
        let _ = self.ui.send(UiEvent::Reset);
        true
    }

    fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("[countdown] Tick thread panicked");
            }
        }
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        // Dropping a running countdown is a silent cancel.
        {
            let mut session = self.shared.lock();
            if session.status == CountdownStatus::Running {
                session.status = CountdownStatus::Cancelled;
            }
        }
        self.join();
    }
}

/// Decides one tick. Called with the session lock held.
fn tick(session: &mut Session, now: Instant, last_shown: Option<i64>) -> Tick {
    if session.status != CountdownStatus::Running {
        return Tick::Stopped;
    }
    let Some(end) = session.end_time else {
        session.status = CountdownStatus::Expired;
        return Tick::Expired;
    };
    if now >= end {
        session.status = CountdownStatus::Expired;
        return Tick::Expired;
    }
    let shown = (end - now).as_secs_f64().round() as i64;
    if last_shown == Some(shown) {
        Tick::Continue(None)
    } else {
        Tick::Continue(Some(shown))
    }
}

fn display(seconds: i64, warning_threshold: f64) -> UiEvent {
    UiEvent::Display {
        text: seconds.to_string(),
        color: classify(seconds as f64, warning_threshold),
    }
}

fn run_ticks(id: u64, shared: Arc<Shared>, ui: UiSender, core: CoreSender) {
    let mut last_shown: Option<i64> = None;
    loop {
        let outcome = {
            let mut session = shared.lock();
            tick(&mut session, shared.clock.now(), last_shown)
        };

        match outcome {
            Tick::Continue(Some(seconds)) => {
                let _ = ui.send(display(seconds, shared.warning_threshold));
                last_shown = Some(seconds);
            }
            Tick::Continue(None) => {}
            Tick::Expired => {
                if last_shown != Some(0) {
                    let _ = ui.send(display(0, shared.warning_threshold));
                }
                let _ = ui.send(UiEvent::Finished);
                let _ = core.send(CoreEvent::CountdownFinished { session: id });
                debug!("[countdown] Session {id} expired");
                return;
            }
            Tick::Stopped => {
                debug!("[countdown] Session {id} stopped");
                return;
            }
        }

        std::thread::sleep(TICK_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::mpsc;

    fn settings(duration_secs: u64, warning: f64) -> TimerSettings {
        TimerSettings {
            duration: Duration::from_secs(duration_secs),
            warning_threshold: warning,
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        ui_rx: mpsc::UnboundedReceiver<UiEvent>,
        core_rx: mpsc::UnboundedReceiver<CoreEvent>,
        countdown: Countdown,
    }

    fn harness(duration_secs: u64, warning: f64) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let countdown = Countdown::new(
            1,
            settings(duration_secs, warning),
            clock.clone(),
            ui_tx,
            core_tx,
        );
        Harness { clock, ui_rx, core_rx, countdown }
    }

    /// Gives the tick thread a few iterations to observe the clock.
    fn settle() {
        std::thread::sleep(TICK_INTERVAL * 4);
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn displays(events: &[UiEvent]) -> Vec<(String, ColorClass)> {
        events
            .iter()
            .filter_map(|e| match e {
                UiEvent::Display { text, color } => Some((text.clone(), *color)),
                _ => None,
            })
            .collect()
    }

    // ── classify ──────────────────────────────────────────────────────────────

    #[test]
    fn classify_at_warning_threshold_is_danger() {
        assert_eq!(classify(7.0, 7.0), ColorClass::Danger);
        assert_eq!(classify(0.0, 7.0), ColorClass::Danger);
    }

    #[test]
    fn classify_just_above_warning_threshold_falls_to_bands() {
        assert_eq!(classify(7.01, 7.0), ColorClass::Warn);
        assert_eq!(classify(10.01, 10.0), ColorClass::Mid);
        assert_eq!(classify(20.01, 20.0), ColorClass::Normal);
    }

    #[test]
    fn classify_band_edges() {
        assert_eq!(classify(21.0, 7.0), ColorClass::Normal);
        assert_eq!(classify(20.0, 7.0), ColorClass::Mid);
        assert_eq!(classify(10.0, 7.0), ColorClass::Warn);
        assert_eq!(classify(10.5, 7.0), ColorClass::Mid);
    }

    #[test]
    fn classify_warning_threshold_overrides_bands() {
        assert_eq!(classify(12.0, 15.0), ColorClass::Danger);
    }

    // ── tick ──────────────────────────────────────────────────────────────────

    #[test]
    fn tick_coalesces_repeated_seconds() {
        let base = Instant::now();
        let mut session = Session {
            status: CountdownStatus::Running,
            end_time: Some(base + Duration::from_secs(3)),
        };
        assert_eq!(tick(&mut session, base, None), Tick::Continue(Some(3)));
        assert_eq!(
            tick(&mut session, base + Duration::from_millis(50), Some(3)),
            Tick::Continue(None)
        );
        assert_eq!(
            tick(&mut session, base + Duration::from_millis(600), Some(3)),
            Tick::Continue(Some(2))
        );
    }

    #[test]
    fn tick_expires_at_deadline() {
        let base = Instant::now();
        let mut session = Session {
            status: CountdownStatus::Running,
            end_time: Some(base + Duration::from_secs(1)),
        };
        assert_eq!(tick(&mut session, base + Duration::from_secs(1), Some(1)), Tick::Expired);
        assert_eq!(session.status, CountdownStatus::Expired);
    }

    #[test]
    fn tick_reports_stopped_when_cancelled() {
        let mut session = Session {
            status: CountdownStatus::Cancelled,
            end_time: Some(Instant::now()),
        };
        assert_eq!(tick(&mut session, Instant::now(), None), Tick::Stopped);
    }

    #[test]
    fn full_countdown_emits_one_update_per_distinct_second() {
        let base = Instant::now();
        let mut session = Session {
            status: CountdownStatus::Running,
            end_time: Some(base + Duration::from_secs(45)),
        };
        let mut last = None;
        let mut emitted = Vec::new();
        let mut t = Duration::ZERO;
        loop {
            match tick(&mut session, base + t, last) {
                Tick::Continue(Some(s)) => {
                    emitted.push(s);
                    last = Some(s);
                }
                Tick::Continue(None) => {}
                Tick::Expired | Tick::Stopped => break,
            }
            t += TICK_INTERVAL;
        }
        let expected: Vec<i64> = (0..=45).rev().collect();
        assert_eq!(emitted, expected);
    }

    // ── state machine ─────────────────────────────────────────────────────────

    #[test]
    fn new_countdown_is_idle() {
        let h = harness(45, 7.0);
        assert_eq!(h.countdown.status(), CountdownStatus::Idle);
        assert_eq!(h.countdown.remaining(), Duration::ZERO);
        assert!(h.countdown.end_time().is_none());
    }

    #[test]
    fn start_sets_end_time_and_runs() {
        let mut h = harness(45, 7.0);
        let now = h.clock.now();
        h.countdown.start(Duration::from_secs(45)).unwrap();
        assert_eq!(h.countdown.status(), CountdownStatus::Running);
        assert_eq!(h.countdown.end_time(), Some(now + Duration::from_secs(45)));
        assert_eq!(h.countdown.remaining(), Duration::from_secs(45));
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        assert_eq!(
            h.countdown.start(Duration::from_secs(45)),
            Err(CountdownError::NotIdle(CountdownStatus::Running))
        );
    }

    #[test]
    fn start_then_cancel_leaves_cancelled() {
        for secs in [1u64, 5, 45, 3600] {
            let mut h = harness(secs, 7.0);
            h.countdown.start(Duration::from_secs(secs)).unwrap();
            assert!(h.countdown.cancel());
            assert_eq!(h.countdown.status(), CountdownStatus::Cancelled);
            assert_eq!(h.countdown.remaining(), Duration::ZERO);
        }
    }

    #[test]
    fn cancel_emits_reset_and_no_further_updates() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        settle();
        h.countdown.cancel();
        let events = drain(&mut h.ui_rx);
        assert!(matches!(events.last(), Some(UiEvent::Reset)));

        h.clock.advance(Duration::from_secs(10));
        settle();
        assert!(drain(&mut h.ui_rx).is_empty());
        assert!(h.core_rx.try_recv().is_err());
    }

    #[test]
    fn cancel_when_idle_or_finished_is_a_no_op() {
        let mut h = harness(45, 7.0);
        assert!(!h.countdown.cancel());
        h.countdown.start(Duration::from_secs(45)).unwrap();
        assert!(h.countdown.cancel());
        assert!(!h.countdown.cancel());
        assert_eq!(h.countdown.status(), CountdownStatus::Cancelled);
    }

    #[test]
    fn adjust_before_start_does_not_start() {
        let h = harness(45, 7.0);
        assert!(!h.countdown.adjust(5.0));
        assert_eq!(h.countdown.status(), CountdownStatus::Idle);
        assert!(h.countdown.end_time().is_none());
    }

    #[test]
    fn adjust_after_cancel_does_not_resurrect() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        h.countdown.cancel();
        let end = h.countdown.end_time();
        assert!(!h.countdown.adjust(10.0));
        assert_eq!(h.countdown.end_time(), end);
        assert_eq!(h.countdown.status(), CountdownStatus::Cancelled);
    }

    #[test]
    fn adjust_sums_signed_deltas() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        let start = h.countdown.end_time().unwrap();
        for delta in [0.1, 0.1, -0.1, 2.0, -0.5] {
            assert!(h.countdown.adjust(delta));
        }
        assert_eq!(h.countdown.end_time().unwrap(), start + Duration::from_millis(1600));
    }

    #[test]
    fn concurrent_adjusts_are_all_applied() {
        const N: usize = 32;
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        let start = h.countdown.end_time().unwrap();

        std::thread::scope(|s| {
            for _ in 0..N {
                s.spawn(|| assert!(h.countdown.adjust(1.0)));
            }
        });

        assert_eq!(
            h.countdown.end_time().unwrap(),
            start + Duration::from_secs(N as u64)
        );
    }

    // ── end to end ────────────────────────────────────────────────────────────

    #[test]
    fn spike_countdown_end_to_end() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        settle();
        let first = displays(&drain(&mut h.ui_rx));
        assert_eq!(first, vec![("45".to_string(), ColorClass::Normal)]);

        h.clock.set_elapsed(Duration::from_secs(38));
        settle();
        let at_38 = displays(&drain(&mut h.ui_rx));
        assert_eq!(at_38, vec![("7".to_string(), ColorClass::Danger)]);

        h.clock.set_elapsed(Duration::from_secs(45));
        settle();
        let tail = drain(&mut h.ui_rx);
        assert_eq!(displays(&tail), vec![("0".to_string(), ColorClass::Danger)]);
        assert!(matches!(tail.last(), Some(UiEvent::Finished)));
        assert_eq!(h.countdown.status(), CountdownStatus::Expired);
        assert!(matches!(
            h.core_rx.try_recv(),
            Ok(CoreEvent::CountdownFinished { session: 1 })
        ));
    }

    #[test]
    fn final_zero_is_not_repeated() {
        let mut h = harness(2, 1.0);
        h.countdown.start(Duration::from_secs(2)).unwrap();
        settle();
        // 0.3 s left rounds to "0" before the deadline passes.
        h.clock.set_elapsed(Duration::from_millis(1700));
        settle();
        h.clock.set_elapsed(Duration::from_secs(2));
        settle();
        let zeros = displays(&drain(&mut h.ui_rx))
            .into_iter()
            .filter(|(text, _)| text == "0")
            .count();
        assert_eq!(zeros, 1);
    }

    #[test]
    fn adjust_past_deadline_expires_on_next_tick() {
        let mut h = harness(45, 7.0);
        h.countdown.start(Duration::from_secs(45)).unwrap();
        assert!(h.countdown.adjust(-60.0));
        settle();
        assert_eq!(h.countdown.status(), CountdownStatus::Expired);
        assert_eq!(h.countdown.remaining(), Duration::ZERO);
    }
}
