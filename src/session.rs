#![warn(clippy::pedantic)]

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stage_sys::{Stage, StageResult, StatusWord};

use crate::calibration::CalibrationReferences;
use crate::ring_buffer::SampleRing;

/// The one physical link, shared by the scan loop and the status poller. Every device call goes
/// through [`SharedStage::with`], so at most one command is on the wire at a time.
#[derive(Clone)]
pub struct SharedStage {
    inner: Arc<Mutex<Box<dyn Stage>>>,
}

impl SharedStage {
    pub fn new<S: Stage + 'static>(stage: S) -> Self {
        SharedStage {
            inner: Arc::new(Mutex::new(Box::new(stage))),
        }
    }

    /// Run `f` with exclusive access to the stage. A panic in another holder does not poison
    /// the link; the hardware state is re-read on every call anyway.
    /// # Errors
    /// Whatever `f` returns.
    pub fn with<T>(&self, f: impl FnOnce(&mut dyn Stage) -> StageResult<T>) -> StageResult<T> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Calibrating,
    Ready,
    Scanning,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Calibrating => write!(f, "Calibrating"),
            ControllerState::Ready => write!(f, "Ready"),
            ControllerState::Scanning => write!(f, "Scanning"),
        }
    }
}

/// Run-time view of the instrument. Cloning it gives the read-only snapshot handed to
/// presentation code.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSession {
    pub state: ControllerState,
    /// An operation (calibration, scan or reference move) holds the controller.
    pub running: bool,
    pub position: i64,
    pub status: StatusWord,
    pub output_voltage: f64,
    pub input_voltage: f64,
    pub references: Option<CalibrationReferences>,
    pub rows_completed: usize,
    pub data_file: Option<PathBuf>,
    pub polls: u64,
}

impl Default for ScanSession {
    fn default() -> Self {
        ScanSession {
            state: ControllerState::Idle,
            running: false,
            position: 0,
            status: StatusWord::IDLE,
            output_voltage: 0.0,
            input_voltage: 0.0,
            references: None,
            rows_completed: 0,
            data_file: None,
            polls: 0,
        }
    }
}

impl ScanSession {
    #[inline]
    #[must_use]
    pub fn calibrated(&self) -> bool {
        self.references.is_some()
    }

    #[inline]
    #[must_use]
    pub fn in_motion(&self) -> bool {
        self.status.in_motion()
    }

    #[inline]
    #[must_use]
    pub fn home_switch(&self) -> bool {
        self.status.home_switch()
    }

    #[inline]
    #[must_use]
    pub fn reverse_switch(&self) -> bool {
        self.status.reverse_switch()
    }

    #[inline]
    #[must_use]
    pub fn forward_switch(&self) -> bool {
        self.status.forward_switch()
    }

    #[must_use]
    pub fn position_mm(&self) -> Option<f64> {
        self.references?.position_to_mm(self.position)
    }
}

#[derive(Debug)]
struct SessionInner {
    session: ScanSession,
    readings: SampleRing<f64>,
}

/// Owner of the [`ScanSession`] and the recent input-reading history, behind one lock.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionInner>>,
}

impl SessionHandle {
    /// Keeps the last `2^log_exponent` input readings.
    #[must_use]
    pub fn new(log_exponent: u32) -> Option<Self> {
        Some(SessionHandle {
            inner: Arc::new(Mutex::new(SessionInner {
                session: ScanSession::default(),
                readings: SampleRing::with_exponent(log_exponent)?,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> ScanSession {
        self.lock().session.clone()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ScanSession) -> T) -> T {
        f(&mut self.lock().session)
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.lock().session.state
    }

    #[must_use]
    pub fn references(&self) -> Option<CalibrationReferences> {
        self.lock().session.references
    }

    /// Store one poll of the device and append the input reading to the history.
    pub fn record_poll(&self, position: i64, status: StatusWord, input_voltage: f64) {
        let mut inner = self.lock();
        inner.session.position = position;
        inner.session.status = status;
        inner.session.input_voltage = input_voltage;
        inner.session.polls += 1;
        inner.readings.push(input_voltage);
    }

    /// The newest `num` input readings, oldest first.
    #[must_use]
    pub fn recent_readings(&self, num: usize) -> Vec<f64> {
        self.lock().readings.last_n(num).collect()
    }
}

/// Background thread refreshing the session from the device at a fixed cadence. Stops (and is
/// joined) on [`StatusPoller::stop`] or drop.
pub struct StatusPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// # Errors
    /// Fails only if the OS refuses to start the thread.
    pub fn spawn(
        stage: SharedStage,
        session: SessionHandle,
        interval: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("status-poller".into())
            .spawn(move || {
                let mut failing = false;
                while !stop_flag.load(Ordering::Acquire) {
                    match poll_once(&stage, &session) {
                        Ok(()) => failing = false,
                        // one warning per outage, not one per poll
                        Err(e) if !failing => {
                            log::warn!("status poll failed: {e}");
                            failing = true;
                        }
                        Err(_) => {}
                    }
                    thread::sleep(interval);
                }
            })?;
        Ok(StatusPoller {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("status poller thread panicked");
            }
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read position, status and input under a single hold of the link.
/// # Errors
/// Propagates the first failing device read; the session is left untouched.
pub fn poll_once(stage: &SharedStage, session: &SessionHandle) -> StageResult<()> {
    let (position, status, input) = stage.with(|s| {
        Ok((
            s.read_position()?,
            s.read_status()?,
            s.read_input_voltage()?,
        ))
    })?;
    session.record_poll(position, status, input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_sys::{ErrorCode, SimStage};
    use std::time::Instant;

    fn open_sim(sim: &SimStage) -> SharedStage {
        let stage = SharedStage::new(sim.clone());
        stage.with(|s| s.open("sim")).unwrap();
        stage
    }

    #[test]
    fn poll_updates_snapshot() {
        let sim = SimStage::new()
            .with_switches(0, 50_000, 100_000)
            .at_position(50_000)
            .with_beam(|p, _| p as f64 * 1e-5);
        let stage = open_sim(&sim);
        let session = SessionHandle::new(4).unwrap();

        poll_once(&stage, &session).unwrap();
        let snap = session.snapshot();
        assert_eq!(snap.position, 50_000);
        assert!(snap.home_switch());
        assert!(!snap.reverse_switch());
        assert!(!snap.in_motion());
        assert!((snap.input_voltage - 0.5).abs() < 1e-12);
        assert_eq!(snap.polls, 1);
        assert_eq!(session.recent_readings(10), vec![snap.input_voltage]);
        assert_eq!(snap.position_mm(), None);
    }

    #[test]
    fn failed_poll_leaves_session_alone() {
        let sim = SimStage::new().failing_from(3, ErrorCode::TIMEOUT);
        let stage = open_sim(&sim);
        let session = SessionHandle::new(4).unwrap();
        // open was call 1, read_position call 2, read_status call 3 fails
        assert!(poll_once(&stage, &session).is_err());
        assert_eq!(session.snapshot(), ScanSession::default());
        assert!(session.recent_readings(4).is_empty());
    }

    #[test]
    fn poller_runs_until_stopped() {
        let sim = SimStage::new().with_beam(|_, _| 1.0);
        let stage = open_sim(&sim);
        let session = SessionHandle::new(3).unwrap();
        let mut poller =
            StatusPoller::spawn(stage, session.clone(), Duration::from_millis(2)).unwrap();

        let started = Instant::now();
        while session.snapshot().polls < 10 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        poller.stop();
        let polls = session.snapshot().polls;
        assert!(polls >= 10);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(session.snapshot().polls, polls);
        assert_eq!(session.recent_readings(100).len(), 8);
    }

    #[test]
    fn state_names() {
        assert_eq!(ControllerState::Scanning.to_string(), "Scanning");
        assert_eq!(ControllerState::default(), ControllerState::Idle);
    }
}
