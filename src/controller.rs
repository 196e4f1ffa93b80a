//! Sequencing of the slit stage and analyzer supply: calibration against the limit switches,
//! the nested position/voltage sweep, reference moves and cleanup.
//!
//! Every long operation is cooperative with [`AbortToken`]: the flag is checked before each move,
//! before every motion poll, before each voltage step and after each settling delay, and all
//! sleeps are split into slices no longer than the motion poll interval.
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};
use stage_sys::{Stage, StageError, StageResult};
use thiserror::Error;

use crate::calibration::{Anchor, CalibrationReferences, SwitchOffsets};
use crate::datafile::{ScanHeader, ScanRecorder};
use crate::session::{ControllerState, SessionHandle, SharedStage};
use crate::util::{linspace, round_to};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("stage communication failed: {0}")]
    Device(#[from] StageError),
    #[error("no limit switch active after seeking the edge")]
    Calibration,
    #[error("stage references unknown; calibrate first")]
    NotCalibrated,
    #[error("controller busy ({0})")]
    Busy(ControllerState),
    #[error("invalid scan: {0}")]
    InvalidScan(String),
    #[error("aborted")]
    Aborted,
    #[error("data file: {0}")]
    Recorder(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    CalibrationDone(CalibrationReferences),
    CalibrationFailed(String),
    ScanStarted { positions: usize, voltages: usize },
    ScanCompleted { rows: usize },
    ScanAborted { rows: usize },
    ScanFailed(String),
}

impl fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanEvent::CalibrationDone(refs) => write!(
                f,
                "CALIBRATION:DONE:{}:{}:{}",
                refs.home, refs.faraday, refs.end
            ),
            ScanEvent::CalibrationFailed(why) => write!(f, "CALIBRATION:FAILED:{why}"),
            ScanEvent::ScanStarted {
                positions,
                voltages,
            } => write!(f, "SCAN:STARTED:{positions}:{voltages}"),
            ScanEvent::ScanCompleted { rows } => write!(f, "SCAN:COMPLETED:{rows}"),
            ScanEvent::ScanAborted { rows } => write!(f, "SCAN:ABORTED:{rows}"),
            ScanEvent::ScanFailed(why) => write!(f, "SCAN:FAILED:{why}"),
        }
    }
}

/// Cooperative cancellation flag shared between the controller and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// # Errors
    /// `ScanError::Aborted` once triggered.
    pub fn check(&self) -> Result<(), ScanError> {
        if self.is_triggered() {
            Err(ScanError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Stage speeds in counts per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speeds {
    pub travel: u32,
    pub default: u32,
    pub seek: u32,
    pub close: u32,
}

impl Default for Speeds {
    fn default() -> Self {
        Speeds {
            travel: 200_000,
            default: 50_000,
            seek: 10_000,
            close: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub settle: Duration,
    pub motion_poll: Duration,
    /// Pause before each commanded move of a scan.
    pub pre_move: Duration,
    pub status_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            settle: Duration::from_millis(50),
            motion_poll: Duration::from_millis(500),
            pre_move: Duration::from_secs(1),
            status_poll: Duration::from_millis(100),
        }
    }
}

impl Timing {
    /// No waiting at all; the simulated stage completes moves by poll count.
    #[must_use]
    pub fn immediate() -> Self {
        Timing {
            settle: Duration::ZERO,
            motion_poll: Duration::ZERO,
            pre_move: Duration::ZERO,
            status_poll: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSetup {
    pub speeds: Speeds,
    pub timing: Timing,
    pub offsets: SwitchOffsets,
    pub travel_mm: f64,
    pub return_to_faraday: bool,
    pub voltage_decimals: i32,
    pub output_dir: PathBuf,
    pub comment: String,
    pub plate_length: f64,
    pub plate_gap: f64,
    pub beam_energy: f64,
}

impl Default for ControllerSetup {
    fn default() -> Self {
        ControllerSetup {
            speeds: Speeds::default(),
            timing: Timing::default(),
            offsets: SwitchOffsets::default(),
            travel_mm: 193.0,
            return_to_faraday: true,
            voltage_decimals: 2,
            output_dir: PathBuf::from("."),
            comment: String::from("emittance scan"),
            plate_length: 40.78,
            plate_gap: 4.0,
            beam_energy: 20.0,
        }
    }
}

/// One sweep: stage positions in counts, analyzer output in volts. Both ranges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    pub start_position: i64,
    pub end_position: i64,
    pub motor_steps: usize,
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub voltage_steps: usize,
}

impl ScanParams {
    /// Window given in mm from the park position.
    #[must_use]
    pub fn from_mm(
        refs: &CalibrationReferences,
        start_mm: f64,
        end_mm: f64,
        motor_steps: usize,
        start_voltage: f64,
        end_voltage: f64,
        voltage_steps: usize,
    ) -> Option<Self> {
        Some(ScanParams {
            start_position: refs.mm_to_position(start_mm)?,
            end_position: refs.mm_to_position(end_mm)?,
            motor_steps,
            start_voltage,
            end_voltage,
            voltage_steps,
        })
    }

    /// # Errors
    /// `InvalidScan` for empty sweeps or non-finite voltages.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.motor_steps == 0 || self.voltage_steps == 0 {
            return Err(ScanError::InvalidScan(format!(
                "{} positions x {} voltages",
                self.motor_steps, self.voltage_steps
            )));
        }
        if !self.start_voltage.is_finite() || !self.end_voltage.is_finite() {
            return Err(ScanError::InvalidScan("non-finite voltage".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn positions(&self) -> Vec<i64> {
        linspace(
            self.start_position as f64,
            self.end_position as f64,
            self.motor_steps,
        )
        .into_iter()
        .map(|p| p.round() as i64)
        .collect()
    }

    #[must_use]
    pub fn voltages(&self, decimals: i32) -> Vec<f64> {
        linspace(self.start_voltage, self.end_voltage, self.voltage_steps)
            .into_iter()
            .map(|v| round_to(v, decimals))
            .collect()
    }
}

/// Handle on the instrument. Clones drive the same stage and session, so one can run an
/// operation on a worker thread while another aborts it.
#[derive(Clone)]
pub struct ScanController {
    stage: SharedStage,
    session: SessionHandle,
    setup: Arc<ControllerSetup>,
    abort: AbortToken,
    events: Sender<ScanEvent>,
}

impl ScanController {
    #[must_use]
    pub fn new(
        stage: SharedStage,
        session: SessionHandle,
        setup: ControllerSetup,
        events: Sender<ScanEvent>,
    ) -> Self {
        ScanController {
            stage,
            session,
            setup: Arc::new(setup),
            abort: AbortToken::default(),
            events,
        }
    }

    #[inline]
    #[must_use]
    pub fn setup(&self) -> &ControllerSetup {
        &self.setup
    }

    #[inline]
    #[must_use]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    #[inline]
    #[must_use]
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    fn emit(&self, event: ScanEvent) {
        info!("{event}");
        // nobody listening is not an error
        let _ = self.events.send(event);
    }

    /// Claim the controller for an operation, moving to `next` if given.
    fn reserve(
        &self,
        next: Option<ControllerState>,
        needs_references: bool,
    ) -> Result<Option<CalibrationReferences>, ScanError> {
        self.session.update(|s| {
            if s.running {
                return Err(ScanError::Busy(s.state));
            }
            if needs_references && s.references.is_none() {
                return Err(ScanError::NotCalibrated);
            }
            s.running = true;
            if let Some(state) = next {
                s.state = state;
            }
            self.abort.reset();
            Ok(s.references)
        })
    }

    fn release(&self, state: ControllerState) {
        self.session.update(|s| {
            s.running = false;
            s.state = state;
        });
    }

    fn device<T>(
        &self,
        f: impl FnOnce(&mut dyn Stage) -> StageResult<T>,
    ) -> Result<T, ScanError> {
        Ok(self.stage.with(f)?)
    }

    fn set_output_voltage(&self, volts: f64) -> Result<(), ScanError> {
        self.device(|s| s.set_output_voltage(volts))?;
        self.session.update(|s| s.output_voltage = volts);
        Ok(())
    }

    /// Sleep for `total`, in slices no longer than the motion poll, checking the abort flag
    /// between slices and once more at the end.
    fn pause(&self, total: Duration) -> Result<(), ScanError> {
        let slice = self
            .setup
            .timing
            .motion_poll
            .max(Duration::from_millis(1));
        let mut left = total;
        while !left.is_zero() {
            self.abort.check()?;
            let step = left.min(slice);
            thread::sleep(step);
            left -= step;
        }
        self.abort.check()
    }

    fn wait_for_motion(&self) -> Result<(), ScanError> {
        loop {
            self.abort.check()?;
            if !self.device(|s| s.is_in_motion())? {
                return Ok(());
            }
            thread::sleep(self.setup.timing.motion_poll);
        }
    }

    /// Zero the analyzer and halt the stage, logging rather than propagating failures.
    fn safe_stop(&self) {
        if let Err(e) = self.set_output_voltage(0.0) {
            warn!("failed to zero output voltage during cleanup: {e}");
        }
        if let Err(e) = self.device(|s| s.stop()) {
            warn!("failed to stop stage during cleanup: {e}");
        }
    }

    /// Find the limit switches and derive the stage reference frame.
    /// # Errors
    /// `Busy` if another operation holds the controller, `Calibration` when no switch is active
    /// after the seek, `Device` for link failures, `Aborted`.
    pub fn calibrate(&self) -> Result<CalibrationReferences, ScanError> {
        let previous = self.session.state();
        self.reserve(Some(ControllerState::Calibrating), false)?;
        info!("calibrating stage references (was {previous})");
        match self.find_references() {
            Ok(refs) => {
                self.session.update(|s| s.references = Some(refs));
                self.release(ControllerState::Ready);
                self.emit(ScanEvent::CalibrationDone(refs));
                Ok(refs)
            }
            Err(e) => {
                if matches!(e, ScanError::Aborted | ScanError::Device(_)) {
                    self.safe_stop();
                }
                self.session.update(|s| s.references = None);
                self.release(ControllerState::Idle);
                self.emit(ScanEvent::CalibrationFailed(e.to_string()));
                Err(e)
            }
        }
    }

    fn find_references(&self) -> Result<CalibrationReferences, ScanError> {
        let mut status = self.device(|s| s.read_status())?;
        if Anchor::from_status(status).is_none() {
            debug!("no switch active, seeking edge");
            self.device(|s| {
                s.set_speed(self.setup.speeds.seek)?;
                s.seek_edge()
            })?;
            self.wait_for_motion()?;
            self.device(|s| s.set_speed(self.setup.speeds.default))?;
            status = self.device(|s| s.read_status())?;
        }
        let anchor = Anchor::from_status(status).ok_or(ScanError::Calibration)?;
        let position = self.device(|s| s.read_position())?;
        let refs = CalibrationReferences::from_anchor(
            anchor,
            position,
            self.setup.offsets,
            self.setup.travel_mm,
        );
        info!(
            "anchored on {anchor:?} switch at {position}: home {}, faraday {}, end {}",
            refs.home, refs.faraday, refs.end
        );
        Ok(refs)
    }

    fn header_for(
        &self,
        params: &ScanParams,
        refs: &CalibrationReferences,
    ) -> Result<ScanHeader, ScanError> {
        let start_mm = refs
            .position_to_mm(params.start_position)
            .ok_or(ScanError::NotCalibrated)?;
        let end_mm = refs
            .position_to_mm(params.end_position)
            .ok_or(ScanError::NotCalibrated)?;
        let step = |start: f64, end: f64, steps: usize| {
            if steps > 1 {
                (end - start) / (steps - 1) as f64
            } else {
                0.0
            }
        };
        Ok(ScanHeader {
            comment: self.setup.comment.clone(),
            plate_length: self.setup.plate_length,
            plate_gap: self.setup.plate_gap,
            beam_energy: self.setup.beam_energy,
            motor_start_mm: start_mm,
            motor_step_mm: step(start_mm, end_mm, params.motor_steps),
            voltage_start: params.start_voltage,
            voltage_step: step(params.start_voltage, params.end_voltage, params.voltage_steps),
            voltage_steps: params.voltage_steps,
            position_steps: params.motor_steps,
        })
    }

    /// Validate, claim the controller and build the file header. Nothing touches the device.
    fn begin_scan(&self, params: &ScanParams) -> Result<ScanHeader, ScanError> {
        params.validate()?;
        let refs = self
            .reserve(Some(ControllerState::Scanning), true)?
            .ok_or(ScanError::NotCalibrated)?;
        match self.header_for(params, &refs) {
            Ok(header) => {
                self.session.update(|s| s.rows_completed = 0);
                Ok(header)
            }
            Err(e) => {
                self.release(ControllerState::Idle);
                Err(e)
            }
        }
    }

    /// Run a complete scan on the calling thread, recording into `out`.
    /// # Errors
    /// Precondition failures (`Busy`, `NotCalibrated`, `InvalidScan`) are returned without
    /// touching the device; otherwise the scan's outcome, after the matching event is emitted.
    pub fn run_scan<W: Write>(&self, params: &ScanParams, out: W) -> Result<usize, ScanError> {
        let header = self.begin_scan(params)?;
        let recorder = match ScanRecorder::new(out, &header) {
            Ok(r) => r,
            Err(e) => {
                self.release(ControllerState::Idle);
                self.emit(ScanEvent::ScanFailed(e.to_string()));
                return Err(e.into());
            }
        };
        self.execute_scan(params, recorder)
    }

    /// Open a timestamped data file in the output directory and run the scan on a worker thread.
    /// # Errors
    /// Precondition failures, or failure to create the data file or the thread.
    pub fn start_scan(&self, params: &ScanParams) -> Result<(PathBuf, JoinHandle<()>), ScanError> {
        let header = self.begin_scan(params)?;
        let path = self
            .setup
            .output_dir
            .join(Local::now().format("datafile_%Y-%m-%d_%H-%M.dat").to_string());
        let recorder = match ScanRecorder::create(&path, &header) {
            Ok(r) => r,
            Err(e) => {
                self.release(ControllerState::Idle);
                self.emit(ScanEvent::ScanFailed(e.to_string()));
                return Err(e.into());
            }
        };
        self.session.update(|s| s.data_file = Some(path.clone()));
        info!("recording scan to {}", path.display());

        let worker = self.clone();
        let params = *params;
        let handle = thread::Builder::new()
            .name("scan".into())
            .spawn(move || {
                let _ = worker.execute_scan(&params, recorder);
            })
            .map_err(|e| {
                self.release(ControllerState::Idle);
                ScanError::Recorder(e)
            })?;
        Ok((path, handle))
    }

    fn execute_scan<W: Write>(
        &self,
        params: &ScanParams,
        mut recorder: ScanRecorder<W>,
    ) -> Result<usize, ScanError> {
        self.emit(ScanEvent::ScanStarted {
            positions: params.motor_steps,
            voltages: params.voltage_steps,
        });
        let result = self
            .sweep(params, &mut recorder)
            .and_then(|rows| self.finish_scan().map(|()| rows));
        let rows = recorder.rows_written();
        match &result {
            Ok(_) => self.emit(ScanEvent::ScanCompleted { rows }),
            Err(ScanError::Aborted) => {
                self.safe_stop();
                self.emit(ScanEvent::ScanAborted { rows });
            }
            Err(e) => {
                error!("scan failed after {rows} rows: {e}");
                self.safe_stop();
                self.emit(ScanEvent::ScanFailed(e.to_string()));
            }
        }
        self.release(ControllerState::Idle);
        result
    }

    fn sweep<W: Write>(
        &self,
        params: &ScanParams,
        recorder: &mut ScanRecorder<W>,
    ) -> Result<usize, ScanError> {
        let positions = params.positions();
        let voltages = params.voltages(self.setup.voltage_decimals);
        self.device(|s| s.set_speed(self.setup.speeds.travel))?;

        for (index, &position) in positions.iter().enumerate() {
            self.abort.check()?;
            self.pause(self.setup.timing.pre_move)?;
            self.device(|s| s.move_to(position))?;
            self.wait_for_motion()?;

            let mut row = Vec::with_capacity(voltages.len());
            for &volts in &voltages {
                self.abort.check()?;
                self.set_output_voltage(volts)?;
                self.pause(self.setup.timing.settle)?;
                let reading = self.device(|s| s.read_input_voltage())?;
                debug!("{position} @ {volts} V -> {reading}");
                self.session.update(|s| s.input_voltage = reading);
                row.push(reading);
            }
            recorder.write_row(&row)?;
            self.session.update(|s| s.rows_completed = index + 1);
            info!(
                "position {}/{} ({position}) recorded",
                index + 1,
                positions.len()
            );
        }
        Ok(positions.len())
    }

    fn finish_scan(&self) -> Result<(), ScanError> {
        self.set_output_voltage(0.0)?;
        self.device(|s| s.set_speed(self.setup.speeds.default))?;
        if self.setup.return_to_faraday {
            if let Some(refs) = self.session.references() {
                self.travel_to(refs.faraday)?;
            }
        }
        Ok(())
    }

    /// Move at travel speed and wait for the stage to stop.
    fn travel_to(&self, target: i64) -> Result<(), ScanError> {
        self.device(|s| {
            s.set_speed(self.setup.speeds.travel)?;
            s.move_to(target)
        })?;
        self.wait_for_motion()?;
        self.device(|s| s.set_speed(self.setup.speeds.default))
    }

    fn go_to_reference(
        &self,
        name: &str,
        pick: impl FnOnce(&CalibrationReferences) -> i64,
    ) -> Result<(), ScanError> {
        let refs = self.reserve(None, true)?.ok_or(ScanError::NotCalibrated)?;
        let target = pick(&refs);
        info!("moving to {name} ({target})");
        let result = self.travel_to(target);
        if let Err(e) = &result {
            warn!("move to {name} interrupted: {e}");
            if let Err(e) = self.device(|s| s.stop()) {
                warn!("failed to stop stage: {e}");
            }
        }
        let state = self.session.state();
        self.release(state);
        result
    }

    /// # Errors
    /// `NotCalibrated`, `Busy`, `Aborted` or a device failure.
    pub fn go_home(&self) -> Result<(), ScanError> {
        self.go_to_reference("home", |r| r.home)
    }

    /// # Errors
    /// `NotCalibrated`, `Busy`, `Aborted` or a device failure.
    pub fn go_faraday(&self) -> Result<(), ScanError> {
        self.go_to_reference("faraday", |r| r.faraday)
    }

    /// Run `op` on a worker thread, logging its failure. Used for operations whose outcome is
    /// reported through events or the session rather than a return value.
    /// # Errors
    /// Fails only if the thread cannot be started.
    pub fn spawn<F>(&self, name: &str, op: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce(&ScanController) -> Result<(), ScanError> + Send + 'static,
    {
        let worker = self.clone();
        let label = name.to_string();
        thread::Builder::new().name(label.clone()).spawn(move || {
            if let Err(e) = op(&worker) {
                warn!("{label} ended: {e}");
            }
        })
    }

    /// Request that the running operation stop at its next check point. The operation itself
    /// zeroes the output and stops the stage.
    pub fn abort(&self) {
        info!("abort requested");
        self.abort.trigger();
    }

    /// Leave the hardware safe and release the link: stop, set the close speed, zero the output,
    /// close. Every step is attempted; the first failure is returned.
    /// # Errors
    /// The first device failure encountered.
    pub fn shutdown(&self) -> Result<(), ScanError> {
        self.abort.trigger();
        let close_speed = self.setup.speeds.close;
        let mut first: Option<StageError> = None;
        let mut attempt = |what: &str, result: StageResult<()>| {
            if let Err(e) = result {
                warn!("shutdown: {what} failed: {e}");
                first.get_or_insert(e);
            }
        };
        attempt("stop", self.stage.with(|s| s.stop()));
        attempt("set close speed", self.stage.with(|s| s.set_speed(close_speed)));
        attempt("zero output", self.stage.with(|s| s.set_output_voltage(0.0)));
        attempt("close link", self.stage.with(|s| s.close()));
        self.session.update(|s| {
            s.output_voltage = 0.0;
            s.running = false;
        });
        first.map_or(Ok(()), |e| Err(e.into()))
    }
}

#[cfg(test)]
mod tests;
