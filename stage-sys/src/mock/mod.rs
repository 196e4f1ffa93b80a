//! A simulated slit stage and analyzer, for running the controller away from the instrument.
//!
//! Motion is modelled in status polls rather than wall-clock time: a commanded move completes
//! after a fixed number of status reads, which keeps tests deterministic regardless of how long
//! the caller sleeps between polls.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{
    ErrorCode, StageError, StageResult, StatusWord, STATUS_FORWARD_SWITCH, STATUS_HOME_SWITCH,
    STATUS_IN_MOTION, STATUS_REVERSE_SWITCH,
};
use crate::stage::Stage;

#[cfg(feature = "mock_loud")]
use lazy_static::lazy_static;
#[cfg(feature = "mock_loud")]
use std::time::Instant;

#[cfg(feature = "mock_loud")]
lazy_static! {
    static ref API_START_TIME: Instant = Instant::now();
}

macro_rules! announce {
    ($call:expr $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "mock_loud")]
        {
            print!("[{}] {}", API_START_TIME.elapsed().as_secs_f32(), $call);
            $(
                print!(" ({:?})", $arg);
            )*
            println!();
        }
    };
}

/// Every command the simulated controller has accepted, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(String),
    MoveTo(i64),
    SetSpeed(u32),
    SetOutputVoltage(f64),
    SeekEdge,
    Stop,
    Close,
}

/// Analyzer response: input reading as a function of (stage position, output voltage).
pub type BeamFn = Box<dyn FnMut(i64, f64) -> f64 + Send>;

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: i64,
    to: i64,
    polls_left: u32,
    total: u32,
}

impl Motion {
    fn current(&self) -> i64 {
        let done = f64::from(self.total - self.polls_left) / f64::from(self.total);
        self.from + ((self.to - self.from) as f64 * done) as i64
    }
}

struct SimState {
    open: bool,
    position: i64,
    motion: Option<Motion>,
    speed: u32,
    output_voltage: f64,

    reverse_limit: i64,
    home_switch: i64,
    home_width: i64,
    forward_limit: i64,
    seek_target: Option<i64>,
    polls_per_move: u32,

    beam: BeamFn,
    history: Vec<Command>,
    calls: u64,
    fail_from: Option<(u64, ErrorCode)>,
}

impl SimState {
    fn check_call(&mut self) -> StageResult<()> {
        self.calls += 1;
        if let Some((n, code)) = self.fail_from {
            if self.calls >= n {
                return Err(StageError::Controller(code));
            }
        }
        if self.open {
            Ok(())
        } else {
            Err(StageError::NotOpen)
        }
    }

    fn current_position(&self) -> i64 {
        self.motion.map_or(self.position, |m| m.current())
    }

    fn start_motion(&mut self, target: i64) {
        let from = self.current_position();
        let to = target.clamp(self.reverse_limit, self.forward_limit);
        self.motion = Some(Motion {
            from,
            to,
            polls_left: self.polls_per_move.max(1),
            total: self.polls_per_move.max(1),
        });
    }

    fn status(&self) -> StatusWord {
        let pos = self.current_position();
        let mut word = 0;
        if self.motion.is_some() {
            word |= STATUS_IN_MOTION;
        }
        if (pos - self.home_switch).abs() <= self.home_width {
            word |= STATUS_HOME_SWITCH;
        }
        if pos > self.reverse_limit {
            word |= STATUS_REVERSE_SWITCH;
        }
        if pos < self.forward_limit {
            word |= STATUS_FORWARD_SWITCH;
        }
        StatusWord(word)
    }

    fn advance(&mut self) {
        if let Some(mut m) = self.motion {
            m.polls_left -= 1;
            if m.polls_left == 0 {
                self.position = m.to;
                self.motion = None;
            } else {
                self.motion = Some(m);
            }
        }
    }
}

/// Handle on a simulated controller. Clones share the same simulated hardware, so a test can keep
/// one handle for inspection while the controller owns another.
#[derive(Clone)]
pub struct SimStage {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimStage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStage {
    /// Stage parked between the reverse limit and the home switch, spaced with the instrument's
    /// mechanical offsets.
    #[must_use]
    pub fn new() -> Self {
        SimStage {
            inner: Arc::new(Mutex::new(SimState {
                open: false,
                position: 1_500_000,
                motion: None,
                speed: 50_000,
                output_voltage: 0.0,
                reverse_limit: 0,
                home_switch: 3_679_098,
                home_width: 2_000,
                forward_limit: 3_679_098 + 2_578_395,
                seek_target: None,
                polls_per_move: 3,
                beam: Box::new(|_, _| 0.0),
                history: Vec::new(),
                calls: 0,
                fail_from: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn at_position(self, position: i64) -> Self {
        {
            let mut s = self.state();
            s.position = position;
            s.motion = None;
        }
        self
    }

    /// Place the reverse limit, the home switch and the forward limit.
    #[must_use]
    pub fn with_switches(self, reverse: i64, home: i64, forward: i64) -> Self {
        {
            let mut s = self.state();
            s.reverse_limit = reverse;
            s.home_switch = home;
            s.forward_limit = forward;
        }
        self
    }

    /// Where an edge seek comes to rest, instead of the home switch.
    #[must_use]
    pub fn with_seek_target(self, position: i64) -> Self {
        self.state().seek_target = Some(position);
        self
    }

    #[must_use]
    pub fn with_polls_per_move(self, polls: u32) -> Self {
        self.state().polls_per_move = polls.max(1);
        self
    }

    /// The closure runs with the simulator locked; it must not call back into this stage.
    #[must_use]
    pub fn with_beam<F>(self, beam: F) -> Self
    where
        F: FnMut(i64, f64) -> f64 + Send + 'static,
    {
        self.state().beam = Box::new(beam);
        self
    }

    /// Every call from the `n`th onward (counting from 1) fails with `code`, as a dropped link
    /// would.
    #[must_use]
    pub fn failing_from(self, n: u64, code: ErrorCode) -> Self {
        self.state().fail_from = Some((n, code));
        self
    }

    /// Two-dimensional Gaussian beam response, peaked at (`position`, `volts`).
    #[must_use]
    pub fn gaussian_beam(
        amplitude: f64,
        position: i64,
        position_sigma: f64,
        volts: f64,
        volts_sigma: f64,
    ) -> impl FnMut(i64, f64) -> f64 + Send + 'static {
        move |p, v| {
            let dx = (p - position) as f64 / position_sigma;
            let dv = (v - volts) / volts_sigma;
            amplitude * (-0.5 * (dx * dx + dv * dv)).exp()
        }
    }

    #[must_use]
    pub fn history(&self) -> Vec<Command> {
        self.state().history.clone()
    }

    #[must_use]
    pub fn output_voltages(&self) -> Vec<f64> {
        self.state()
            .history
            .iter()
            .filter_map(|c| match c {
                Command::SetOutputVoltage(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn position(&self) -> i64 {
        self.state().current_position()
    }

    #[must_use]
    pub fn speed(&self) -> u32 {
        self.state().speed
    }

    #[must_use]
    pub fn output_voltage(&self) -> f64 {
        self.state().output_voltage
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    #[must_use]
    pub fn in_motion(&self) -> bool {
        self.state().motion.is_some()
    }
}

impl Stage for SimStage {
    fn open(&mut self, address: &str) -> StageResult<()> {
        announce!("open", address);
        let mut s = self.state();
        s.open = true;
        s.check_call()?;
        s.history.push(Command::Open(address.to_string()));
        Ok(())
    }

    fn move_to(&mut self, position: i64) -> StageResult<()> {
        announce!("move_to", position);
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::MoveTo(position));
        s.start_motion(position);
        Ok(())
    }

    fn set_speed(&mut self, counts_per_sec: u32) -> StageResult<()> {
        announce!("set_speed", counts_per_sec);
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::SetSpeed(counts_per_sec));
        s.speed = counts_per_sec;
        Ok(())
    }

    fn set_output_voltage(&mut self, volts: f64) -> StageResult<()> {
        announce!("set_output_voltage", volts);
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::SetOutputVoltage(volts));
        s.output_voltage = volts;
        Ok(())
    }

    fn read_input_voltage(&mut self) -> StageResult<f64> {
        announce!("read_input_voltage");
        let mut s = self.state();
        s.check_call()?;
        let position = s.current_position();
        let volts = s.output_voltage;
        Ok((s.beam)(position, volts))
    }

    fn read_position(&mut self) -> StageResult<i64> {
        announce!("read_position");
        let mut s = self.state();
        s.check_call()?;
        Ok(s.current_position())
    }

    fn read_status(&mut self) -> StageResult<StatusWord> {
        announce!("read_status");
        let mut s = self.state();
        s.check_call()?;
        let word = s.status();
        s.advance();
        Ok(word)
    }

    fn seek_edge(&mut self) -> StageResult<()> {
        announce!("seek_edge");
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::SeekEdge);
        let target = s.seek_target.unwrap_or(s.home_switch);
        s.start_motion(target);
        Ok(())
    }

    fn stop(&mut self) -> StageResult<()> {
        announce!("stop");
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::Stop);
        s.position = s.current_position();
        s.motion = None;
        Ok(())
    }

    fn close(&mut self) -> StageResult<()> {
        announce!("close");
        let mut s = self.state();
        s.check_call()?;
        s.history.push(Command::Close);
        s.open = false;
        Ok(())
    }
}
