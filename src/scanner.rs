#![warn(clippy::pedantic)]
#![allow(clippy::result_unit_err)]

use std::path::Path;
use std::str::Split;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::analysis::{self, AnalysisSetup, EmittanceResult};
use crate::controller::{ScanController, ScanError, ScanParams};
use crate::datafile::{self, AxisCalibration};

/// Default scan window, in mm from the park position and analyzer volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoScan {
    pub start_mm: f64,
    pub end_mm: f64,
    pub motor_steps: usize,
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub voltage_steps: usize,
}

impl Default for AutoScan {
    fn default() -> Self {
        AutoScan {
            start_mm: 160.0,
            end_mm: 196.0,
            motor_steps: 100,
            start_voltage: -2.0,
            end_voltage: 2.0,
            voltage_steps: 50,
        }
    }
}

/// Load a scan file and run the full analysis on it.
/// # Errors
/// Describes either a malformed file or a failed analysis.
pub fn analyze_file(path: &Path, setup: &AnalysisSetup) -> Result<EmittanceResult, String> {
    let (header, grid) = datafile::load_scan_file(path).map_err(|e| e.to_string())?;
    let calibration = AxisCalibration::from_header(&header).map_err(|e| e.to_string())?;
    log::info!(
        "{}: '{}', {} positions from {:.3} mm, {} voltages from {} V",
        path.display(),
        header.comment,
        calibration.position_steps,
        calibration.motor_start,
        calibration.voltage_steps,
        calibration.voltage_min,
    );
    analysis::analyze(&grid, &calibration, setup).map_err(|e| e.to_string())
}

/// The instrument as seen from the command socket: the controller plus scan and analysis
/// defaults.
pub struct Scanner {
    pub controller: ScanController,
    pub auto_scan: AutoScan,
    pub analysis: AnalysisSetup,
    pub start_time: Instant,
    pub cycle_counter: u64,
    pub exit_requested: bool,
    workers: Vec<JoinHandle<()>>,
}

fn parse<T: std::str::FromStr>(x: &str) -> Result<T, ()> {
    x.parse::<T>().or(Err(()))
}

fn reply(result: Result<String, ScanError>) -> String {
    result.unwrap_or_else(|e| format!("ERR:{e}"))
}

impl Scanner {
    #[must_use]
    pub fn new(controller: ScanController) -> Self {
        Scanner {
            controller,
            auto_scan: AutoScan::default(),
            analysis: AnalysisSetup::default(),
            start_time: Instant::now(),
            cycle_counter: 0,
            exit_requested: false,
            workers: Vec::new(),
        }
    }

    /// Join worker threads that have finished.
    pub fn reap_workers(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(JoinHandle::is_finished);
        self.workers = running;
        for handle in done {
            if handle.join().is_err() {
                log::error!("controller worker panicked");
            }
        }
    }

    /// Block until every running operation has ended.
    pub fn wait_for_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("controller worker panicked");
            }
        }
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.controller.session().snapshot().running
    }

    fn spawn(
        &mut self,
        name: &str,
        op: impl FnOnce(&ScanController) -> Result<(), ScanError> + Send + 'static,
    ) -> Result<String, ScanError> {
        let snap = self.controller.session().snapshot();
        if snap.running {
            return Err(ScanError::Busy(snap.state));
        }
        self.workers.push(self.controller.spawn(name, op)?);
        Ok("OK".into())
    }

    fn start_scan(&mut self, params: &ScanParams) -> Result<String, ScanError> {
        let (path, handle) = self.controller.start_scan(params)?;
        self.workers.push(handle);
        Ok(path.display().to_string())
    }

    fn scan_from_mm(&mut self, window: AutoScan) -> Result<String, ScanError> {
        let refs = self
            .controller
            .session()
            .references()
            .ok_or(ScanError::NotCalibrated)?;
        let params = ScanParams::from_mm(
            &refs,
            window.start_mm,
            window.end_mm,
            window.motor_steps,
            window.start_voltage,
            window.end_voltage,
            window.voltage_steps,
        )
        .ok_or(ScanError::NotCalibrated)?;
        self.start_scan(&params)
    }

    /// `state:running:position:position_mm:status:output_v:input_v:calibrated:rows`
    #[must_use]
    pub fn state_line(&self) -> String {
        let s = self.controller.session().snapshot();
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            s.state,
            u8::from(s.running),
            s.position,
            s.position_mm().map_or_else(|| "NaN".into(), |mm| format!("{mm:.3}")),
            s.status.raw(),
            s.output_voltage,
            s.input_voltage,
            u8::from(s.calibrated()),
            s.rows_completed,
        )
    }

    fn process_scan_command(&mut self, cmd: Split<'_, char>) -> Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["AUTO"] => reply(self.scan_from_mm(self.auto_scan)),
            ["START", start_mm, end_mm, motor_steps, v_start, v_end, v_steps] => {
                let window = AutoScan {
                    start_mm: parse(start_mm)?,
                    end_mm: parse(end_mm)?,
                    motor_steps: parse(motor_steps)?,
                    start_voltage: parse(v_start)?,
                    end_voltage: parse(v_end)?,
                    voltage_steps: parse(v_steps)?,
                };
                reply(self.scan_from_mm(window))
            }
            ["AUTO", "GET"] => format!(
                "{}:{}:{}:{}:{}:{}",
                self.auto_scan.start_mm,
                self.auto_scan.end_mm,
                self.auto_scan.motor_steps,
                self.auto_scan.start_voltage,
                self.auto_scan.end_voltage,
                self.auto_scan.voltage_steps
            ),
            _ => Err(())?,
        };
        Ok(resp)
    }

    fn process_analyzer_command(&mut self, cmd: Split<'_, char>) -> Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["SIGMA", "SET", x] => {
                self.analysis.sigma = parse(x)?;
                String::new()
            }
            ["SIGMA", "GET"] => self.analysis.sigma.to_string(),
            ["PASSES", "SET", x] => {
                self.analysis.passes = parse(x)?;
                String::new()
            }
            ["PASSES", "GET"] => self.analysis.passes.to_string(),
            ["CUT", "SET", x] => {
                self.analysis.cut_fraction = parse(x)?;
                String::new()
            }
            ["CUT", "GET"] => self.analysis.cut_fraction.to_string(),
            _ => Err(())?,
        };
        Ok(resp)
    }

    /// Handle an incoming command by routing it to the appropriate subfunction. Returns the
    /// reply for the sender; operation failures are replied as `ERR:<reason>`.
    /// # Errors
    /// Returns `Err(())` when `cmd` is not a recognised command.
    pub fn process_command(&mut self, mut cmd: Split<'_, char>) -> Result<String, ()> {
        self.reap_workers();
        match cmd.next() {
            Some("CALIBRATE") => Ok(reply(
                self.spawn("calibrate", |c| c.calibrate().map(|_| ())),
            )),
            Some("SCAN") => self.process_scan_command(cmd),
            Some("ABORT") => {
                self.controller.abort();
                Ok("OK".into())
            }
            Some("GO") => match cmd.next() {
                Some("HOME") => Ok(reply(self.spawn("go-home", ScanController::go_home))),
                Some("FARADAY") => Ok(reply(self.spawn("go-faraday", ScanController::go_faraday))),
                Some(_) | None => Err(()),
            },
            Some("STATE") => match cmd.next() {
                Some("GET") => Ok(self.state_line()),
                Some(_) | None => Err(()),
            },
            Some("ANALYZER") => self.process_analyzer_command(cmd),
            Some("ANALYZE") => {
                // paths may themselves contain ':'
                let file = cmd.collect::<Vec<&str>>().join(":");
                if file.is_empty() {
                    return Err(());
                }
                Ok(
                    match analyze_file(Path::new(&file), &self.analysis) {
                        Ok(r) => format!("{}:{}:{}", r.x2_rms, r.theta2_rms, r.emittance),
                        Err(e) => format!("ERR:{e}"),
                    },
                )
            }
            Some("SERVICE") => match cmd.next() {
                Some("STOP") => {
                    self.controller.abort();
                    self.exit_requested = true;
                    Ok("OK".into())
                }
                Some(_) | None => Err(()),
            },
            Some(_) | None => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerSetup, Timing};
    use crate::session::{SessionHandle, SharedStage};
    use stage_sys::{SimStage, Stage};
    use std::sync::mpsc;

    fn scanner(sim: &SimStage, setup: ControllerSetup) -> Scanner {
        let mut stage = sim.clone();
        stage.open("sim").unwrap();
        let (tx, _rx) = mpsc::channel();
        let controller = ScanController::new(
            SharedStage::new(stage),
            SessionHandle::new(4).unwrap(),
            setup,
            tx,
        );
        Scanner::new(controller)
    }

    fn run(s: &mut Scanner, cmd: &str) -> Result<String, ()> {
        s.process_command(cmd.split(':'))
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let sim = SimStage::new();
        let mut s = scanner(&sim, ControllerSetup::default());
        assert_eq!(run(&mut s, "LAMP:ON"), Err(()));
        assert_eq!(run(&mut s, "GO:NOWHERE"), Err(()));
        assert_eq!(run(&mut s, "SCAN:START:1:2"), Err(()));
        assert_eq!(run(&mut s, "SCAN:START:a:2:3:4:5:6"), Err(()));
        assert_eq!(run(&mut s, "ANALYZE"), Err(()));
        assert_eq!(
            run(&mut s, "SCAN:AUTO").unwrap(),
            "ERR:stage references unknown; calibrate first"
        );
    }

    #[test]
    fn analyzer_settings() {
        let sim = SimStage::new();
        let mut s = scanner(&sim, ControllerSetup::default());
        run(&mut s, "ANALYZER:PASSES:SET:2").unwrap();
        assert_eq!(run(&mut s, "ANALYZER:PASSES:GET").unwrap(), "2");
        assert_eq!(run(&mut s, "ANALYZER:CUT:SET:x"), Err(()));
        assert_eq!(run(&mut s, "ANALYZER:SIGMA:GET").unwrap(), "0.6");
    }

    #[test]
    fn calibrate_scan_and_analyze() {
        let dir = tempfile::tempdir().unwrap();
        // 1 mm is 6_257_493 / 193 counts with the default switch spacing
        let counts_per_mm = 6_257_493.0 / 193.0;
        let sim = SimStage::new().with_beam(SimStage::gaussian_beam(
            1.0,
            (80.0 * counts_per_mm) as i64,
            5.0 * counts_per_mm,
            0.0,
            0.8,
        ));
        let setup = ControllerSetup {
            timing: Timing::immediate(),
            output_dir: dir.path().to_path_buf(),
            ..ControllerSetup::default()
        };
        let mut s = scanner(&sim, setup);

        assert_eq!(run(&mut s, "CALIBRATE").unwrap(), "OK");
        s.wait_for_workers();
        assert!(run(&mut s, "STATE:GET").unwrap().starts_with("Ready:0:"));

        let path = run(&mut s, "SCAN:START:60:100:16:-2:2:12").unwrap();
        assert!(!path.starts_with("ERR"));
        s.wait_for_workers();
        assert!(run(&mut s, "STATE:GET").unwrap().starts_with("Idle:0:"));

        let resp = run(&mut s, &format!("ANALYZE:{path}")).unwrap();
        let numbers: Vec<f64> = resp.split(':').map(|x| x.parse().unwrap()).collect();
        assert_eq!(numbers.len(), 3);
        assert!(numbers.iter().all(|x| x.is_finite() && *x > 0.0));

        assert!(run(&mut s, "ANALYZE:/no/such/file.dat")
            .unwrap()
            .starts_with("ERR:"));
    }

    #[test]
    fn reference_moves_need_calibration() {
        let sim = SimStage::new().at_position(0);
        let setup = ControllerSetup {
            timing: Timing::immediate(),
            ..ControllerSetup::default()
        };
        let mut s = scanner(&sim, setup);
        assert_eq!(run(&mut s, "GO:HOME").unwrap(), "OK");
        s.wait_for_workers();
        assert_eq!(sim.position(), 0);

        run(&mut s, "CALIBRATE").unwrap();
        s.wait_for_workers();
        run(&mut s, "GO:FARADAY").unwrap();
        s.wait_for_workers();
        assert_eq!(sim.position(), 3_679_098);
        assert_eq!(run(&mut s, "SERVICE:STOP").unwrap(), "OK");
        assert!(s.exit_requested);
    }
}
