use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use stage_sys::mock::Command;
use stage_sys::{ErrorCode, SimStage};

use super::*;
use crate::datafile::{load_scan_file, read_scan, DataFormatError};

fn rig(sim: &SimStage, setup: ControllerSetup) -> (ScanController, Receiver<ScanEvent>) {
    let stage = SharedStage::new(sim.clone());
    stage.with(|s| s.open("sim")).unwrap();
    let (tx, rx) = mpsc::channel();
    let session = SessionHandle::new(6).unwrap();
    (ScanController::new(stage, session, setup, tx), rx)
}

fn quick_setup() -> ControllerSetup {
    ControllerSetup {
        timing: Timing::immediate(),
        ..ControllerSetup::default()
    }
}

fn small_scan() -> ScanParams {
    ScanParams {
        start_position: 1_000_000,
        end_position: 2_000_000,
        motor_steps: 3,
        start_voltage: -1.0,
        end_voltage: 1.0,
        voltage_steps: 2,
    }
}

#[test]
fn calibration_on_active_reverse_switch() {
    let sim = SimStage::new()
        .with_switches(1000, 1000 + 3_679_098, 1000 + 3_679_098 + 2_578_395)
        .at_position(1000);
    let (ctl, rx) = rig(&sim, quick_setup());

    let refs = ctl.calibrate().unwrap();
    assert_eq!(
        (refs.home, refs.faraday, refs.end),
        (1000, 4_679_098, 7_257_493)
    );
    // already on a switch: nothing but reads
    assert_eq!(sim.history(), vec![Command::Open("sim".into())]);
    let snap = ctl.session().snapshot();
    assert_eq!(snap.state, ControllerState::Ready);
    assert!(snap.calibrated());
    assert!(!snap.running);
    assert_eq!(rx.try_recv().unwrap(), ScanEvent::CalibrationDone(refs));
}

#[test]
fn calibration_seeks_when_no_switch_active() {
    let sim = SimStage::new();
    let (ctl, _rx) = rig(&sim, quick_setup());

    let refs = ctl.calibrate().unwrap();
    assert_eq!(refs.faraday, 3_679_098);
    assert_eq!(refs.home, 0);
    assert_eq!(refs.end, 3_679_098 + 2_578_395);
    assert_eq!(
        sim.history()[1..],
        [
            Command::SetSpeed(10_000),
            Command::SeekEdge,
            Command::SetSpeed(50_000)
        ]
    );
}

#[test]
fn calibration_fails_without_switch() {
    let sim = SimStage::new().with_seek_target(2_000_000);
    let (ctl, rx) = rig(&sim, quick_setup());

    assert!(matches!(ctl.calibrate(), Err(ScanError::Calibration)));
    let snap = ctl.session().snapshot();
    assert_eq!(snap.state, ControllerState::Idle);
    assert!(!snap.calibrated());
    assert!(matches!(
        rx.try_recv().unwrap(),
        ScanEvent::CalibrationFailed(_)
    ));
}

#[test]
fn scan_requires_calibration_and_valid_steps() {
    let sim = SimStage::new();
    let (ctl, _rx) = rig(&sim, quick_setup());

    assert!(matches!(
        ctl.run_scan(&small_scan(), Vec::new()),
        Err(ScanError::NotCalibrated)
    ));
    let empty = ScanParams {
        voltage_steps: 0,
        ..small_scan()
    };
    assert!(matches!(
        ctl.run_scan(&empty, Vec::new()),
        Err(ScanError::InvalidScan(_))
    ));
    assert!(matches!(ctl.go_home(), Err(ScanError::NotCalibrated)));
    // nothing reached the stage
    assert_eq!(sim.history(), vec![Command::Open("sim".into())]);
    assert!(!ctl.session().snapshot().running);
}

#[test]
fn busy_controller_rejects_operations() {
    let sim = SimStage::new().at_position(0);
    let (ctl, _rx) = rig(&sim, quick_setup());
    ctl.calibrate().unwrap();

    ctl.session().update(|s| {
        s.running = true;
        s.state = ControllerState::Scanning;
    });
    assert!(matches!(
        ctl.calibrate(),
        Err(ScanError::Busy(ControllerState::Scanning))
    ));
    assert!(matches!(
        ctl.run_scan(&small_scan(), Vec::new()),
        Err(ScanError::Busy(_))
    ));
    assert!(matches!(ctl.go_faraday(), Err(ScanError::Busy(_))));
}

#[test]
fn completed_scan_records_every_row() {
    let sim = SimStage::new()
        .at_position(0)
        .with_beam(SimStage::gaussian_beam(2.0, 1_500_000, 400_000.0, 0.0, 1.0));
    let (ctl, rx) = rig(&sim, quick_setup());
    ctl.calibrate().unwrap();

    let mut out = Vec::new();
    assert_eq!(ctl.run_scan(&small_scan(), &mut out).unwrap(), 3);

    let (header, grid) = read_scan(out.as_slice()).unwrap();
    assert_eq!(header.position_steps, 3);
    assert_eq!(header.voltage_steps, 2);
    assert_eq!(header.voltage_start, -1.0);
    assert_eq!(header.voltage_step, 2.0);
    let refs = ctl.session().references().unwrap();
    let start_mm = refs.position_to_mm(1_000_000).unwrap();
    assert!((header.motor_start_mm - start_mm).abs() < 1e-9);
    assert_eq!(grid.position_rows(), 3);
    // the middle position sits on the beam
    assert!(grid.view()[[1, 0]] > grid.view()[[0, 0]]);

    assert_eq!(
        sim.output_voltages(),
        vec![-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, 0.0]
    );
    assert_eq!(sim.position(), refs.faraday);
    assert_eq!(sim.speed(), 50_000);

    let snap = ctl.session().snapshot();
    assert_eq!(snap.state, ControllerState::Idle);
    assert_eq!(snap.rows_completed, 3);
    assert!(snap.calibrated());

    let events: Vec<ScanEvent> = rx.try_iter().collect();
    assert_eq!(
        events[1..],
        [
            ScanEvent::ScanStarted {
                positions: 3,
                voltages: 2
            },
            ScanEvent::ScanCompleted { rows: 3 },
        ]
    );
}

#[test]
fn abort_after_first_sample_leaves_no_rows() {
    let sim = SimStage::new().at_position(0);
    let setup = ControllerSetup {
        return_to_faraday: false,
        ..quick_setup()
    };
    let (ctl, rx) = rig(&sim, setup);
    ctl.calibrate().unwrap();

    let token = ctl.abort_token();
    let sim = sim.with_beam(move |_, _| {
        token.trigger();
        0.5
    });

    let mut out = Vec::new();
    assert!(matches!(
        ctl.run_scan(&small_scan(), &mut out),
        Err(ScanError::Aborted)
    ));
    // header only
    assert!(matches!(
        read_scan(out.as_slice()),
        Err(DataFormatError::RowCount {
            expected: 3,
            found: 0
        })
    ));
    assert_eq!(ctl.session().snapshot().rows_completed, 0);

    assert_eq!(sim.output_voltages().last(), Some(&0.0));
    assert_eq!(sim.history().last(), Some(&Command::Stop));
    assert_eq!(ctl.session().state(), ControllerState::Idle);
    assert!(rx
        .try_iter()
        .any(|e| e == ScanEvent::ScanAborted { rows: 0 }));
}

#[test]
fn abort_from_another_thread_interrupts_motion() {
    let motion_poll = Duration::from_millis(200);
    let sim = SimStage::new().at_position(0).with_polls_per_move(1000);
    let setup = ControllerSetup {
        timing: Timing {
            motion_poll,
            ..Timing::immediate()
        },
        ..ControllerSetup::default()
    };
    let (ctl, rx) = rig(&sim, setup);
    ctl.calibrate().unwrap();

    let worker = ctl.clone();
    let scan = thread::spawn(move || worker.run_scan(&small_scan(), Vec::new()));
    // let the first move get under way
    thread::sleep(3 * motion_poll / 2);
    assert!(sim.in_motion());

    let requested = Instant::now();
    ctl.abort();
    let result = scan.join().unwrap();
    let latency = requested.elapsed();

    assert!(matches!(result, Err(ScanError::Aborted)));
    assert!(latency < motion_poll + Duration::from_millis(150), "{latency:?}");
    assert_eq!(sim.output_voltages().last(), Some(&0.0));
    assert_eq!(sim.history().last(), Some(&Command::Stop));
    assert_eq!(ctl.session().state(), ControllerState::Idle);
    assert!(!ctl.session().snapshot().running);
    assert!(rx
        .try_iter()
        .any(|e| e == ScanEvent::ScanAborted { rows: 0 }));
}

#[test]
fn device_failure_ends_scan() {
    let sim = SimStage::new().at_position(0);
    let (ctl, rx) = rig(&sim, quick_setup());
    ctl.calibrate().unwrap();
    // open, status, position so far; fail on the first motion poll
    let sim = sim.failing_from(6, ErrorCode::NO_RESPONSE);

    let result = ctl.run_scan(&small_scan(), Vec::new());
    assert!(matches!(
        result,
        Err(ScanError::Device(StageError::Controller(ErrorCode::NO_RESPONSE)))
    ));
    assert_eq!(ctl.session().state(), ControllerState::Idle);
    assert!(!ctl.session().snapshot().running);
    assert!(rx
        .try_iter()
        .any(|e| matches!(e, ScanEvent::ScanFailed(_))));
    assert_eq!(sim.history().last(), Some(&Command::MoveTo(1_000_000)));
}

#[test]
fn reference_moves() {
    let sim = SimStage::new().at_position(0);
    let (ctl, _rx) = rig(&sim, quick_setup());
    ctl.calibrate().unwrap();

    ctl.go_faraday().unwrap();
    assert_eq!(sim.position(), 3_679_098);
    ctl.go_home().unwrap();
    assert_eq!(sim.position(), 0);
    assert_eq!(sim.speed(), 50_000);
    assert_eq!(ctl.session().state(), ControllerState::Ready);
}

#[test]
fn threaded_scan_writes_timestamped_file() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimStage::new().at_position(0).with_beam(|_, v| v + 2.0);
    let setup = ControllerSetup {
        output_dir: dir.path().to_path_buf(),
        ..quick_setup()
    };
    let (ctl, _rx) = rig(&sim, setup);
    ctl.calibrate().unwrap();

    let params = ScanParams {
        motor_steps: 2,
        ..small_scan()
    };
    let (path, handle) = ctl.start_scan(&params).unwrap();
    handle.join().unwrap();

    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("datafile_") && name.ends_with(".dat"));
    let (_, grid) = load_scan_file(&path).unwrap();
    assert_eq!(grid.position_rows(), 2);
    assert_eq!(grid.view().row(0).to_vec(), vec![1.0, 3.0]);
    assert_eq!(ctl.session().snapshot().data_file, Some(path));
}

#[test]
fn shutdown_leaves_stage_safe() {
    let sim = SimStage::new();
    let (ctl, _rx) = rig(&sim, quick_setup());
    ctl.shutdown().unwrap();
    assert_eq!(
        sim.history()[1..],
        [
            Command::Stop,
            Command::SetSpeed(100_000),
            Command::SetOutputVoltage(0.0),
            Command::Close
        ]
    );
    assert!(!sim.is_open());
}

#[test]
fn voltages_are_rounded() {
    let params = ScanParams {
        start_voltage: -2.0,
        end_voltage: 2.0,
        voltage_steps: 7,
        ..small_scan()
    };
    assert_eq!(
        params.voltages(2),
        vec![-2.0, -1.33, -0.67, 0.0, 0.67, 1.33, 2.0]
    );
    assert_eq!(params.positions(), vec![1_000_000, 1_500_000, 2_000_000]);
    let single = ScanParams {
        motor_steps: 1,
        ..small_scan()
    };
    assert_eq!(single.positions(), vec![1_000_000]);
}

#[test]
fn event_frames() {
    assert_eq!(
        ScanEvent::ScanAborted { rows: 4 }.to_string(),
        "SCAN:ABORTED:4"
    );
    assert_eq!(
        ScanEvent::ScanStarted {
            positions: 100,
            voltages: 50
        }
        .to_string(),
        "SCAN:STARTED:100:50"
    );
}
