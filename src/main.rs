#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::fs::read_to_string;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use std::{env, process};

use async_std::task;
use chrono::Local;
use env_logger::Env;
use log::{error, info, warn};

use rustemit::analysis::AnalysisSetup;
use rustemit::configs;
use rustemit::scanner::{analyze_file, Scanner};
use rustemit::session::{SessionHandle, SharedStage, StatusPoller};
use rustemit::util::find_file;
use rustemit::ScanController;
use stage_sys::Stage;

/// The service loop never sleeps for less than this, whatever the configured poll interval.
const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

fn init_logging() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn load_config() -> Option<toml::Value> {
    let path = find_file(Path::new("config.toml"))?;
    info!("reading config file {}", path.display());
    let text = match read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to read {}: {e}", path.display());
            return None;
        }
    };
    match text.parse::<toml::Value>() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!("failed to parse {}: {e}", path.display());
            None
        }
    }
}

fn analyze(cfg: Option<&toml::Value>, file: &str) -> i32 {
    let setup = match cfg.map(configs::analysis_from_config) {
        Some(Ok(setup)) => setup,
        Some(Err(e)) => {
            error!("bad analyzer settings: {e}");
            return 1;
        }
        None => AnalysisSetup::default(),
    };
    match analyze_file(Path::new(file), &setup) {
        Ok(result) => {
            info!(
                "x2_rms {:.6} mm, theta2_rms {:.6} mrad, emittance {:.6} mm mrad",
                result.x2_rms, result.theta2_rms, result.emittance
            );
            info!(
                "centroid at {:.3} mm, {:.3} mrad",
                result.x_centroid, result.theta_centroid
            );
            0
        }
        Err(e) => {
            error!("analysis of {file} failed: {e}");
            1
        }
    }
}

fn serve(cfg: &toml::Value) {
    let setup = configs::controller_setup_from_config(cfg)
        .expect("Failed to read controller settings from config file");
    let address = configs::device_address(cfg).expect("No device address in config file");

    let mut device = configs::sim_stage_from_config(cfg);
    device
        .open(&address)
        .expect("Failed to open the stage controller");
    warn!(
        "no hardware stage driver is built in; driving the simulated stage (address {address})"
    );
    let stage = SharedStage::new(device);

    let session = SessionHandle::new(configs::log_length_exponent(cfg))
        .expect("Invalid input log length in config file");
    let mut poller = StatusPoller::spawn(stage.clone(), session.clone(), setup.timing.status_poll)
        .expect("Failed to start the status poller");
    let loop_period = setup.timing.status_poll.max(MIN_LOOP_PERIOD);

    let (events_tx, events) = mpsc::channel();
    let controller = ScanController::new(stage, session, setup, events_tx);
    let mut scanner = Scanner::new(controller);
    scanner.auto_scan =
        configs::auto_scan_from_config(cfg).expect("Invalid auto_scan section in config file");
    scanner.analysis =
        configs::analysis_from_config(cfg).expect("Invalid analyzer section in config file");

    task::block_on(async {
        let mut comms = configs::comms_from_config(cfg)
            .await
            .expect("Failed to construct sockets from config file");
        info!(
            "publishing on port {}, commands on port {}",
            comms.logs_port(),
            comms.command_port()
        );

        info!("entering main loop...");
        loop {
            scanner.cycle_counter += 1;

            while let Ok(event) = events.try_recv() {
                if let Err(e) = comms.publish_event(&event).await {
                    warn!("failed to publish event {event}: {e}");
                }
            }
            if comms.should_publish_logs(scanner.cycle_counter) {
                if let Err(e) = comms.publish_logs(&scanner).await {
                    warn!("failed to publish logs: error [{e}]");
                }
            }
            while let Some(request) = comms.handle_socket_request(&mut scanner).await {
                info!("handled socket request <{request}>");
            }
            if scanner.exit_requested {
                break;
            }
            task::sleep(loop_period).await;
        }
        let _ = comms.unbind_sockets().await;
    });

    info!("shutting down");
    scanner.controller.abort();
    scanner.wait_for_workers();
    poller.stop();
    if let Err(e) = scanner.controller.shutdown() {
        error!("stage shutdown incomplete: {e}");
    }
}

fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();
    let cfg = load_config();

    match args.get(1).map(String::as_str) {
        Some("analyze") => {
            let Some(file) = args.get(2) else {
                error!("usage: {} analyze <datafile>", args[0]);
                process::exit(2);
            };
            process::exit(analyze(cfg.as_ref(), file));
        }
        None | Some("serve") => {
            let cfg = cfg.expect("A readable config.toml is required to run the scanner");
            serve(&cfg);
        }
        Some(other) => {
            error!("unknown mode '{other}'; expected 'serve' or 'analyze <datafile>'");
            process::exit(2);
        }
    }
}
