#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc
)]

use std::path::PathBuf;
use std::time::Duration;

use gethostname::gethostname;
use stage_sys::SimStage;

use crate::analysis::AnalysisSetup;
use crate::calibration::SwitchOffsets;
use crate::communications::ScannerComms;
use crate::controller::{ControllerSetup, Speeds, Timing};
use crate::scanner::AutoScan;
use crate::util::{tomlget, tomlget_opt, tomlget_or};

fn hostname() -> Result<String, String> {
    gethostname()
        .into_string()
        .map_err(|_| "failed to get hostname".into())
}

/// Per-host value first, then the shared section.
fn host_or_section<'a>(
    cfg: &'a toml::Value,
    hostname: &str,
    section: &str,
    key: &str,
) -> Option<&'a str> {
    tomlget_opt!(cfg, hostname, key, as_str).or_else(|| tomlget_opt!(cfg, section, key, as_str))
}

pub fn speeds_from_config(cfg: &toml::Value) -> Speeds {
    let default = Speeds::default();
    let speed = |key: &str, or: u32| {
        tomlget_or!(cfg, "device", key, as_integer, u32, i64::from(or))
    };
    Speeds {
        travel: speed("travel_speed", default.travel),
        default: speed("default_speed", default.default),
        seek: speed("seek_speed", default.seek),
        close: speed("close_speed", default.close),
    }
}

pub fn timing_from_config(cfg: &toml::Value) -> Timing {
    let millis = |key: &str, or: Duration| {
        Duration::from_millis(tomlget_or!(
            cfg,
            "timing",
            key,
            as_integer,
            u64,
            or.as_millis() as i64
        ))
    };
    let default = Timing::default();
    Timing {
        settle: millis("settle_ms", default.settle),
        motion_poll: millis("motion_poll_ms", default.motion_poll),
        pre_move: millis("pre_move_ms", default.pre_move),
        status_poll: millis("status_poll_ms", default.status_poll),
    }
}

pub fn controller_setup_from_config(cfg: &toml::Value) -> Result<ControllerSetup, String> {
    let hostname = hostname()?;
    let default = ControllerSetup::default();
    let default_offsets = SwitchOffsets::default();

    let travel_mm = tomlget_or!(
        cfg,
        "calibration",
        "travel_mm",
        as_float,
        f64,
        default.travel_mm
    );
    if travel_mm <= 0.0 {
        return Err(format!("calibration:travel_mm must be positive, found {travel_mm}"));
    }
    let output_dir = host_or_section(cfg, &hostname, "general", "output_dir")
        .map_or(default.output_dir, PathBuf::from);

    Ok(ControllerSetup {
        speeds: speeds_from_config(cfg),
        timing: timing_from_config(cfg),
        offsets: SwitchOffsets {
            home_to_faraday: tomlget_or!(
                cfg,
                "calibration",
                "home_to_faraday",
                as_integer,
                i64,
                default_offsets.home_to_faraday
            ),
            faraday_to_end: tomlget_or!(
                cfg,
                "calibration",
                "faraday_to_end",
                as_integer,
                i64,
                default_offsets.faraday_to_end
            ),
        },
        travel_mm,
        return_to_faraday: tomlget_or!(cfg, "general", "return_to_faraday", as_bool, true),
        voltage_decimals: tomlget_or!(cfg, "device", "voltage_decimals", as_integer, i32, 2),
        output_dir,
        comment: tomlget_or!(cfg, "general", "comment", as_str, "emittance scan").to_string(),
        plate_length: tomlget!(cfg, "analyzer", "plate_length_mm", as_float, f64),
        plate_gap: tomlget!(cfg, "analyzer", "plate_gap_mm", as_float, f64),
        beam_energy: tomlget!(cfg, "analyzer", "beam_energy_ev", as_float, f64),
    })
}

pub fn analysis_from_config(cfg: &toml::Value) -> Result<AnalysisSetup, String> {
    let default = AnalysisSetup::default();
    let out = AnalysisSetup {
        sigma: tomlget_or!(cfg, "analyzer", "sigma", as_float, f64, default.sigma),
        truncate: tomlget_or!(cfg, "analyzer", "truncate", as_float, f64, default.truncate),
        passes: tomlget_or!(
            cfg,
            "analyzer",
            "passes",
            as_integer,
            u32,
            i64::from(default.passes)
        ),
        cut_fraction: tomlget_or!(
            cfg,
            "analyzer",
            "cut_fraction",
            as_float,
            f64,
            default.cut_fraction
        ),
    };
    if !(out.sigma >= 0.0 && out.truncate > 0.0) {
        return Err(format!(
            "invalid smoothing parameters sigma {} truncate {}",
            out.sigma, out.truncate
        ));
    }
    if !(0.0..=1.0).contains(&out.cut_fraction) {
        return Err(format!(
            "analyzer:cut_fraction must lie in [0, 1], found {}",
            out.cut_fraction
        ));
    }
    Ok(out)
}

pub fn auto_scan_from_config(cfg: &toml::Value) -> Result<AutoScan, String> {
    let default = AutoScan::default();
    let out = AutoScan {
        start_mm: tomlget_or!(cfg, "auto_scan", "start_mm", as_float, f64, default.start_mm),
        end_mm: tomlget_or!(cfg, "auto_scan", "end_mm", as_float, f64, default.end_mm),
        motor_steps: tomlget_or!(
            cfg,
            "auto_scan",
            "motor_steps",
            as_integer,
            usize,
            default.motor_steps as i64
        ),
        start_voltage: tomlget_or!(
            cfg,
            "auto_scan",
            "start_voltage",
            as_float,
            f64,
            default.start_voltage
        ),
        end_voltage: tomlget_or!(
            cfg,
            "auto_scan",
            "end_voltage",
            as_float,
            f64,
            default.end_voltage
        ),
        voltage_steps: tomlget_or!(
            cfg,
            "auto_scan",
            "voltage_steps",
            as_integer,
            usize,
            default.voltage_steps as i64
        ),
    };
    if out.motor_steps == 0 || out.voltage_steps == 0 {
        return Err("auto_scan step counts must be at least 1".into());
    }
    Ok(out)
}

/// Link address of the stage controller, with a per-host override.
pub fn device_address(cfg: &toml::Value) -> Result<String, String> {
    let hostname = hostname()?;
    host_or_section(cfg, &hostname, "device", "address")
        .map(String::from)
        .ok_or_else(|| "failed to get key device:address".into())
}

/// Simulated stage with a Gaussian beam. This is the only stage the service can drive; the
/// configured device address is passed to its `open` and nothing more.
#[must_use]
pub fn sim_stage_from_config(cfg: &toml::Value) -> SimStage {
    let beam = SimStage::gaussian_beam(
        tomlget_or!(cfg, "simulation", "amplitude", as_float, f64, 1.0),
        tomlget_or!(cfg, "simulation", "position", as_integer, i64, 3_679_098),
        tomlget_or!(cfg, "simulation", "position_sigma", as_float, f64, 50_000.0),
        tomlget_or!(cfg, "simulation", "volts", as_float, f64, 0.0),
        tomlget_or!(cfg, "simulation", "volts_sigma", as_float, f64, 0.5),
    );
    SimStage::new().with_beam(beam)
}

/// Input readings are kept in a ring of `2^n` entries. An explicit exponent wins; a plain
/// length is rounded down to a power of two.
#[must_use]
pub fn log_length_exponent(cfg: &toml::Value) -> u32 {
    if let Some(exponent) = tomlget_opt!(cfg, "general", "log_length_exponent", as_integer, u32) {
        exponent
    } else if let Some(length) = tomlget_opt!(cfg, "general", "log_length", as_integer, u64) {
        let exponent = length.checked_ilog2().unwrap_or(0);
        if 1 << exponent != length {
            log::warn!(
                "config log length {length} rounded down to 2^{exponent} = {}",
                1u64 << exponent
            );
        }
        exponent
    } else {
        log::warn!("no log length in config; using default of 1024");
        10
    }
}

pub async fn comms_from_config(cfg: &toml::Value) -> Result<ScannerComms, String> {
    let mut out = ScannerComms::new().ok_or("failed to instantiate comms struct")?;
    out.bind_sockets(
        tomlget_or!(cfg, "general", "logs_port", as_integer, u16, 8080),
        tomlget_or!(cfg, "general", "command_port", as_integer, u16, 8081),
    )
    .await
    .map_err(|e| format!("error [{e}] in binding sockets"))?;
    out.set_log_publish_frequency(tomlget_or!(
        cfg,
        "general",
        "logs_publish_freq_cycles",
        as_integer,
        u32,
        8
    ));
    out.set_readings_published(tomlget_or!(
        cfg,
        "general",
        "readings_published",
        as_integer,
        usize,
        64
    ));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> toml::Value {
        text.parse().unwrap()
    }

    const MINIMAL: &str = "
[analyzer]
plate_length_mm = 40.78
plate_gap_mm = 4.0
beam_energy_ev = 20.0
";

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = parse(MINIMAL);
        let setup = controller_setup_from_config(&cfg).unwrap();
        assert_eq!(setup, ControllerSetup::default());
        assert_eq!(analysis_from_config(&cfg).unwrap(), AnalysisSetup::default());
        assert_eq!(auto_scan_from_config(&cfg).unwrap(), AutoScan::default());
        assert_eq!(log_length_exponent(&cfg), 10);
    }

    #[test]
    fn analyzer_geometry_is_required() {
        let cfg = parse("[analyzer]\nplate_length_mm = 40.0\n");
        let err = controller_setup_from_config(&cfg).unwrap_err();
        assert!(err.contains("plate_gap_mm"), "{err}");
    }

    #[test]
    fn explicit_values() {
        let cfg = parse(
            "
[general]
output_dir = \"/data/emittance\"
return_to_faraday = false
log_length = 1000
[device]
address = \"192.168.0.20\"
seek_speed = 5000
[timing]
settle_ms = 20
[calibration]
home_to_faraday = 100
[analyzer]
plate_length_mm = 40.0
plate_gap_mm = 5.0
beam_energy_ev = 10.0
passes = 2
cut_fraction = 0.2
[auto_scan]
motor_steps = 10
",
        );
        let setup = controller_setup_from_config(&cfg).unwrap();
        assert_eq!(setup.output_dir, PathBuf::from("/data/emittance"));
        assert!(!setup.return_to_faraday);
        assert_eq!(setup.speeds.seek, 5000);
        assert_eq!(setup.speeds.travel, 200_000);
        assert_eq!(setup.timing.settle, Duration::from_millis(20));
        assert_eq!(setup.offsets.home_to_faraday, 100);
        assert_eq!(setup.offsets.faraday_to_end, 2_578_395);
        assert_eq!(setup.plate_gap, 5.0);

        let analysis = analysis_from_config(&cfg).unwrap();
        assert_eq!((analysis.passes, analysis.cut_fraction), (2, 0.2));
        assert_eq!(auto_scan_from_config(&cfg).unwrap().motor_steps, 10);
        assert_eq!(device_address(&cfg).unwrap(), "192.168.0.20");
        assert_eq!(log_length_exponent(&cfg), 9);
    }

    #[test]
    fn host_section_overrides_address() {
        let host = hostname().unwrap();
        let cfg = parse(&format!(
            "[device]\naddress = \"shared\"\n[\"{host}\"]\naddress = \"bench\"\n"
        ));
        assert_eq!(device_address(&cfg).unwrap(), "bench");
        assert!(device_address(&parse("[device]\n")).is_err());
    }

    #[test]
    fn simulated_beam_follows_config() {
        use stage_sys::Stage;
        let cfg = parse("[simulation]\namplitude = 2.0\nposition = 1000\nvolts = 0.5\n");
        let mut sim = sim_stage_from_config(&cfg).at_position(1000);
        sim.open("192.168.1.50").unwrap();
        sim.set_output_voltage(0.5).unwrap();
        assert!((sim.read_input_voltage().unwrap() - 2.0).abs() < 1e-12);
        sim.set_output_voltage(-0.5).unwrap();
        assert!(sim.read_input_voltage().unwrap() < 2.0);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(analysis_from_config(&parse("[analyzer]\nsigma = -1.0\n")).is_err());
        assert!(analysis_from_config(&parse("[analyzer]\ncut_fraction = 1.5\n")).is_err());
        assert!(auto_scan_from_config(&parse("[auto_scan]\nvoltage_steps = 0\n")).is_err());
        let cfg = parse(&format!("{MINIMAL}[calibration]\ntravel_mm = 0.0\n"));
        assert!(controller_setup_from_config(&cfg).is_err());
    }
}
