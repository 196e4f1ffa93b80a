use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use rand::Rng;

use rustemit::analysis::{self, AnalysisSetup};
use rustemit::datafile::{AxisCalibration, ScanGrid};
use rustemit::ring_buffer::SampleRing;

const POSITIONS: usize = 100;
const VOLTAGES: usize = 50;

fn noisy_scan() -> ScanGrid {
    let mut rng = rand::thread_rng();
    ScanGrid::from_array(Array2::from_shape_fn((POSITIONS, VOLTAGES), |(p, v)| {
        let dx = (p as f64 - 55.0) / 8.0;
        let dv = (v as f64 - 24.0 - 0.3 * (p as f64 - 55.0)) / 5.0;
        (-0.5 * (dx * dx + dv * dv)).exp() + rng.gen_range(0.0..0.02)
    }))
}

fn calibration() -> AxisCalibration {
    AxisCalibration {
        plate_length: 40.78,
        plate_gap: 4.0,
        beam_energy: 20.0,
        motor_start: 160.0,
        motor_step_size: 36.0 / POSITIONS as f64,
        voltage_min: -200.0,
        voltage_step_size: 400.0 / VOLTAGES as f64,
        voltage_steps: VOLTAGES,
        position_steps: POSITIONS,
    }
}

pub fn pipeline(c: &mut Criterion) {
    let grid = noisy_scan();
    let cal = calibration();
    let setup = AnalysisSetup::default();
    c.bench_function("analyze 100x50", |b| {
        b.iter(|| black_box(analysis::analyze(&grid, &cal, &setup)))
    });
    c.bench_function("gaussian_filter 100x50", |b| {
        b.iter(|| black_box(analysis::gaussian_filter(grid.view(), 0.6, 4.0)))
    });
    c.bench_function("background_cut 100x50", |b| {
        b.iter(|| {
            let mut density = grid.view().to_owned();
            analysis::background_cut(&mut density, 0.3);
            black_box(density)
        })
    });
}

pub fn readings_log(c: &mut Criterion) {
    c.bench_function("SampleRing 2^16", |b| {
        b.iter(|| {
            let mut ring = SampleRing::<f64>::with_exponent(10).unwrap();
            for i in 0..65536 {
                ring.push(f64::from(i));
            }
            black_box(ring.last_n(64).sum::<f64>())
        })
    });
}

criterion_group!(benches, pipeline, readings_log);
criterion_main!(benches);
