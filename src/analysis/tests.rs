use rand::Rng;

use super::*;

fn gaussian_density(x: &Array1<f64>, theta: &Array1<f64>, correlation: f64) -> Array2<f64> {
    let norm = 2.0 * (1.0 - correlation * correlation);
    Array2::from_shape_fn((theta.len(), x.len()), |(i, j)| {
        let (t, s) = (theta[i], x[j]);
        (-(s * s - 2.0 * correlation * s * t + t * t) / norm).exp()
    })
}

fn symmetric_axis(half_width: f64, steps: usize) -> Array1<f64> {
    Array1::linspace(-half_width, half_width, steps)
}

fn calibration(position_steps: usize, voltage_steps: usize) -> AxisCalibration {
    AxisCalibration {
        plate_length: 40.78,
        plate_gap: 4.0,
        beam_energy: 20.0,
        motor_start: 160.0,
        motor_step_size: 0.4,
        voltage_min: -200.0,
        voltage_step_size: 400.0 / (voltage_steps - 1) as f64,
        voltage_steps,
        position_steps,
    }
}

#[test]
fn kernel_width_and_weights() {
    let kernel = gaussian_kernel(0.6, 4.0);
    assert_eq!(kernel.len(), 5);
    assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    let e1 = (-0.5_f64 / 0.36).exp();
    let e2 = (-2.0_f64 / 0.36).exp();
    assert!((kernel[2] - 1.0 / (1.0 + 2.0 * e1 + 2.0 * e2)).abs() < 1e-12);
    assert!((kernel[0] - kernel[4]).abs() < 1e-15);
}

#[test]
fn reflection_indices() {
    assert_eq!(reflect(-1, 4), 0);
    assert_eq!(reflect(-2, 4), 1);
    assert_eq!(reflect(4, 4), 3);
    assert_eq!(reflect(5, 4), 2);
    assert_eq!(reflect(2, 4), 2);
    assert_eq!(reflect(-3, 1), 0);
}

#[test]
fn filter_keeps_constants_and_spreads_impulses() {
    let flat = Array2::from_elem((6, 9), 2.5);
    let smoothed = gaussian_filter(flat.view(), 0.6, 4.0).unwrap();
    assert!(smoothed.iter().all(|v| (v - 2.5).abs() < 1e-12));

    let mut impulse = Array2::zeros((9, 9));
    impulse[[4, 4]] = 1.0;
    let smoothed = gaussian_filter(impulse.view(), 0.6, 4.0).unwrap();
    let center = gaussian_kernel(0.6, 4.0)[2];
    assert!((smoothed[[4, 4]] - center * center).abs() < 1e-12);
    assert!((smoothed.sum() - 1.0).abs() < 1e-12);
    assert!((smoothed[[3, 4]] - smoothed[[4, 5]]).abs() < 1e-15);

    assert_eq!(
        gaussian_filter(impulse.view(), -1.0, 4.0),
        Err(AnalysisError::BadSigma(-1.0))
    );
    assert_eq!(gaussian_filter(impulse.view(), 0.0, 4.0).unwrap(), impulse);
}

#[test]
fn cut_removes_isolated_spikes() {
    let mut density = Array2::zeros((7, 7));
    for i in 1..=2 {
        for j in 1..=2 {
            density[[i, j]] = 10.0;
        }
    }
    density[[4, 4]] = 5.0;
    density[[0, 6]] = 5.0;
    background_cut(&mut density, 0.3);
    assert_eq!(density[[4, 4]], 0.0);
    // edges are never tested
    assert_eq!(density[[0, 6]], 5.0);
    assert_eq!(density.slice(ndarray::s![1..=2, 1..=2]).sum(), 40.0);
}

#[test]
fn cut_tracks_falling_maximum() {
    let mut density = Array2::zeros((5, 5));
    density[[2, 0]] = 100.0;
    for i in 1..=3 {
        for j in 2..=3 {
            density[[i, j]] = 10.0;
        }
    }
    background_cut(&mut density, 0.3);
    assert_eq!(density[[2, 0]], 0.0);
    assert_eq!(density.sum(), 60.0);
}

#[test]
fn cut_is_idempotent() {
    let mut rng = rand::thread_rng();
    let axis = Array1::from_iter((0..31).map(f64::from));
    let mut density = Array2::from_shape_fn((31, 31), |(i, j)| {
        let (di, dj) = (axis[i] - 15.0, axis[j] - 15.0);
        (-(di * di + dj * dj) / 18.0).exp()
    });
    let spikes = [(2, 2), (2, 27), (27, 2), (27, 27), (5, 25), (25, 5)];
    for &(i, j) in &spikes {
        density[[i, j]] = rng.gen_range(0.5..0.9);
    }

    background_cut(&mut density, 0.3);
    for &(i, j) in &spikes {
        assert_eq!(density[[i, j]], 0.0);
    }
    assert_eq!(density[[15, 15]], 1.0);

    let once = density.clone();
    background_cut(&mut density, 0.3);
    assert_eq!(density, once);
}

#[test]
fn symmetric_beam_is_centred() {
    let x = symmetric_axis(5.0, 41);
    let theta = symmetric_axis(6.0, 31);
    let result = phase_space_moments(gaussian_density(&x, &theta, 0.0), x.view(), theta.view())
        .unwrap();
    assert!(result.x_centroid.abs() < 1e-12);
    assert!(result.theta_centroid.abs() < 1e-12);
    assert!((result.x2_rms - 2.0).abs() < 1e-3);
    assert!((result.theta2_rms - 2.0).abs() < 1e-3);
    assert!((result.emittance - result.x2_rms * result.theta2_rms).abs() < 1e-9);
}

#[test]
fn correlated_beam_shrinks_emittance() {
    let x = symmetric_axis(7.0, 71);
    let theta = symmetric_axis(7.0, 71);
    let result = phase_space_moments(gaussian_density(&x, &theta, 0.5), x.view(), theta.view())
        .unwrap();
    let expected = 4.0 * 0.75_f64.sqrt();
    assert!((result.emittance - expected).abs() / expected < 1e-3);
    assert!(result.emittance < result.x2_rms * result.theta2_rms);
}

#[test]
fn inconsistent_correlation_is_rejected() {
    let x = Array1::from(vec![-1.0, 1.0]);
    let theta = Array1::from(vec![-1.0, 1.0]);
    let density = Array2::from(vec![[2.0, -1.0], [-1.0, 2.0]]);
    let err = phase_space_moments(density, x.view(), theta.view()).unwrap_err();
    assert_eq!(err, AnalysisError::Radicand(-8.0));
    assert!(err.is_invariant());
}

#[test]
fn empty_grid_has_no_moments() {
    let x = symmetric_axis(1.0, 4);
    let theta = symmetric_axis(1.0, 3);
    let err = phase_space_moments(Array2::zeros((3, 4)), x.view(), theta.view()).unwrap_err();
    assert_eq!(err, AnalysisError::EmptyMarginal("position"));

    let err = phase_space_moments(Array2::zeros((4, 3)), x.view(), theta.view()).unwrap_err();
    assert!(matches!(err, AnalysisError::ShapeMismatch { .. }));
    assert!(!err.is_invariant());
}

#[test]
fn pipeline_on_noisy_scan() {
    let mut rng = rand::thread_rng();
    let (positions, voltages) = (30, 20);
    let raw = Array2::from_shape_fn((positions, voltages), |(p, v)| {
        let dp = (p as f64 - 14.0) / 3.0;
        let dv = (v as f64 - 9.0) / 2.5;
        (-0.5 * (dp * dp + dv * dv)).exp() + rng.gen_range(0.0..0.01)
    });
    let grid = ScanGrid::from_array(raw);
    let before = grid.clone();
    let cal = calibration(positions, voltages);

    let result = analyze(&grid, &cal, &AnalysisSetup::default()).unwrap();
    assert_eq!(grid, before);
    assert_eq!(result.density.dim(), (voltages, positions));
    assert!(result.emittance > 0.0);
    assert!(result.emittance <= result.x2_rms * result.theta2_rms);
    assert!((result.x_centroid - cal.position_axis()[14]).abs() < 0.2);

    let twice = AnalysisSetup {
        passes: 2,
        ..AnalysisSetup::default()
    };
    let smoother = analyze(&grid, &cal, &twice).unwrap();
    assert!(smoother.emittance.is_finite());
    assert_ne!(smoother.density, result.density);
}

#[test]
fn pipeline_rejects_mismatched_grid() {
    let grid = ScanGrid::from_array(Array2::ones((4, 5)));
    let err = analyze(&grid, &calibration(5, 5), &AnalysisSetup::default()).unwrap_err();
    assert!(matches!(err, AnalysisError::ShapeMismatch { .. }));
}
