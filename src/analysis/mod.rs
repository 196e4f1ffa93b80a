//! Phase-space reconstruction of a finished scan: smoothing, background removal, marginal
//! moments and the RMS emittance.
//!
//! Density grids are indexed `[voltage, position]` (the transpose of the raw scan), so rows run
//! along the angle axis and columns along the position axis.
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::datafile::{AxisCalibration, ScanGrid};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisSetup {
    /// Gaussian smoothing width, in grid samples.
    pub sigma: f64,
    /// Kernel half-width in units of `sigma`.
    pub truncate: f64,
    /// How many times the smoothing is applied. Archived analyses smoothed twice.
    pub passes: u32,
    /// Fraction of the grid maximum below which an isolated sample counts as background.
    pub cut_fraction: f64,
}

impl Default for AnalysisSetup {
    fn default() -> Self {
        AnalysisSetup {
            sigma: 0.6,
            truncate: 4.0,
            passes: 1,
            cut_fraction: 0.3,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("smoothing width {0} must be finite and non-negative")]
    BadSigma(f64),
    #[error("grid is {rows}x{cols} but the axes give {expected_rows}x{expected_cols}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("the {0} marginal has no weight")]
    EmptyMarginal(&'static str),
    #[error("density integrates to zero")]
    ZeroMass,
    #[error("{0} RMS size is zero or undefined")]
    ZeroSpread(&'static str),
    #[error("emittance radicand {0} is outside [0, 1]; correlation exceeds the beam sizes")]
    Radicand(f64),
}

impl AnalysisError {
    /// True for failures of the physical invariants (as opposed to bad parameters).
    #[must_use]
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            AnalysisError::EmptyMarginal(_)
                | AnalysisError::ZeroMass
                | AnalysisError::ZeroSpread(_)
                | AnalysisError::Radicand(_)
        )
    }
}

/// Headline numbers plus everything needed to draw the phase-space contour plot.
#[derive(Debug, Clone)]
pub struct EmittanceResult {
    /// Twice the RMS beam size, mm.
    pub x2_rms: f64,
    /// Twice the RMS divergence, mrad.
    pub theta2_rms: f64,
    /// Four times the RMS emittance, mm mrad.
    pub emittance: f64,
    pub x_centroid: f64,
    pub theta_centroid: f64,
    /// Smoothed, background-cut density, indexed `[theta, x]`.
    pub density: Array2<f64>,
    pub x_centered: Array1<f64>,
    pub theta_centered: Array1<f64>,
}

/// Normalised sampled Gaussian of half-width `round(truncate * sigma)`.
#[must_use]
pub fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Index into `0..n` with half-sample symmetric reflection at both ends (`d c b a | a b c d |
/// d c b a`).
fn reflect(k: i64, n: usize) -> usize {
    let n = n as i64;
    let m = k.rem_euclid(2 * n);
    (if m >= n { 2 * n - 1 - m } else { m }) as usize
}

fn filter_axis(grid: &Array2<f64>, axis: Axis, kernel: &[f64]) -> Array2<f64> {
    let radius = (kernel.len() / 2) as i64;
    let mut out = Array2::zeros(grid.raw_dim());
    for (src, mut dst) in grid.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        for (i, d) in dst.iter_mut().enumerate() {
            *d = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * src[reflect(i as i64 + k as i64 - radius, n)])
                .sum();
        }
    }
    out
}

/// Separable 2-D Gaussian smoothing with reflecting boundaries.
/// # Errors
/// Rejects a negative or non-finite `sigma`.
pub fn gaussian_filter(
    grid: ArrayView2<'_, f64>,
    sigma: f64,
    truncate: f64,
) -> Result<Array2<f64>, AnalysisError> {
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(AnalysisError::BadSigma(sigma));
    }
    if sigma == 0.0 || grid.is_empty() {
        return Ok(grid.to_owned());
    }
    let kernel = gaussian_kernel(sigma, truncate);
    let rows = filter_axis(&grid.to_owned(), Axis(0), &kernel);
    Ok(filter_axis(&rows, Axis(1), &kernel))
}

fn grid_max(grid: &Array2<f64>) -> f64 {
    grid.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Zero every interior sample whose two neighbours along `axis` both sit below
/// `cut_fraction` of the current grid maximum. Works in place, in index order, so later samples
/// see earlier zeroing.
fn cut_along(density: &mut Array2<f64>, axis: Axis, cut_fraction: f64, max: &mut f64) {
    let (lanes, len) = match axis {
        Axis(0) => (density.ncols(), density.nrows()),
        _ => (density.nrows(), density.ncols()),
    };
    let idx = |lane: usize, i: usize| match axis {
        Axis(0) => [i, lane],
        _ => [lane, i],
    };
    for lane in 0..lanes {
        for i in 1..len.saturating_sub(1) {
            let threshold = cut_fraction * *max;
            let value = density[idx(lane, i)];
            if value != 0.0
                && density[idx(lane, i - 1)] < threshold
                && density[idx(lane, i + 1)] < threshold
            {
                density[idx(lane, i)] = 0.0;
                if value == *max {
                    *max = grid_max(density);
                }
            }
        }
    }
}

/// Background cut: first along the voltage neighbours of every position column, then along the
/// position neighbours of every voltage row, each pass seeing the result of the one before.
pub fn background_cut(density: &mut Array2<f64>, cut_fraction: f64) {
    let mut max = grid_max(density);
    cut_along(density, Axis(0), cut_fraction, &mut max);
    cut_along(density, Axis(1), cut_fraction, &mut max);
}

/// Moments of a density indexed `[theta, x]` over the given axes.
/// # Errors
/// Fails on mismatched shapes, and with an invariant error whenever the moments are undefined
/// or the correlation term makes the emittance radicand negative.
pub fn phase_space_moments(
    density: Array2<f64>,
    x_axis: ArrayView1<'_, f64>,
    theta_axis: ArrayView1<'_, f64>,
) -> Result<EmittanceResult, AnalysisError> {
    let (n_theta, n_x) = density.dim();
    if n_x != x_axis.len() || n_theta != theta_axis.len() {
        return Err(AnalysisError::ShapeMismatch {
            rows: n_theta,
            cols: n_x,
            expected_rows: theta_axis.len(),
            expected_cols: x_axis.len(),
        });
    }

    // normalised by step count, not by their sums
    let x_marginal = density.sum_axis(Axis(0)) / n_theta as f64;
    let theta_marginal = density.sum_axis(Axis(1)) / n_x as f64;

    let (x_centroid, x_centered, x2_rms) = weighted_moments(x_axis, &x_marginal, "position")?;
    let (theta_centroid, theta_centered, theta2_rms) =
        weighted_moments(theta_axis, &theta_marginal, "angle")?;

    let total_mass = density.sum();
    if total_mass == 0.0 || !total_mass.is_finite() {
        return Err(AnalysisError::ZeroMass);
    }
    let correlation = density.dot(&x_centered).dot(&theta_centered);
    let ratio = correlation / (x2_rms * theta2_rms) * 4.0 / total_mass;
    let radicand = 1.0 - ratio * ratio;
    if radicand.is_nan() || radicand < 0.0 {
        return Err(AnalysisError::Radicand(radicand));
    }

    Ok(EmittanceResult {
        x2_rms,
        theta2_rms,
        emittance: x2_rms * theta2_rms * radicand.sqrt(),
        x_centroid,
        theta_centroid,
        density,
        x_centered,
        theta_centered,
    })
}

/// Centroid, centred axis and twice the RMS width of `marginal` over `axis`.
fn weighted_moments(
    axis: ArrayView1<'_, f64>,
    marginal: &Array1<f64>,
    name: &'static str,
) -> Result<(f64, Array1<f64>, f64), AnalysisError> {
    let weight = marginal.sum();
    if weight == 0.0 || !weight.is_finite() {
        return Err(AnalysisError::EmptyMarginal(name));
    }
    let centroid = axis.dot(marginal) / weight;
    let centered = axis.mapv(|v| v - centroid);
    let two_rms = 2.0 * (centered.mapv(|v| v * v).dot(marginal) / weight).sqrt();
    if two_rms.is_nan() || two_rms <= 0.0 {
        return Err(AnalysisError::ZeroSpread(name));
    }
    Ok((centroid, centered, two_rms))
}

/// Full pipeline on a raw scan: smooth, transpose, cut background, take moments.
/// # Errors
/// See [`gaussian_filter`] and [`phase_space_moments`]; a grid that does not match the
/// calibration's step counts is a shape mismatch.
pub fn analyze(
    grid: &ScanGrid,
    calibration: &AxisCalibration,
    setup: &AnalysisSetup,
) -> Result<EmittanceResult, AnalysisError> {
    if grid.position_rows() != calibration.position_steps
        || grid.voltage_steps() != calibration.voltage_steps
    {
        return Err(AnalysisError::ShapeMismatch {
            rows: grid.position_rows(),
            cols: grid.voltage_steps(),
            expected_rows: calibration.position_steps,
            expected_cols: calibration.voltage_steps,
        });
    }
    let mut smoothed = grid.view().to_owned();
    for _ in 0..setup.passes {
        smoothed = gaussian_filter(smoothed.view(), setup.sigma, setup.truncate)?;
    }
    let mut density = smoothed.reversed_axes();
    background_cut(&mut density, setup.cut_fraction);

    let x_axis = calibration.position_axis();
    let theta_axis = calibration.theta_axis();
    log::debug!(
        "analyzing {}x{} grid, x {:.3}..{:.3} mm, theta {:.3}..{:.3} mrad",
        calibration.position_steps,
        calibration.voltage_steps,
        x_axis[0],
        x_axis[x_axis.len() - 1],
        theta_axis[0],
        theta_axis[theta_axis.len() - 1],
    );
    phase_space_moments(density, x_axis.view(), theta_axis.view())
}

#[cfg(test)]
mod tests;
