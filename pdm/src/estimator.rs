//! Reference (CPU, double precision) phase dispersion estimators.
//!
//! Every trial frequency `f` is scored with `Θ(f) = V / Vres(f)`, where `V` is
//! the weighted variance of the light curve and `Vres` the weighted variance
//! of the residuals around a phase-folded model:
//!
//! - **tophat**: each point is predicted by the weighted mean of all points
//!   closer than `dphi` in phase (including itself),
//! - **gauss window**: same, with Gaussian phase weights of width `dphi`,
//! - **binned**: each point is predicted by the weighted mean of its phase
//!   bin, or by linear interpolation between the two nearest bin centres.
//!
//! This path exists to validate the GPU kernels. Frequencies are evaluated
//! in parallel with rayon, points within a frequency sequentially.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::grid::FrequencyGrid;
use crate::job::PowerSeries;
use crate::light_curve::{LightCurve, weighted_stats};
use crate::statistic::Statistic;

/// Floor applied to a bin's total weight before dividing by it.
pub const EMPTY_BIN_WEIGHT: f64 = 1e-10;

/// Interpolation neighbours lighter than this exclude the point.
pub const DEGENERATE_BIN_WEIGHT: f64 = 1e-9;

/// Default `skipped_weight` above which a binned frequency is reported degenerate.
pub const DEFAULT_DEGENERATE_SKIP_THRESHOLD: f64 = 0.5;

/// Phase of `t` at frequency `freq`, in `[0, 1)`.
#[inline]
pub fn phase(t: f64, freq: f64) -> f64 {
    (t * freq).rem_euclid(1.0)
}

/// Phase distance for a time separation, folded to `[0, 0.5]`.
#[inline]
pub fn folded_phase_distance(dt: f64, freq: f64) -> f64 {
    let x = dt * freq;
    let dph = x - x.floor();
    dph.min(1.0 - dph)
}

/// `V / Vres`, undefined (NaN) when the light curve has no variance.
#[inline]
pub fn theta(variance: f64, residual: f64) -> f64 {
    if variance == 0.0 {
        f64::NAN
    } else {
        variance / residual
    }
}

/// Residual variance around the tophat-window local means.
pub fn tophat_residual(t: &[f64], y: &[f64], w: &[f64], freq: f64, dphi: f64) -> f64 {
    windowed_residual(t, y, w, |dt| {
        if folded_phase_distance(dt, freq) < dphi {
            1.0
        } else {
            0.0
        }
    })
}

/// Residual variance around Gaussian-weighted local means.
pub fn gauss_residual(t: &[f64], y: &[f64], w: &[f64], freq: f64, dphi: f64) -> f64 {
    windowed_residual(t, y, w, |dt| {
        let d = folded_phase_distance(dt, freq) / dphi;
        (-0.5 * d * d).exp()
    })
}

fn windowed_residual(t: &[f64], y: &[f64], w: &[f64], kernel: impl Fn(f64) -> f64) -> f64 {
    let mut var = 0.0;
    for i in 0..t.len() {
        let mut mbar = 0.0;
        let mut wtot = 0.0;
        for j in 0..t.len() {
            let g = kernel((t[j] - t[i]).abs());
            if g > 0.0 {
                mbar += g * w[j] * y[j];
                wtot += g * w[j];
            }
        }
        let r = y[i] - mbar / wtot;
        var += w[i] * r * r;
    }
    var
}

/// Result of the binned model at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinnedResidual {
    /// Renormalized residual variance; NaN when every point was excluded.
    pub variance: f64,
    /// Total weight of points excluded for lack of populated neighbour bins.
    pub skipped_weight: f64,
}

impl BinnedResidual {
    pub fn is_degenerate(&self, threshold: f64) -> bool {
        !self.variance.is_finite() || self.skipped_weight > threshold
    }
}

/// Residual variance around per-bin means, optionally interpolated.
///
/// With interpolation, a point whose two neighbouring bins are not both
/// populated is excluded and its weight reported in `skipped_weight`; the
/// remaining variance is divided by `1 - skipped_weight`.
pub fn binned_residual(
    t: &[f64],
    y: &[f64],
    w: &[f64],
    freq: f64,
    nbins: u32,
    linterp: bool,
) -> BinnedResidual {
    let nbins = nbins as usize;
    let nb = nbins as f64;
    let mut bin_wtot = vec![0.0; nbins];
    let mut bin_mean = vec![0.0; nbins];

    let phases: Vec<f64> = t.iter().map(|&ti| phase(ti, freq)).collect();
    let bins: Vec<usize> = phases
        .iter()
        .map(|&p| ((p * nb) as usize).min(nbins - 1))
        .collect();

    for ((&b, &wi), &yi) in bins.iter().zip(w).zip(y) {
        bin_wtot[b] += wi;
        bin_mean[b] += wi * yi;
    }
    for (wtot, mean) in bin_wtot.iter_mut().zip(bin_mean.iter_mut()) {
        *wtot = wtot.max(EMPTY_BIN_WEIGHT);
        *mean /= *wtot;
    }

    let mut var = 0.0;
    let mut skipped_weight = 0.0;
    let mut included = 0usize;

    for i in 0..t.len() {
        let b = bins[i];
        let mut prediction = bin_mean[b];

        if linterp {
            let mut alpha = phases[i] * nb - (b as f64 + 0.5);
            let (bin0, bin1) = if alpha < 0.0 {
                alpha += 1.0;
                ((b + nbins - 1) % nbins, b)
            } else {
                (b, (b + 1) % nbins)
            };

            if bin_wtot[bin0] < DEGENERATE_BIN_WEIGHT || bin_wtot[bin1] < DEGENERATE_BIN_WEIGHT {
                skipped_weight += w[i];
                continue;
            }

            prediction = (1.0 - alpha) * bin_mean[bin0] + alpha * bin_mean[bin1];
        }

        let r = y[i] - prediction;
        var += w[i] * r * r;
        included += 1;
    }

    let variance = if included == 0 {
        f64::NAN
    } else {
        var / (1.0 - skipped_weight)
    };

    BinnedResidual {
        variance,
        skipped_weight,
    }
}

/// Scalar reference implementation of every [`Statistic`].
#[derive(Debug, Clone, Copy)]
pub struct PhaseVarianceEstimator {
    statistic: Statistic,
    degenerate_skip_threshold: f64,
}

impl PhaseVarianceEstimator {
    pub fn new(statistic: Statistic) -> Self {
        Self {
            statistic,
            degenerate_skip_threshold: DEFAULT_DEGENERATE_SKIP_THRESHOLD,
        }
    }

    pub fn degenerate_skip_threshold(mut self, threshold: f64) -> Self {
        self.degenerate_skip_threshold = threshold;
        self
    }

    pub fn statistic(&self) -> &Statistic {
        &self.statistic
    }

    /// Scores every frequency. `weights` must already sum to one.
    pub fn estimate(
        &self,
        times: &[f64],
        values: &[f64],
        weights: &[f64],
        freqs: &[f64],
    ) -> Result<PowerSeries> {
        validate_arrays(times, values, weights, freqs)?;
        self.statistic.validate()?;

        let variance = weighted_stats(values, weights).variance;

        let power: Vec<f64> = match self.statistic {
            Statistic::Tophat { dphi } => freqs
                .par_iter()
                .map(|&f| theta(variance, tophat_residual(times, values, weights, f, dphi)))
                .collect(),
            Statistic::GaussWindow { dphi } => freqs
                .par_iter()
                .map(|&f| theta(variance, gauss_residual(times, values, weights, f, dphi)))
                .collect(),
            Statistic::Binned { nbins, linterp } => {
                let residuals: Vec<BinnedResidual> = freqs
                    .par_iter()
                    .map(|&f| binned_residual(times, values, weights, f, nbins, linterp))
                    .collect();

                let degenerate = residuals
                    .iter()
                    .filter(|r| r.is_degenerate(self.degenerate_skip_threshold))
                    .count();
                if degenerate > 0 {
                    tracing::warn!(
                        degenerate,
                        total = freqs.len(),
                        nbins,
                        threshold = self.degenerate_skip_threshold,
                        "binned statistic is degenerate at some frequencies; power may be unstable"
                    );
                }

                residuals
                    .iter()
                    .map(|r| theta(variance, r.variance))
                    .collect()
            }
        };

        Ok(PowerSeries::new(power))
    }

    /// Scores a light curve on a grid, deriving normalized weights from its uncertainties.
    pub fn estimate_light_curve(
        &self,
        curve: &LightCurve,
        grid: &FrequencyGrid,
    ) -> Result<PowerSeries> {
        self.estimate(curve.times(), curve.values(), &curve.weights(), grid)
    }
}

/// Scores every frequency with the reference implementation of `statistic`.
pub fn estimate(
    times: &[f64],
    values: &[f64],
    weights: &[f64],
    freqs: &[f64],
    statistic: &Statistic,
) -> Result<PowerSeries> {
    PhaseVarianceEstimator::new(*statistic).estimate(times, values, weights, freqs)
}

/// [`estimate`] for a validated light curve and grid.
pub fn estimate_light_curve(
    curve: &LightCurve,
    grid: &FrequencyGrid,
    statistic: &Statistic,
) -> Result<PowerSeries> {
    PhaseVarianceEstimator::new(*statistic).estimate_light_curve(curve, grid)
}

fn validate_arrays(times: &[f64], values: &[f64], weights: &[f64], freqs: &[f64]) -> Result<()> {
    if times.len() != values.len() || times.len() != weights.len() {
        return Err(Error::invalid(format!(
            "array lengths differ: {} times, {} values, {} weights",
            times.len(),
            values.len(),
            weights.len()
        )));
    }
    if times.len() < 2 {
        return Err(Error::invalid(format!(
            "need at least 2 samples, got {}",
            times.len()
        )));
    }
    if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
        return Err(Error::invalid("weights must be finite and non-negative"));
    }
    if freqs.is_empty() {
        return Err(Error::invalid("frequency grid is empty"));
    }
    if freqs.iter().any(|f| !(f.is_finite() && *f > 0.0)) {
        return Err(Error::invalid("frequencies must be finite and positive"));
    }
    Ok(())
}
