//! Light curves and their weighted moments.

use crate::error::{Error, Result};

/// An irregularly sampled time series with per-sample uncertainties.
///
/// Validated on construction: at least two samples, all values finite,
/// uncertainties strictly positive, and a positive time baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct LightCurve {
    times: Vec<f64>,
    values: Vec<f64>,
    uncertainties: Vec<f64>,
}

/// Weighted mean and variance of a light curve's values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedStats {
    pub mean: f64,
    pub variance: f64,
}

impl LightCurve {
    pub fn new(times: Vec<f64>, values: Vec<f64>, uncertainties: Vec<f64>) -> Result<Self> {
        if times.len() != values.len() || times.len() != uncertainties.len() {
            return Err(Error::invalid(format!(
                "light curve arrays differ in length: {} times, {} values, {} uncertainties",
                times.len(),
                values.len(),
                uncertainties.len()
            )));
        }
        if times.len() < 2 {
            return Err(Error::invalid(format!(
                "light curve needs at least 2 points, got {}",
                times.len()
            )));
        }
        if let Some(i) = times
            .iter()
            .zip(&values)
            .position(|(t, y)| !t.is_finite() || !y.is_finite())
        {
            return Err(Error::invalid(format!("non-finite sample at index {i}")));
        }
        if let Some(i) = uncertainties.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(Error::invalid(format!(
                "uncertainty at index {i} must be finite and positive, got {}",
                uncertainties[i]
            )));
        }

        let curve = Self {
            times,
            values,
            uncertainties,
        };
        let baseline = curve.baseline();
        if baseline <= 0.0 {
            return Err(Error::invalid(format!(
                "light curve baseline must be positive, got {baseline}"
            )));
        }
        Ok(curve)
    }

    /// Builds a light curve where every sample has the same uncertainty.
    pub fn with_uniform_uncertainty(times: Vec<f64>, values: Vec<f64>, sigma: f64) -> Result<Self> {
        let uncertainties = vec![sigma; times.len()];
        Self::new(times, values, uncertainties)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Always false; a valid light curve has at least two samples.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn uncertainties(&self) -> &[f64] {
        &self.uncertainties
    }

    /// Time span between the earliest and latest sample.
    pub fn baseline(&self) -> f64 {
        baseline(&self.times)
    }

    /// Inverse-variance weights normalized to sum to one.
    pub fn weights(&self) -> Vec<f64> {
        normalized_weights(&self.uncertainties)
    }

    pub fn stats(&self) -> WeightedStats {
        weighted_stats(&self.values, &self.weights())
    }
}

pub(crate) fn baseline(times: &[f64]) -> f64 {
    let (min, max) = times
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
            (lo.min(t), hi.max(t))
        });
    max - min
}

/// Converts uncertainties to `σ⁻²` weights normalized so they sum to one.
pub fn normalized_weights(uncertainties: &[f64]) -> Vec<f64> {
    let mut weights: Vec<f64> = uncertainties.iter().map(|s| 1.0 / (s * s)).collect();
    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

/// Weighted mean `Σ wy` and variance `Σ w(y - ȳ)²`, assuming `Σ w = 1`.
///
/// Constant series report an exact zero variance so callers can rely on
/// `variance == 0.0` to detect them.
pub fn weighted_stats(values: &[f64], weights: &[f64]) -> WeightedStats {
    if let Some(&first) = values.first() {
        if values.iter().all(|&y| y == first) {
            return WeightedStats {
                mean: first,
                variance: 0.0,
            };
        }
    }

    let mean: f64 = values.iter().zip(weights).map(|(y, w)| w * y).sum();
    let variance = values
        .iter()
        .zip(weights)
        .map(|(y, w)| {
            let d = y - mean;
            w * d * d
        })
        .sum();
    WeightedStats { mean, variance }
}
