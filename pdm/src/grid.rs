//! Trial frequency grids and the baseline/Nyquist planner that sizes them.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::light_curve::baseline;

/// Non-empty, strictly positive, non-decreasing trial frequencies.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyGrid {
    freqs: Vec<f64>,
}

impl FrequencyGrid {
    pub fn new(freqs: Vec<f64>) -> Result<Self> {
        if freqs.is_empty() {
            return Err(Error::invalid("frequency grid is empty"));
        }
        if let Some(i) = freqs.iter().position(|f| !(f.is_finite() && *f > 0.0)) {
            return Err(Error::invalid(format!(
                "frequency at index {i} must be finite and positive, got {}",
                freqs[i]
            )));
        }
        if let Some(i) = freqs.windows(2).position(|w| w[1] < w[0]) {
            return Err(Error::invalid(format!(
                "frequency grid decreases at index {}",
                i + 1
            )));
        }
        Ok(Self { freqs })
    }

    /// Evenly spaced grid `start + step * i` for `i` in `[0, count)`.
    pub fn linear(start: f64, step: f64, count: usize) -> Result<Self> {
        Self::new((0..count).map(|i| start + step * i as f64).collect())
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.freqs
    }
}

impl Deref for FrequencyGrid {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.freqs
    }
}

/// Heuristics for [`plan`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Multiple of the average Nyquist frequency used as the upper bound
    /// when `max_freq` is not given.
    pub nyquist_factor: f64,
    /// Approximate number of grid points across a typical peak.
    pub samples_per_peak: f64,
    pub min_freq: Option<f64>,
    pub max_freq: Option<f64>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            nyquist_factor: 5.0,
            samples_per_peak: 5.0,
            min_freq: None,
            max_freq: None,
        }
    }
}

impl GridConfig {
    pub fn nyquist_factor(mut self, factor: f64) -> Self {
        self.nyquist_factor = factor;
        self
    }

    pub fn samples_per_peak(mut self, samples: f64) -> Self {
        self.samples_per_peak = samples;
        self
    }

    pub fn min_freq(mut self, freq: f64) -> Self {
        self.min_freq = Some(freq);
        self
    }

    pub fn max_freq(mut self, freq: f64) -> Self {
        self.max_freq = Some(freq);
        self
    }
}

/// Plans a frequency grid from the sampling of `times`.
///
/// The spacing is `df = 1 / (baseline * samples_per_peak)` and the grid is
/// `df * (nf0 + i)`. When `min_freq` is set, `nf0 = min(1, floor(min_freq / df))`,
/// which never moves the start above `df`. The count is
/// `ceil(max_freq / df - nf0)` with `max_freq`, otherwise
/// `floor(0.5 * samples_per_peak * nyquist_factor * N)`.
pub fn plan(times: &[f64], config: &GridConfig) -> Result<FrequencyGrid> {
    if times.len() < 2 {
        return Err(Error::invalid(format!(
            "grid planning needs at least 2 samples, got {}",
            times.len()
        )));
    }
    if !(config.samples_per_peak > 0.0 && config.nyquist_factor > 0.0) {
        return Err(Error::invalid(format!(
            "samples_per_peak and nyquist_factor must be positive, got {} and {}",
            config.samples_per_peak, config.nyquist_factor
        )));
    }

    let baseline = baseline(times);
    if !(baseline > 0.0 && baseline.is_finite()) {
        return Err(Error::invalid(format!(
            "time baseline must be positive, got {baseline}"
        )));
    }

    let df = 1.0 / (baseline * config.samples_per_peak);

    // `min`, not `max`: any min_freq of at least one step starts the grid at
    // `df`, a smaller one yields a zero first frequency that is rejected below.
    let nf0 = match config.min_freq {
        Some(min_freq) => (min_freq / df).floor().min(1.0),
        None => 1.0,
    };

    let count = match config.max_freq {
        Some(max_freq) => (max_freq / df - nf0).ceil(),
        None => (0.5 * config.samples_per_peak * config.nyquist_factor * times.len() as f64)
            .floor(),
    };
    if !(count >= 1.0) {
        return Err(Error::invalid(format!(
            "planned grid is empty (count {count})"
        )));
    }

    tracing::debug!(baseline, df, nf0, count, "planned frequency grid");

    FrequencyGrid::new(
        (0..count as usize)
            .map(|i| df * (nf0 + i as f64))
            .collect(),
    )
}
