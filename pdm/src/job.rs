use std::ops::Deref;
use std::sync::Arc;

use crate::grid::FrequencyGrid;
use crate::light_curve::LightCurve;

/// One light curve paired with the grid it is evaluated on.
#[derive(Debug, Clone)]
pub struct Job {
    curve: Arc<LightCurve>,
    grid: Arc<FrequencyGrid>,
}

impl Job {
    pub fn new(curve: impl Into<Arc<LightCurve>>, grid: impl Into<Arc<FrequencyGrid>>) -> Self {
        Self {
            curve: curve.into(),
            grid: grid.into(),
        }
    }

    pub fn curve(&self) -> &LightCurve {
        &self.curve
    }

    pub fn grid(&self) -> &FrequencyGrid {
        &self.grid
    }

    /// `(N, Nf)`: sample count and frequency count.
    pub fn shape(&self) -> (usize, usize) {
        (self.curve.len(), self.grid.len())
    }
}

/// Θ values aligned with a job's frequency grid.
///
/// Entries are non-finite where the statistic is undefined (constant light
/// curve, no usable bins); use [`PowerSeries::non_finite_count`] to detect them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PowerSeries {
    values: Vec<f64>,
}

/// The largest finite entry of a power series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub frequency: f64,
    pub power: f64,
}

impl PowerSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub(crate) fn from_device(values: &[f32]) -> Self {
        Self {
            values: values.iter().map(|&v| v as f64).collect(),
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }

    pub fn non_finite_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_finite()).count()
    }

    /// True when any frequency produced an undefined or infinite statistic.
    pub fn is_degenerate(&self) -> bool {
        self.values.iter().any(|v| !v.is_finite())
    }

    /// Highest finite power and its frequency. Non-finite entries are skipped.
    pub fn peak(&self, grid: &[f64]) -> Option<Peak> {
        debug_assert_eq!(grid.len(), self.values.len());

        self.values
            .iter()
            .zip(grid)
            .enumerate()
            .filter(|(_, (p, _))| p.is_finite())
            .max_by(|(_, (a, _)), (_, (b, _))| a.total_cmp(b))
            .map(|(index, (&power, &frequency))| Peak {
                index,
                frequency,
                power,
            })
    }
}

impl Deref for PowerSeries {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.values
    }
}
