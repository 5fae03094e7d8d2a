//! Phase-folding models and their parameters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest bin count the GPU kernel supports (size of its per-invocation bin arrays).
pub const MAX_GPU_BINS: u32 = 128;

/// Default phase window half-width.
pub const DEFAULT_DPHI: f64 = 0.05;

/// Default number of phase bins.
pub const DEFAULT_NBINS: u32 = 30;

/// Compiled kernel variants, one compute entry point each.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum KernelVariant {
    Tophat,
    GaussWindow,
    BinnedInterp,
}

impl KernelVariant {
    /// WGSL entry point implementing this variant.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelVariant::Tophat => "pdm_tophat",
            KernelVariant::GaussWindow => "pdm_gauss",
            KernelVariant::BinnedInterp => "pdm_binned_linterp",
        }
    }
}

/// The residual-variance model used to score a trial frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Statistic {
    /// Local weighted mean over points closer than `dphi` in phase.
    Tophat { dphi: f64 },
    /// Local weighted mean with Gaussian phase weights of width `dphi`.
    GaussWindow { dphi: f64 },
    /// Per-bin weighted means over `nbins` equal phase bins, optionally
    /// linearly interpolated between neighbouring bin centres.
    Binned { nbins: u32, linterp: bool },
}

impl Default for Statistic {
    fn default() -> Self {
        Self::Binned {
            nbins: DEFAULT_NBINS,
            linterp: true,
        }
    }
}

impl Statistic {
    pub fn tophat(dphi: f64) -> Self {
        Self::Tophat { dphi }
    }

    pub fn gauss(dphi: f64) -> Self {
        Self::GaussWindow { dphi }
    }

    pub fn binned(nbins: u32) -> Self {
        Self::Binned {
            nbins,
            linterp: false,
        }
    }

    pub fn binned_linterp(nbins: u32) -> Self {
        Self::Binned {
            nbins,
            linterp: true,
        }
    }

    pub fn variant(&self) -> KernelVariant {
        match self {
            Statistic::Tophat { .. } => KernelVariant::Tophat,
            Statistic::GaussWindow { .. } => KernelVariant::GaussWindow,
            Statistic::Binned { .. } => KernelVariant::BinnedInterp,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Statistic::Tophat { dphi } | Statistic::GaussWindow { dphi } => {
                if !(dphi > 0.0 && dphi <= 0.5) {
                    return Err(Error::invalid(format!(
                        "dphi must be in (0, 0.5], got {dphi}"
                    )));
                }
            }
            Statistic::Binned { nbins, .. } => {
                if nbins == 0 {
                    return Err(Error::invalid("nbins must be at least 1"));
                }
            }
        }
        Ok(())
    }

    /// Validation plus the limits of the GPU kernels.
    pub(crate) fn validate_for_gpu(&self) -> Result<()> {
        self.validate()?;
        if let Statistic::Binned { nbins, .. } = *self {
            if nbins > MAX_GPU_BINS {
                return Err(Error::invalid(format!(
                    "nbins {nbins} exceeds the GPU limit of {MAX_GPU_BINS}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_variant_names() {
        assert_eq!(KernelVariant::Tophat.to_string(), "tophat");
        assert_eq!(KernelVariant::GaussWindow.to_string(), "gauss-window");
        assert_eq!(KernelVariant::BinnedInterp.to_string(), "binned-interp");
        assert_eq!(
            KernelVariant::from_str("binned-interp").unwrap(),
            KernelVariant::BinnedInterp
        );
        assert!(KernelVariant::from_str("lomb-scargle").is_err());
    }

    #[test]
    fn test_entry_points_are_distinct() {
        let mut names: Vec<_> = KernelVariant::iter().map(|v| v.entry_point()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_statistic_variant() {
        assert_eq!(Statistic::tophat(0.1).variant(), KernelVariant::Tophat);
        assert_eq!(Statistic::gauss(0.1).variant(), KernelVariant::GaussWindow);
        assert_eq!(Statistic::binned(10).variant(), KernelVariant::BinnedInterp);
        assert_eq!(Statistic::default().variant(), KernelVariant::BinnedInterp);
    }

    #[test]
    fn test_validate_dphi() {
        assert!(Statistic::tophat(0.05).validate().is_ok());
        assert!(Statistic::tophat(0.5).validate().is_ok());
        assert!(Statistic::tophat(0.0).validate().is_err());
        assert!(Statistic::gauss(0.6).validate().is_err());
        assert!(Statistic::gauss(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_validate_nbins() {
        assert!(Statistic::binned(1).validate().is_ok());
        assert!(Statistic::binned(0).validate().is_err());
        assert!(Statistic::binned_linterp(MAX_GPU_BINS).validate_for_gpu().is_ok());
        assert!(Statistic::binned_linterp(MAX_GPU_BINS + 1).validate().is_ok());
        assert!(
            Statistic::binned_linterp(MAX_GPU_BINS + 1)
                .validate_for_gpu()
                .is_err()
        );
    }

    #[test]
    fn test_statistic_serde_tagged() {
        let stat: Statistic = serde_yml::from_str("kind: binned\nnbins: 12\nlinterp: false\n").unwrap();
        assert_eq!(stat, Statistic::binned(12));
        let stat: Statistic = serde_yml::from_str("kind: gauss-window\ndphi: 0.1\n").unwrap();
        assert_eq!(stat, Statistic::gauss(0.1));
    }
}
