//! PDM - phase dispersion minimization periodograms on the GPU.
//!
//! Scores trial frequencies of irregularly sampled light curves with the
//! Θ statistic, the ratio of a curve's variance to the variance left after
//! phase folding. Many light curves are evaluated at once, each on its own
//! stream slot, with transfers and kernels overlapping across jobs.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pdm::prelude::*;
//!
//! let curve = LightCurve::with_uniform_uncertainty(times, values, 0.05)?;
//! let grid = plan(curve.times(), &GridConfig::default())?;
//! let job = Job::new(curve, grid);
//!
//! let mut engine = PdmEngine::new()?;
//! let statistic = Statistic::binned_linterp(30);
//! let pending = engine.run(&[job], None, &statistic)?;
//! let mut drained = engine.finish()?;
//! for handle in pending {
//!     let output = drained.take(handle)?;
//!     println!("{:?}", output.power.non_finite_count());
//! }
//! ```
//!
//! The CPU [`estimator`] computes the same statistics in double precision
//! and serves as the reference for the GPU kernels.

mod config;
mod engine;
mod error;
pub mod estimator;
mod gpu;
mod grid;
mod job;
mod light_curve;
mod pool;
mod statistic;

pub mod prelude;

pub use prelude::*;
