//! Error types for periodogram operations.

use thiserror::Error;

/// Errors that can occur while planning grids or evaluating periodograms.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed light curve, grid, statistic parameters, or buffer shape.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Device or host allocation failed while growing the pools.
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// A kernel launch or readback failed. `job` is `None` when the fault is
    /// device-wide and cannot be attributed to a single job.
    #[error("Kernel dispatch failed{}: {message}", .job.map(|j| format!(" for job {j}")).unwrap_or_default())]
    KernelDispatch { job: Option<usize>, message: String },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Failed to load config")]
    Config(#[from] common::SerdeFormatError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }
}
