// src/error.rs

//! Error types for the deblender.

use std::fmt;

/// Errors that can occur while configuring or running a deblend.
///
/// Every variant is fatal and surfaced before the first solver iteration;
/// running out of the iteration budget is *not* an error (the solver returns
/// its best estimate with the history marked as non-converged).
#[derive(Debug, Clone)]
pub enum DeblendError {
    /// Invalid configuration parameter.
    InvalidConfig {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why it's invalid.
        message: String,
    },

    /// Input array shapes disagree, or a peak falls outside the cutout.
    InvalidDimensions {
        /// Description of the dimension error.
        message: String,
    },

    /// A blend was constructed with an empty peak list.
    NoPeaks,

    /// Every pixel in every band has zero weight; the objective is undefined.
    DegenerateWeights,

    /// The constraint chain requests PSF convolution but the kernels are
    /// missing or miscounted.
    MissingPsf {
        /// Number of bands in the cutout.
        expected: usize,
        /// Number of kernels supplied.
        got: usize,
    },

    /// A post-solve analysis was requested before `deblend()` ran.
    NotSolved,
}

impl fmt::Display for DeblendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeblendError::InvalidConfig { parameter, message } => {
                write!(f, "Invalid configuration for '{}': {}", parameter, message)
            }
            DeblendError::InvalidDimensions { message } => {
                write!(f, "Invalid dimensions: {}", message)
            }
            DeblendError::NoPeaks => {
                write!(f, "A blend requires at least one peak")
            }
            DeblendError::DegenerateWeights => {
                write!(
                    f,
                    "All weights are zero in every band; check the variance, \
                     mask planes, and footprint"
                )
            }
            DeblendError::MissingPsf { expected, got } => {
                write!(
                    f,
                    "PSF convolution requested but {} kernel(s) supplied for {} band(s)",
                    got, expected
                )
            }
            DeblendError::NotSolved => {
                write!(f, "No solver result available; call deblend() first")
            }
        }
    }
}

impl std::error::Error for DeblendError {}

/// Convenience type alias for Results with DeblendError.
pub type Result<T> = std::result::Result<T, DeblendError>;
