// src/cutout.rs

//! Pixel cutouts, mask planes, and weight maps for one blended group.

use ndarray::{Array2, Array3};

use crate::error::{DeblendError, Result};

/// Mask plane bits flagging pixels that carry no usable signal.
pub mod mask {
    /// Bad pixel (detector defect).
    pub const BAD: u64 = 1 << 0;
    /// Cosmic ray hit.
    pub const CR: u64 = 1 << 1;
    /// No data (chip gap, unobserved).
    pub const NO_DATA: u64 = 1 << 2;
    /// Saturated.
    pub const SAT: u64 = 1 << 3;
    /// Suspect (near saturation, interpolated).
    pub const SUSPECT: u64 = 1 << 4;

    /// Union of all planes that zero a pixel's weight by default.
    pub const DEFAULT_BAD: u64 = BAD | CR | NO_DATA | SAT | SUSPECT;
}

/// A candidate source position within a blend, in cutout pixel coordinates.
///
/// Peaks are ordered and immutable once a solve begins: the source count of
/// a factorization is fixed for the lifetime of the solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// X position (sub-pixel).
    pub x: f64,
    /// Y position (sub-pixel).
    pub y: f64,
}

impl Peak {
    /// Create a peak at the given cutout-local position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Aligned multi-band pixel data for one blended group.
///
/// All bands share an identical shape and pixel origin; the footprint marks
/// which pixels belong to the detected region.
#[derive(Debug, Clone)]
pub struct Cutout {
    /// Intensity, shape (bands, height, width).
    pub data: Array3<f64>,
    /// Mask plane bits, same shape as `data`.
    pub mask: Array3<u64>,
    /// Per-pixel variance, same shape as `data`.
    pub variance: Array3<f64>,
    /// Footprint membership, shape (height, width).
    pub footprint: Array2<bool>,
}

impl Cutout {
    /// Assemble a cutout, validating that every plane shares one pixel grid.
    pub fn new(
        data: Array3<f64>,
        mask: Array3<u64>,
        variance: Array3<f64>,
        footprint: Array2<bool>,
    ) -> Result<Self> {
        let shape = data.dim();
        if mask.dim() != shape {
            return Err(DeblendError::InvalidDimensions {
                message: format!(
                    "mask shape {:?} does not match data shape {:?}",
                    mask.dim(),
                    shape
                ),
            });
        }
        if variance.dim() != shape {
            return Err(DeblendError::InvalidDimensions {
                message: format!(
                    "variance shape {:?} does not match data shape {:?}",
                    variance.dim(),
                    shape
                ),
            });
        }
        if footprint.dim() != (shape.1, shape.2) {
            return Err(DeblendError::InvalidDimensions {
                message: format!(
                    "footprint shape {:?} does not match image shape {:?}",
                    footprint.dim(),
                    (shape.1, shape.2)
                ),
            });
        }
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(DeblendError::InvalidDimensions {
                message: "cutout cannot be empty".into(),
            });
        }
        Ok(Self {
            data,
            mask,
            variance,
            footprint,
        })
    }

    /// Cutout with unit variance, clean masks, and a full footprint.
    ///
    /// Useful for synthetic data and tests where every pixel is trusted.
    pub fn from_data(data: Array3<f64>) -> Self {
        let (_, height, width) = data.dim();
        let mask = Array3::zeros(data.dim());
        let variance = Array3::ones(data.dim());
        let footprint = Array2::from_elem((height, width), true);
        Self {
            data,
            mask,
            variance,
            footprint,
        }
    }

    /// Number of bands.
    pub fn bands(&self) -> usize {
        self.data.dim().0
    }

    /// Cutout height in pixels.
    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    /// Cutout width in pixels.
    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// Build the per-pixel, per-band weight map.
    ///
    /// Weights are inverse variance, zeroed wherever the variance is not
    /// positive, any of `bad_bits` is set in the mask, or the pixel lies
    /// outside the footprint. The result is non-negative everywhere.
    pub fn weights(&self, bad_bits: u64) -> Array3<f64> {
        let (bands, height, width) = self.data.dim();
        let mut weights = Array3::zeros((bands, height, width));
        for b in 0..bands {
            for y in 0..height {
                for x in 0..width {
                    let var = self.variance[[b, y, x]];
                    let flagged = self.mask[[b, y, x]] & bad_bits != 0;
                    if var > 0.0 && !flagged && self.footprint[[y, x]] {
                        weights[[b, y, x]] = 1.0 / var;
                    }
                }
            }
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cutout() -> Cutout {
        let data = Array3::from_elem((2, 3, 3), 1.0);
        Cutout::from_data(data)
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let data = Array3::zeros((2, 3, 3));
        let mask = Array3::zeros((2, 3, 4));
        let variance = Array3::ones((2, 3, 3));
        let footprint = Array2::from_elem((3, 3), true);

        let result = Cutout::new(data, mask, variance, footprint);
        assert!(matches!(
            result,
            Err(DeblendError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_footprint_shape_rejected() {
        let data = Array3::zeros((2, 3, 3));
        let mask = Array3::zeros((2, 3, 3));
        let variance = Array3::ones((2, 3, 3));
        let footprint = Array2::from_elem((4, 3), true);

        let result = Cutout::new(data, mask, variance, footprint);
        assert!(matches!(
            result,
            Err(DeblendError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_weights_inverse_variance() {
        let mut cutout = small_cutout();
        cutout.variance.fill(4.0);

        let weights = cutout.weights(mask::DEFAULT_BAD);
        assert!((weights[[0, 1, 1]] - 0.25).abs() < 1e-15);
    }

    #[test]
    fn test_weights_zero_for_flagged_pixels() {
        let mut cutout = small_cutout();
        cutout.mask[[0, 1, 1]] = mask::CR;
        cutout.mask[[1, 2, 2]] = mask::SAT | mask::SUSPECT;

        let weights = cutout.weights(mask::DEFAULT_BAD);
        assert_eq!(weights[[0, 1, 1]], 0.0);
        assert_eq!(weights[[1, 2, 2]], 0.0);
        // The same pixel in the other band is unaffected.
        assert!(weights[[1, 1, 1]] > 0.0);
    }

    #[test]
    fn test_weights_zero_outside_footprint() {
        let mut cutout = small_cutout();
        cutout.footprint[[0, 0]] = false;

        let weights = cutout.weights(mask::DEFAULT_BAD);
        assert_eq!(weights[[0, 0, 0]], 0.0);
        assert_eq!(weights[[1, 0, 0]], 0.0);
    }

    #[test]
    fn test_weights_zero_for_nonpositive_variance() {
        let mut cutout = small_cutout();
        cutout.variance[[0, 2, 1]] = 0.0;
        cutout.variance[[1, 2, 1]] = -1.0;

        let weights = cutout.weights(mask::DEFAULT_BAD);
        assert_eq!(weights[[0, 2, 1]], 0.0);
        assert_eq!(weights[[1, 2, 1]], 0.0);
    }

    #[test]
    fn test_weights_nonnegative() {
        let cutout = small_cutout();
        let weights = cutout.weights(mask::DEFAULT_BAD);
        assert!(weights.iter().all(|&w| w >= 0.0));
    }
}
