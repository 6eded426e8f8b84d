// src/psf.rs

//! Point-spread-function kernels and same-size convolution.

use ndarray::Array2;

use crate::error::{DeblendError, Result};

/// A fixed convolution kernel for one band.
///
/// Kernels are immutable for the duration of a solve and may be shared
/// across concurrent group solves.
#[derive(Debug, Clone)]
pub struct PsfKernel {
    kernel: Array2<f64>,
}

impl PsfKernel {
    /// Wrap a kernel image. Both dimensions must be odd so the kernel has a
    /// well-defined center pixel.
    pub fn new(kernel: Array2<f64>) -> Result<Self> {
        let (kh, kw) = kernel.dim();
        if kh == 0 || kw == 0 {
            return Err(DeblendError::InvalidDimensions {
                message: "PSF kernel cannot be empty".into(),
            });
        }
        if kh % 2 == 0 || kw % 2 == 0 {
            return Err(DeblendError::InvalidDimensions {
                message: format!(
                    "PSF kernel dimensions must be odd, got {}x{}",
                    kh, kw
                ),
            });
        }
        Ok(Self { kernel })
    }

    /// Wrap a kernel, zeroing entries whose magnitude is below `clip`.
    ///
    /// Clipping the far wings sparsifies the kernel the same way the
    /// deblender's PSF threshold does.
    pub fn with_clip(kernel: Array2<f64>, clip: f64) -> Result<Self> {
        let clipped = kernel.mapv(|v| if v.abs() < clip { 0.0 } else { v });
        Self::new(clipped)
    }

    /// A copy with entries whose magnitude is below `clip` zeroed.
    pub fn clipped(&self, clip: f64) -> Self {
        Self {
            kernel: self.kernel.mapv(|v| if v.abs() < clip { 0.0 } else { v }),
        }
    }

    /// The kernel image.
    pub fn kernel(&self) -> &Array2<f64> {
        &self.kernel
    }

    /// Sum of absolute kernel values, an upper bound on the operator norm
    /// of the convolution.
    pub fn l1_norm(&self) -> f64 {
        self.kernel.iter().map(|v| v.abs()).sum()
    }

    /// Convolve an image with the kernel, zero-padded, same output size.
    pub fn convolve(&self, img: &Array2<f64>) -> Array2<f64> {
        self.correlate_impl(img, true)
    }

    /// Cross-correlate an image with the kernel: the adjoint of
    /// [`convolve`](Self::convolve) under zero padding, used for gradient
    /// back-projection.
    pub fn correlate(&self, img: &Array2<f64>) -> Array2<f64> {
        self.correlate_impl(img, false)
    }

    fn correlate_impl(&self, img: &Array2<f64>, flip: bool) -> Array2<f64> {
        let (height, width) = img.dim();
        let (kh, kw) = self.kernel.dim();
        let cy = (kh / 2) as isize;
        let cx = (kw / 2) as isize;

        let mut out = Array2::zeros((height, width));
        for y in 0..height as isize {
            for x in 0..width as isize {
                let mut acc = 0.0;
                for ky in 0..kh as isize {
                    for kx in 0..kw as isize {
                        let (sy, sx) = if flip {
                            (y - (ky - cy), x - (kx - cx))
                        } else {
                            (y + (ky - cy), x + (kx - cx))
                        };
                        if sy < 0 || sx < 0 || sy >= height as isize || sx >= width as isize {
                            continue;
                        }
                        acc += self.kernel[[ky as usize, kx as usize]]
                            * img[[sy as usize, sx as usize]];
                    }
                }
                out[[y as usize, x as usize]] = acc;
            }
        }
        out
    }
}
