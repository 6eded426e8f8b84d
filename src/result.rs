// src/result.rs

//! Result types for a deblend solve.

use ndarray::{Array2, Array3, Axis};

use crate::history::ConvergenceRecord;
use crate::psf::PsfKernel;

/// Result of deblending one blended group.
///
/// Templates are normalized to unit sum, so `sed[[b, k]]` is the model flux
/// of source `k` in band `b`.
#[derive(Debug, Clone)]
pub struct DeblendResult {
    /// SED matrix, shape (bands, sources), non-negative.
    pub sed: Array2<f64>,
    /// Spatial templates, shape (sources, height, width), non-negative,
    /// shared across bands.
    pub templates: Array3<f64>,
    /// Reconstructed model cube, shape (bands, height, width).
    pub model: Array3<f64>,
    /// Per-iteration convergence history.
    pub history: ConvergenceRecord,
}

impl DeblendResult {
    /// Number of bands.
    pub fn bands(&self) -> usize {
        self.sed.dim().0
    }

    /// Number of sources in the factorization.
    pub fn sources(&self) -> usize {
        self.sed.dim().1
    }

    /// Whether the solve stopped early on the residual criteria.
    pub fn converged(&self) -> bool {
        self.history.converged()
    }

    /// One source's modeled contribution in one band:
    /// `sed[[band, source]] * templates[source]`, convolved by the band's
    /// PSF when one is supplied.
    pub fn source_model(
        &self,
        band: usize,
        source: usize,
        psf: Option<&PsfKernel>,
    ) -> Array2<f64> {
        let template = self.templates.index_axis(Axis(0), source).to_owned();
        let template = match psf {
            Some(kernel) => kernel.convolve(&template),
            None => template,
        };
        template * self.sed[[band, source]]
    }
}
