// src/session.rs

//! Per-blend working state.
//!
//! A `BlendSession` owns one group's cutout, weight map, peaks, and solver
//! output for the lifetime of one deblend call. All validation happens at
//! construction, before any iteration runs; the post-solve analyses are
//! pure functions of the stored result.

use ndarray::{Array2, Array3, Axis};

use crate::config::DeblendConfig;
use crate::constraint::ResolvedConstraints;
use crate::core::{self, Problem};
use crate::cutout::{Cutout, Peak};
use crate::error::{DeblendError, Result};
use crate::psf::PsfKernel;
use crate::result::DeblendResult;

/// Working state for deblending one blended group.
pub struct BlendSession {
    cutout: Cutout,
    weights: Array3<f64>,
    peaks: Vec<Peak>,
    centers: Vec<(f64, f64)>,
    psfs: Option<Vec<PsfKernel>>,
    config: DeblendConfig,
    resolved: ResolvedConstraints,
    result: Option<DeblendResult>,
}

impl BlendSession {
    /// Assemble and validate a session.
    ///
    /// Checks the configuration, peak list (non-empty, inside the cutout,
    /// per-source flag counts), PSF kernel counts when the chain requests
    /// convolution, and that at least one pixel carries weight. The
    /// constraint chain is resolved here, once; any sparsity override is
    /// logged at that point.
    pub fn new(
        cutout: Cutout,
        peaks: Vec<Peak>,
        psfs: Option<Vec<PsfKernel>>,
        config: DeblendConfig,
    ) -> Result<Self> {
        config.validate()?;

        if peaks.is_empty() {
            return Err(DeblendError::NoPeaks);
        }

        let height = cutout.height();
        let width = cutout.width();
        for (i, peak) in peaks.iter().enumerate() {
            let inside = peak.x >= 0.0
                && peak.y >= 0.0
                && peak.x <= (width - 1) as f64
                && peak.y <= (height - 1) as f64;
            if !inside {
                return Err(DeblendError::InvalidDimensions {
                    message: format!(
                        "peak {} at ({}, {}) lies outside the {}x{} cutout",
                        i, peak.x, peak.y, height, width
                    ),
                });
            }
        }

        if let Some(seeks) = &config.constraints.monotonic_sources {
            if seeks.len() != peaks.len() {
                return Err(DeblendError::InvalidConfig {
                    parameter: "monotonic_sources".into(),
                    message: format!("{} flags for {} peaks", seeks.len(), peaks.len()),
                });
            }
        }

        // Kernel wings below the configured threshold are zeroed up front,
        // once, so the solver and template extraction share one clipped
        // kernel per band.
        let psfs = psfs.map(|kernels| {
            kernels
                .into_iter()
                .map(|k| k.clipped(config.psf_clip))
                .collect::<Vec<_>>()
        });

        let resolved = config.constraints.resolve();
        if resolved.use_psf {
            let got = psfs.as_ref().map_or(0, |k| k.len());
            if got != cutout.bands() {
                return Err(DeblendError::MissingPsf {
                    expected: cutout.bands(),
                    got,
                });
            }
        }

        let weights = cutout.weights(config.bad_mask);
        if weights.iter().all(|&w| w == 0.0) {
            return Err(DeblendError::DegenerateWeights);
        }

        // Half-pixel correction: on even-sized axes the peak grid and the
        // pixel-center grid disagree by half a pixel.
        let dx = if width % 2 == 0 { 0.5 } else { 0.0 };
        let dy = if height % 2 == 0 { 0.5 } else { 0.0 };
        let centers = peaks.iter().map(|p| (p.x - dx, p.y - dy)).collect();

        Ok(Self {
            cutout,
            weights,
            peaks,
            centers,
            psfs,
            config,
            resolved,
            result: None,
        })
    }

    /// Run the solver and store the result.
    pub fn deblend(&mut self) -> Result<&DeblendResult> {
        let solution = core::run(&Problem {
            data: &self.cutout.data,
            weights: &self.weights,
            centers: &self.centers,
            resolved: &self.resolved,
            monotonic_sources: self.config.constraints.monotonic_sources.as_deref(),
            psfs: self.psfs.as_deref(),
            config: &self.config,
        })?;

        let result = DeblendResult {
            sed: solution.sed,
            templates: solution.templates,
            model: solution.model,
            history: solution.history,
        };
        Ok(self.result.insert(result))
    }

    /// The cutout this session was built around.
    pub fn cutout(&self) -> &Cutout {
        &self.cutout
    }

    /// The weight map derived from variance, masks, and the footprint.
    pub fn weights(&self) -> &Array3<f64> {
        &self.weights
    }

    /// The peaks, in their original order and coordinates.
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    /// Cutout-local constraint centers after the half-pixel correction.
    pub fn centers(&self) -> &[(f64, f64)] {
        &self.centers
    }

    /// Whether resolving the constraint chain overrode a conflicting
    /// sparsity request (hard thresholding wins over soft).
    pub fn sparsity_overridden(&self) -> bool {
        self.resolved.sparsity_overridden
    }

    /// The stored result, if `deblend()` has run.
    pub fn result(&self) -> Option<&DeblendResult> {
        self.result.as_ref()
    }

    /// Consume the session, keeping only the result.
    pub fn into_result(self) -> Option<DeblendResult> {
        self.result
    }

    fn solved(&self) -> Result<&DeblendResult> {
        self.result.as_ref().ok_or(DeblendError::NotSolved)
    }

    fn psf_for(&self, band: usize) -> Option<&PsfKernel> {
        if self.resolved.use_psf {
            self.psfs.as_ref().map(|kernels| &kernels[band])
        } else {
            None
        }
    }

    /// One source's modeled contribution in one band.
    pub fn source_model(&self, band: usize, source: usize) -> Result<Array2<f64>> {
        let result = self.solved()?;
        Ok(result.source_model(band, source, self.psf_for(band)))
    }

    /// Redistribute the observed pixel data of one band across sources.
    ///
    /// Each pixel's observed value is split in proportion to the sources'
    /// template weights there, so the per-source portions sum to the
    /// observed value wherever any template is non-zero, and are all zero
    /// where every template vanishes. Returns shape (sources, height,
    /// width).
    pub fn apportion_band(&self, band: usize) -> Result<Array3<f64>> {
        let result = self.solved()?;
        let n_sources = result.sources();
        let height = self.cutout.height();
        let width = self.cutout.width();

        let templates: Vec<Array2<f64>> = (0..n_sources)
            .map(|k| result.source_model(band, k, self.psf_for(band)))
            .collect();

        let mut portions = Array3::zeros((n_sources, height, width));
        for y in 0..height {
            for x in 0..width {
                let total: f64 = templates.iter().map(|t| t[[y, x]]).sum();
                if total > 0.0 {
                    let observed = self.cutout.data[[band, y, x]];
                    for (k, template) in templates.iter().enumerate() {
                        portions[[k, y, x]] = observed * template[[y, x]] / total;
                    }
                }
            }
        }
        Ok(portions)
    }

    /// Total re-apportioned flux per band and source, shape
    /// (bands, sources).
    pub fn apportion_flux(&self) -> Result<Array2<f64>> {
        let result = self.solved()?;
        let mut flux = Array2::zeros((result.bands(), result.sources()));
        for b in 0..result.bands() {
            let portions = self.apportion_band(b)?;
            for k in 0..result.sources() {
                flux[[b, k]] = portions.index_axis(Axis(0), k).sum();
            }
        }
        Ok(flux)
    }

    /// Pairwise template overlap: for each unordered source pair, the inner
    /// product of their templates normalized by the product of their total
    /// fluxes. Zero when either total flux is zero. `min_flux` clips
    /// template pixels below the cutoff before measuring.
    pub fn correlations(&self, min_flux: Option<f64>) -> Result<Array2<f64>> {
        let result = self.solved()?;
        let n_sources = result.sources();

        let mut templates = result.templates.clone();
        if let Some(cut) = min_flux {
            templates.mapv_inplace(|v| if v < cut { 0.0 } else { v });
        }
        let totals: Vec<f64> = (0..n_sources)
            .map(|k| templates.index_axis(Axis(0), k).sum())
            .collect();

        let mut corr = Array2::zeros((n_sources, n_sources));
        for i in 0..n_sources {
            for j in (i + 1)..n_sources {
                let norm = totals[i] * totals[j];
                if norm > 0.0 {
                    let inner: f64 = templates
                        .index_axis(Axis(0), i)
                        .iter()
                        .zip(templates.index_axis(Axis(0), j).iter())
                        .map(|(a, b)| a * b)
                        .sum();
                    corr[[i, j]] = inner / norm;
                    corr[[j, i]] = inner / norm;
                }
            }
        }
        Ok(corr)
    }
}
