// src/config.rs

//! Configuration for the deblender.

use crate::constraint::{ConstraintSpec, Sparsity};
use crate::cutout::mask;
use crate::error::{DeblendError, Result};

/// Configuration parameters for a deblend solve.
///
/// All precedence and defaulting happens here, once, at configuration-build
/// time; the solver never inspects optional parameters mid-iteration.
#[derive(Debug, Clone)]
pub struct DeblendConfig {
    /// Constraint chain applied to the spatial templates.
    pub constraints: ConstraintSpec,

    /// Maximum number of ADMM iterations. Exhausting the budget is not an
    /// error; the result is returned with the history marked non-converged.
    pub max_iter: usize,

    /// Relative convergence tolerance on the primal/dual residuals.
    pub e_rel: f64,

    /// Absolute convergence tolerance on the primal/dual residuals.
    pub e_abs: f64,

    /// ADMM penalty parameter scaling the dual residual.
    pub rho: f64,

    /// Number of consecutive in-tolerance iterations required to stop early.
    pub converged_iters: usize,

    /// Fraction of the inverse Lipschitz bound used as the gradient step.
    pub step_scale: f64,

    /// Optional sparsity applied to the SED matrix after each update
    /// (non-negativity always applies).
    pub sed_sparsity: Option<Sparsity>,

    /// PSF kernel entries below this magnitude are clipped to zero.
    pub psf_clip: f64,

    /// Mask plane bits that zero a pixel's weight.
    pub bad_mask: u64,

    /// Groups with more peaks than this are reported and skipped by the
    /// group manager instead of being solved. `None` means no cap.
    pub max_peaks: Option<usize>,
}

impl Default for DeblendConfig {
    fn default() -> Self {
        Self {
            constraints: ConstraintSpec::default(),
            max_iter: 200,
            e_rel: 1e-3,
            e_abs: 1e-8,
            rho: 1.0,
            converged_iters: 3,
            step_scale: 1.0,
            sed_sparsity: None,
            psf_clip: 1e-2,
            bad_mask: mask::DEFAULT_BAD,
            max_peaks: None,
        }
    }
}

impl DeblendConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "max_iter".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.e_rel <= 0.0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "e_rel".into(),
                message: "must be positive".into(),
            });
        }

        if self.e_abs < 0.0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "e_abs".into(),
                message: "must be non-negative".into(),
            });
        }

        if self.rho <= 0.0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "rho".into(),
                message: "must be positive".into(),
            });
        }

        if self.converged_iters == 0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "converged_iters".into(),
                message: "must be at least 1".into(),
            });
        }

        if !(self.step_scale > 0.0 && self.step_scale <= 1.0) {
            return Err(DeblendError::InvalidConfig {
                parameter: "step_scale".into(),
                message: "must be in (0, 1]".into(),
            });
        }

        if let Some(s) = self.sed_sparsity {
            if s.threshold() < 0.0 {
                return Err(DeblendError::InvalidConfig {
                    parameter: "sed_sparsity".into(),
                    message: "threshold must be non-negative".into(),
                });
            }
        }

        for c in &self.constraints.chain {
            if let crate::constraint::Constraint::Sparsity(s) = c {
                if s.threshold() < 0.0 {
                    return Err(DeblendError::InvalidConfig {
                        parameter: "constraints".into(),
                        message: "sparsity threshold must be non-negative".into(),
                    });
                }
            }
        }

        if self.psf_clip < 0.0 {
            return Err(DeblendError::InvalidConfig {
                parameter: "psf_clip".into(),
                message: "must be non-negative".into(),
            });
        }

        if let Some(cap) = self.max_peaks {
            if cap < 2 {
                return Err(DeblendError::InvalidConfig {
                    parameter: "max_peaks".into(),
                    message: "a cap below 2 would exclude every blend".into(),
                });
            }
        }

        Ok(())
    }
}

/// Builder for constructing `DeblendConfig` with a fluent API.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: DeblendConfig,
}

impl ConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: DeblendConfig::default(),
        }
    }

    /// Set the constraint chain.
    pub fn constraints(mut self, constraints: ConstraintSpec) -> Self {
        self.config.constraints = constraints;
        self
    }

    /// Set the maximum number of iterations.
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.config.max_iter = max_iter;
        self
    }

    /// Set the relative convergence tolerance.
    pub fn e_rel(mut self, e_rel: f64) -> Self {
        self.config.e_rel = e_rel;
        self
    }

    /// Set the absolute convergence tolerance.
    pub fn e_abs(mut self, e_abs: f64) -> Self {
        self.config.e_abs = e_abs;
        self
    }

    /// Set the ADMM penalty parameter.
    pub fn rho(mut self, rho: f64) -> Self {
        self.config.rho = rho;
        self
    }

    /// Set how many consecutive in-tolerance iterations stop the solve.
    pub fn converged_iters(mut self, converged_iters: usize) -> Self {
        self.config.converged_iters = converged_iters;
        self
    }

    /// Set the gradient step as a fraction of the inverse Lipschitz bound.
    pub fn step_scale(mut self, step_scale: f64) -> Self {
        self.config.step_scale = step_scale;
        self
    }

    /// Apply a sparsity operator to the SED matrix after each update.
    pub fn sed_sparsity(mut self, sparsity: Sparsity) -> Self {
        self.config.sed_sparsity = Some(sparsity);
        self
    }

    /// Set the PSF kernel clipping threshold.
    pub fn psf_clip(mut self, psf_clip: f64) -> Self {
        self.config.psf_clip = psf_clip;
        self
    }

    /// Set the mask plane bits that zero a pixel's weight.
    pub fn bad_mask(mut self, bad_mask: u64) -> Self {
        self.config.bad_mask = bad_mask;
        self
    }

    /// Cap the number of peaks a group may have and still be solved.
    pub fn max_peaks(mut self, max_peaks: usize) -> Self {
        self.config.max_peaks = Some(max_peaks);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DeblendConfig {
        self.config
    }

    /// Build and validate the configuration.
    pub fn build_validated(self) -> Result<DeblendConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
