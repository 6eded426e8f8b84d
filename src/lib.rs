// src/lib.rs

//! # Deblend
//!
//! Multi-band astronomical image deblending by constrained matrix
//! factorization.
//!
//! A blended group's pixel cube (bands x height x width) is factored into
//! per-source spectral energy distributions (SEDs) and shared non-negative
//! spatial templates, one template per detected peak. The factorization is
//! solved by alternating proximal gradient steps inside an ADMM loop, with
//! astrophysical constraints (monotonicity from the peak, 180-degree
//! symmetry, sparsity) applied as projection operators on the templates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use deblend::{BlendSession, Cutout, DeblendConfig, Peak};
//! use ndarray::Array3;
//!
//! # fn main() -> Result<(), deblend::DeblendError> {
//! // A 2-band 32x32 cutout with two detected peaks.
//! let data = Array3::<f64>::zeros((2, 32, 32));
//! let cutout = Cutout::from_data(data);
//! let peaks = vec![Peak::new(10.0, 16.0), Peak::new(22.0, 16.0)];
//!
//! let config = DeblendConfig::builder()
//!     .max_iter(150)
//!     .e_rel(1e-3)
//!     .build_validated()?;
//!
//! let mut session = BlendSession::new(cutout, peaks, None, config)?;
//! let result = session.deblend()?;
//! println!(
//!     "converged: {} after {} iterations",
//!     result.converged(),
//!     result.history.iterations()
//! );
//!
//! // Redistribute the observed flux across the separated sources.
//! let flux = session.apportion_flux()?;
//! # let _ = flux;
//! # Ok(())
//! # }
//! ```

mod config;
mod constraint;
mod core;
mod cutout;
mod error;
mod group;
mod history;
mod psf;
mod result;
mod session;

pub use config::{ConfigBuilder, DeblendConfig};
pub use constraint::{
    prox_hard, prox_plus, prox_soft_plus, prox_sparsity, prox_symmetric, Constraint,
    ConstraintSpec, MonotonicFallback, MonotonicProjection, Sparsity,
};
pub use cutout::{mask, Cutout, Peak};
pub use error::{DeblendError, Result};
pub use group::{BlendGroup, GroupManager, GroupOutcome, GroupResult};
pub use history::{ConstraintResidual, ConvergenceRecord, IterationRecord, SedDiagnostic};
pub use psf::PsfKernel;
pub use result::DeblendResult;
pub use session::BlendSession;

// Re-export ndarray for convenience
pub use ndarray;
