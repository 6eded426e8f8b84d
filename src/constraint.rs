// src/constraint.rs

//! Proximal operators and the typed constraint chain.
//!
//! Each operator is a pure mapping from an estimate array to a projected
//! array of identical shape. Projections are idempotent on their feasible
//! set: applying an operator twice returns the same array as applying it
//! once.

use ndarray::Array2;

/// Sparsity penalty applied through a thresholding operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sparsity {
    /// L0-like: zero entries whose magnitude is below the threshold.
    Hard {
        /// Magnitude cutoff.
        threshold: f64,
    },
    /// L1-like: shift entries toward zero by the threshold, clamp negatives.
    Soft {
        /// Shrinkage amount.
        threshold: f64,
    },
}

impl Sparsity {
    pub(crate) fn threshold(&self) -> f64 {
        match *self {
            Sparsity::Hard { threshold } | Sparsity::Soft { threshold } => threshold,
        }
    }
}

/// What a source gets instead of the monotonicity projection when it does
/// not seek monotonicity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonotonicFallback {
    /// Leave the source's template untouched.
    PassThrough,
    /// Apply a sparsity operator instead.
    Sparsity(Sparsity),
}

/// One member of the closed constraint set.
///
/// Constraints combine in an explicit ordered list (see [`ConstraintSpec`]);
/// the list is resolved once at session construction, never inspected ad hoc
/// during iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Clamp all negative entries to zero.
    NonNegative,
    /// Hard or soft thresholding.
    Sparsity(Sparsity),
    /// Radially non-increasing from each source's center.
    Monotonic {
        /// Operator for sources that do not seek monotonicity.
        fallback: MonotonicFallback,
    },
    /// Exact 180-degree point symmetry about each source's center.
    Symmetric,
    /// Convolve per-band by the supplied PSF kernel. This is a fixed linear
    /// map on the model, not a feasibility projection, so it carries no
    /// dual variable; requesting it switches the solver's model and
    /// gradients to the convolved form.
    Psf,
}

/// An ordered constraint chain plus optional per-source monotonicity flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintSpec {
    /// Constraints in application order.
    pub chain: Vec<Constraint>,
    /// When set, `monotonic_sources[k]` says whether source `k` seeks
    /// monotonicity; sources that don't get the configured fallback.
    /// When unset, every source seeks monotonicity.
    pub monotonic_sources: Option<Vec<bool>>,
}

impl Default for ConstraintSpec {
    fn default() -> Self {
        Self::monotonic()
    }
}

impl ConstraintSpec {
    /// Chain with the given constraints and no per-source flags.
    pub fn new(chain: Vec<Constraint>) -> Self {
        Self {
            chain,
            monotonic_sources: None,
        }
    }

    /// Non-negativity plus monotonicity (the usual default).
    pub fn monotonic() -> Self {
        Self::new(vec![
            Constraint::NonNegative,
            Constraint::Monotonic {
                fallback: MonotonicFallback::PassThrough,
            },
        ])
    }

    /// Non-negativity, monotonicity, and point symmetry.
    pub fn monotonic_symmetric() -> Self {
        Self::new(vec![
            Constraint::NonNegative,
            Constraint::Monotonic {
                fallback: MonotonicFallback::PassThrough,
            },
            Constraint::Symmetric,
        ])
    }

    /// Non-negativity only.
    pub fn free() -> Self {
        Self::new(vec![Constraint::NonNegative])
    }

    /// Append PSF convolution to the chain.
    pub fn with_psf(mut self) -> Self {
        self.chain.push(Constraint::Psf);
        self
    }

    /// Set the per-source monotonicity flags.
    pub fn with_monotonic_sources(mut self, seeks: Vec<bool>) -> Self {
        self.monotonic_sources = Some(seeks);
        self
    }

    /// Resolve the user chain into the form the solver iterates over.
    ///
    /// PSF membership is lifted out of the projection chain, exact
    /// duplicates collapse to their first occurrence, a second sparsity
    /// request is overridden (hard wins over soft, never both), and
    /// non-negativity is prepended when absent so the non-negativity
    /// invariant holds after every iteration.
    pub(crate) fn resolve(&self) -> ResolvedConstraints {
        let mut chain: Vec<Constraint> = Vec::new();
        let mut use_psf = false;
        let mut sparsity_at: Option<usize> = None;
        let mut overridden = false;

        for &c in &self.chain {
            match c {
                Constraint::Psf => use_psf = true,
                Constraint::Sparsity(s) => match sparsity_at {
                    None => {
                        sparsity_at = Some(chain.len());
                        chain.push(c);
                    }
                    Some(i) => {
                        if chain[i] == c {
                            continue;
                        }
                        overridden = true;
                        // Hard threshold wins over soft; otherwise keep the
                        // first request.
                        let keep_soft = matches!(
                            chain[i],
                            Constraint::Sparsity(Sparsity::Soft { .. })
                        );
                        if keep_soft && matches!(s, Sparsity::Hard { .. }) {
                            chain[i] = c;
                        }
                    }
                },
                other => {
                    if !chain.contains(&other) {
                        chain.push(other);
                    }
                }
            }
        }

        if let (true, Some(i)) = (overridden, sparsity_at) {
            log::warn!(
                "conflicting sparsity constraints requested; applying {:?} only",
                chain[i]
            );
        }

        if !chain.contains(&Constraint::NonNegative) {
            chain.insert(0, Constraint::NonNegative);
            log::debug!("non-negativity added to the constraint chain");
        }

        ResolvedConstraints {
            chain,
            use_psf,
            sparsity_overridden: overridden,
        }
    }
}

/// Constraint chain after resolution, as consumed by the solver.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConstraints {
    /// Projection constraints in application order (PSF removed).
    pub chain: Vec<Constraint>,
    /// Whether the model is PSF-convolved.
    pub use_psf: bool,
    /// Whether a sparsity conflict was resolved by override.
    pub sparsity_overridden: bool,
}

/// Clamp all entries below zero to zero.
pub fn prox_plus(x: &Array2<f64>) -> Array2<f64> {
    x.mapv(|v| v.max(0.0))
}

/// Zero entries whose magnitude is below `threshold`, pass the rest through.
pub fn prox_hard(x: &Array2<f64>, threshold: f64) -> Array2<f64> {
    x.mapv(|v| if v.abs() < threshold { 0.0 } else { v })
}

/// Shift entries toward zero by `threshold`, then clamp negatives to zero.
pub fn prox_soft_plus(x: &Array2<f64>, threshold: f64) -> Array2<f64> {
    x.mapv(|v| (v - threshold).max(0.0))
}

/// Dispatch to the requested thresholding operator.
pub fn prox_sparsity(x: &Array2<f64>, sparsity: Sparsity) -> Array2<f64> {
    match sparsity {
        Sparsity::Hard { threshold } => prox_hard(x, threshold),
        Sparsity::Soft { threshold } => prox_soft_plus(x, threshold),
    }
}

/// Average each pixel with its 180-degree-rotated counterpart about the
/// center, enforcing exact point symmetry.
///
/// The center may sit on a half-integer grid point (even-sized cutouts
/// after the half-pixel correction), so the reflected index is computed
/// from `round(2 * center)` rather than a rounded center. Pixels whose
/// counterpart falls outside the array pass through unchanged.
pub fn prox_symmetric(x: &Array2<f64>, center: (f64, f64)) -> Array2<f64> {
    let (height, width) = x.dim();
    let two_cx = (2.0 * center.0).round() as isize;
    let two_cy = (2.0 * center.1).round() as isize;

    let mut out = x.clone();
    for y in 0..height as isize {
        for px in 0..width as isize {
            let ry = two_cy - y;
            let rx = two_cx - px;
            if ry < 0 || rx < 0 || ry >= height as isize || rx >= width as isize {
                continue;
            }
            // Visit each pair once; (ry, rx) == (y, px) is the center pixel.
            if (ry, rx) <= (y, px) {
                continue;
            }
            let avg = 0.5
                * (x[[y as usize, px as usize]] + x[[ry as usize, rx as usize]]);
            out[[y as usize, px as usize]] = avg;
            out[[ry as usize, rx as usize]] = avg;
        }
    }
    out
}

/// Projection onto templates that are radially non-increasing from a fixed,
/// possibly off-grid center.
///
/// Construction precomputes a processing order (by distance from the center)
/// and, for every pixel, a strictly closer reference neighbor along the ray
/// toward the center. Applying the projection clamps each pixel to at most
/// its reference value, so moving outward along any ray is non-increasing.
#[derive(Debug, Clone)]
pub struct MonotonicProjection {
    width: usize,
    order: Vec<usize>,
    reference: Vec<usize>,
}

impl MonotonicProjection {
    /// Build the projection for a `height` x `width` template centered at
    /// `(x, y)` in pixel coordinates.
    pub fn new(height: usize, width: usize, center: (f64, f64)) -> Self {
        let (cx, cy) = center;
        let n = height * width;
        let dist2 = |idx: usize| -> f64 {
            let dy = (idx / width) as f64 - cy;
            let dx = (idx % width) as f64 - cx;
            dx * dx + dy * dy
        };

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| dist2(a).total_cmp(&dist2(b)));

        let mut reference = vec![0usize; n];
        for idx in 0..n {
            let y = (idx / width) as isize;
            let x = (idx % width) as isize;
            let d0 = dist2(idx);

            let dxc = cx - x as f64;
            let dyc = cy - y as f64;
            let norm = (dxc * dxc + dyc * dyc).sqrt();
            if norm < 0.5 {
                // This pixel holds the center.
                reference[idx] = idx;
                continue;
            }
            let ux = dxc / norm;
            let uy = dyc / norm;

            // Among the strictly closer 8-neighbors, take the one best
            // aligned with the ray toward the center.
            let mut best = idx;
            let mut best_score = f64::NEG_INFINITY;
            for oy in -1isize..=1 {
                for ox in -1isize..=1 {
                    if ox == 0 && oy == 0 {
                        continue;
                    }
                    let ny = y + oy;
                    let nx = x + ox;
                    if ny < 0 || nx < 0 || ny >= height as isize || nx >= width as isize {
                        continue;
                    }
                    let nidx = ny as usize * width + nx as usize;
                    if dist2(nidx) >= d0 {
                        continue;
                    }
                    let onorm = ((ox * ox + oy * oy) as f64).sqrt();
                    let score = (ox as f64 * ux + oy as f64 * uy) / onorm;
                    if score > best_score {
                        best_score = score;
                        best = nidx;
                    }
                }
            }
            reference[idx] = best;
        }

        Self {
            width,
            order,
            reference,
        }
    }

    /// Project a template onto the monotone feasible set.
    pub fn apply(&self, x: &Array2<f64>) -> Array2<f64> {
        let width = self.width;
        let mut out = x.clone();
        for &idx in &self.order {
            let r = self.reference[idx];
            if r == idx {
                continue;
            }
            let cap = out[[r / width, r % width]];
            let v = &mut out[[idx / width, idx % width]];
            if *v > cap {
                *v = cap;
            }
        }
        out
    }
}
