// src/history.rs

//! Convergence history and diagnostics extraction.
//!
//! The solver appends one record per iteration; after the solve the record
//! is read-only. The curve extraction methods exist so a caller-supplied
//! reporting or plotting facility can inspect convergence without knowing
//! the solver internals.

use crate::constraint::Constraint;

/// SED-update diagnostics for one source at one iteration.
#[derive(Debug, Clone, Copy)]
pub struct SedDiagnostic {
    /// Inner product of the updated and previous SED columns.
    pub cross: f64,
    /// Squared norm of the previous SED column.
    pub old_norm2: f64,
}

/// Primal/dual residuals for one active constraint at one iteration.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintResidual {
    /// The constraint these residuals belong to.
    pub constraint: Constraint,
    /// Squared primal residual: pre- vs post-projection mismatch.
    pub primal2: f64,
    /// Squared primal tolerance.
    pub e_pri2: f64,
    /// Squared dual residual: change in the projected estimate scaled by
    /// the penalty parameter.
    pub dual2: f64,
    /// Squared dual tolerance.
    pub e_dual2: f64,
}

impl ConstraintResidual {
    /// Whether both residuals are within their tolerances.
    pub fn within_tolerance(&self) -> bool {
        self.primal2 <= self.e_pri2 && self.dual2 <= self.e_dual2
    }
}

/// One iteration's snapshot of the solve.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// Per-source SED cross terms.
    pub sed: Vec<SedDiagnostic>,
    /// Per-constraint residuals, in chain order.
    pub residuals: Vec<ConstraintResidual>,
    /// Weighted residual sum of squares of the model entering this
    /// iteration.
    pub rss: f64,
    /// Whether the RSS regressed relative to the previous iteration
    /// (a numerical stall; recorded, never fatal).
    pub stalled: bool,
}

/// Ordered sequence of residual snapshots for one solve.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceRecord {
    records: Vec<IterationRecord>,
    converged: bool,
}

impl ConvergenceRecord {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub(crate) fn mark_converged(&mut self) {
        self.converged = true;
    }

    /// Whether the solve stopped early on the residual criteria. `false`
    /// means the iteration budget was exhausted; the estimate is still the
    /// best available and callers inspect the curves to judge quality.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Number of iterations performed.
    pub fn iterations(&self) -> usize {
        self.records.len()
    }

    /// All per-iteration records, in order.
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// The most recent record, if any iteration ran.
    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Weighted model RSS per iteration.
    pub fn rss_curve(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.rss).collect()
    }

    /// SED convergence curve for one source: `cross - old_norm2` per
    /// iteration. Positive values indicate the SED column is still growing
    /// along its previous direction.
    pub fn sed_curve(&self, source: usize) -> Vec<f64> {
        self.records
            .iter()
            .map(|r| {
                let d = &r.sed[source];
                d.cross - d.old_norm2
            })
            .collect()
    }

    /// `(primal2, e_pri2)` pairs per iteration for one constraint.
    pub fn primal_curve(&self, constraint: usize) -> Vec<(f64, f64)> {
        self.records
            .iter()
            .map(|r| {
                let c = &r.residuals[constraint];
                (c.primal2, c.e_pri2)
            })
            .collect()
    }

    /// `(dual2, e_dual2)` pairs per iteration for one constraint.
    pub fn dual_curve(&self, constraint: usize) -> Vec<(f64, f64)> {
        self.records
            .iter()
            .map(|r| {
                let c = &r.residuals[constraint];
                (c.dual2, c.e_dual2)
            })
            .collect()
    }

    /// Indices of iterations where the RSS regressed.
    pub fn stalls(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.stalled)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rss: f64, stalled: bool) -> IterationRecord {
        IterationRecord {
            sed: vec![SedDiagnostic {
                cross: 2.0 * rss,
                old_norm2: rss,
            }],
            residuals: vec![ConstraintResidual {
                constraint: Constraint::NonNegative,
                primal2: rss,
                e_pri2: 1.0,
                dual2: 0.5 * rss,
                e_dual2: 1.0,
            }],
            rss,
            stalled,
        }
    }

    #[test]
    fn test_curves() {
        let mut history = ConvergenceRecord::new();
        history.push(record(4.0, false));
        history.push(record(2.0, false));
        history.push(record(3.0, true));

        assert_eq!(history.iterations(), 3);
        assert_eq!(history.rss_curve(), vec![4.0, 2.0, 3.0]);
        assert_eq!(history.sed_curve(0), vec![4.0, 2.0, 3.0]);
        assert_eq!(history.stalls(), vec![2]);

        let primal = history.primal_curve(0);
        assert_eq!(primal[1], (2.0, 1.0));
        let dual = history.dual_curve(0);
        assert_eq!(dual[0], (2.0, 1.0));
    }

    #[test]
    fn test_within_tolerance() {
        let ok = ConstraintResidual {
            constraint: Constraint::Symmetric,
            primal2: 0.5,
            e_pri2: 1.0,
            dual2: 0.1,
            e_dual2: 0.2,
        };
        assert!(ok.within_tolerance());

        let bad = ConstraintResidual {
            dual2: 0.3,
            ..ok
        };
        assert!(!bad.within_tolerance());
    }

    #[test]
    fn test_converged_flag() {
        let mut history = ConvergenceRecord::new();
        assert!(!history.converged());
        history.mark_converged();
        assert!(history.converged());
    }
}
