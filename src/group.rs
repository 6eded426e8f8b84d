// src/group.rs

//! Batch deblending of many blended groups.
//!
//! The group manager applies one shared configuration to a catalog of
//! groups, skipping the ones that do not need deblending and isolating
//! per-group failures so one pathological blend never aborts the batch.

use rayon::prelude::*;

use crate::config::DeblendConfig;
use crate::cutout::{Cutout, Peak};
use crate::error::DeblendError;
use crate::psf::PsfKernel;
use crate::result::DeblendResult;
use crate::session::BlendSession;

/// One blended group: a cutout and the peaks detected inside it.
#[derive(Debug, Clone)]
pub struct BlendGroup {
    /// Caller-assigned identifier, carried through to the outcome.
    pub id: u64,
    /// The group's multi-band cutout.
    pub cutout: Cutout,
    /// Detected peaks, in cutout-local coordinates.
    pub peaks: Vec<Peak>,
}

impl BlendGroup {
    pub fn new(id: u64, cutout: Cutout, peaks: Vec<Peak>) -> Self {
        Self { id, cutout, peaks }
    }
}

/// What happened to one group during a batch run.
#[derive(Debug)]
pub enum GroupOutcome {
    /// The group was solved.
    Deblended(DeblendResult),
    /// Fewer than two peaks: nothing to separate.
    SingleSource,
    /// The group exceeded the configured peak cap and was skipped.
    TooManyPeaks {
        /// How many peaks the group had.
        peaks: usize,
    },
    /// Session construction or the solve failed for this group only.
    Failed(DeblendError),
}

/// One group's identifier paired with its outcome.
#[derive(Debug)]
pub struct GroupResult {
    pub id: u64,
    pub outcome: GroupOutcome,
}

/// Applies one configuration across a catalog of blended groups.
pub struct GroupManager {
    config: DeblendConfig,
    psfs: Option<Vec<PsfKernel>>,
}

impl GroupManager {
    pub fn new(config: DeblendConfig) -> Self {
        Self { config, psfs: None }
    }

    /// Supply one PSF kernel per band, shared by every group.
    pub fn with_psfs(mut self, psfs: Vec<PsfKernel>) -> Self {
        self.psfs = Some(psfs);
        self
    }

    /// Deblend every group, in parallel. Output order matches input order.
    pub fn deblend_all(&self, groups: Vec<BlendGroup>) -> Vec<GroupResult> {
        groups
            .into_par_iter()
            .map(|group| self.deblend_group(group))
            .collect()
    }

    /// Deblend a single group, applying the skip rules first.
    pub fn deblend_group(&self, group: BlendGroup) -> GroupResult {
        let id = group.id;
        let n_peaks = group.peaks.len();

        if n_peaks < 2 {
            log::debug!("group {}: {} peak(s), nothing to deblend", id, n_peaks);
            return GroupResult {
                id,
                outcome: GroupOutcome::SingleSource,
            };
        }

        if let Some(cap) = self.config.max_peaks {
            if n_peaks > cap {
                log::info!("group {}: {} peaks exceed the cap of {}", id, n_peaks, cap);
                return GroupResult {
                    id,
                    outcome: GroupOutcome::TooManyPeaks { peaks: n_peaks },
                };
            }
        }

        let outcome = match self.solve(group) {
            Ok(result) => GroupOutcome::Deblended(result),
            Err(e) => {
                log::warn!("group {}: deblend failed: {}", id, e);
                GroupOutcome::Failed(e)
            }
        };
        GroupResult { id, outcome }
    }

    fn solve(&self, group: BlendGroup) -> crate::error::Result<DeblendResult> {
        let mut session = BlendSession::new(
            group.cutout,
            group.peaks,
            self.psfs.clone(),
            self.config.clone(),
        )?;
        session.deblend()?;
        session.into_result().ok_or(DeblendError::NotSolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn blend(id: u64, n_peaks: usize) -> BlendGroup {
        let size = 15;
        let centers: Vec<(f64, f64)> = (0..n_peaks)
            .map(|k| (3.0 + 3.0 * k as f64, 7.0))
            .collect();
        let data = Array3::from_shape_fn((1, size, size), |(_, y, x)| {
            let mut v = 0.0;
            for &(cx, cy) in &centers {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                v += (-(dx * dx + dy * dy) / 4.0).exp();
            }
            v
        });
        let peaks = centers.iter().map(|&(x, y)| Peak::new(x, y)).collect();
        BlendGroup::new(id, Cutout::from_data(data), peaks)
    }

    #[test]
    fn test_single_peak_groups_skipped() {
        let manager = GroupManager::new(DeblendConfig::default());
        let results = manager.deblend_all(vec![blend(7, 1), blend(8, 2)]);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 7);
        assert!(matches!(results[0].outcome, GroupOutcome::SingleSource));
        assert!(matches!(results[1].outcome, GroupOutcome::Deblended(_)));
    }

    #[test]
    fn test_peak_cap_applies() {
        let config = DeblendConfig::builder().max_peaks(2).build();
        let manager = GroupManager::new(config);
        let results = manager.deblend_all(vec![blend(1, 3), blend(2, 2)]);

        assert!(matches!(
            results[0].outcome,
            GroupOutcome::TooManyPeaks { peaks: 3 }
        ));
        assert!(matches!(results[1].outcome, GroupOutcome::Deblended(_)));
    }

    #[test]
    fn test_failed_group_does_not_abort_batch() {
        // An empty-footprint group fails validation; the other still solves.
        let mut bad = blend(3, 2);
        bad.cutout.footprint.fill(false);
        let good = blend(4, 2);

        let manager = GroupManager::new(DeblendConfig::default());
        let results = manager.deblend_all(vec![bad, good]);

        assert!(matches!(
            results[0].outcome,
            GroupOutcome::Failed(DeblendError::DegenerateWeights)
        ));
        assert!(matches!(results[1].outcome, GroupOutcome::Deblended(_)));
    }

    #[test]
    fn test_output_order_matches_input() {
        let manager = GroupManager::new(DeblendConfig::default());
        let groups: Vec<BlendGroup> = (0..6).map(|i| blend(i, 2)).collect();
        let results = manager.deblend_all(groups);
        let ids: Vec<u64> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }
}
