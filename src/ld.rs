//! Linkage-disequilibrium pruning of alternate-allele count rows.
//!
//! Rows are scanned in windows of `size` rows advancing by `step`. Inside a window every
//! retained row knocks out each later retained row whose squared Rogers-Huff correlation
//! with it exceeds `threshold`. The scan can be repeated over the survivors.

use log::info;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Result, ScanError};
use crate::genotype::mask_to_indices;

/// Squared genotype correlation of two alt-count rows.
///
/// `None` when either row has no variance, which never counts as linked.
pub fn rogers_huff_r2(a: ArrayView1<'_, u8>, b: ArrayView1<'_, u8>) -> Option<f64> {
    let n = a.len() as f64;
    let (mut x, mut y, mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (&ai, &bi) in a.iter().zip(b.iter()) {
        let (ai, bi) = (ai as f64, bi as f64);
        x += ai;
        y += bi;
        xx += ai * ai;
        yy += bi * bi;
        xy += ai * bi;
    }
    let var_a = n * xx - x * x;
    let var_b = n * yy - y * y;
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    let r = (n * xy - x * y) / (var_a * var_b).sqrt();
    Some(r * r)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LdPrune {
    pub size: usize,
    pub step: usize,
    pub threshold: f64,
    pub n_iter: usize,
}

impl Default for LdPrune {
    fn default() -> Self {
        Self {
            size: 500,
            step: 200,
            threshold: 0.2,
            n_iter: 1,
        }
    }
}

impl LdPrune {
    pub fn new(size: usize, step: usize, threshold: f64, n_iter: usize) -> Result<Self> {
        if size == 0 || step == 0 || n_iter == 0 {
            return Err(ScanError::invalid(format!(
                "LD pruning needs size, step and n_iter > 0 (size={}, step={}, n_iter={})",
                size, step, n_iter
            )));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ScanError::invalid(format!(
                "LD pruning r^2 threshold must lie in [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self {
            size,
            step,
            threshold,
            n_iter,
        })
    }

    /// One pass over `n_alt` (variants x samples); true for rows that survive.
    pub fn locate_unlinked(&self, n_alt: ArrayView2<'_, u8>) -> Vec<bool> {
        let n = n_alt.nrows();
        let mut keep = vec![true; n];
        for start in (0..n).step_by(self.step) {
            let stop = (start + self.size).min(n);
            for i in start..stop {
                if !keep[i] {
                    continue;
                }
                for j in i + 1..stop {
                    if keep[j]
                        && rogers_huff_r2(n_alt.row(i), n_alt.row(j)).is_some_and(|r2| r2 > self.threshold)
                    {
                        keep[j] = false;
                    }
                }
            }
        }
        keep
    }

    /// Runs `n_iter` passes and returns the surviving row indices of `n_alt`.
    pub fn prune(&self, n_alt: &Array2<u8>) -> Vec<usize> {
        let mut kept: Vec<usize> = (0..n_alt.nrows()).collect();
        for iteration in 0..self.n_iter {
            let current = n_alt.select(Axis(0), &kept);
            let unlinked = self.locate_unlinked(current.view());
            let next: Vec<usize> = mask_to_indices(&unlinked).into_iter().map(|i| kept[i]).collect();
            info!(
                "LD pruning iteration {}: retaining {}, removing {} variants",
                iteration + 1,
                next.len(),
                kept.len() - next.len()
            );
            kept = next;
        }
        kept
    }
}
