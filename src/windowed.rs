//! Windowed Population Branch Statistic.
//!
//! Per-variant Hudson Fst components are summed over windows of consecutive rows, pairwise
//! Fst is turned into a branch length `-ln(1 - Fst)`, and the three branch lengths of a
//! (cohort A, cohort B, outgroup) triple give PBS for cohort A.

use std::ops::Range;

use crate::error::{Result, ScanError};
use crate::genotype::{AlleleCounts, PositionSequence};

/// Upper clip applied to window Fst before the log transform.
const MAX_FST: f64 = 0.99999;

/// Window layout over rows: `size` consecutive rows, advancing by `step` rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSpec {
    pub size: usize,
    pub step: usize,
}

impl WindowSpec {
    pub fn new(size: usize, step: usize) -> Result<Self> {
        if size == 0 || step == 0 {
            return Err(ScanError::invalid(format!(
                "window size and step must be > 0 (size={}, step={})",
                size, step
            )));
        }
        Ok(Self { size, step })
    }

    /// Row ranges of every full window; a trailing partial window is dropped.
    pub fn windows(self, n_rows: usize) -> impl Iterator<Item = Range<usize>> {
        let size = self.size;
        (0..n_rows)
            .step_by(self.step)
            .map(move |start| start..start + size)
            .take_while(move |w| w.end <= n_rows)
    }

    pub fn n_windows(&self, n_rows: usize) -> usize {
        if n_rows < self.size {
            0
        } else {
            (n_rows - self.size) / self.step + 1
        }
    }
}

/// Applies `statistic` to every window of `values`.
pub fn moving_statistic<T, F>(values: &[T], window: WindowSpec, mut statistic: F) -> Vec<f64>
where
    F: FnMut(&[T]) -> f64,
{
    window
        .windows(values.len())
        .map(|w| statistic(&values[w]))
        .collect()
}

/// Mean position of each window.
pub fn window_midpoints(positions: &PositionSequence, window: WindowSpec) -> Vec<f64> {
    moving_statistic(positions.as_slice(), window, |w| {
        w.iter().map(|&p| p as f64).sum::<f64>() / w.len() as f64
    })
}

fn mean_pairwise_difference(counts: &[i32]) -> Option<f64> {
    let an: f64 = counts.iter().map(|&c| c as f64).sum();
    let n_pairs = an * (an - 1.0) / 2.0;
    if n_pairs <= 0.0 {
        return None;
    }
    let n_same: f64 = counts
        .iter()
        .map(|&c| c as f64 * (c as f64 - 1.0) / 2.0)
        .sum();
    Some((n_pairs - n_same) / n_pairs)
}

fn mean_pairwise_difference_between(c1: &[i32], c2: &[i32]) -> Option<f64> {
    let an1: f64 = c1.iter().map(|&c| c as f64).sum();
    let an2: f64 = c2.iter().map(|&c| c as f64).sum();
    let n_pairs = an1 * an2;
    if n_pairs <= 0.0 {
        return None;
    }
    let n_same: f64 = c1
        .iter()
        .zip(c2)
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum();
    Some((n_pairs - n_same) / n_pairs)
}

/// Hudson Fst numerator and denominator for one variant.
///
/// The numerator is undefined when either cohort has fewer than two called copies; the
/// denominator only needs one called copy in each cohort. Each part is summed on its own
/// over a window, so a variant can add to the denominator without adding to the numerator.
pub fn hudson_fst_components(c1: &[i32], c2: &[i32]) -> (Option<f64>, Option<f64>) {
    let between = mean_pairwise_difference_between(c1, c2);
    let within = mean_pairwise_difference(c1)
        .zip(mean_pairwise_difference(c2))
        .map(|(w1, w2)| (w1 + w2) / 2.0);
    let num = between.zip(within).map(|(b, w)| b - w);
    (num, between)
}

/// Windowed Hudson Fst as ratio of summed components.
///
/// Undefined components are left out of their own sum only. A window whose summed
/// denominator is zero (no between-cohort differences at all) is reported as 0.
pub fn moving_hudson_fst(ac1: &AlleleCounts, ac2: &AlleleCounts, window: WindowSpec) -> Result<Vec<f64>> {
    check_rows(&[("cohort 1", ac1.n_variants()), ("cohort 2", ac2.n_variants())])?;
    if ac1.n_alleles() != ac2.n_alleles() {
        return Err(ScanError::shape(format!(
            "allele count widths differ ({} vs {})",
            ac1.n_alleles(),
            ac2.n_alleles()
        )));
    }

    let components: Vec<(Option<f64>, Option<f64>)> = (0..ac1.n_variants())
        .map(|v| {
            let r1 = ac1.row(v);
            let r2 = ac2.row(v);
            hudson_fst_components(&r1.to_vec(), &r2.to_vec())
        })
        .collect();

    Ok(moving_statistic(&components, window, |w| {
        let num: f64 = w.iter().filter_map(|&(n, _)| n).sum();
        let den: f64 = w.iter().filter_map(|&(_, d)| d).sum();
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }))
}

fn branch_length(fst: f64) -> f64 {
    -(1.0 - fst.clamp(0.0, MAX_FST)).ln()
}

/// Normalized PBS from the three pairwise window Fst values.
///
/// The normalizer `1 + (t12 + t13 + t23) / 2` is at least 1 once Fst is clipped to
/// `[0, MAX_FST]`, so the division is always defined.
pub fn pbs_from_fst(fst12: f64, fst13: f64, fst23: f64, normed: bool) -> f64 {
    let t12 = branch_length(fst12);
    let t13 = branch_length(fst13);
    let t23 = branch_length(fst23);

    let pbs = (t12 + t13 - t23) / 2.0;
    if normed {
        pbs / (1.0 + (t12 + t13 + t23) / 2.0)
    } else {
        pbs
    }
}

/// Windowed PBS values paired with window midpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowedStatistic {
    pub values: Vec<f64>,
    pub midpoints: Vec<f64>,
}

impl WindowedStatistic {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Normalized PBS of cohort A against cohort B, with `outgroup` as the third branch.
///
/// Every allele-count matrix must have as many rows as `positions`; this is checked before
/// any window is computed.
pub fn windowed_pbs(
    cohort_a: &AlleleCounts,
    cohort_b: &AlleleCounts,
    outgroup: &AlleleCounts,
    positions: &PositionSequence,
    window: WindowSpec,
) -> Result<WindowedStatistic> {
    check_rows(&[
        ("positions", positions.len()),
        ("cohort A", cohort_a.n_variants()),
        ("cohort B", cohort_b.n_variants()),
        ("outgroup", outgroup.n_variants()),
    ])?;

    let fst12 = moving_hudson_fst(cohort_a, cohort_b, window)?;
    let fst13 = moving_hudson_fst(cohort_a, outgroup, window)?;
    let fst23 = moving_hudson_fst(cohort_b, outgroup, window)?;

    let values = fst12
        .iter()
        .zip(&fst13)
        .zip(&fst23)
        .map(|((&a, &b), &c)| pbs_from_fst(a, b, c, true))
        .collect();
    let midpoints = window_midpoints(positions, window);

    Ok(WindowedStatistic { values, midpoints })
}

fn check_rows(inputs: &[(&str, usize)]) -> Result<()> {
    if let Some(&(first_name, first_len)) = inputs.first() {
        for &(name, len) in &inputs[1..] {
            if len != first_len {
                return Err(ScanError::shape(format!(
                    "{} has {} rows but {} has {}",
                    name, len, first_name, first_len
                )));
            }
        }
    }
    Ok(())
}
