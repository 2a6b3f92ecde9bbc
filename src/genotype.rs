//! In-memory genotype calls, allele counts and sorted positions.
//!
//! A [`CallSet`] is what an array-store reader hands back after materialization: a
//! variant-major genotype matrix of allele indices and the sorted coordinates of its rows.
//! Everything downstream borrows these read-only.

use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayView1, Axis};
use rayon::prelude::*;

use crate::error::{Result, ScanError};

/// Allele index used for a missing call.
pub const MISSING: i8 = -1;

/// Genotype calls shaped `(variants, samples, ploidy)`; negative allele indices are missing.
#[derive(Clone, Debug, PartialEq)]
pub struct GenotypeMatrix {
    calls: Array3<i8>,
}

impl GenotypeMatrix {
    pub fn new(calls: Array3<i8>) -> Self {
        Self { calls }
    }

    /// Builds a matrix from per-variant rows of per-sample calls.
    pub fn from_rows(rows: &[Vec<Vec<i8>>]) -> Result<Self> {
        let n_variants = rows.len();
        let n_samples = rows.first().map_or(0, |r| r.len());
        let ploidy = rows
            .first()
            .and_then(|r| r.first())
            .map_or(0, |c| c.len());

        let mut calls = Array3::<i8>::from_elem((n_variants, n_samples, ploidy), MISSING);
        for (v, row) in rows.iter().enumerate() {
            if row.len() != n_samples {
                return Err(ScanError::shape(format!(
                    "variant row {} has {} samples, expected {}",
                    v,
                    row.len(),
                    n_samples
                )));
            }
            for (sample, call) in row.iter().enumerate() {
                if call.len() != ploidy {
                    return Err(ScanError::shape(format!(
                        "call at variant {} sample {} has ploidy {}, expected {}",
                        v,
                        sample,
                        call.len(),
                        ploidy
                    )));
                }
                for (k, &allele) in call.iter().enumerate() {
                    calls[[v, sample, k]] = allele;
                }
            }
        }
        Ok(Self { calls })
    }

    pub fn n_variants(&self) -> usize {
        self.calls.len_of(Axis(0))
    }

    pub fn n_samples(&self) -> usize {
        self.calls.len_of(Axis(1))
    }

    pub fn ploidy(&self) -> usize {
        self.calls.len_of(Axis(2))
    }

    pub fn call(&self, variant: usize, sample: usize) -> ArrayView1<'_, i8> {
        self.calls.slice(s![variant, sample, ..])
    }

    /// True when every allele copy of the call is present.
    pub fn is_called(&self, variant: usize, sample: usize) -> bool {
        self.call(variant, sample).iter().all(|&a| a >= 0)
    }

    /// True when the call is fully present and all copies carry the same allele.
    pub fn is_hom(&self, variant: usize, sample: usize) -> bool {
        let call = self.call(variant, sample);
        match call.get(0) {
            Some(&first) if first >= 0 => call.iter().all(|&a| a == first),
            _ => false,
        }
    }

    /// Counts allele copies per variant for alleles `0..=max_allele`.
    ///
    /// Missing copies and alleles above `max_allele` are not counted. Rows are counted in
    /// parallel on the global rayon pool.
    pub fn count_alleles(&self, max_allele: u8) -> AlleleCounts {
        let n_alleles = max_allele as usize + 1;
        let n_variants = self.n_variants();

        let flat: Vec<i32> = (0..n_variants)
            .into_par_iter()
            .flat_map_iter(|v| {
                let mut row = vec![0i32; n_alleles];
                for &allele in self.calls.index_axis(Axis(0), v).iter() {
                    if allele >= 0 && (allele as usize) < n_alleles {
                        row[allele as usize] += 1;
                    }
                }
                row
            })
            .collect();

        let counts = Array2::from_shape_fn((n_variants, n_alleles), |(v, a)| flat[v * n_alleles + a]);
        AlleleCounts::new(counts)
    }

    /// Number of non-reference allele copies per call; missing copies count as zero.
    pub fn to_n_alt(&self) -> Array2<u8> {
        self.calls
            .map_axis(Axis(2), |call| call.iter().filter(|&&a| a > 0).count() as u8)
    }

    pub fn take_samples(&self, indices: &[usize]) -> Result<Self> {
        check_indices(indices, self.n_samples(), "sample")?;
        Ok(Self::new(self.calls.select(Axis(1), indices)))
    }

    pub fn take_variants(&self, indices: &[usize]) -> Result<Self> {
        check_indices(indices, self.n_variants(), "variant")?;
        Ok(Self::new(self.calls.select(Axis(0), indices)))
    }

    pub fn compress_variants(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_variants() {
            return Err(ScanError::shape(format!(
                "variant mask has length {}, genotype matrix has {} variants",
                mask.len(),
                self.n_variants()
            )));
        }
        self.take_variants(&mask_to_indices(mask))
    }

    pub fn compress_samples(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_samples() {
            return Err(ScanError::shape(format!(
                "sample mask has length {}, genotype matrix has {} samples",
                mask.len(),
                self.n_samples()
            )));
        }
        self.take_samples(&mask_to_indices(mask))
    }

    pub fn slice_variants(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.n_variants() {
            return Err(ScanError::invalid(format!(
                "variant range {:?} outside 0..{}",
                range,
                self.n_variants()
            )));
        }
        Ok(Self::new(self.calls.slice(s![range, .., ..]).to_owned()))
    }
}

/// Per-variant allele counts, shaped `(variants, max_allele + 1)`.
#[derive(Clone, Debug, PartialEq)]
pub struct AlleleCounts {
    counts: Array2<i32>,
}

impl AlleleCounts {
    pub fn new(counts: Array2<i32>) -> Self {
        Self { counts }
    }

    pub fn n_variants(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_alleles(&self) -> usize {
        self.counts.ncols()
    }

    pub fn row(&self, variant: usize) -> ArrayView1<'_, i32> {
        self.counts.row(variant)
    }

    /// Number of distinct alleles observed at the variant.
    pub fn allelism(&self, variant: usize) -> usize {
        self.counts.row(variant).iter().filter(|&&c| c > 0).count()
    }

    /// Number of called allele copies at the variant.
    pub fn called(&self, variant: usize) -> i32 {
        self.counts.row(variant).sum()
    }

    pub fn ref_count(&self, variant: usize) -> i32 {
        self.counts[[variant, 0]]
    }

    pub fn is_biallelic(&self) -> Vec<bool> {
        (0..self.n_variants()).map(|v| self.allelism(v) == 2).collect()
    }

    pub fn is_segregating(&self) -> Vec<bool> {
        (0..self.n_variants()).map(|v| self.allelism(v) > 1).collect()
    }

    pub fn compress_variants(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_variants() {
            return Err(ScanError::shape(format!(
                "variant mask has length {}, allele counts have {} rows",
                mask.len(),
                self.n_variants()
            )));
        }
        Ok(Self::new(self.counts.select(Axis(0), &mask_to_indices(mask))))
    }
}

/// Sorted genomic coordinates of the rows of a genotype matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionSequence {
    positions: Vec<i64>,
}

impl PositionSequence {
    /// Wraps positions, rejecting any decrease.
    pub fn new(positions: Vec<i64>) -> Result<Self> {
        if let Some(i) = positions.windows(2).position(|w| w[1] < w[0]) {
            return Err(ScanError::invalid(format!(
                "positions are not sorted: {} follows {} at row {}",
                positions[i + 1],
                positions[i],
                i + 1
            )));
        }
        Ok(Self { positions })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.positions
    }

    /// First index whose position is `>= value`.
    pub fn lower_bound(&self, value: i64) -> usize {
        self.positions.partition_point(|&p| p < value)
    }

    /// First index whose position is `> value`.
    pub fn upper_bound(&self, value: i64) -> usize {
        self.positions.partition_point(|&p| p <= value)
    }

    /// Row index of the first occurrence of `value`.
    pub fn locate(&self, value: i64) -> Option<usize> {
        let idx = self.lower_bound(value);
        (self.positions.get(idx) == Some(&value)).then_some(idx)
    }

    /// Rows falling in `[start, stop]`; an open bound extends to the sequence edge.
    pub fn locate_range(&self, start: Option<i64>, stop: Option<i64>) -> Range<usize> {
        let lo = start.map_or(0, |s| self.lower_bound(s));
        let hi = stop.map_or(self.len(), |s| self.upper_bound(s));
        lo..hi.max(lo)
    }

    pub fn compress(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(ScanError::shape(format!(
                "variant mask has length {}, positions have length {}",
                mask.len(),
                self.len()
            )));
        }
        let positions = self
            .positions
            .iter()
            .zip(mask)
            .filter_map(|(&p, &keep)| keep.then_some(p))
            .collect();
        Ok(Self { positions })
    }
}

/// A materialized contig: genotypes with their aligned positions.
#[derive(Clone, Debug)]
pub struct CallSet {
    pub contig: String,
    pub genotypes: GenotypeMatrix,
    pub positions: PositionSequence,
}

impl CallSet {
    pub fn new(
        contig: impl Into<String>,
        genotypes: GenotypeMatrix,
        positions: PositionSequence,
    ) -> Result<Self> {
        if genotypes.n_variants() != positions.len() {
            return Err(ScanError::shape(format!(
                "genotype matrix has {} variants but {} positions",
                genotypes.n_variants(),
                positions.len()
            )));
        }
        Ok(Self {
            contig: contig.into(),
            genotypes,
            positions,
        })
    }

    pub fn compress_variants(&self, mask: &[bool]) -> Result<Self> {
        Ok(Self {
            contig: self.contig.clone(),
            genotypes: self.genotypes.compress_variants(mask)?,
            positions: self.positions.compress(mask)?,
        })
    }

    /// Keeps only segregating sites (more than one allele observed).
    pub fn segregating(&self, max_allele: u8) -> Result<Self> {
        let seg = self.genotypes.count_alleles(max_allele).is_segregating();
        self.compress_variants(&seg)
    }
}

pub(crate) fn mask_to_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &keep)| keep.then_some(i))
        .collect()
}

fn check_indices(indices: &[usize], len: usize, what: &str) -> Result<()> {
    match indices.iter().find(|&&i| i >= len) {
        Some(&bad) => Err(ScanError::invalid(format!(
            "{} index {} out of bounds ({} available)",
            what, bad, len
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Three variants, three diploid samples.
    pub(crate) fn small_matrix() -> GenotypeMatrix {
        GenotypeMatrix::from_rows(&[
            vec![vec![0, 0], vec![0, 1], vec![1, 1]],
            vec![vec![0, 0], vec![0, 0], vec![0, 0]],
            vec![vec![2, 2], vec![-1, -1], vec![0, 2]],
        ])
        .unwrap()
    }

    #[test]
    fn test_count_alleles_skips_missing() {
        let ac = small_matrix().count_alleles(3);
        assert_eq!(ac.n_alleles(), 4);
        assert_eq!(ac.row(0).to_vec(), vec![3, 3, 0, 0]);
        assert_eq!(ac.row(1).to_vec(), vec![6, 0, 0, 0]);
        assert_eq!(ac.row(2).to_vec(), vec![1, 0, 3, 0]);
        assert_eq!(ac.called(2), 4);
    }

    #[test]
    fn test_allele_count_predicates() {
        let ac = small_matrix().count_alleles(3);
        assert_eq!(ac.is_biallelic(), vec![true, false, true]);
        assert_eq!(ac.is_segregating(), vec![true, false, true]);
    }

    #[test]
    fn test_hom_and_called() {
        let gt = small_matrix();
        assert!(gt.is_hom(0, 0));
        assert!(!gt.is_hom(0, 1));
        assert!(!gt.is_hom(2, 1));
        assert!(!gt.is_called(2, 1));
        assert!(gt.is_called(2, 2));
    }

    #[test]
    fn test_to_n_alt() {
        let n_alt = small_matrix().to_n_alt();
        assert_eq!(n_alt.row(0).to_vec(), vec![0, 1, 2]);
        assert_eq!(n_alt.row(2).to_vec(), vec![2, 0, 1]);
    }

    #[test]
    fn test_take_and_compress() {
        let gt = small_matrix();
        let sub = gt.take_samples(&[2, 0]).unwrap();
        assert_eq!(sub.n_samples(), 2);
        assert_eq!(sub.call(0, 0).to_vec(), vec![1, 1]);

        let rows = gt.compress_variants(&[true, false, true]).unwrap();
        assert_eq!(rows.n_variants(), 2);
        assert!(gt.compress_variants(&[true]).is_err());
        assert!(gt.take_samples(&[3]).is_err());
    }

    #[test]
    fn test_positions_must_be_sorted() {
        assert!(PositionSequence::new(vec![1, 5, 5, 9]).is_ok());
        assert!(matches!(
            PositionSequence::new(vec![1, 5, 4]),
            Err(ScanError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_position_bounds() {
        let pos = PositionSequence::new(vec![100, 200, 300, 400, 500]).unwrap();
        assert_eq!(pos.lower_bound(200), 1);
        assert_eq!(pos.upper_bound(200), 2);
        assert_eq!(pos.locate(300), Some(2));
        assert_eq!(pos.locate(301), None);
        assert_eq!(pos.locate_range(Some(150), Some(400)), 1..4);
        assert_eq!(pos.locate_range(None, Some(250)), 0..2);
        assert_eq!(pos.locate_range(Some(450), None), 4..5);
        assert_eq!(pos.locate_range(Some(600), Some(700)), 5..5);
    }

    #[test]
    fn test_callset_requires_alignment() {
        let pos = PositionSequence::new(vec![1, 2]).unwrap();
        assert!(matches!(
            CallSet::new("2L", small_matrix(), pos),
            Err(ScanError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_segregating_filter() {
        let pos = PositionSequence::new(vec![10, 20, 30]).unwrap();
        let cs = CallSet::new("2L", small_matrix(), pos).unwrap();
        let seg = cs.segregating(3).unwrap();
        assert_eq!(seg.positions.as_slice(), &[10, 30]);
        assert_eq!(seg.genotypes.n_variants(), 2);
    }
}
