//! Site selection for PCA: frequency/missingness filtering and stride thinning.

use log::{debug, info};
use ndarray::{Array2, Axis};

use crate::error::{Result, ScanError};
use crate::genotype::{mask_to_indices, AlleleCounts, GenotypeMatrix};

/// Thresholds controlling which variant rows enter a PCA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteSelector {
    pub min_minor_ac: i32,
    pub max_an_missing: i32,
    pub n_snps: usize,
    pub snp_offset: usize,
}

/// Rows kept after selection, with their alternate-allele counts (variants x samples).
#[derive(Clone, Debug)]
pub struct SelectedSites {
    pub indices: Vec<usize>,
    pub n_alt: Array2<u8>,
}

impl SiteSelector {
    pub fn new(min_minor_ac: i32, max_an_missing: i32, n_snps: usize, snp_offset: usize) -> Result<Self> {
        if n_snps == 0 {
            return Err(ScanError::invalid("n_snps must be > 0"));
        }
        if min_minor_ac < 0 || max_an_missing < 0 {
            return Err(ScanError::invalid(format!(
                "allele-count thresholds must be non-negative (min_minor_ac={}, max_an_missing={})",
                min_minor_ac, max_an_missing
            )));
        }
        Ok(Self {
            min_minor_ac,
            max_an_missing,
            n_snps,
            snp_offset,
        })
    }

    /// Biallelic rows whose reference count lies in `[min_minor_ac, n_chroms - min_minor_ac]`
    /// and whose missing-copy count is at most `max_an_missing`.
    pub fn candidate_rows(&self, ac: &AlleleCounts, n_chroms: i32) -> Vec<usize> {
        let min_ref_ac = self.min_minor_ac;
        let max_ref_ac = n_chroms - self.min_minor_ac;

        let mask: Vec<bool> = (0..ac.n_variants())
            .map(|v| {
                let ref_ac = ac.ref_count(v);
                let an_missing = n_chroms - ac.called(v);
                ac.allelism(v) == 2
                    && ref_ac >= min_ref_ac
                    && ref_ac <= max_ref_ac
                    && an_missing <= self.max_an_missing
            })
            .collect();
        mask_to_indices(&mask)
    }

    /// Takes every `len / n_snps`-th index starting at `snp_offset`.
    ///
    /// With fewer candidates than `n_snps` the stride is 1 and every candidate from the
    /// offset onwards is kept. An offset at or beyond the stride only moves which residue
    /// class is sampled.
    pub fn thin(&self, candidates: &[usize]) -> Vec<usize> {
        let step = (candidates.len() / self.n_snps).max(1);
        candidates
            .iter()
            .skip(self.snp_offset)
            .step_by(step)
            .copied()
            .collect()
    }

    /// Full selection: candidate filter, thinning, alt-count transform and removal of rows
    /// where every sample carries the same alt count.
    pub fn select(&self, genotypes: &GenotypeMatrix, ac: &AlleleCounts) -> Result<SelectedSites> {
        if ac.n_variants() != genotypes.n_variants() {
            return Err(ScanError::shape(format!(
                "allele counts have {} rows, genotype matrix has {} variants",
                ac.n_variants(),
                genotypes.n_variants()
            )));
        }
        let n_chroms = (genotypes.n_samples() * genotypes.ploidy()) as i32;

        let candidates = self.candidate_rows(ac, n_chroms);
        info!(
            "Site selection: {} / {} variants pass biallelic/frequency/missingness filters.",
            candidates.len(),
            ac.n_variants()
        );

        let thinned = self.thin(&candidates);
        debug!(
            "Thinned to {} variants (target {}, offset {}).",
            thinned.len(),
            self.n_snps,
            self.snp_offset
        );

        let n_alt = genotypes.take_variants(&thinned)?.to_n_alt();
        let variable: Vec<bool> = n_alt
            .axis_iter(Axis(0))
            .map(|row| match row.get(0) {
                Some(&first) => row.iter().any(|&x| x != first),
                None => false,
            })
            .collect();

        let dropped = variable.iter().filter(|&&keep| !keep).count();
        if dropped > 0 {
            debug!("Dropped {} invariant variants after thinning.", dropped);
        }

        let keep = mask_to_indices(&variable);
        let indices = keep.iter().map(|&i| thinned[i]).collect();
        let n_alt = n_alt.select(Axis(0), &keep);

        Ok(SelectedSites { indices, n_alt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn counts(rows: &[[i32; 4]]) -> AlleleCounts {
        let flat: Vec<i32> = rows.iter().flatten().copied().collect();
        AlleleCounts::new(Array2::from_shape_vec((rows.len(), 4), flat).unwrap())
    }

    #[test]
    fn test_zero_target_is_rejected() {
        assert!(matches!(
            SiteSelector::new(1, 0, 0, 0),
            Err(ScanError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_candidates_satisfy_predicate() {
        // n_chroms = 10
        let ac = counts(&[
            [5, 5, 0, 0], // ok
            [10, 0, 0, 0], // monomorphic
            [9, 1, 0, 0], // ref above max (10 - 2)
            [4, 4, 0, 0], // 2 missing copies
            [3, 3, 4, 0], // triallelic
            [2, 0, 8, 0], // ok, biallelic without allele 1
            [1, 9, 0, 0], // ref below min
        ]);
        let sel = SiteSelector::new(2, 0, 100, 0).unwrap();
        let rows = sel.candidate_rows(&ac, 10);
        assert_eq!(rows, vec![0, 5]);

        let lenient = SiteSelector::new(2, 2, 100, 0).unwrap();
        assert_eq!(lenient.candidate_rows(&ac, 10), vec![0, 3, 5]);
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_thinning_count() {
        for m in 1..60usize {
            for n_snps in 1..=m {
                let step = m / n_snps;
                for offset in 0..(step + 2) {
                    let sel = SiteSelector::new(0, 0, n_snps, offset).unwrap();
                    let candidates: Vec<usize> = (0..m).map(|i| i * 3).collect();
                    let thinned = sel.thin(&candidates);
                    let expected = if offset >= m { 0 } else { (m - offset + step - 1) / step };
                    assert_eq!(thinned.len(), expected, "m={} n_snps={} offset={}", m, n_snps, offset);
                    assert!(thinned.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }

    #[test]
    fn test_thinning_below_target_keeps_everything() {
        let sel = SiteSelector::new(0, 0, 10, 0).unwrap();
        assert_eq!(sel.thin(&[1, 4, 7]), vec![1, 4, 7]);
    }

    #[test]
    fn test_offset_selects_residue_class() {
        let sel = SiteSelector::new(0, 0, 3, 1).unwrap();
        let candidates: Vec<usize> = (0..9).collect();
        assert_eq!(sel.thin(&candidates), vec![1, 4, 7]);
    }

    #[test]
    fn test_select_drops_invariant_rows() {
        // Row 1 is biallelic but every sample is heterozygous, so alt counts are constant.
        let gt = GenotypeMatrix::from_rows(&[
            vec![vec![0, 0], vec![0, 1], vec![1, 1]],
            vec![vec![0, 1], vec![0, 1], vec![0, 1]],
            vec![vec![0, 0], vec![0, 0], vec![0, 1]],
        ])
        .unwrap();
        let ac = gt.count_alleles(3);
        let sel = SiteSelector::new(1, 0, 10, 0).unwrap();
        let selected = sel.select(&gt, &ac).unwrap();
        assert_eq!(selected.indices, vec![0, 2]);
        assert_eq!(selected.n_alt.nrows(), 2);
        assert_eq!(selected.n_alt.row(1).to_vec(), vec![0, 0, 1]);
    }
}
