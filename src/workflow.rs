//! Per-contig scan workflows: PBS over cohort comparisons and haplotype lengths around
//! rare variants.

use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use log::{info, warn};

use crate::breakpoints::{scan_contig, BreakpointWriter, RareVariant};
use crate::cohorts::CohortComparison;
use crate::error::{Result, ScanError};
use crate::genotype::{AlleleCounts, CallSet};
use crate::sink::{PlotSink, WindowedPlot};
use crate::windowed::{windowed_pbs, WindowSpec};

pub const PBS_STATISTIC: &str = "PBS";
pub const PBS_Y_RANGE: (f64, f64) = (-0.3, 0.3);
const MAX_ALLELE: u8 = 3;

/// Biallelic sites where the reference allele is observed.
pub fn pbs_site_mask(ac: &AlleleCounts) -> Vec<bool> {
    ac.is_biallelic()
        .into_iter()
        .enumerate()
        .map(|(v, biallelic)| biallelic && ac.ref_count(v) > 0)
        .collect()
}

/// Outgroup genotypes on the focal call set's sites, with an optional species per sample.
pub struct Outgroup<'a> {
    pub callset: &'a CallSet,
    pub species: Option<&'a [String]>,
}

impl Outgroup<'_> {
    /// Sample columns to use against a comparison of `species`.
    fn samples_for(&self, species: Option<&str>) -> Result<Vec<usize>> {
        let n = self.callset.genotypes.n_samples();
        match (self.species, species) {
            (Some(labels), Some(wanted)) => {
                let idx: Vec<usize> = (0..n).filter(|&i| labels[i] == wanted).collect();
                if idx.is_empty() {
                    return Err(ScanError::EmptySelection(format!(
                        "no outgroup samples of species {}",
                        wanted
                    )));
                }
                Ok(idx)
            }
            _ => Ok((0..n).collect()),
        }
    }
}

/// Runs windowed PBS for every comparison and hands each result to `sink`.
///
/// Returns the number of comparisons exported.
pub fn run_pbs_scan(
    focal: &CallSet,
    outgroup: &Outgroup<'_>,
    comparisons: &[CohortComparison],
    window: WindowSpec,
    sink: &mut dyn PlotSink,
    progress: &ProgressBar,
) -> Result<usize> {
    if outgroup.callset.positions != focal.positions {
        return Err(ScanError::shape(format!(
            "outgroup has {} sites, focal call set has {} (positions must be identical)",
            outgroup.callset.positions.len(),
            focal.positions.len()
        )));
    }
    if let Some(labels) = outgroup.species {
        if labels.len() != outgroup.callset.genotypes.n_samples() {
            return Err(ScanError::shape(format!(
                "{} outgroup species labels for {} outgroup samples",
                labels.len(),
                outgroup.callset.genotypes.n_samples()
            )));
        }
    }

    let mask = pbs_site_mask(&focal.genotypes.count_alleles(MAX_ALLELE));
    let focal_seg = focal.compress_variants(&mask)?;
    let outgroup_seg = outgroup.callset.genotypes.compress_variants(&mask)?;
    info!(
        "{} / {} sites are biallelic with the reference observed on {}",
        focal_seg.positions.len(),
        mask.len(),
        focal.contig
    );

    let mut exported = 0;
    for comparison in comparisons {
        progress.set_message(comparison.label.clone());
        info!(
            "--------- Running {} on {} | Chromosome {} ----------",
            PBS_STATISTIC, comparison.label, focal.contig
        );
        let [pheno1, pheno2] = &comparison.cohorts;
        let ac1 = focal_seg.genotypes.take_samples(&pheno1.indices)?.count_alleles(MAX_ALLELE);
        let ac2 = focal_seg.genotypes.take_samples(&pheno2.indices)?.count_alleles(MAX_ALLELE);
        let out_idx = outgroup.samples_for(comparison.species.as_deref())?;
        let ac_out = outgroup_seg.take_samples(&out_idx)?.count_alleles(MAX_ALLELE);

        let stat = windowed_pbs(&ac1, &ac2, &ac_out, &focal_seg.positions, window)?;
        if stat.is_empty() {
            warn!(
                "{}: fewer sites than one window ({}), nothing to export",
                comparison.label, window.size
            );
        }
        sink.windowed(&WindowedPlot {
            statistic: PBS_STATISTIC,
            cohort_label: &comparison.label,
            cohort_label_no_space: &comparison.label_no_space,
            values: &stat.values,
            midpoints: &stat.midpoints,
            contig: &focal.contig,
            colour: comparison.colour,
            y_range: PBS_Y_RANGE,
        })?;
        exported += 1;
        progress.inc(1);
    }
    Ok(exported)
}

pub fn haplen_output_path(dir: &Path, contig: &str) -> PathBuf {
    dir.join(format!("f2HapLengths_{}.tsv", contig))
}

/// Restricts to segregating sites, truncates `out`, then scans each rare variant of the
/// contig in input order, appending one line per variant.
pub fn run_haplen_scan(
    callset: &CallSet,
    variants: &[RareVariant],
    out: &Path,
    progress: &ProgressBar,
) -> Result<usize> {
    let seg = callset.segregating(MAX_ALLELE)?;
    info!(
        "{} / {} sites segregating on {}",
        seg.positions.len(),
        callset.positions.len(),
        callset.contig
    );
    let mut writer = BreakpointWriter::create(out)?;
    let written = scan_contig(&seg, variants, &mut writer, |_| progress.inc(1))?;
    info!("Wrote {} haplotype lengths to {}", written, out.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohorts::Cohort;
    use crate::genotype::{GenotypeMatrix, PositionSequence};
    use crate::sink::MemorySink;

    fn callset(rows: &[[[i8; 2]; 4]], positions: Vec<i64>) -> CallSet {
        let rows: Vec<Vec<Vec<i8>>> = rows
            .iter()
            .map(|r| r.iter().map(|c| c.to_vec()).collect())
            .collect();
        CallSet::new(
            "2L",
            GenotypeMatrix::from_rows(&rows).unwrap(),
            PositionSequence::new(positions).unwrap(),
        )
        .unwrap()
    }

    fn focal() -> CallSet {
        callset(
            &[
                [[0, 0], [0, 0], [1, 1], [1, 1]],
                [[0, 0], [0, 1], [1, 1], [1, 1]],
                [[1, 1], [1, 1], [1, 1], [1, 1]],
                [[0, 0], [0, 0], [0, 1], [1, 1]],
                [[0, 1], [0, 0], [1, 1], [1, 1]],
                [[0, 0], [0, 0], [1, 1], [0, 1]],
                [[0, 0], [0, 1], [0, 1], [1, 1]],
            ],
            (1..=7).map(|i| i * 100).collect(),
        )
    }

    fn outgroup(positions: Vec<i64>) -> CallSet {
        let rows = vec![[[0, 0], [0, 1], [0, 0], [1, 1]]; positions.len()];
        callset(&rows, positions)
    }

    fn comparison(species: Option<&str>) -> CohortComparison {
        CohortComparison {
            key: vec!["Obuasi".into()],
            label: "Obuasi".into(),
            label_no_space: "Obuasi".into(),
            species: species.map(String::from),
            colour: "#e41a1c",
            cohorts: [
                Cohort {
                    name: "Obuasi_alive".into(),
                    phenotype: "alive".into(),
                    indices: vec![0, 1],
                },
                Cohort {
                    name: "Obuasi_dead".into(),
                    phenotype: "dead".into(),
                    indices: vec![2, 3],
                },
            ],
        }
    }

    #[test]
    fn test_pbs_site_mask() {
        let ac = focal().genotypes.count_alleles(3);
        let mask = pbs_site_mask(&ac);
        assert_eq!(mask, vec![true, true, false, true, true, true, true]);
    }

    #[test]
    fn test_pbs_scan_exports_each_comparison() {
        let focal = focal();
        let out_cs = outgroup(focal.positions.as_slice().to_vec());
        let species: Vec<String> = ["gambiae", "gambiae", "coluzzii", "coluzzii"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = Outgroup {
            callset: &out_cs,
            species: Some(&species),
        };
        let mut sink = MemorySink::default();
        let n = run_pbs_scan(
            &focal,
            &out,
            &[comparison(Some("gambiae")), comparison(None)],
            WindowSpec::new(2, 2).unwrap(),
            &mut sink,
            &ProgressBar::hidden(),
        )
        .unwrap();

        assert_eq!(n, 2);
        let plot = &sink.windowed[0];
        assert_eq!(plot.statistic, "PBS");
        assert_eq!(plot.y_range, (-0.3, 0.3));
        assert_eq!(plot.midpoints, vec![150.0, 450.0, 650.0]);
        assert_eq!(plot.values.len(), 3);
        assert!(plot.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_pbs_scan_checks_shapes_first() {
        let focal = focal();
        let out_cs = outgroup((1..=6).map(|i| i * 100).collect());
        let mut sink = MemorySink::default();
        let err = run_pbs_scan(
            &focal,
            &Outgroup {
                callset: &out_cs,
                species: None,
            },
            &[comparison(None)],
            WindowSpec::new(2, 2).unwrap(),
            &mut sink,
            &ProgressBar::hidden(),
        );
        assert!(matches!(err, Err(ScanError::ShapeMismatch(_))));
        assert!(sink.windowed.is_empty());
    }

    #[test]
    fn test_pbs_scan_unknown_outgroup_species() {
        let focal = focal();
        let out_cs = outgroup(focal.positions.as_slice().to_vec());
        let species = vec!["gambiae".to_string(); 4];
        let mut sink = MemorySink::default();
        let err = run_pbs_scan(
            &focal,
            &Outgroup {
                callset: &out_cs,
                species: Some(&species),
            },
            &[comparison(Some("arabiensis"))],
            WindowSpec::new(2, 2).unwrap(),
            &mut sink,
            &ProgressBar::hidden(),
        );
        assert!(matches!(err, Err(ScanError::EmptySelection(_))));
    }

    #[test]
    fn test_haplen_scan_uses_segregating_sites() {
        // Row at 300 is monomorphic and disappears before scanning.
        let cs = callset(
            &[
                [[0, 0], [1, 1], [0, 1], [0, 1]],
                [[0, 1], [0, 1], [0, 0], [0, 0]],
                [[0, 0], [0, 0], [0, 0], [0, 0]],
                [[0, 1], [0, 1], [1, 1], [0, 0]],
                [[1, 1], [0, 0], [0, 0], [0, 0]],
            ],
            vec![100, 200, 300, 400, 500],
        );
        let variants = vec![
            RareVariant {
                contig: "2L".into(),
                pos: 200,
                idx1: 0,
                idx2: 1,
            },
            RareVariant {
                contig: "3R".into(),
                pos: 200,
                idx1: 0,
                idx2: 1,
            },
        ];
        let dir = tempfile::tempdir().unwrap();
        let out = haplen_output_path(dir.path(), "2L");
        std::fs::write(&out, "stale\n").unwrap();

        let n = run_haplen_scan(&cs, &variants, &out, &ProgressBar::hidden()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "2L\t200\t400\t100\t500\n");
    }
}
