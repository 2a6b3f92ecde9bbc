//! Inversion karyotyping from genotypes at tag SNPs.
//!
//! Each inversion has a list of tag-SNP positions whose alternate allele travels with the
//! inverted arrangement. A sample's mean alternate-allele count over the called tag sites
//! estimates how many inverted copies it carries (0, 1 or 2 for a diploid).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{Result, ScanError};
use crate::genotype::CallSet;

/// Per-sample summary over the tag sites of one inversion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KaryotypeScore {
    /// Mean alternate-allele count over called tag sites; `None` when none is called.
    pub mean_alt: Option<f64>,
    /// Tag sites with a complete call.
    pub total_sites: usize,
    /// Called tag sites carrying 0, 1 and 2 alternate copies.
    pub n_alt: [usize; 3],
}

#[derive(Serialize)]
struct ScoreRow<'a> {
    sample_id: &'a str,
    inversion: &'a str,
    mean_genotype: Option<f64>,
    total_sites: usize,
    n_0: usize,
    n_1: usize,
    n_2: usize,
}

/// Reads tag positions: one per line, first column, no header.
pub fn read_tag_positions(path: &Path) -> Result<Vec<i64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut positions = Vec::new();
    for (lineno, record) in reader.records().enumerate() {
        let record = record?;
        let Some(field) = record.get(0).map(str::trim).filter(|f| !f.is_empty()) else {
            continue;
        };
        let pos = field.parse::<i64>().map_err(|_| {
            ScanError::malformed(path, format!("line {}: '{}' is not a position", lineno + 1, field))
        })?;
        positions.push(pos);
    }
    info!("Read {} tag positions from {}", positions.len(), path.display());
    Ok(positions)
}

/// Scores every sample of `callset` at the rows whose position is a tag.
pub fn score_karyotypes(callset: &CallSet, tags: &[i64]) -> Result<Vec<KaryotypeScore>> {
    let tags: HashSet<i64> = tags.iter().copied().collect();
    let mask: Vec<bool> = callset.positions.as_slice().iter().map(|p| tags.contains(p)).collect();
    let tagged = callset.compress_variants(&mask)?;
    let n_tagged = tagged.positions.len();
    if n_tagged == 0 {
        return Err(ScanError::EmptySelection(format!(
            "none of {} tag positions is present on {}",
            tags.len(),
            callset.contig
        )));
    }
    info!("{} / {} tag positions found on {}", n_tagged, tags.len(), callset.contig);

    let genotypes = &tagged.genotypes;
    let n_alt = genotypes.to_n_alt();
    let scores = (0..genotypes.n_samples())
        .into_par_iter()
        .map(|sample| {
            let mut score = KaryotypeScore::default();
            let mut alt_sum = 0usize;
            for v in 0..n_tagged {
                if !genotypes.is_called(v, sample) {
                    continue;
                }
                let alt = n_alt[[v, sample]] as usize;
                alt_sum += alt;
                score.total_sites += 1;
                if let Some(slot) = score.n_alt.get_mut(alt) {
                    *slot += 1;
                }
            }
            score.mean_alt = (score.total_sites > 0).then(|| alt_sum as f64 / score.total_sites as f64);
            score
        })
        .collect::<Vec<_>>();

    let uncalled = scores.iter().filter(|s| s.mean_alt.is_none()).count();
    if uncalled > 0 {
        warn!("{} samples have no called tag site", uncalled);
    }
    Ok(scores)
}

pub fn karyotype_output_path(dir: &Path, inversion: &str) -> PathBuf {
    dir.join(format!("karyotype_{}.tsv", inversion))
}

/// Writes one tab-separated row per sample.
pub fn write_scores(path: &Path, inversion: &str, sample_ids: &[String], scores: &[KaryotypeScore]) -> Result<()> {
    if sample_ids.len() != scores.len() {
        return Err(ScanError::shape(format!(
            "{} sample ids for {} karyotype scores",
            sample_ids.len(),
            scores.len()
        )));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for (id, score) in sample_ids.iter().zip(scores) {
        writer.serialize(ScoreRow {
            sample_id: id,
            inversion,
            mean_genotype: score.mean_alt,
            total_sites: score.total_sites,
            n_0: score.n_alt[0],
            n_1: score.n_alt[1],
            n_2: score.n_alt[2],
        })?;
    }
    writer.flush()?;
    info!("Wrote {} karyotype scores to {}", scores.len(), path.display());
    Ok(())
}
