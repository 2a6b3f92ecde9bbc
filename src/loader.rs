//! Materializing call sets from VCF files.
//!
//! A [`CallSetSource`] does all of its reading in one `materialize` call; the returned
//! [`CallSet`] is plain in-memory arrays that the scans borrow immutably.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::Array3;
use noodles_vcf::{
    self as vcf,
    variant::record::samples::series::Value,
    variant::record::samples::Series as VcfSeriesTrait,
};
use rayon::prelude::*;

use crate::error::{Result, ScanError};
use crate::genotype::{CallSet, GenotypeMatrix, PositionSequence, MISSING};

/// Anything that can produce a dense call set for one contig.
pub trait CallSetSource {
    fn materialize(&self) -> Result<CallSet>;
}

#[derive(Clone, Debug)]
pub struct VcfCallSetSource {
    pub path: PathBuf,
    pub contig: String,
    pub site_filter: Option<PathBuf>,
}

/// Reads a site-filter mask: one boolean per line.
pub fn read_site_filter(path: &Path) -> Result<Vec<bool>> {
    let reader = BufReader::new(File::open(path)?);
    let mut mask = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        let value = match token.to_ascii_lowercase().as_str() {
            "1" | "true" | "pass" => true,
            "0" | "false" | "fail" => false,
            other => {
                return Err(ScanError::malformed(
                    path,
                    format!("line {}: '{}' is not a site-filter value", lineno + 1, other),
                ))
            }
        };
        mask.push(value);
    }
    Ok(mask)
}

fn allele_index(idx: Option<usize>, path: &Path) -> Result<i8> {
    match idx {
        None => Ok(MISSING),
        Some(i) => i8::try_from(i)
            .map_err(|_| ScanError::malformed(path, format!("allele index {} exceeds {}", i, i8::MAX))),
    }
}

/// Parses `0/1`, `1|1`, `./.` and haploid `0` style genotype strings.
fn parse_gt_string(gt: &str, path: &Path) -> Result<Vec<i8>> {
    gt.split(['/', '|'])
        .map(|a| match a {
            "." | "" => Ok(MISSING),
            _ => a
                .parse::<usize>()
                .map_err(|_| ScanError::malformed(path, format!("unparsable genotype '{}'", gt)))
                .and_then(|i| allele_index(Some(i), path)),
        })
        .collect()
}

impl VcfCallSetSource {
    pub fn new(path: impl Into<PathBuf>, contig: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contig: contig.into(),
            site_filter: None,
        }
    }

    pub fn with_site_filter(mut self, path: impl Into<PathBuf>) -> Self {
        self.site_filter = Some(path.into());
        self
    }

    pub fn sample_names(&self) -> Result<Vec<String>> {
        let mut reader = vcf::io::reader::Builder::default().build_from_path(&self.path)?;
        let header = reader.read_header()?;
        Ok(header.sample_names().iter().cloned().collect())
    }

    /// Per-variant calls for the contig, in file order. Missing calls may be empty.
    fn read_calls(&self) -> Result<(Vec<i64>, Vec<Vec<Vec<i8>>>, usize, usize)> {
        let path = self.path.as_path();
        let mut reader = vcf::io::reader::Builder::default().build_from_path(path)?;
        let header = reader.read_header()?;
        let n_samples = header.sample_names().len();
        if n_samples == 0 {
            return Err(ScanError::malformed(path, "VCF header contains no samples"));
        }

        let gt_key = vcf::variant::record::samples::keys::key::GENOTYPE.as_ref();
        if !header.formats().contains_key(gt_key) {
            return Err(ScanError::malformed(path, format!("FORMAT={} not declared in header", gt_key)));
        }

        let mut positions = Vec::new();
        let mut rows = Vec::new();
        let mut ploidy: Option<usize> = None;
        let mut record = vcf::Record::default();

        while reader.read_record(&mut record)? != 0 {
            if record.reference_sequence_name() != self.contig {
                continue;
            }
            let position = match record.variant_start() {
                Some(Ok(p)) => p.get() as i64,
                Some(Err(e)) => return Err(ScanError::Io(e)),
                None => return Err(ScanError::malformed(path, "record without a position")),
            };

            let mut calls: Vec<Vec<i8>> = vec![Vec::new(); n_samples];
            if let Some(series) = record.samples().select(gt_key) {
                for (sample_idx, value) in series.iter(&header).enumerate() {
                    if sample_idx >= n_samples {
                        warn!(
                            "More GT values than samples at {}:{}, ignoring the rest",
                            self.contig, position
                        );
                        break;
                    }
                    let call = match value? {
                        Some(Value::Genotype(gt)) => gt
                            .iter()
                            .map(|item| item.map(|(idx, _)| idx).map_err(ScanError::Io))
                            .map(|idx| idx.and_then(|i| allele_index(i, path)))
                            .collect::<Result<Vec<i8>>>()?,
                        Some(Value::String(s)) => parse_gt_string(s.as_ref(), path)?,
                        Some(other) => {
                            return Err(ScanError::malformed(
                                path,
                                format!("unexpected GT value {:?} at {}:{}", other, self.contig, position),
                            ))
                        }
                        None => Vec::new(),
                    };
                    if call.iter().all(|&a| a == MISSING) {
                        continue;
                    }
                    match ploidy {
                        None => ploidy = Some(call.len()),
                        Some(p) if p != call.len() => {
                            return Err(ScanError::malformed(
                                path,
                                format!(
                                    "sample {} at {}:{} has ploidy {}, expected {}",
                                    sample_idx,
                                    self.contig,
                                    position,
                                    call.len(),
                                    p
                                ),
                            ))
                        }
                        Some(_) => {}
                    }
                    calls[sample_idx] = call;
                }
            }
            positions.push(position);
            rows.push(calls);
        }

        let ploidy = ploidy.unwrap_or_else(|| {
            debug!("No called genotypes on {}, assuming diploid", self.contig);
            2
        });
        Ok((positions, rows, n_samples, ploidy))
    }
}

impl CallSetSource for VcfCallSetSource {
    fn materialize(&self) -> Result<CallSet> {
        info!("Reading {} from {}", self.contig, self.path.display());
        let (positions, rows, n_samples, ploidy) = self.read_calls()?;
        let n_variants = rows.len();

        let flat: Vec<i8> = rows
            .par_iter()
            .flat_map_iter(|calls| {
                calls.iter().flat_map(move |call| {
                    (0..ploidy).map(move |k| call.get(k).copied().unwrap_or(MISSING))
                })
            })
            .collect();
        let calls = Array3::from_shape_vec((n_variants, n_samples, ploidy), flat)
            .map_err(|e| ScanError::shape(e.to_string()))?;

        let positions = PositionSequence::new(positions)?;
        let callset = CallSet::new(self.contig.clone(), GenotypeMatrix::new(calls), positions)?;
        info!(
            "Materialized {} variants x {} samples (ploidy {}) on {}",
            n_variants, n_samples, ploidy, self.contig
        );

        match &self.site_filter {
            Some(filter_path) => {
                let mask = read_site_filter(filter_path)?;
                if mask.len() != callset.positions.len() {
                    return Err(ScanError::shape(format!(
                        "site filter {} has {} entries, contig {} has {} variants",
                        filter_path.display(),
                        mask.len(),
                        self.contig,
                        callset.positions.len()
                    )));
                }
                let filtered = callset.compress_variants(&mask)?;
                info!("{} / {} sites pass the site filter", filtered.positions.len(), mask.len());
                Ok(filtered)
            }
            None => Ok(callset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VCF: &str = "##fileformat=VCFv4.3\n\
##contig=<ID=2L>\n\
##contig=<ID=3R>\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\ts3\n\
2L\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0/0\t0/1\t1/1\n\
2L\t200\t.\tC\tG,T\t.\tPASS\t.\tGT\t0|2\t./.\t1|1\n\
3R\t50\t.\tG\tA\t.\tPASS\t.\tGT\t0/1\t0/1\t0/1\n\
2L\t300\t.\tT\tA\t.\tPASS\t.\tGT\t1/1\t0/0\t0/1\n";

    fn write_vcf(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("calls.vcf");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_materialize_contig() {
        let dir = tempfile::tempdir().unwrap();
        let source = VcfCallSetSource::new(write_vcf(dir.path(), VCF), "2L");
        let cs = source.materialize().unwrap();

        assert_eq!(cs.positions.as_slice(), &[100, 200, 300]);
        assert_eq!(cs.genotypes.n_samples(), 3);
        assert_eq!(cs.genotypes.ploidy(), 2);
        assert_eq!(cs.genotypes.call(1, 0).to_vec(), vec![0, 2]);
        assert_eq!(cs.genotypes.call(1, 1).to_vec(), vec![MISSING, MISSING]);
        assert!(!cs.genotypes.is_called(1, 1));
        assert_eq!(source.sample_names().unwrap(), vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_site_filter_applied_and_length_checked() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_path = write_vcf(dir.path(), VCF);
        let filter_path = dir.path().join("filter.txt");

        std::fs::write(&filter_path, "pass\nfail\n1\n").unwrap();
        let cs = VcfCallSetSource::new(&vcf_path, "2L")
            .with_site_filter(&filter_path)
            .materialize()
            .unwrap();
        assert_eq!(cs.positions.as_slice(), &[100, 300]);

        std::fs::write(&filter_path, "true\nfalse\n").unwrap();
        let err = VcfCallSetSource::new(&vcf_path, "2L")
            .with_site_filter(&filter_path)
            .materialize();
        assert!(matches!(err, Err(ScanError::ShapeMismatch(_))));
    }

    #[test]
    fn test_unsorted_positions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let text = VCF.replace("2L\t300\t", "2L\t150\t");
        let err = VcfCallSetSource::new(write_vcf(dir.path(), &text), "2L").materialize();
        assert!(matches!(err, Err(ScanError::InvalidParameter(_))));
    }

    #[test]
    fn test_read_site_filter_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "1\nmaybe\n").unwrap();
        assert!(matches!(read_site_filter(&path), Err(ScanError::MalformedInput { .. })));
    }

    #[test]
    fn test_parse_gt_string() {
        let p = Path::new("x.vcf");
        assert_eq!(parse_gt_string("0/1", p).unwrap(), vec![0, 1]);
        assert_eq!(parse_gt_string("2|.", p).unwrap(), vec![2, MISSING]);
        assert_eq!(parse_gt_string("1", p).unwrap(), vec![1]);
        assert!(parse_gt_string("A/T", p).is_err());
        assert!(parse_gt_string("0/300", p).is_err());
    }
}
