//! Haplotype-length scans around rare variants shared by two individuals.
//!
//! Starting from the row of a rare variant carried by both individuals, the scan walks right
//! and left until it hits a row where the two are homozygous for different alleles, which
//! cannot happen on a shared haplotype. The boundary rows themselves are part of the
//! reported interval.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::error::{Result, ScanError};
use crate::genotype::CallSet;

/// One input row: a rare variant and the two sample columns carrying it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RareVariant {
    pub contig: String,
    pub pos: i64,
    pub idx1: usize,
    pub idx2: usize,
}

/// Interval found around a rare variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub contig: String,
    pub position: i64,
    pub lower: usize,
    pub upper: usize,
    pub start: i64,
    pub end: i64,
}

impl Breakpoint {
    pub fn size(&self) -> i64 {
        self.end - self.start
    }
}

/// Reads tab-separated rare-variant pairs with a `contig pos idx1 idx2` header.
pub fn read_rare_variants(path: &Path) -> Result<Vec<RareVariant>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

pub struct BreakpointScanner<'a> {
    callset: &'a CallSet,
}

impl<'a> BreakpointScanner<'a> {
    pub fn new(callset: &'a CallSet) -> Self {
        Self { callset }
    }

    fn is_recombined(&self, row: usize, s1: usize, s2: usize) -> bool {
        let gt = &self.callset.genotypes;
        gt.is_hom(row, s1) && gt.is_hom(row, s2) && gt.call(row, s1)[0] != gt.call(row, s2)[0]
    }

    fn scan_right(&self, from: usize, s1: usize, s2: usize) -> usize {
        let last = self.callset.positions.len() - 1;
        let mut row = from;
        while !self.is_recombined(row, s1, s2) {
            if row == last {
                break;
            }
            row += 1;
        }
        row
    }

    fn scan_left(&self, from: usize, s1: usize, s2: usize) -> usize {
        let mut row = from;
        while !self.is_recombined(row, s1, s2) {
            if row == 0 {
                break;
            }
            row -= 1;
        }
        row
    }

    pub fn scan(&self, variant: &RareVariant) -> Result<Breakpoint> {
        if variant.contig != self.callset.contig {
            return Err(ScanError::invalid(format!(
                "rare variant on contig {} scanned against contig {}",
                variant.contig, self.callset.contig
            )));
        }
        let n_samples = self.callset.genotypes.n_samples();
        for idx in [variant.idx1, variant.idx2] {
            if idx >= n_samples {
                return Err(ScanError::invalid(format!(
                    "sample index {} out of bounds ({} samples)",
                    idx, n_samples
                )));
            }
        }

        let row = self
            .callset
            .positions
            .locate(variant.pos)
            .ok_or_else(|| ScanError::PositionNotFound {
                contig: variant.contig.clone(),
                position: variant.pos,
            })?;

        let upper = self.scan_right(row, variant.idx1, variant.idx2);
        let lower = self.scan_left(row, variant.idx1, variant.idx2);
        let positions = self.callset.positions.as_slice();

        debug!(
            "{}:{} samples ({}, {}) -> rows {}..={}",
            variant.contig, variant.pos, variant.idx1, variant.idx2, lower, upper
        );

        Ok(Breakpoint {
            contig: variant.contig.clone(),
            position: variant.pos,
            lower,
            upper,
            start: positions[lower],
            end: positions[upper],
        })
    }
}

/// Line-per-record output, flushed after every record.
pub struct BreakpointWriter<W: Write> {
    inner: W,
}

impl BreakpointWriter<BufWriter<File>> {
    /// Truncates `path` and starts a fresh output for a contig run.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> BreakpointWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(&mut self, bp: &Breakpoint) -> Result<()> {
        writeln!(
            self.inner,
            "{}\t{}\t{}\t{}\t{}",
            bp.contig,
            bp.position,
            bp.size(),
            bp.start,
            bp.end
        )?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Scans every rare variant of the call set's contig in input order, appending each result
/// as soon as it is known. Rows for other contigs are skipped. Returns the number of
/// records written.
pub fn scan_contig<'v, W, I, F>(
    callset: &CallSet,
    variants: I,
    writer: &mut BreakpointWriter<W>,
    mut on_record: F,
) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'v RareVariant>,
    F: FnMut(&Breakpoint),
{
    let scanner = BreakpointScanner::new(callset);
    let mut written = 0;
    for variant in variants.into_iter().filter(|v| v.contig == callset.contig) {
        let bp = scanner.scan(variant)?;
        writer.append(&bp)?;
        on_record(&bp);
        written += 1;
    }
    Ok(written)
}
