//! Export of windowed statistics and PCA coordinates.
//!
//! Rendering is left to downstream tools; the sinks here write tab-separated tables that
//! carry everything a plot needs (values, midpoints, colour, axis range).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use rand::Rng;

use crate::config::RunConfig;
use crate::error::{Result, ScanError};
use crate::samples::SampleTable;

/// One windowed statistic for one cohort comparison on one contig.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowedPlot<'a> {
    pub statistic: &'a str,
    pub cohort_label: &'a str,
    pub cohort_label_no_space: &'a str,
    pub values: &'a [f64],
    pub midpoints: &'a [f64],
    pub contig: &'a str,
    pub colour: &'a str,
    pub y_range: (f64, f64),
}

pub trait PlotSink {
    fn windowed(&mut self, plot: &WindowedPlot<'_>) -> Result<()>;
    /// Exports two columns of `table` as plot coordinates.
    fn coordinates(&mut self, table: &SampleTable, axes: (&str, &str)) -> Result<()>;
}

/// Adds `frac * U(-r, r)` noise to every value, `r` being the range of `values`.
pub fn jitter<R: Rng>(values: &[f64], frac: f64, rng: &mut R) -> Vec<f64> {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let r = max - min;
    if frac == 0.0 || !(r > 0.0) {
        return values.to_vec();
    }
    values.iter().map(|&v| v + frac * rng.random_range(-r..r)).collect()
}

fn parse_column(table: &SampleTable, name: &str) -> Result<Vec<f64>> {
    table
        .column(name)?
        .into_iter()
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| ScanError::invalid(format!("column '{}' has non-numeric value '{}'", name, v)))
        })
        .collect()
}

/// Writes each export to its own TSV under `dir`.
pub struct TsvSink {
    dir: PathBuf,
    config: RunConfig,
}

impl TsvSink {
    pub fn new(dir: impl Into<PathBuf>, config: RunConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    pub fn windowed_path(&self, plot: &WindowedPlot<'_>) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.tsv",
            plot.statistic, plot.cohort_label_no_space, plot.contig
        ))
    }

    pub fn coordinates_path(&self, axes: (&str, &str)) -> PathBuf {
        self.dir.join(format!("coords_{}_{}.tsv", axes.0, axes.1))
    }

    fn create(&self, path: &Path) -> Result<BufWriter<File>> {
        fs::create_dir_all(&self.dir)?;
        Ok(BufWriter::new(File::create(path)?))
    }
}

impl PlotSink for TsvSink {
    fn windowed(&mut self, plot: &WindowedPlot<'_>) -> Result<()> {
        if plot.values.len() != plot.midpoints.len() {
            return Err(ScanError::shape(format!(
                "{} values but {} midpoints",
                plot.values.len(),
                plot.midpoints.len()
            )));
        }
        let path = self.windowed_path(plot);
        let mut out = self.create(&path)?;
        writeln!(
            out,
            "# statistic={} cohort={} contig={} colour={} ymin={} ymax={}",
            plot.statistic, plot.cohort_label, plot.contig, plot.colour, plot.y_range.0, plot.y_range.1
        )?;
        writeln!(out, "midpoint\t{}", plot.statistic)?;
        for (m, v) in plot.midpoints.iter().zip(plot.values) {
            writeln!(out, "{}\t{}", m, v)?;
        }
        out.flush()?;
        info!("Wrote {} windows to {}", plot.values.len(), path.display());
        Ok(())
    }

    fn coordinates(&mut self, table: &SampleTable, axes: (&str, &str)) -> Result<()> {
        let mut rng = self.config.rng();
        let x = jitter(&parse_column(table, axes.0)?, self.config.jitter_frac, &mut rng);
        let y = jitter(&parse_column(table, axes.1)?, self.config.jitter_frac, &mut rng);
        let to_text = |v: Vec<f64>| v.into_iter().map(|f| f.to_string()).collect::<Vec<_>>();
        let jittered = table
            .with_column(axes.0, to_text(x))?
            .with_column(axes.1, to_text(y))?;

        let path = self.coordinates_path(axes);
        let out = self.create(&path)?;
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
        writer.write_record(jittered.columns())?;
        for r in 0..jittered.n_rows() {
            writer.write_record(jittered.row(r))?;
        }
        writer.flush()?;
        info!("Wrote {} coordinates to {}", jittered.n_rows(), path.display());
        Ok(())
    }
}

/// Keeps every export in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub windowed: Vec<RecordedPlot>,
    pub coordinates: Vec<(SampleTable, String, String)>,
}

/// Owned copy of a [`WindowedPlot`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedPlot {
    pub statistic: String,
    pub cohort_label: String,
    pub values: Vec<f64>,
    pub midpoints: Vec<f64>,
    pub contig: String,
    pub colour: String,
    pub y_range: (f64, f64),
}

impl PlotSink for MemorySink {
    fn windowed(&mut self, plot: &WindowedPlot<'_>) -> Result<()> {
        self.windowed.push(RecordedPlot {
            statistic: plot.statistic.to_string(),
            cohort_label: plot.cohort_label.to_string(),
            values: plot.values.to_vec(),
            midpoints: plot.midpoints.to_vec(),
            contig: plot.contig.to_string(),
            colour: plot.colour.to_string(),
            y_range: plot.y_range,
        });
        Ok(())
    }

    fn coordinates(&mut self, table: &SampleTable, axes: (&str, &str)) -> Result<()> {
        self.coordinates
            .push((table.clone(), axes.0.to_string(), axes.1.to_string()));
        Ok(())
    }
}
