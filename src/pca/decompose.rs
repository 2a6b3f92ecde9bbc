//! Principal components of alternate-allele count matrices.
//!
//! The decomposition works on the sample-by-sample Gram matrix of the scaled data, which
//! keeps the eigenproblem at `n_samples x n_samples` no matter how many sites are used.
//! Scores are `u_i * s_i` and the explained-variance ratio of component `i` is its
//! eigenvalue over the trace of the Gram matrix.

use std::fmt;
use std::str::FromStr;

use log::debug;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{Result, ScanError};

/// Per-variant scaling applied before decomposition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scaler {
    /// Centre, then divide by `sqrt(p * (1 - p))` with `p` the alt-allele frequency.
    #[default]
    Patterson,
    Centre,
}

impl Scaler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scaler::Patterson => "patterson",
            Scaler::Centre => "centre",
        }
    }
}

impl fmt::Display for Scaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scaler {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "patterson" => Ok(Scaler::Patterson),
            "centre" | "center" => Ok(Scaler::Centre),
            other => Err(ScanError::invalid(format!("unknown scaler '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    /// Sample scores, `(samples, components)`.
    pub coords: Array2<f64>,
    pub eigenvalues: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
}

pub trait Decomposer {
    /// Decomposes `n_alt` (variants x samples) into at most `n_components` components.
    fn decompose(
        &self,
        n_alt: ArrayView2<u8>,
        ploidy: usize,
        scaler: Scaler,
        n_components: usize,
    ) -> Result<Decomposition>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GramPca;

impl GramPca {
    /// Samples x variants matrix of scaled values.
    fn scale(n_alt: ArrayView2<u8>, ploidy: usize, scaler: Scaler) -> Array2<f64> {
        let mut x = n_alt.t().mapv(f64::from);
        for mut column in x.axis_iter_mut(Axis(1)) {
            let mean = column.mean().unwrap_or(0.0);
            column -= mean;
            if scaler == Scaler::Patterson {
                let p = mean / ploidy as f64;
                let sd = (p * (1.0 - p)).sqrt();
                if sd > 0.0 {
                    column /= sd;
                }
            }
        }
        x
    }
}

impl Decomposer for GramPca {
    fn decompose(
        &self,
        n_alt: ArrayView2<u8>,
        ploidy: usize,
        scaler: Scaler,
        n_components: usize,
    ) -> Result<Decomposition> {
        let (n_sites, n_samples) = n_alt.dim();
        if n_components == 0 {
            return Err(ScanError::invalid("n_components must be > 0"));
        }
        if n_sites == 0 || n_samples == 0 {
            return Err(ScanError::EmptySelection(format!(
                "cannot decompose a {} x {} matrix",
                n_sites, n_samples
            )));
        }
        if ploidy == 0 {
            return Err(ScanError::invalid("ploidy must be > 0"));
        }

        let x = Self::scale(n_alt, ploidy, scaler);
        let gram = x.dot(&x.t());
        let trace: f64 = gram.diag().sum();
        debug!(
            "Gram matrix {}x{} from {} sites, trace {:.4}",
            n_samples, n_samples, n_sites, trace
        );

        let eigen = SymmetricEigen::new(DMatrix::from_fn(n_samples, n_samples, |i, j| gram[[i, j]]));
        let mut order: Vec<usize> = (0..n_samples).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let k = n_components.min(n_samples);
        let mut coords = Array2::<f64>::zeros((n_samples, k));
        let mut eigenvalues = Vec::with_capacity(k);
        let mut ratios = Vec::with_capacity(k);

        for (c, &idx) in order.iter().take(k).enumerate() {
            let lambda = eigen.eigenvalues[idx].max(0.0);
            let vector = eigen.eigenvectors.column(idx);
            // Sign convention: the largest-magnitude entry is positive.
            let pivot = vector
                .iter()
                .copied()
                .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            let s = lambda.sqrt();
            for (i, &u) in vector.iter().enumerate() {
                coords[[i, c]] = sign * u * s;
            }
            eigenvalues.push(lambda);
            ratios.push(if trace > 0.0 { lambda / trace } else { 0.0 });
        }

        Ok(Decomposition {
            coords,
            eigenvalues,
            explained_variance_ratio: ratios,
        })
    }
}
