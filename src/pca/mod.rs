//! Cached PCA over genotype call sets.

pub mod cache;
pub mod decompose;
pub mod fingerprint;
pub mod npy;
pub mod runner;

pub use cache::{CacheStore, FsCacheStore, MemoryCacheStore};
pub use decompose::{Decomposer, Decomposition, GramPca, Scaler};
pub use fingerprint::{ParamValue, ParameterSet};
pub use runner::{PcaParams, PcaRunner};

use crate::samples::SampleTable;

/// A PCA as stored in the cache: the sample table with `PC1..PCk` appended, and the
/// explained-variance ratio of each component.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaResult {
    pub table: SampleTable,
    pub evr: Vec<f64>,
}

/// Name of the `i`-th (zero-based) component column.
pub fn component_name(i: usize) -> String {
    format!("PC{}", i + 1)
}
