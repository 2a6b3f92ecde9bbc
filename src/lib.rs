//! Selection scans and cached PCA over Anopheles genotype call sets.
//!
//! The binary in `main.rs` wires these modules into the `pbs`, `haplen`, `pca` and
//! `karyotype` subcommands; everything here is usable as a library.

pub mod breakpoints;
pub mod cohorts;
pub mod config;
pub mod error;
pub mod genotype;
pub mod karyotype;
pub mod ld;
pub mod loader;
pub mod pca;
pub mod samples;
pub mod sink;
pub mod sites;
pub mod windowed;
pub mod workflow;

pub use error::{Result, ScanError};
