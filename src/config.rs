//! Run-wide settings passed explicitly to every workflow entry point.

use std::path::PathBuf;

use log::LevelFilter;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Seed used when none is given on the command line.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub seed: u64,
    /// Coordinate jitter as a fraction of each axis' range; `0.0` disables it.
    pub jitter_frac: f64,
    pub threads: Option<usize>,
    pub log_level: LevelFilter,
    /// Log destination; stderr when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            jitter_frac: 0.02,
            threads: None,
            log_level: LevelFilter::Info,
            log_file: None,
        }
    }
}

impl RunConfig {
    /// Fresh generator seeded from `seed`; two calls yield identical streams.
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    pub fn num_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
