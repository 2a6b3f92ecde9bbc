//! Content-addressed storage of PCA results.
//!
//! Entries are keyed by parameter fingerprint, written once and never evicted. On disk an
//! entry is two files in one directory: `<fp>-data.csv` and `<fp>-evr.npy`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use tempfile::NamedTempFile;

use super::npy;
use super::PcaResult;
use crate::error::{Result, ScanError};
use crate::samples::SampleTable;

pub trait CacheStore {
    /// True only when a complete entry is stored under `fingerprint`.
    fn exists(&self, fingerprint: &str) -> bool;
    fn read(&self, fingerprint: &str) -> Result<PcaResult>;
    fn write(&self, fingerprint: &str, result: &PcaResult) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}-data.csv", fingerprint))
    }

    pub fn evr_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}-evr.npy", fingerprint))
    }

    /// Writes through a temporary file in the cache directory, then renames over `path`,
    /// so readers see either the old file or the complete new one.
    fn write_atomic<F>(&self, path: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
    {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            fill(&mut writer)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ScanError::Io(e.error))?;
        Ok(())
    }

    fn corrupt(&self, fingerprint: &str, path: PathBuf, reason: impl ToString) -> ScanError {
        ScanError::CacheCorrupt {
            fingerprint: fingerprint.to_string(),
            path,
            reason: reason.to_string(),
        }
    }
}

impl CacheStore for FsCacheStore {
    fn exists(&self, fingerprint: &str) -> bool {
        let data = self.data_path(fingerprint).is_file();
        let evr = self.evr_path(fingerprint).is_file();
        if data != evr {
            warn!(
                "Cache entry {} in {} is incomplete; it will be recomputed",
                fingerprint,
                self.dir.display()
            );
        }
        data && evr
    }

    fn read(&self, fingerprint: &str) -> Result<PcaResult> {
        let data_path = self.data_path(fingerprint);
        let evr_path = self.evr_path(fingerprint);

        let table = SampleTable::from_reader(File::open(&data_path)?, b',')
            .map_err(|e| self.corrupt(fingerprint, data_path.clone(), e))?;
        let mut reader = BufReader::new(File::open(&evr_path)?);
        let evr = npy::read_vector(&mut reader).map_err(|e| self.corrupt(fingerprint, evr_path.clone(), e))?;

        debug!("Loaded cached PCA {} from {}", fingerprint, self.dir.display());
        Ok(PcaResult { table, evr })
    }

    fn write(&self, fingerprint: &str, result: &PcaResult) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.write_atomic(&self.data_path(fingerprint), |w| result.table.write_csv(w))?;
        self.write_atomic(&self.evr_path(fingerprint), |w| {
            npy::write_vector(w, &result.evr).map_err(ScanError::from)
        })?;
        debug!("Saved PCA {} to {}", fingerprint, self.dir.display());
        Ok(())
    }
}

/// In-process cache, mainly for tests and single-run pipelines.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, PcaResult>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn exists(&self, fingerprint: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(fingerprint)
    }

    fn read(&self, fingerprint: &str) -> Result<PcaResult> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| ScanError::invalid(format!("no cached PCA under {}", fingerprint)))
    }

    fn write(&self, fingerprint: &str, result: &PcaResult) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.to_string(), result.clone());
        Ok(())
    }
}
