//! Running a PCA for a parameter set, reusing cached results when available.

use log::{info, warn};
use ndarray::Axis;

use super::cache::CacheStore;
use super::decompose::{Decomposer, GramPca, Scaler};
use super::fingerprint::ParameterSet;
use super::{component_name, PcaResult};
use crate::error::{Result, ScanError};
use crate::genotype::CallSet;
use crate::ld::LdPrune;
use crate::samples::{SampleQuery, SampleTable};
use crate::sites::SiteSelector;

/// Highest allele index counted when selecting sites.
const MAX_ALLELE: u8 = 3;

/// Everything that determines a PCA result. Every field takes part in the fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaParams {
    pub contig: String,
    pub region_start: Option<i64>,
    pub region_stop: Option<i64>,
    /// Label of the sample collection the call set was built from.
    pub sample_sets: String,
    pub sample_query: Option<String>,
    /// Label of the site filter applied when the call set was materialized.
    pub site_mask: String,
    pub min_minor_ac: i32,
    pub max_an_missing: i32,
    pub n_snps: usize,
    pub snp_offset: usize,
    pub n_components: usize,
    pub scaler: Scaler,
    /// Optional LD pruning of the selected sites before decomposition.
    pub ld_prune: Option<LdPrune>,
}

impl PcaParams {
    pub fn new(contig: impl Into<String>) -> Self {
        Self {
            contig: contig.into(),
            region_start: None,
            region_stop: None,
            sample_sets: String::new(),
            sample_query: None,
            site_mask: String::new(),
            min_minor_ac: 3,
            max_an_missing: 0,
            n_snps: 100_000,
            snp_offset: 0,
            n_components: 10,
            scaler: Scaler::default(),
            ld_prune: None,
        }
    }

    pub fn parameter_set(&self) -> ParameterSet {
        ParameterSet::new()
            .with("contig", self.contig.as_str())
            .with("region_start", self.region_start)
            .with("region_stop", self.region_stop)
            .with("sample_sets", self.sample_sets.as_str())
            .with("sample_query", self.sample_query.clone())
            .with("site_mask", self.site_mask.as_str())
            .with("min_minor_ac", self.min_minor_ac)
            .with("max_an_missing", self.max_an_missing)
            .with("n_snps", self.n_snps)
            .with("snp_offset", self.snp_offset)
            .with("n_components", self.n_components)
            .with("scaler", self.scaler.as_str())
            .with("ld_prune_size", self.ld_prune.map(|ld| ld.size))
            .with("ld_prune_step", self.ld_prune.map(|ld| ld.step))
            .with("ld_prune_threshold", self.ld_prune.map(|ld| ld.threshold))
            .with("ld_prune_n_iter", self.ld_prune.map(|ld| ld.n_iter))
    }

    pub fn fingerprint(&self) -> Result<String> {
        self.parameter_set().fingerprint()
    }

    fn validate(&self) -> Result<SiteSelector> {
        if self.n_components == 0 {
            return Err(ScanError::invalid("n_components must be > 0"));
        }
        if let (Some(start), Some(stop)) = (self.region_start, self.region_stop) {
            if start > stop {
                return Err(ScanError::invalid(format!(
                    "region start {} is after region stop {}",
                    start, stop
                )));
            }
        }
        if let Some(ld) = self.ld_prune {
            LdPrune::new(ld.size, ld.step, ld.threshold, ld.n_iter)?;
        }
        SiteSelector::new(self.min_minor_ac, self.max_an_missing, self.n_snps, self.snp_offset)
    }
}

pub struct PcaRunner<'a, D = GramPca> {
    cache: &'a dyn CacheStore,
    decomposer: D,
}

impl<'a> PcaRunner<'a, GramPca> {
    pub fn new(cache: &'a dyn CacheStore) -> Self {
        Self::with_decomposer(cache, GramPca)
    }
}

impl<'a, D: Decomposer> PcaRunner<'a, D> {
    pub fn with_decomposer(cache: &'a dyn CacheStore, decomposer: D) -> Self {
        Self { cache, decomposer }
    }

    /// Returns the cached result for `params` if there is one, else computes and stores it.
    ///
    /// `samples` must have one row per genotype sample column, in the same order.
    pub fn run(&self, params: &PcaParams, callset: &CallSet, samples: &SampleTable) -> Result<PcaResult> {
        let selector = params.validate()?;
        let query = params.sample_query.as_deref().map(SampleQuery::parse).transpose()?;
        let fingerprint = params.fingerprint()?;

        if self.cache.exists(&fingerprint) {
            info!("Using cached PCA {}", fingerprint);
            return self.cache.read(&fingerprint);
        }
        info!("Running PCA {}", fingerprint);

        if callset.contig != params.contig {
            return Err(ScanError::invalid(format!(
                "PCA requested for contig {} but the call set holds {}",
                params.contig, callset.contig
            )));
        }
        if samples.n_rows() != callset.genotypes.n_samples() {
            return Err(ScanError::shape(format!(
                "sample table has {} rows, genotype matrix has {} samples",
                samples.n_rows(),
                callset.genotypes.n_samples()
            )));
        }

        let mut genotypes = callset.genotypes.clone();
        if params.region_start.is_some() || params.region_stop.is_some() {
            let range = callset.positions.locate_range(params.region_start, params.region_stop);
            info!(
                "Region {:?}..{:?} covers variants {}..{}",
                params.region_start, params.region_stop, range.start, range.end
            );
            genotypes = genotypes.slice_variants(range)?;
        }

        let mut table = samples.clone();
        if let Some(query) = &query {
            let mask = table.mask(query)?;
            table = table.filter_rows(&mask)?;
            genotypes = genotypes.compress_samples(&mask)?;
            info!("Sample query '{}' keeps {} samples", query.as_str(), table.n_rows());
        }
        if genotypes.n_samples() == 0 {
            return Err(ScanError::EmptySelection("no samples left after the sample query".to_string()));
        }

        let ac = genotypes.count_alleles(MAX_ALLELE);
        let selected = selector.select(&genotypes, &ac)?;
        if selected.indices.is_empty() {
            return Err(ScanError::EmptySelection(format!(
                "no variable sites pass the filters for {}",
                params.contig
            )));
        }
        let mut n_alt = selected.n_alt;
        if let Some(ld) = &params.ld_prune {
            let unlinked = ld.prune(&n_alt);
            n_alt = n_alt.select(Axis(0), &unlinked);
        }
        let n_sites = n_alt.nrows();

        let max_components = n_sites.min(genotypes.n_samples());
        let n_components = if params.n_components > max_components {
            warn!(
                "Requested {} components but only {} samples x {} sites; computing {}",
                params.n_components,
                genotypes.n_samples(),
                n_sites,
                max_components
            );
            max_components
        } else {
            params.n_components
        };

        let decomposition = self.decomposer.decompose(
            n_alt.view(),
            genotypes.ploidy(),
            params.scaler,
            n_components,
        )?;

        for (i, column) in decomposition.coords.columns().into_iter().enumerate() {
            let values = column.iter().map(|v| v.to_string()).collect();
            table = table.with_column(&component_name(i), values)?;
        }
        let result = PcaResult {
            table,
            evr: decomposition.explained_variance_ratio,
        };

        self.cache.write(&fingerprint, &result)?;
        info!("Saved PCA {}", fingerprint);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::ArrayView2;

    use super::*;
    use crate::genotype::{GenotypeMatrix, PositionSequence};
    use crate::pca::cache::{FsCacheStore, MemoryCacheStore};
    use crate::pca::decompose::Decomposition;

    /// Counts how often the decomposition actually runs.
    #[derive(Default)]
    struct CountingPca {
        calls: AtomicUsize,
    }

    impl Decomposer for &CountingPca {
        fn decompose(
            &self,
            n_alt: ArrayView2<u8>,
            ploidy: usize,
            scaler: Scaler,
            n_components: usize,
        ) -> Result<Decomposition> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GramPca.decompose(n_alt, ploidy, scaler, n_components)
        }
    }

    /// Six samples in two groups over eight variants at positions 100..=800.
    fn fixture() -> (CallSet, SampleTable) {
        let hom_ref = vec![0, 0];
        let het = vec![0, 1];
        let hom_alt = vec![1, 1];
        let patterns: [[&Vec<i8>; 6]; 8] = [
            [&hom_ref, &hom_ref, &het, &hom_alt, &hom_alt, &het],
            [&hom_ref, &het, &hom_ref, &hom_alt, &het, &hom_alt],
            [&het, &hom_ref, &hom_ref, &het, &hom_alt, &hom_alt],
            [&hom_ref, &hom_ref, &hom_ref, &hom_alt, &hom_alt, &hom_alt],
            [&hom_alt, &het, &hom_alt, &hom_ref, &hom_ref, &het],
            [&het, &hom_alt, &hom_alt, &hom_ref, &het, &hom_ref],
            [&hom_ref, &het, &het, &het, &hom_alt, &hom_ref],
            [&hom_alt, &hom_alt, &het, &hom_ref, &hom_ref, &hom_ref],
        ];
        let rows: Vec<Vec<Vec<i8>>> = patterns
            .iter()
            .map(|r| r.iter().map(|c| (*c).clone()).collect())
            .collect();
        let callset = CallSet::new(
            "3L",
            GenotypeMatrix::from_rows(&rows).unwrap(),
            PositionSequence::new((1..=8).map(|i| i * 100).collect()).unwrap(),
        )
        .unwrap();
        let text = "sample_id,country\n\
                    s1,Ghana\ns2,Ghana\ns3,Ghana\ns4,Mali\ns5,Mali\ns6,Mali\n";
        (callset, SampleTable::from_reader(text.as_bytes(), b',').unwrap())
    }

    fn params() -> PcaParams {
        PcaParams {
            min_minor_ac: 1,
            n_components: 3,
            ..PcaParams::new("3L")
        }
    }

    #[test]
    fn test_second_run_is_served_from_cache() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let counter = CountingPca::default();
        let runner = PcaRunner::with_decomposer(&cache, &counter);

        let first = runner.run(&params(), &callset, &samples).unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        let second = runner.run(&params(), &callset, &samples).unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);

        assert_eq!(first.evr.len(), 3);
        let cols: Vec<&str> = first.table.columns().iter().map(String::as_str).collect();
        assert_eq!(cols, vec!["sample_id", "country", "PC1", "PC2", "PC3"]);
        assert_eq!(first.table.n_rows(), 6);
    }

    #[test]
    fn test_filesystem_round_trip() {
        let (callset, samples) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCacheStore::new(dir.path());
        let counter = CountingPca::default();
        let runner = PcaRunner::with_decomposer(&cache, &counter);

        let first = runner.run(&params(), &callset, &samples).unwrap();
        let fp = params().fingerprint().unwrap();
        assert!(cache.data_path(&fp).is_file());
        assert!(cache.evr_path(&fp).is_file());

        // A fresh runner over the same directory does no work.
        let reread = PcaRunner::with_decomposer(&cache, &counter)
            .run(&params(), &callset, &samples)
            .unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, reread);
    }

    #[test]
    fn test_different_parameters_miss_the_cache() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let counter = CountingPca::default();
        let runner = PcaRunner::with_decomposer(&cache, &counter);

        runner.run(&params(), &callset, &samples).unwrap();
        let other = PcaParams {
            n_components: 2,
            ..params()
        };
        let result = runner.run(&other, &callset, &samples).unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.evr.len(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_sample_query_and_region() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let runner = PcaRunner::new(&cache);

        let p = PcaParams {
            sample_query: Some("sample_id != 's6'".to_string()),
            region_start: Some(150),
            region_stop: Some(800),
            n_components: 10,
            ..params()
        };
        let result = runner.run(&p, &callset, &samples).unwrap();
        assert_eq!(result.table.n_rows(), 5);
        assert_eq!(result.table.column("sample_id").unwrap(), vec!["s1", "s2", "s3", "s4", "s5"]);
        // Capped at the number of remaining samples.
        assert_eq!(result.evr.len(), 5);
        assert!(result.table.column("PC5").is_ok());
        assert!(result.table.column("PC6").is_err());
    }

    #[test]
    fn test_invalid_parameters_fail_before_the_cache() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let runner = PcaRunner::new(&cache);

        let zero_snps = PcaParams { n_snps: 0, ..params() };
        assert!(matches!(
            runner.run(&zero_snps, &callset, &samples),
            Err(ScanError::InvalidParameter(_))
        ));
        let bad_query = PcaParams {
            sample_query: Some("country ==".to_string()),
            ..params()
        };
        assert!(runner.run(&bad_query, &callset, &samples).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_sites_is_an_empty_selection() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let runner = PcaRunner::new(&cache);
        let p = PcaParams {
            min_minor_ac: 7,
            ..params()
        };
        assert!(matches!(
            runner.run(&p, &callset, &samples),
            Err(ScanError::EmptySelection(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ld_pruning_drops_linked_sites_and_changes_the_fingerprint() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let runner = PcaRunner::new(&cache);

        // Threshold 0 prunes every later row correlated at all with an earlier one.
        let pruned = PcaParams {
            ld_prune: Some(LdPrune::new(8, 8, 0.0, 1).unwrap()),
            n_components: 10,
            ..params()
        };
        assert_ne!(pruned.fingerprint().unwrap(), params().fingerprint().unwrap());
        let json = pruned.parameter_set().canonical_json().unwrap();
        assert!(json.contains(r#""ld_prune_size":8"#));
        assert!(json.contains(r#""ld_prune_threshold":0.0"#));
        assert!(params().parameter_set().canonical_json().unwrap().contains(r#""ld_prune_size":null"#));

        let full = runner.run(&PcaParams { n_components: 10, ..params() }, &callset, &samples).unwrap();
        let result = runner.run(&pruned, &callset, &samples).unwrap();
        assert!(result.evr.len() < full.evr.len());
        assert_eq!(cache.len(), 2);

        let bad = PcaParams {
            ld_prune: Some(LdPrune {
                step: 0,
                ..LdPrune::default()
            }),
            ..params()
        };
        assert!(matches!(
            runner.run(&bad, &callset, &samples),
            Err(ScanError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_sample_table_must_match_genotypes() {
        let (callset, samples) = fixture();
        let cache = MemoryCacheStore::new();
        let short = samples.filter_rows(&[true, true, true, true, true, false]).unwrap();
        assert!(matches!(
            PcaRunner::new(&cache).run(&params(), &callset, &short),
            Err(ScanError::ShapeMismatch(_))
        ));
    }
}
