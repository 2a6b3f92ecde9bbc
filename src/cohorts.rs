//! Partitioning samples into phenotype cohorts per grouping key.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use log::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::samples::{is_missing, SampleTable};

/// Set1-style qualitative palette; comparisons cycle through it in key order.
pub const PALETTE: [&str; 9] = [
    "#e41a1c", "#377eb8", "#4daf4a", "#984ea3", "#ff7f00", "#ffff33", "#a65628", "#f781bf",
    "#999999",
];

/// Column holding the species call; used for outgroup selection when present.
pub const SPECIES_COLUMN: &str = "species";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cohort {
    pub name: String,
    pub phenotype: String,
    pub indices: Vec<usize>,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Two phenotype cohorts sharing one grouping key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CohortComparison {
    pub key: Vec<String>,
    pub label: String,
    pub label_no_space: String,
    pub species: Option<String>,
    pub colour: &'static str,
    pub cohorts: [Cohort; 2],
}

#[derive(Clone, Debug)]
pub struct CohortPartitioner {
    pub columns: Vec<String>,
    pub comparator: String,
    pub min_pop_size: usize,
    pub sample_id_column: String,
    pub excluded: HashSet<String>,
}

/// Reads sample ids to exclude from the `id_column` of a CSV table (e.g. a sib-group table).
pub fn read_excluded_ids(path: &Path, id_column: &str) -> Result<HashSet<String>> {
    let table = SampleTable::read(path)?;
    let ids: HashSet<String> = table.column(id_column)?.into_iter().map(String::from).collect();
    info!("Excluding {} samples listed in {}", ids.len(), path.display());
    Ok(ids)
}

impl CohortPartitioner {
    pub fn new(columns: Vec<String>, comparator: impl Into<String>, min_pop_size: usize) -> Result<Self> {
        if columns.is_empty() {
            return Err(ScanError::invalid("at least one grouping column is required"));
        }
        Ok(Self {
            columns,
            comparator: comparator.into(),
            min_pop_size,
            sample_id_column: "sample_id".to_string(),
            excluded: HashSet::new(),
        })
    }

    pub fn with_exclusions(mut self, sample_id_column: impl Into<String>, excluded: HashSet<String>) -> Self {
        self.sample_id_column = sample_id_column.into();
        self.excluded = excluded;
        self
    }

    /// Groups table rows by the grouping columns and splits each group by the comparator.
    ///
    /// The phenotype pair is the sorted set of distinct comparator values over the
    /// retained rows and must have exactly two members. Row indices refer to the table,
    /// which is aligned with the genotype sample axis.
    pub fn partition(&self, table: &SampleTable) -> Result<Vec<CohortComparison>> {
        let key_cols = self
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        let pheno_col = table.column_index(&self.comparator)?;
        let id_col = if self.excluded.is_empty() {
            None
        } else {
            Some(table.column_index(&self.sample_id_column)?)
        };
        let species_col = table.column_index(SPECIES_COLUMN).ok();

        let mut groups: BTreeMap<Vec<String>, BTreeMap<String, Vec<usize>>> = BTreeMap::new();
        let mut phenotypes = BTreeSet::new();
        let mut n_excluded = 0;
        let mut n_incomplete = 0;
        for r in 0..table.n_rows() {
            let row = table.row(r);
            if let Some(id_col) = id_col {
                if self.excluded.contains(&row[id_col]) {
                    n_excluded += 1;
                    continue;
                }
            }
            if is_missing(&row[pheno_col]) || key_cols.iter().any(|&c| is_missing(&row[c])) {
                n_incomplete += 1;
                continue;
            }
            let key: Vec<String> = key_cols.iter().map(|&c| row[c].clone()).collect();
            let phenotype = row[pheno_col].clone();
            phenotypes.insert(phenotype.clone());
            groups.entry(key).or_default().entry(phenotype).or_default().push(r);
        }
        if n_excluded > 0 {
            debug!("{} samples dropped by the exclusion list", n_excluded);
        }
        if n_incomplete > 0 {
            info!(
                "{} samples dropped for a missing '{}' or grouping value",
                n_incomplete, self.comparator
            );
        }

        if phenotypes.len() != 2 {
            return Err(ScanError::invalid(format!(
                "comparator column '{}' must have exactly two values, found {:?}",
                self.comparator, phenotypes
            )));
        }
        let mut pair = phenotypes.into_iter();
        let (pheno1, pheno2) = match (pair.next(), pair.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(ScanError::invalid("comparator column has fewer than two values")),
        };

        let mut comparisons = Vec::new();
        for (i, (key, mut by_pheno)) in groups.into_iter().enumerate() {
            let label = key.join(" | ");
            let (Some(idx1), Some(idx2)) = (by_pheno.remove(&pheno1), by_pheno.remove(&pheno2)) else {
                warn!("Skipping {}: lacks one of the phenotypes {} / {}", label, pheno1, pheno2);
                continue;
            };
            if idx1.len() < self.min_pop_size || idx2.len() < self.min_pop_size {
                info!(
                    "Skipping {}: {} {} and {} {} samples, minimum is {}",
                    label,
                    idx1.len(),
                    pheno1,
                    idx2.len(),
                    pheno2,
                    self.min_pop_size
                );
                continue;
            }

            let species = species_col.and_then(|c| {
                let first = &table.row(idx1[0])[c];
                idx1.iter()
                    .chain(&idx2)
                    .all(|&r| &table.row(r)[c] == first)
                    .then(|| first.clone())
            });
            let label_no_space = key
                .iter()
                .map(|k| k.replace(char::is_whitespace, ""))
                .collect::<Vec<_>>()
                .join("_");

            comparisons.push(CohortComparison {
                cohorts: [
                    Cohort {
                        name: format!("{}_{}", label_no_space, pheno1),
                        phenotype: pheno1.clone(),
                        indices: idx1,
                    },
                    Cohort {
                        name: format!("{}_{}", label_no_space, pheno2),
                        phenotype: pheno2.clone(),
                        indices: idx2,
                    },
                ],
                key,
                label,
                label_no_space,
                species,
                colour: PALETTE[i % PALETTE.len()],
            });
        }

        info!("{} cohort comparisons pass the size threshold", comparisons.len());
        Ok(comparisons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SampleTable {
        let text = "sample_id,location,species,phenotype\n\
                    a1,Obuasi,gambiae,alive\n\
                    a2,Obuasi,gambiae,dead\n\
                    a3,Obuasi,gambiae,alive\n\
                    a4,Obuasi,gambiae,dead\n\
                    b1,Madina,coluzzii,alive\n\
                    b2,Madina,coluzzii,alive\n\
                    b3,Madina,gambiae,dead\n\
                    c1,Korle Bu,coluzzii,alive\n\
                    c2,Korle Bu,coluzzii,alive\n";
        SampleTable::from_reader(text.as_bytes(), b',').unwrap()
    }

    #[test]
    fn test_partition_groups_and_sorts_phenotypes() {
        let p = CohortPartitioner::new(vec!["location".into()], "phenotype", 1).unwrap();
        let comps = p.partition(&table()).unwrap();
        // Korle Bu lacks the dead phenotype.
        assert_eq!(comps.len(), 2);

        let madina = &comps[0];
        assert_eq!(madina.label, "Madina");
        assert_eq!(madina.cohorts[0].phenotype, "alive");
        assert_eq!(madina.cohorts[0].indices, vec![4, 5]);
        assert_eq!(madina.cohorts[1].indices, vec![6]);
        assert_eq!(madina.species, None);

        let obuasi = &comps[1];
        assert_eq!(obuasi.cohorts[0].indices, vec![0, 2]);
        assert_eq!(obuasi.cohorts[1].indices, vec![1, 3]);
        assert_eq!(obuasi.species.as_deref(), Some("gambiae"));
        assert_ne!(madina.colour, obuasi.colour);
    }

    #[test]
    fn test_min_pop_size_and_exclusions() {
        let p = CohortPartitioner::new(vec!["location".into()], "phenotype", 2).unwrap();
        let comps = p.partition(&table()).unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].label, "Obuasi");

        let excluded: HashSet<String> = ["a3".to_string()].into_iter().collect();
        let p = p.with_exclusions("sample_id", excluded);
        assert!(p.partition(&table()).unwrap().is_empty());
    }

    #[test]
    fn test_labels_with_multiple_columns() {
        let p = CohortPartitioner::new(vec!["location".into(), "species".into()], "phenotype", 1).unwrap();
        let comps = p.partition(&table()).unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].label, "Obuasi | gambiae");
        assert_eq!(comps[0].label_no_space, "Obuasi_gambiae");
        assert_eq!(comps[0].cohorts[1].name, "Obuasi_gambiae_dead");
    }

    #[test]
    fn test_comparator_must_be_binary() {
        let p = CohortPartitioner::new(vec!["location".into()], "species", 1).unwrap();
        assert!(p.partition(&table()).is_ok());
        let p = CohortPartitioner::new(vec!["species".into()], "location", 1).unwrap();
        assert!(matches!(p.partition(&table()), Err(ScanError::InvalidParameter(_))));
        assert!(CohortPartitioner::new(vec![], "phenotype", 1).is_err());
    }

    #[test]
    fn test_rows_with_missing_values_are_dropped() {
        let text = "sample_id,location,phenotype\n\
                    a1,Obuasi,alive\n\
                    a2,Obuasi,dead\n\
                    a3,Obuasi,\n\
                    a4,,dead\n\
                    a5,NA,alive\n\
                    a6,Obuasi,NaN\n";
        let table = SampleTable::from_reader(text.as_bytes(), b',').unwrap();
        let p = CohortPartitioner::new(vec!["location".into()], "phenotype", 1).unwrap();
        let comps = p.partition(&table).unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].label, "Obuasi");
        assert_eq!(comps[0].cohorts[0].indices, vec![0]);
        assert_eq!(comps[0].cohorts[1].indices, vec![1]);
    }

    #[test]
    fn test_read_excluded_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sib_group_table.csv");
        std::fs::write(&path, "sample_id,sib_group\na1,1\nb2,1\n").unwrap();
        let ids = read_excluded_ids(&path, "sample_id").unwrap();
        assert!(ids.contains("a1") && ids.contains("b2"));
        assert_eq!(ids.len(), 2);
    }
}
