// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::{fs::File, path::Path, time::Instant};

use anopheles_scan::{
    breakpoints::read_rare_variants,
    cohorts::{read_excluded_ids, CohortPartitioner},
    config::RunConfig,
    karyotype::{karyotype_output_path, read_tag_positions, score_karyotypes, write_scores},
    ld::LdPrune,
    loader::{CallSetSource, VcfCallSetSource},
    pca::{FsCacheStore, PcaParams, PcaRunner},
    samples::SampleTable,
    sink::{PlotSink, TsvSink},
    windowed::WindowSpec,
    workflow::{haplen_output_path, run_haplen_scan, run_pbs_scan, Outgroup},
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    let config = RunConfig {
        seed: cli_args.seed,
        jitter_frac: cli_args.jitter_frac,
        threads: cli_args.threads,
        log_level,
        log_file: cli_args.log_file.clone(),
    };

    let mut logger = env_logger::Builder::new();
    logger.filter_level(config.log_level).format_timestamp_micros();
    if let Some(path) = &config.log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        logger.target(env_logger::Target::Pipe(Box::new(file)));
    }
    logger.init();

    info!("Starting anopheles_scan with args: {:?}", cli_args);

    let num_threads = config.num_threads();
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    match &cli_args.command {
        cli::Command::Pbs(args) => commands::pbs(args, &config)?,
        cli::Command::Haplen(args) => commands::haplen(args)?,
        cli::Command::Pca(args) => commands::pca(args, &config)?,
        cli::Command::Karyotype(args) => commands::karyotype(args)?,
    }

    info!(
        "anopheles_scan finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn progress_bar(len: u64, unit: &str) -> Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) {{msg}}",
            unit
        ))
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(len).with_style(style))
}

/// Loads a metadata table and checks it against the VCF's sample order.
fn load_aligned_samples(path: &Path, source: &VcfCallSetSource, id_column: &str) -> Result<SampleTable> {
    let table = SampleTable::read(path)
        .with_context(|| format!("Failed to read sample metadata {}", path.display()))?;
    let names = source.sample_names()?;
    if table.n_rows() != names.len() {
        return Err(anyhow!(
            "Sample metadata {} has {} rows but {} has {} samples.",
            path.display(),
            table.n_rows(),
            source.path.display(),
            names.len()
        ));
    }
    if let Ok(ids) = table.column(id_column) {
        if let Some((i, (id, name))) = ids
            .iter()
            .zip(&names)
            .enumerate()
            .find(|(_, (id, name))| **id != name.as_str())
        {
            return Err(anyhow!(
                "Sample metadata row {} is '{}' but VCF sample {} is '{}'; tables must follow VCF sample order.",
                i, id, i, name
            ));
        }
    } else {
        debug!("No '{}' column in {}; assuming VCF sample order.", id_column, path.display());
    }
    Ok(table)
}

mod commands {
    use super::*;

    pub(crate) fn pbs(args: &cli::PbsArgs, config: &RunConfig) -> Result<()> {
        let window = WindowSpec::new(args.window_size, args.window_step)?;

        let mut focal_source = VcfCallSetSource::new(&args.vcf, &args.contig);
        let mut outgroup_source = VcfCallSetSource::new(&args.outgroup_vcf, &args.contig);
        if let Some(filter) = &args.site_filter {
            focal_source = focal_source.with_site_filter(filter);
            outgroup_source = outgroup_source.with_site_filter(filter);
        }
        let metadata = load_aligned_samples(&args.metadata, &focal_source, &args.sample_id_column)?;

        let mut partitioner = CohortPartitioner::new(args.columns.clone(), &args.comparator, args.min_pop_size)?;
        if let Some(exclude) = &args.exclude {
            let excluded = read_excluded_ids(exclude, &args.sample_id_column)?;
            partitioner = partitioner.with_exclusions(&args.sample_id_column, excluded);
        }
        let comparisons = partitioner.partition(&metadata)?;
        if comparisons.is_empty() {
            return Err(anyhow!("No cohort comparison meets the minimum population size of {}.", args.min_pop_size));
        }

        let outgroup_species = match &args.outgroup_metadata {
            Some(path) => {
                let table = load_aligned_samples(path, &outgroup_source, &args.sample_id_column)?;
                Some(
                    table
                        .column(&args.outgroup_species_column)?
                        .into_iter()
                        .map(String::from)
                        .collect::<Vec<_>>(),
                )
            }
            None => None,
        };

        let focal = focal_source.materialize()?;
        let outgroup_callset = outgroup_source.materialize()?;
        let outgroup = Outgroup {
            callset: &outgroup_callset,
            species: outgroup_species.as_deref(),
        };

        let mut sink = TsvSink::new(&args.out_dir, config.clone());
        let pb = progress_bar(comparisons.len() as u64, "cohorts")?;
        let n = run_pbs_scan(&focal, &outgroup, &comparisons, window, &mut sink, &pb)?;
        pb.finish_with_message("PBS complete.");
        info!("Exported PBS for {} cohort comparisons on {}.", n, args.contig);
        Ok(())
    }

    pub(crate) fn haplen(args: &cli::HaplenArgs) -> Result<()> {
        let variants = read_rare_variants(&args.pairs)
            .with_context(|| format!("Failed to read rare-variant pairs {}", args.pairs.display()))?;
        let n_contig = variants.iter().filter(|v| v.contig == args.contig).count();
        info!("{} of {} rare-variant pairs are on {}.", n_contig, variants.len(), args.contig);

        let callset = VcfCallSetSource::new(&args.vcf, &args.contig).materialize()?;
        let out = haplen_output_path(&args.out_dir, &args.contig);
        let pb = progress_bar(n_contig as u64, "pairs")?;
        run_haplen_scan(&callset, &variants, &out, &pb)?;
        pb.finish_with_message("Haplotype lengths complete.");
        Ok(())
    }

    pub(crate) fn karyotype(args: &cli::KaryotypeArgs) -> Result<()> {
        let tags = read_tag_positions(&args.targets)
            .with_context(|| format!("Failed to read tag SNPs {}", args.targets.display()))?;
        let source = VcfCallSetSource::new(&args.vcf, &args.contig);
        let sample_ids = source.sample_names()?;
        let callset = source.materialize()?;

        let scores = score_karyotypes(&callset, &tags)?;
        let out = karyotype_output_path(&args.out_dir, &args.inversion);
        write_scores(&out, &args.inversion, &sample_ids, &scores)?;
        info!("Karyotyped {} samples for {}.", scores.len(), args.inversion);
        Ok(())
    }

    pub(crate) fn pca(args: &cli::PcaArgs, config: &RunConfig) -> Result<()> {
        let mut source = VcfCallSetSource::new(&args.vcf, &args.contig);
        if let Some(filter) = &args.site_filter {
            source = source.with_site_filter(filter);
        }
        let samples = load_aligned_samples(&args.metadata, &source, &args.sample_id_column)?;

        let params = PcaParams {
            region_start: args.region_start,
            region_stop: args.region_stop,
            sample_sets: args.sample_sets.clone(),
            sample_query: args.sample_query.clone(),
            site_mask: args.site_mask.clone(),
            min_minor_ac: args.min_minor_ac,
            max_an_missing: args.max_an_missing,
            n_snps: args.n_snps,
            snp_offset: args.snp_offset,
            n_components: args.components,
            scaler: args.scaler.parse()?,
            ld_prune: if args.no_ld_prune {
                None
            } else {
                Some(LdPrune::new(
                    args.ld_window_size,
                    args.ld_window_step,
                    args.ld_threshold,
                    args.ld_iterations,
                )?)
            },
            ..PcaParams::new(&args.contig)
        };

        let callset = source.materialize()?;
        let cache = FsCacheStore::new(&args.results_dir);
        let result = PcaRunner::new(&cache).run(&params, &callset, &samples)?;

        let evr_text: Vec<String> = result.evr.iter().map(|v| format!("{:.4}", v)).collect();
        info!("Explained variance ratios: [{}]", evr_text.join(", "));

        if let Some(dir) = &args.coords_dir {
            let mut sink = TsvSink::new(dir, config.clone());
            sink.coordinates(&result.table, (args.x_axis.as_str(), args.y_axis.as_str()))?;
        }
        Ok(())
    }
}

// --- Module Implementations ---

mod cli {
    use clap::{Args, Parser, Subcommand};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Selection scans and cached PCA for Anopheles call sets.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,

        /// Write log output here instead of stderr.
        #[arg(long, global = true)]
        pub(crate) log_file: Option<PathBuf>,

        #[arg(long, default_value_t = anopheles_scan::config::DEFAULT_SEED, global = true)]
        pub(crate) seed: u64,

        /// Coordinate jitter as a fraction of the axis range (0 disables).
        #[arg(long, default_value_t = 0.02, global = true)]
        pub(crate) jitter_frac: f64,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Windowed population branch statistic per cohort comparison.
        Pbs(PbsArgs),
        /// Haplotype lengths around rare variants shared by two samples.
        Haplen(HaplenArgs),
        /// PCA with a content-addressed result cache.
        Pca(PcaArgs),
        /// Inversion karyotype scores from genotypes at tag SNPs.
        Karyotype(KaryotypeArgs),
    }

    #[derive(Args, Debug)]
    pub(crate) struct PbsArgs {
        #[arg(long, required = true)]
        pub(crate) vcf: PathBuf,

        #[arg(short, long, required = true)]
        pub(crate) contig: String,

        #[arg(long)]
        pub(crate) site_filter: Option<PathBuf>,

        #[arg(long, required = true)]
        pub(crate) outgroup_vcf: PathBuf,

        #[arg(long)]
        pub(crate) outgroup_metadata: Option<PathBuf>,

        #[arg(long, default_value = "species")]
        pub(crate) outgroup_species_column: String,

        #[arg(short, long, required = true)]
        pub(crate) metadata: PathBuf,

        #[arg(long, default_value = "sample_id")]
        pub(crate) sample_id_column: String,

        #[arg(long, required = true, value_delimiter = ',')]
        pub(crate) columns: Vec<String>,

        #[arg(long, required = true)]
        pub(crate) comparator: String,

        #[arg(long, default_value_t = 10)]
        pub(crate) min_pop_size: usize,

        /// Table whose id column lists samples to leave out (e.g. sib groups).
        #[arg(long)]
        pub(crate) exclude: Option<PathBuf>,

        #[arg(long, required = true)]
        pub(crate) window_size: usize,

        #[arg(long, required = true)]
        pub(crate) window_step: usize,

        #[arg(short, long = "out", required = true)]
        pub(crate) out_dir: PathBuf,
    }

    #[derive(Args, Debug)]
    pub(crate) struct HaplenArgs {
        #[arg(long, required = true)]
        pub(crate) vcf: PathBuf,

        #[arg(short, long, required = true)]
        pub(crate) contig: String,

        /// Tab-separated `contig pos idx1 idx2` table.
        #[arg(long, required = true)]
        pub(crate) pairs: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) out_dir: PathBuf,
    }

    #[derive(Args, Debug)]
    pub(crate) struct KaryotypeArgs {
        #[arg(long, required = true)]
        pub(crate) vcf: PathBuf,

        #[arg(short, long, required = true)]
        pub(crate) contig: String,

        /// Inversion name used in the output (e.g. 2La).
        #[arg(short, long, required = true)]
        pub(crate) inversion: String,

        /// Tag SNP positions, one per line.
        #[arg(long, required = true)]
        pub(crate) targets: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) out_dir: PathBuf,
    }

    #[derive(Args, Debug)]
    pub(crate) struct PcaArgs {
        #[arg(long, required = true)]
        pub(crate) vcf: PathBuf,

        #[arg(short, long, required = true)]
        pub(crate) contig: String,

        #[arg(long)]
        pub(crate) site_filter: Option<PathBuf>,

        #[arg(short, long, required = true)]
        pub(crate) metadata: PathBuf,

        #[arg(long, default_value = "sample_id")]
        pub(crate) sample_id_column: String,

        #[arg(long, required = true)]
        pub(crate) results_dir: PathBuf,

        #[arg(long)]
        pub(crate) region_start: Option<i64>,

        #[arg(long)]
        pub(crate) region_stop: Option<i64>,

        #[arg(long, default_value = "")]
        pub(crate) sample_sets: String,

        #[arg(long)]
        pub(crate) sample_query: Option<String>,

        #[arg(long, default_value = "gamb_colu")]
        pub(crate) site_mask: String,

        #[arg(long, default_value_t = 3)]
        pub(crate) min_minor_ac: i32,

        #[arg(long, default_value_t = 0)]
        pub(crate) max_an_missing: i32,

        #[arg(long, default_value_t = 100_000)]
        pub(crate) n_snps: usize,

        #[arg(long, default_value_t = 0)]
        pub(crate) snp_offset: usize,

        #[arg(short = 'k', long, default_value_t = 10)]
        pub(crate) components: usize,

        #[arg(long, default_value = "patterson")]
        pub(crate) scaler: String,

        /// Skip LD pruning of the selected sites.
        #[arg(long)]
        pub(crate) no_ld_prune: bool,

        #[arg(long, default_value_t = 500)]
        pub(crate) ld_window_size: usize,

        #[arg(long, default_value_t = 200)]
        pub(crate) ld_window_step: usize,

        /// Sites with r^2 above this against an earlier site in the window are removed.
        #[arg(long, default_value_t = 0.2)]
        pub(crate) ld_threshold: f64,

        #[arg(long, default_value_t = 1)]
        pub(crate) ld_iterations: usize,

        /// Also export jittered coordinates to this directory.
        #[arg(long)]
        pub(crate) coords_dir: Option<PathBuf>,

        #[arg(long, default_value = "PC1")]
        pub(crate) x_axis: String,

        #[arg(long, default_value = "PC2")]
        pub(crate) y_axis: String,
    }
}
