use clap::Parser;
use gasic_batch::commands::batch::{BatchConfig, BatchRunner};
use gasic_batch::commands::quality_check::run_quality_check;
use gasic_batch::correction::BootstrapConfig;
use gasic_batch::fetch::HttpFetcher;
use gasic_batch::ledger::RunLedger;
use gasic_batch::mapper::{self, MapperKind, MapperParams};
use gasic_batch::metafile::{DownloadPolicy, MetagenomeSource, Platform, SeqDb};
use gasic_batch::names::ReferenceRegistry;
use gasic_batch::seqfile;
use gasic_batch::similarity::CountMismatch;
use gasic_batch::simulator::{SimulatorKind, SimulatorOverrides};
use gasic_batch::tools;
use log::info;
use rayon::ThreadPoolBuilder;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(4).unwrap())]
    num_threads: NonZeroUsize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "1")]
    verbose: u8,
}

/// Similarity-corrected abundance estimation for batches of metagenomes.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// Download, map and correct every metagenome of a metadata table
    Batch {
        #[clap(flatten)]
        common: CommonOpts,

        /// Tab-delimited reference table: reference fasta and optional mapper index
        #[clap(short = 'n', long, value_parser)]
        names: PathBuf,

        /// Tab-delimited metadata table with a header line
        #[clap(short = 'm', long, value_parser)]
        metadata: PathBuf,

        /// Sequence database of the metadata table (MGRAST or SRA)
        #[clap(short = 'd', long, default_value = "MGRAST")]
        seq_db: String,

        /// Output of a previous run; metagenomes found there are replayed, not recomputed
        #[clap(short = 'l', long, value_parser)]
        last_run: Option<PathBuf>,

        /// Output file (stdout if not given)
        #[clap(short = 'o', long, value_parser)]
        output: Option<PathBuf>,

        /// MG-RAST processing stages to download from, in order
        #[clap(long, value_delimiter = ',', default_value = "150,100")]
        stages: Vec<u32>,

        /// Download URL prefix
        #[clap(long, default_value = gasic_batch::metafile::DEFAULT_BASE_URL)]
        base_url: String,

        /// Download attempts per stage
        #[clap(long, default_value_t = gasic_batch::metafile::DEFAULT_MAX_ITERATIONS)]
        max_iterations: u32,

        /// HTTP timeout in seconds
        #[clap(long, default_value_t = 600)]
        timeout: u64,

        /// Read mapper
        #[clap(long, default_value = "bowtie2")]
        mapper: String,

        /// Read simulator
        #[clap(long, default_value = "mason")]
        simulator: String,

        /// Extra mapper option as key=value (passed as -key value); repeatable
        #[clap(long = "mapper-param", value_parser = MapperParams::parse_pair)]
        mapper_params: Vec<(String, String)>,

        /// Build missing mapper indexes before processing
        #[clap(long, action)]
        build_index: bool,

        /// Skip metagenomes sequenced on this platform (illumina, 454, sanger); repeatable
        #[clap(long = "skip-platform", value_parser)]
        skip_platforms: Vec<Platform>,

        /// Skip metagenomes with fewer reads
        #[clap(long, default_value_t = 1)]
        min_reads: usize,

        /// Number of reads simulated per reference
        #[clap(long, value_parser)]
        sim_reads: Option<usize>,

        /// Fixed simulated read length instead of the observed one
        #[clap(long, value_parser)]
        sim_read_length: Option<usize>,

        /// Extra simulator argument; repeatable
        #[clap(long = "sim-arg", allow_hyphen_values = true)]
        sim_args: Vec<String>,

        /// What to do when references yield different numbers of simulated reads (warn or fail)
        #[clap(long, default_value = "warn")]
        on_count_mismatch: CountMismatch,

        /// Number of bootstrap samples (1 disables resampling)
        #[clap(short = 'b', long, default_value_t = 100)]
        bootstrap: usize,

        /// Seed of the bootstrap resampling
        #[clap(long, default_value_t = 0)]
        seed: u64,

        /// Abundance threshold of the p-value
        #[clap(long, default_value_t = 5e-4)]
        threshold: f64,

        /// Concurrent mapper and simulator processes
        #[clap(short = 'c', long, value_parser, default_value_t = NonZeroUsize::new(1).unwrap())]
        concurrency: NonZeroUsize,

        /// Directory for per-metagenome workspaces (system temp dir if not given)
        #[clap(long, value_parser)]
        temp_dir: Option<PathBuf>,

        /// Keep per-metagenome workspaces for inspection
        #[clap(long, action)]
        keep_temp: bool,
    },
    /// Report mapping and coverage statistics of SAM files
    QualityCheck {
        #[clap(flatten)]
        common: CommonOpts,

        /// SAM files to analyze
        #[clap(required = true, value_parser)]
        sam_files: Vec<PathBuf>,

        /// Directory for the <name>_info.txt reports
        #[clap(short = 'o', long, value_parser, default_value = ".")]
        outdir: PathBuf,
    },
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Batch {
            common,
            names,
            metadata,
            seq_db,
            last_run,
            output,
            stages,
            base_url,
            max_iterations,
            timeout,
            mapper,
            simulator,
            mapper_params,
            build_index,
            skip_platforms,
            min_reads,
            sim_reads,
            sim_read_length,
            sim_args,
            on_count_mismatch,
            bootstrap,
            seed,
            threshold,
            concurrency,
            temp_dir,
            keep_temp,
        } => {
            initialize(&common)?;

            if bootstrap == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "--bootstrap must be at least 1",
                ));
            }
            if !(0.0..=1.0).contains(&threshold) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "--threshold must be in [0, 1]",
                ));
            }

            // Executables are checked before anything else is read
            let search_path = tools::default_search_path();
            let mapper = mapper.parse::<MapperKind>()?.resolve(&search_path)?;
            let simulator = simulator.parse::<SimulatorKind>()?.resolve(&search_path)?;

            let registry = ReferenceRegistry::from_path(&names)?;
            info!("Loaded {} references from {}", registry.len(), names.display());
            if build_index {
                mapper::ensure_indexes(mapper.as_ref(), &registry)?;
            }

            let policy = DownloadPolicy {
                base_url,
                stages,
                max_iterations,
                sample_lines: seqfile::DEFAULT_SAMPLE_LINES,
            };
            let source = MetagenomeSource::from_path(&metadata, seq_db.parse::<SeqDb>()?, policy)?;
            let ledger = match last_run {
                Some(path) => RunLedger::from_path(path)?,
                None => RunLedger::default(),
            };
            let fetcher = HttpFetcher::new(Duration::from_secs(timeout))?;

            let config = BatchConfig {
                concurrency: concurrency.get(),
                bootstrap: BootstrapConfig {
                    samples: bootstrap,
                    seed,
                    threshold,
                },
                skip_platforms,
                min_reads,
                keep_temp,
                temp_root: temp_dir,
                mapper_params: MapperParams(mapper_params),
                sim_overrides: SimulatorOverrides {
                    read_count: sim_reads,
                    read_length: sim_read_length,
                    extra_args: sim_args,
                },
                count_mismatch: on_count_mismatch,
                sample_lines: seqfile::DEFAULT_SAMPLE_LINES,
            };

            let out: Box<dyn Write> = match output {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let mut runner = BatchRunner::new(
                config,
                registry,
                source,
                mapper.as_ref(),
                simulator.as_ref(),
                &fetcher,
                ledger,
            );
            runner.run(out)?;
        }
        Args::QualityCheck {
            common,
            sam_files,
            outdir,
        } => {
            initialize(&common)?;
            let written = run_quality_check(&sam_files, &outdir)?;
            info!("Wrote {} reports to {}", written.len(), outdir.display());
        }
    }

    Ok(())
}

/// Initialize logging and the global thread pool
fn initialize(common: &CommonOpts) -> io::Result<()> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(common.num_threads.into())
        .build_global()
        .map_err(|e| io::Error::other(format!("Failed to configure thread pool: {}", e)))
}
