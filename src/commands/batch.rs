use crate::correction::{correct_abundances, BootstrapConfig, CorrectionResult, MappedMatrix};
use crate::fetch::Fetcher;
use crate::ledger::RunLedger;
use crate::mapper::{self, MapperParams, ReadMapper};
use crate::metafile::{MetagenomeRow, MetagenomeSource, Platform};
use crate::names::ReferenceRegistry;
use crate::output::{OutputWriter, SoftFailure};
use crate::seqfile;
use crate::similarity::{build_similarity_tensor, CountMismatch, TensorError};
use crate::simulator::{self, ReadSimulator, SimulatorOverrides, SimulatorParams};
use log::{debug, error, info, warn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Configuration for the batch command
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Concurrent mapper and simulator processes
    pub concurrency: usize,
    pub bootstrap: BootstrapConfig,
    /// Platforms whose metagenomes are skipped
    pub skip_platforms: Vec<Platform>,
    /// Metagenomes with fewer reads are skipped
    pub min_reads: usize,
    pub keep_temp: bool,
    /// Parent of the per-metagenome workspaces; system temp dir if None
    pub temp_root: Option<PathBuf>,
    pub mapper_params: MapperParams,
    pub sim_overrides: SimulatorOverrides,
    pub count_mismatch: CountMismatch,
    pub sample_lines: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            concurrency: 1,
            bootstrap: BootstrapConfig::default(),
            skip_platforms: Vec::new(),
            min_reads: 1,
            keep_temp: false,
            temp_root: None,
            mapper_params: MapperParams::default(),
            sim_overrides: SimulatorOverrides::default(),
            count_mismatch: CountMismatch::default(),
            sample_lines: seqfile::DEFAULT_SAMPLE_LINES,
        }
    }
}

/// Per-metagenome pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    FormatNormalizing,
    StatsComputing,
    PlatformChecking,
    Mapping,
    Simulating,
    PairwiseMapping,
    MatrixBuilding,
    Correcting,
    Emitting,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Downloading => "downloading reads",
            Stage::FormatNormalizing => "normalizing read format",
            Stage::StatsComputing => "computing read statistics",
            Stage::PlatformChecking => "checking platform",
            Stage::Mapping => "mapping reads",
            Stage::Simulating => "simulating reads",
            Stage::PairwiseMapping => "mapping simulated reads",
            Stage::MatrixBuilding => "building similarity matrix",
            Stage::Correcting => "correcting abundances",
            Stage::Emitting => "writing results",
        };
        write!(f, "{}", s)
    }
}

/// Counts of metagenomes by outcome
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub replayed: usize,
    pub soft_failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.completed + self.replayed + self.soft_failed
    }
}

enum Outcome {
    Corrected(CorrectionResult),
    Skipped(SoftFailure),
}

/// Runs the abundance correction for every metagenome of a metadata table,
/// strictly one metagenome at a time
pub struct BatchRunner<'a> {
    config: BatchConfig,
    registry: ReferenceRegistry,
    source: MetagenomeSource,
    mapper: &'a dyn ReadMapper,
    simulator: &'a dyn ReadSimulator,
    fetcher: &'a dyn Fetcher,
    ledger: RunLedger,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        config: BatchConfig,
        registry: ReferenceRegistry,
        source: MetagenomeSource,
        mapper: &'a dyn ReadMapper,
        simulator: &'a dyn ReadSimulator,
        fetcher: &'a dyn Fetcher,
        ledger: RunLedger,
    ) -> Self {
        BatchRunner {
            config,
            registry,
            source,
            mapper,
            simulator,
            fetcher,
            ledger,
        }
    }

    pub fn registry(&self) -> &ReferenceRegistry {
        &self.registry
    }

    /// Process all metagenomes, writing rows to `out`. Soft failures become
    /// error rows; any other error aborts the batch, naming the metagenome
    /// it happened on.
    pub fn run<W: Write>(&mut self, out: W) -> io::Result<BatchSummary> {
        let mut writer = OutputWriter::new(out);
        let mut summary = BatchSummary::default();
        info!(
            "Processing {} metagenomes against {} references",
            self.source.len(),
            self.registry.len()
        );

        let mut rows = self.source.rows();
        while let Some(row) = rows.next() {
            let mut row = row?;

            if let Some(lines) = self.ledger.rows(&row.id) {
                info!("{} already processed; replaying {} rows", row.id, lines.len());
                writer.replay(lines)?;
                summary.replayed += 1;
                continue;
            }

            let mut builder = tempfile::Builder::new();
            let prefix = format!("{}.", row.id);
            builder.prefix(&prefix);
            let workspace = match &self.config.temp_root {
                Some(root) => builder.tempdir_in(root)?,
                None => builder.tempdir()?,
            };
            debug!("Workspace for {}: {}", row.id, workspace.path().display());

            self.registry.reset_outputs();
            let outcome = process_metagenome(
                &self.config,
                &mut self.registry,
                self.mapper,
                self.simulator,
                self.fetcher,
                &mut row,
                workspace.path(),
            );

            if self.config.keep_temp {
                let kept = workspace.keep();
                info!("Keeping workspace {}", kept.display());
            }
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Aborting the batch at {}: {}", row.id, e);
                    let pending: Vec<String> = rows.filter_map(|r| r.ok().map(|r| r.id)).collect();
                    if !pending.is_empty() {
                        error!("Not processed: {}", pending.join(", "));
                    }
                    return Err(io::Error::new(
                        e.kind(),
                        format!("Metagenome {}: {}", row.id, e),
                    ));
                }
            };

            log_stage(&row.id, Stage::Emitting);
            match outcome {
                Outcome::Corrected(result) => {
                    let names: Vec<String> = self.registry.iter().map(|r| r.name()).collect();
                    writer.write_result(&row.id, &names, &result)?;
                    summary.completed += 1;
                }
                Outcome::Skipped(failure) => {
                    warn!("Skipping {}: {}", row.id, failure.reason());
                    writer.write_error(&row.id, failure)?;
                    summary.soft_failed += 1;
                }
            }
        }

        info!(
            "Done: {} corrected, {} replayed, {} skipped",
            summary.completed, summary.replayed, summary.soft_failed
        );
        Ok(summary)
    }
}

fn log_stage(id: &str, stage: Stage) {
    info!("[{}] {}", id, stage);
}

fn process_metagenome(
    config: &BatchConfig,
    registry: &mut ReferenceRegistry,
    mapper: &dyn ReadMapper,
    simulator: &dyn ReadSimulator,
    fetcher: &dyn Fetcher,
    row: &mut MetagenomeRow,
    workdir: &Path,
) -> io::Result<Outcome> {
    let id = row.id.clone();

    log_stage(&id, Stage::Downloading);
    if !row.download(fetcher, workdir)? {
        return Ok(Outcome::Skipped(SoftFailure::NoReadFile));
    }

    log_stage(&id, Stage::FormatNormalizing);
    if let Err(e) = row.normalize_format() {
        warn!("Format conversion failed for {}: {}", id, e);
        return Ok(Outcome::Skipped(SoftFailure::FormatConversionError));
    }

    log_stage(&id, Stage::StatsComputing);
    let stats = match row.read_stats()? {
        Some(stats) if stats.count >= config.min_reads => stats,
        Some(stats) => {
            warn!("{} has {} reads, below the minimum of {}", id, stats.count, config.min_reads);
            return Ok(Outcome::Skipped(SoftFailure::NoReadFile));
        }
        None => return Ok(Outcome::Skipped(SoftFailure::NoReadFile)),
    };
    info!(
        "{}: {} reads, length min {} median {} mean {:.1} max {}",
        id, stats.count, stats.min, stats.median, stats.mean, stats.max
    );

    log_stage(&id, Stage::PlatformChecking);
    let platform = match row.platform() {
        Some(p) if config.skip_platforms.contains(&p) => {
            return Ok(Outcome::Skipped(SoftFailure::UndesiredPlatform))
        }
        Some(p) => p,
        None => return Ok(Outcome::Skipped(SoftFailure::UndeterminedPlatform)),
    };

    let reads = match row.read_file() {
        Some(read_file) => read_file.path.clone(),
        None => return Ok(Outcome::Skipped(SoftFailure::NoReadFile)),
    };

    log_stage(&id, Stage::Mapping);
    let sams = mapper::map_parallel(
        mapper,
        registry,
        &reads,
        workdir,
        &config.mapper_params,
        config.concurrency,
    )?;
    for (i, sam) in sams.into_iter().enumerate() {
        registry.set_sam_file(i, sam)?;
    }

    log_stage(&id, Stage::Simulating);
    let params = SimulatorParams::from_read_stats(Some(platform), &stats, &config.sim_overrides)?;
    let Some(simulated) = simulator::simulate_parallel(
        simulator,
        registry,
        workdir,
        &params,
        config.concurrency,
        config.sample_lines,
    )?
    else {
        return Ok(Outcome::Skipped(SoftFailure::SimulationError));
    };
    let sim_counts: Vec<usize> = simulated.iter().map(|(_, n)| *n).collect();
    for (i, (path, count)) in simulated.into_iter().enumerate() {
        registry.set_sim_reads(i, path, count)?;
    }

    log_stage(&id, Stage::PairwiseMapping);
    let comparisons = mapper::all_comparisons(registry)?;
    let pairwise = mapper::map_pairwise(
        mapper,
        &comparisons,
        workdir,
        &config.mapper_params,
        config.concurrency,
    )?;
    for p in &pairwise {
        registry.set_pairwise_sam(p.query, p.subject, p.sam_file.clone())?;
    }

    log_stage(&id, Stage::MatrixBuilding);
    let tensor = match build_similarity_tensor(
        registry.len(),
        &pairwise,
        &sim_counts,
        config.count_mismatch,
    ) {
        Ok(tensor) => tensor,
        Err(TensorError::CountMismatch { .. }) => {
            return Ok(Outcome::Skipped(SoftFailure::SimulationError))
        }
        Err(TensorError::Io(e)) => return Err(e),
    };

    log_stage(&id, Stage::Correcting);
    let mapped = MappedMatrix::from_sam_files(&registry.sam_files()?)?;
    let result = correct_abundances(&mapped, &tensor, &config.bootstrap)?;
    Ok(Outcome::Corrected(result))
}
