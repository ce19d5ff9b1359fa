//! Read mapping through an external short-read mapper.
//!
//! Mapping runs on a dedicated rayon pool sized by the requested
//! concurrency. Workers only return paths; the caller stores them in the
//! registry once the whole fan-out has joined.

use crate::names::ReferenceRegistry;
use crate::similarity::PairwiseOutput;
use crate::tools::{non_empty_file, require_executable, run_logged};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

/// Extra `key=value` mapper options, passed as `-key value`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperParams(pub Vec<(String, String)>);

impl MapperParams {
    /// Parse `key=value` or bare `key` (a flag without value)
    pub fn parse_pair(s: &str) -> io::Result<(String, String)> {
        let (key, value) = s.split_once('=').unwrap_or((s, ""));
        let key = key.trim();
        if key.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid mapper parameter '{}': expected key=value", s),
            ));
        }
        Ok((key.to_string(), value.trim().to_string()))
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for (key, value) in &self.0 {
            args.push(format!("-{}", key));
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        args
    }
}

/// A short-read mapper that writes SAM
pub trait ReadMapper: Sync {
    fn name(&self) -> &'static str;

    /// Map `reads` (fasta) against `index`, writing `sam`. The exit status is
    /// logged but not judged; callers check the output file.
    fn map(&self, index: &Path, reads: &Path, sam: &Path, params: &MapperParams) -> io::Result<()>;

    fn has_index(&self, index: &Path) -> bool;

    fn build_index(&self, reference: &Path, index: &Path) -> io::Result<()>;
}

/// Supported mappers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    Bowtie2,
}

impl FromStr for MapperKind {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bowtie2" => Ok(MapperKind::Bowtie2),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapper \"{}\" not implemented", s),
            )),
        }
    }
}

impl MapperKind {
    /// Locate the mapper's executables, failing before any work is done
    pub fn resolve(&self, search_path: &OsStr) -> io::Result<Box<dyn ReadMapper>> {
        match self {
            MapperKind::Bowtie2 => Ok(Box::new(Bowtie2 {
                exe: require_executable("bowtie2", search_path)?,
                build_exe: require_executable("bowtie2-build", search_path)?,
            })),
        }
    }
}

pub struct Bowtie2 {
    exe: PathBuf,
    build_exe: PathBuf,
}

impl ReadMapper for Bowtie2 {
    fn name(&self) -> &'static str {
        "bowtie2"
    }

    fn map(&self, index: &Path, reads: &Path, sam: &Path, params: &MapperParams) -> io::Result<()> {
        let mut command = Command::new(&self.exe);
        command
            .arg("-U")
            .arg(reads)
            .arg("-x")
            .arg(index)
            .arg("-S")
            .arg(sam)
            .arg("--local")
            .arg("-f")
            .args(params.to_args());
        let status = run_logged(command, &log_path(sam))?;
        if !status.success() {
            warn!("bowtie2 exited with {} while writing {}", status, sam.display());
        }
        Ok(())
    }

    fn has_index(&self, index: &Path) -> bool {
        ["1.bt2", "1.bt2l"].iter().any(|ext| {
            let mut p = index.as_os_str().to_os_string();
            p.push(".");
            p.push(ext);
            Path::new(&p).exists()
        })
    }

    fn build_index(&self, reference: &Path, index: &Path) -> io::Result<()> {
        let mut command = Command::new(&self.build_exe);
        command.arg(reference).arg(index);
        let mut log = index.as_os_str().to_os_string();
        log.push(".build.log");
        let status = run_logged(command, Path::new(&log))?;
        if !status.success() || !self.has_index(index) {
            return Err(io::Error::other(format!(
                "bowtie2-build failed for '{}' (exit {})",
                reference.display(),
                status
            )));
        }
        Ok(())
    }
}

fn log_path(output: &Path) -> PathBuf {
    let mut p = output.as_os_str().to_os_string();
    p.push(".log");
    PathBuf::from(p)
}

fn worker_pool(concurrency: usize) -> io::Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()
        .map_err(|e| io::Error::other(format!("Failed to build mapper pool: {}", e)))
}

fn check_outputs<'a>(sams: impl IntoIterator<Item = &'a Path>) -> io::Result<()> {
    for sam in sams {
        if !non_empty_file(sam) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Mapper produced no output at '{}' (see {})",
                    sam.display(),
                    log_path(sam).display()
                ),
            ));
        }
    }
    Ok(())
}

/// Build every missing index of the registry, one reference at a time
pub fn ensure_indexes(mapper: &dyn ReadMapper, registry: &ReferenceRegistry) -> io::Result<()> {
    for reference in registry.iter() {
        if mapper.has_index(&reference.index_file) {
            debug!("Index found for {}", reference.name());
            continue;
        }
        info!(
            "Building {} index {} from {}",
            mapper.name(),
            reference.index_file.display(),
            reference.ref_file.display()
        );
        mapper.build_index(&reference.ref_file, &reference.index_file)?;
    }
    Ok(())
}

/// Map `reads` against every reference. Returns one SAM path per
/// reference, in registry order.
pub fn map_parallel(
    mapper: &dyn ReadMapper,
    registry: &ReferenceRegistry,
    reads: &Path,
    outdir: &Path,
    params: &MapperParams,
    concurrency: usize,
) -> io::Result<Vec<PathBuf>> {
    let stem = reads
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reads".to_string());
    let jobs: Vec<(PathBuf, PathBuf)> = registry
        .iter()
        .map(|r| {
            (
                r.index_file.clone(),
                outdir.join(format!("{}.{}.sam", stem, r.row_index)),
            )
        })
        .collect();

    info!(
        "Mapping {} against {} references ({} workers)",
        reads.display(),
        jobs.len(),
        concurrency
    );
    let pool = worker_pool(concurrency)?;
    let sams: Vec<PathBuf> = pool.install(|| {
        jobs.par_iter()
            .map(|(index, sam)| mapper.map(index, reads, sam, params).map(|_| sam.clone()))
            .collect::<io::Result<_>>()
    })?;
    check_outputs(sams.iter().map(|p| p.as_path()))?;
    Ok(sams)
}

/// One pairwise job: simulated reads of `query` against the index of `subject`
#[derive(Debug, Clone)]
pub struct Comparison {
    pub query: usize,
    pub subject: usize,
    pub subject_index: PathBuf,
    pub query_reads: PathBuf,
}

/// Full query x subject cross product over the registry's simulated reads
pub fn all_comparisons(registry: &ReferenceRegistry) -> io::Result<Vec<Comparison>> {
    let mut comparisons = Vec::with_capacity(registry.len() * registry.len());
    for query in registry.iter() {
        let reads = query.sim_reads().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("No simulated reads for reference {}", query.name()),
            )
        })?;
        for subject in registry.iter() {
            comparisons.push(Comparison {
                query: query.row_index,
                subject: subject.row_index,
                subject_index: subject.index_file.clone(),
                query_reads: reads.to_path_buf(),
            });
        }
    }
    Ok(comparisons)
}

/// Map each comparison into a uniquely named SAM in `outdir`.
/// Results keep the order of `comparisons`.
pub fn map_pairwise(
    mapper: &dyn ReadMapper,
    comparisons: &[Comparison],
    outdir: &Path,
    params: &MapperParams,
    concurrency: usize,
) -> io::Result<Vec<PairwiseOutput>> {
    info!(
        "Mapping simulated reads pairwise: {} comparisons ({} workers)",
        comparisons.len(),
        concurrency
    );
    let pool = worker_pool(concurrency)?;
    let outputs: Vec<PairwiseOutput> = pool.install(|| {
        comparisons
            .par_iter()
            .map(|c| -> io::Result<PairwiseOutput> {
                let sam = tempfile::Builder::new()
                    .prefix(&format!("{}-{}.", c.query, c.subject))
                    .suffix(".sam")
                    .rand_bytes(6)
                    .tempfile_in(outdir)?
                    .into_temp_path()
                    .keep()
                    .map_err(|e| e.error)?;
                mapper.map(&c.subject_index, &c.query_reads, &sam, params)?;
                Ok(PairwiseOutput {
                    query: c.query,
                    subject: c.subject,
                    sam_file: sam,
                })
            })
            .collect::<io::Result<_>>()
    })?;
    check_outputs(outputs.iter().map(|o| o.sam_file.as_path()))?;
    Ok(outputs)
}
