//! Read simulation through an external simulator.

use crate::metafile::Platform;
use crate::names::ReferenceRegistry;
use crate::seqfile::{self, ReadStats, SeqFormat};
use crate::tools::{non_empty_file, require_executable, run_logged};
use log::{info, warn};
use rayon::prelude::*;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_SIM_READS: usize = 10_000;
pub const MAX_TRIES: usize = 5;

/// User-supplied values taking precedence over the read statistics
#[derive(Debug, Clone, Default)]
pub struct SimulatorOverrides {
    pub read_count: Option<usize>,
    pub read_length: Option<usize>,
    /// Passed through verbatim before the output option
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LengthModel {
    Fixed(usize),
    Normal { mean: f64, stdev: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorParams {
    pub platform: Platform,
    pub read_count: usize,
    pub length: LengthModel,
    pub extra_args: Vec<String>,
}

impl SimulatorParams {
    /// Illumina reads get the median observed length; 454 and Sanger reads
    /// follow the observed mean and standard deviation
    pub fn from_read_stats(
        platform: Option<Platform>,
        stats: &ReadStats,
        overrides: &SimulatorOverrides,
    ) -> io::Result<Self> {
        let platform = platform.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot choose simulator parameters for an unknown platform",
            )
        })?;
        let length = match (platform, overrides.read_length) {
            (_, Some(len)) => LengthModel::Fixed(len),
            (Platform::Illumina, None) => LengthModel::Fixed(stats.median.round().max(1.0) as usize),
            (Platform::Roche454 | Platform::Sanger, None) => LengthModel::Normal {
                mean: stats.mean,
                stdev: stats.stdev,
            },
        };
        Ok(SimulatorParams {
            platform,
            read_count: overrides.read_count.unwrap_or(DEFAULT_SIM_READS),
            length,
            extra_args: overrides.extra_args.clone(),
        })
    }
}

/// A read simulator writing reads from one reference sequence
pub trait ReadSimulator: Sync {
    fn name(&self) -> &'static str;

    /// One attempt. Returns whether the simulator exited successfully.
    fn simulate(&self, reference: &Path, out: &Path, params: &SimulatorParams) -> io::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorKind {
    Mason,
}

impl FromStr for SimulatorKind {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mason" => Ok(SimulatorKind::Mason),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Simulator: \"{}\" not supported", s),
            )),
        }
    }
}

impl SimulatorKind {
    pub fn resolve(&self, search_path: &OsStr) -> io::Result<Box<dyn ReadSimulator>> {
        match self {
            SimulatorKind::Mason => Ok(Box::new(Mason {
                exe: require_executable("mason", search_path)?,
            })),
        }
    }
}

pub struct Mason {
    exe: PathBuf,
}

impl Mason {
    fn args(params: &SimulatorParams) -> Vec<String> {
        let mut args = vec![
            params.platform.as_str().to_string(),
            "-N".to_string(),
            params.read_count.to_string(),
        ];
        match params.length {
            LengthModel::Fixed(len) => {
                args.extend(["-n".to_string(), len.to_string()]);
                if params.platform == Platform::Illumina {
                    args.extend(["-hi", "0", "-hs", "0", "-sq"].map(String::from));
                }
            }
            LengthModel::Normal { mean, stdev } => {
                args.extend([
                    "-nm".to_string(),
                    format!("{:.0}", mean),
                    "-ns".to_string(),
                    format!("{:.0}", stdev),
                ]);
            }
        }
        args.extend(params.extra_args.iter().cloned());
        args
    }
}

impl ReadSimulator for Mason {
    fn name(&self) -> &'static str {
        "mason"
    }

    fn simulate(&self, reference: &Path, out: &Path, params: &SimulatorParams) -> io::Result<bool> {
        let mut command = std::process::Command::new(&self.exe);
        command.args(Mason::args(params)).arg("-o").arg(out).arg(reference);
        let mut log = out.as_os_str().to_os_string();
        log.push(".log");
        let status = run_logged(command, Path::new(&log))?;

        // mason also writes the alignments of the simulated reads
        let mut by_product = out.as_os_str().to_os_string();
        by_product.push(".sam");
        let by_product = PathBuf::from(by_product);
        if by_product.exists() {
            fs::remove_file(&by_product)?;
        }
        Ok(status.success())
    }
}

/// Simulate, retry on failure, then normalise to fasta. Returns the fasta
/// path and read count, or None once every try failed.
fn simulate_reference(
    simulator: &dyn ReadSimulator,
    reference: &Path,
    stem: &str,
    outdir: &Path,
    params: &SimulatorParams,
    sample_lines: usize,
) -> io::Result<Option<(PathBuf, usize)>> {
    let raw = outdir.join(format!("{}_simReads.fq", stem));
    let mut ok = false;
    for attempt in 1..=MAX_TRIES {
        if simulator.simulate(reference, &raw, params)? && non_empty_file(&raw) {
            ok = true;
            break;
        }
        warn!(
            "{} failed for {} (try {}/{})",
            simulator.name(),
            reference.display(),
            attempt,
            MAX_TRIES
        );
    }
    if !ok {
        return Ok(None);
    }

    let format = match seqfile::detect_format(&raw, sample_lines) {
        Ok(format) => format,
        Err(e) => {
            warn!("Simulated reads {} unreadable: {}", raw.display(), e);
            return Ok(None);
        }
    };
    let fasta = match format {
        SeqFormat::Fasta => raw,
        SeqFormat::Fastq => {
            let fasta = outdir.join(format!("{}_simReads.fasta", stem));
            seqfile::fastq_to_fasta(&raw, &fasta)?;
            fs::remove_file(&raw)?;
            fasta
        }
    };
    let count = seqfile::count_records(&fasta, SeqFormat::Fasta)?;
    if count == 0 {
        warn!("No reads simulated from {}", reference.display());
        return Ok(None);
    }
    Ok(Some((fasta, count)))
}

/// Simulate reads for every reference, in registry order. None if any
/// reference failed to yield reads.
pub fn simulate_parallel(
    simulator: &dyn ReadSimulator,
    registry: &ReferenceRegistry,
    outdir: &Path,
    params: &SimulatorParams,
    concurrency: usize,
    sample_lines: usize,
) -> io::Result<Option<Vec<(PathBuf, usize)>>> {
    info!(
        "Simulating {} {} reads from each of {} references",
        params.read_count,
        params.platform,
        registry.len()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()
        .map_err(|e| io::Error::other(format!("Failed to build simulator pool: {}", e)))?;
    let results: Vec<Option<(PathBuf, usize)>> = pool.install(|| {
        registry
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|r| {
                let stem = format!(
                    "{}_{}",
                    r.ref_file
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "ref".to_string()),
                    r.row_index
                );
                simulate_reference(simulator, &r.ref_file, &stem, outdir, params, sample_lines)
            })
            .collect::<io::Result<_>>()
    })?;
    Ok(results.into_iter().collect())
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::mapper::tests::install_script;

    /// Stand-in for mason: writes `-N` fastq reads to `-o`, plus a SAM by-product
    pub(crate) const FAKE_MASON: &str = r#"#!/bin/sh
n=10
while [ $# -gt 0 ]; do
  case "$1" in
    -N) n="$2"; shift ;;
    -o) out="$2"; shift ;;
  esac
  shift
done
i=1
: > "$out"
while [ "$i" -le "$n" ]; do
  printf '@sim%s\nACGTACGTAC\n+\nIIIIIIIIII\n' "$i" >> "$out"
  i=$((i + 1))
done
touch "$out.sam"
echo "simulated $n reads"
"#;

    fn stats(lengths: &[usize]) -> ReadStats {
        ReadStats::from_lengths(lengths).unwrap()
    }

    pub(crate) fn fake_simulator(bin: &Path) -> Box<dyn ReadSimulator> {
        install_script(bin, "mason", FAKE_MASON);
        let search = std::env::join_paths([bin]).unwrap();
        SimulatorKind::Mason.resolve(&search).unwrap()
    }

    #[test]
    fn test_params_by_platform() {
        let s = stats(&[70, 72, 75, 100]);
        let overrides = SimulatorOverrides::default();
        let illumina = SimulatorParams::from_read_stats(Some(Platform::Illumina), &s, &overrides).unwrap();
        assert_eq!(illumina.read_count, DEFAULT_SIM_READS);
        assert_eq!(illumina.length, LengthModel::Fixed(74));
        assert_eq!(
            Mason::args(&illumina),
            vec!["illumina", "-N", "10000", "-n", "74", "-hi", "0", "-hs", "0", "-sq"]
        );

        let roche = SimulatorParams::from_read_stats(Some(Platform::Roche454), &s, &overrides).unwrap();
        assert!(matches!(roche.length, LengthModel::Normal { .. }));
        assert_eq!(&Mason::args(&roche)[..4], &["454", "-N", "10000", "-nm"]);

        let err = SimulatorParams::from_read_stats(None, &s, &overrides).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_overrides() {
        let overrides = SimulatorOverrides {
            read_count: Some(50),
            read_length: Some(100),
            extra_args: vec!["-s".to_string(), "7".to_string()],
        };
        let params =
            SimulatorParams::from_read_stats(Some(Platform::Sanger), &stats(&[800]), &overrides).unwrap();
        assert_eq!(params.read_count, 50);
        assert_eq!(
            Mason::args(&params),
            vec!["sanger", "-N", "50", "-n", "100", "-s", "7"]
        );
    }

    #[test]
    fn test_unknown_simulator() {
        assert!("grinder".parse::<SimulatorKind>().is_err());
    }

    #[test]
    fn test_simulate_parallel() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let simulator = fake_simulator(bin.path());
        let registry = ReferenceRegistry::from_rows(vec![
            (work.path().join("a.fa"), work.path().join("a.fa")),
            (work.path().join("b.fa"), work.path().join("b.fa")),
        ]);
        let params = SimulatorParams {
            platform: Platform::Illumina,
            read_count: 25,
            length: LengthModel::Fixed(10),
            extra_args: Vec::new(),
        };

        let sims = simulate_parallel(simulator.as_ref(), &registry, work.path(), &params, 2, 400)
            .unwrap()
            .unwrap();
        assert_eq!(sims.len(), 2);
        assert_eq!(sims[0].0, work.path().join("a_0_simReads.fasta"));
        assert_eq!(sims[1].1, 25);
        assert!(!work.path().join("a_0_simReads.fq").exists());
        assert!(!work.path().join("a_0_simReads.fq.sam").exists());
        assert!(work.path().join("b_1_simReads.fq.log").exists());
    }

    /// mason stand-in that records each call in `counter` and fails the
    /// first `failures` calls
    fn flaky_simulator(bin: &Path, counter: &Path, failures: usize) -> Box<dyn ReadSimulator> {
        let script = format!(
            "#!/bin/sh\necho call >> '{}'\ncalls=$(wc -l < '{}')\n[ \"$calls\" -gt {} ] || exit 1\n{}",
            counter.display(),
            counter.display(),
            failures,
            FAKE_MASON.trim_start_matches("#!/bin/sh\n")
        );
        install_script(bin, "mason", &script);
        let search = std::env::join_paths([bin]).unwrap();
        SimulatorKind::Mason.resolve(&search).unwrap()
    }

    fn calls(counter: &Path) -> usize {
        fs::read_to_string(counter).unwrap_or_default().lines().count()
    }

    fn single_reference(dir: &Path) -> ReferenceRegistry {
        ReferenceRegistry::from_rows(vec![(dir.join("a.fa"), dir.join("a.fa"))])
    }

    fn small_params() -> SimulatorParams {
        SimulatorParams {
            platform: Platform::Illumina,
            read_count: 5,
            length: LengthModel::Fixed(10),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_simulator_retries_until_success() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let counter = work.path().join("calls.txt");
        let simulator = flaky_simulator(bin.path(), &counter, 2);

        let sims = simulate_parallel(
            simulator.as_ref(),
            &single_reference(work.path()),
            work.path(),
            &small_params(),
            1,
            400,
        )
        .unwrap()
        .unwrap();
        assert_eq!(calls(&counter), 3);
        assert_eq!(sims[0].1, 5);
    }

    #[test]
    fn test_failing_simulator_gives_up() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let counter = work.path().join("calls.txt");
        let simulator = flaky_simulator(bin.path(), &counter, 99);

        let result = simulate_parallel(
            simulator.as_ref(),
            &single_reference(work.path()),
            work.path(),
            &small_params(),
            1,
            400,
        )
        .unwrap();
        assert!(result.is_none());
        assert_eq!(calls(&counter), MAX_TRIES);
    }
}
