//! End-to-end tests of the batch pipeline.
//! bowtie2, bowtie2-build and mason are replaced by shell scripts and the
//! download server by an in-memory fetcher.
#![cfg(unix)]

use flate2::write::GzEncoder;
use flate2::Compression;
use gasic_batch::commands::batch::{BatchConfig, BatchRunner};
use gasic_batch::correction::BootstrapConfig;
use gasic_batch::fetch::{FetchResponse, Fetcher};
use gasic_batch::ledger::RunLedger;
use gasic_batch::mapper::MapperKind;
use gasic_batch::metafile::{DownloadPolicy, MetagenomeSource, SeqDb};
use gasic_batch::names::ReferenceRegistry;
use gasic_batch::simulator::{SimulatorKind, SimulatorOverrides};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const BOWTIE2: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -U) reads="$2"; shift ;;
    -x) index="$2"; shift ;;
    -S) sam="$2"; shift ;;
  esac
  shift
done
flag=0; rname=ref; pos=1; cigar=4M
case "$index" in *unmapped*) flag=4; rname='*'; pos=0; cigar='*' ;; esac
{
  printf '@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:ref\tLN:20\n'
  awk -v f="$flag" -v r="$rname" -v p="$pos" -v c="$cigar" \
    '/^>/ { n = substr($1, 2); printf "%s\t%s\t%s\t%s\t42\t%s\t*\t0\t0\tACGT\tIIII\n", n, f, r, p, c }' "$reads"
} > "$sam"
"#;

const BOWTIE2_BUILD: &str = "#!/bin/sh\ntouch \"$2.1.bt2\"\n";

const MASON: &str = r#"#!/bin/sh
n=10
while [ $# -gt 0 ]; do
  case "$1" in
    -N) n="$2"; shift ;;
    -o) out="$2"; shift ;;
  esac
  shift
done
awk -v n="$n" 'BEGIN { for (i = 1; i <= n; i++) printf "@sim%d\nACGTACGTAC\n+\nIIIIIIIIII\n", i }' > "$out"
touch "$out.sam"
"#;

struct MockServer {
    responses: HashMap<String, Vec<u8>>,
    requested: RefCell<Vec<String>>,
}

impl Fetcher for MockServer {
    fn get(&self, url: &str) -> io::Result<FetchResponse> {
        self.requested.borrow_mut().push(url.to_string());
        let (status, body) = match self.responses.get(url) {
            Some(body) => (200, body.clone()),
            None => (404, Vec::new()),
        };
        Ok(FetchResponse {
            status,
            body: Box::new(Cursor::new(body)),
        })
    }
}

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

fn install_tools(bin: &Path) {
    for (name, body) in [
        ("bowtie2", BOWTIE2),
        ("bowtie2-build", BOWTIE2_BUILD),
        ("mason", MASON),
    ] {
        let path = bin.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn metagenome_reads(n: usize) -> Vec<u8> {
    (0..n)
        .map(|i| format!(">read{}\nACGTACGTAC\n", i))
        .collect::<String>()
        .into_bytes()
}

fn write_names(dir: &Path) -> PathBuf {
    let names = dir.join("names.txt");
    fs::write(
        &names,
        format!(
            "{}\t{}\n{}\t{}\n",
            dir.join("ref_a.fa").display(),
            dir.join("ref_a").display(),
            dir.join("ref_b.fa").display(),
            dir.join("ref_b_unmapped").display()
        ),
    )
    .unwrap();
    for r in ["ref_a.fa", "ref_b.fa"] {
        fs::write(dir.join(r), ">chr\nACGTACGTACGTACGTACGT\n").unwrap();
    }
    names
}

fn policy() -> DownloadPolicy {
    DownloadPolicy {
        base_url: "http://mock".to_string(),
        ..Default::default()
    }
}

#[test]
fn test_single_metagenome_two_references() -> io::Result<()> {
    let bin = TempDir::new()?;
    let work = TempDir::new()?;
    install_tools(bin.path());
    let search = std::env::join_paths([bin.path()]).unwrap();
    let mapper = MapperKind::Bowtie2.resolve(&search)?;
    let simulator = SimulatorKind::Mason.resolve(&search)?;

    let registry = ReferenceRegistry::from_path(write_names(work.path()))?;
    let source = MetagenomeSource::from_reader(
        Cursor::new("id\tseq_method\nmgm0000001.3\tIllumina HiSeq\n"),
        SeqDb::Mgrast,
        policy(),
    )
    .unwrap();
    let server = MockServer {
        // first stage and iteration fails, the next iteration succeeds
        responses: HashMap::from([(
            "http://mock/mgm0000001.3?file=150.2".to_string(),
            gzip(&metagenome_reads(5000)),
        )]),
        requested: RefCell::new(Vec::new()),
    };
    let config = BatchConfig {
        concurrency: 2,
        bootstrap: BootstrapConfig {
            samples: 5,
            seed: 1,
            threshold: 5e-4,
        },
        sim_overrides: SimulatorOverrides {
            read_count: Some(50),
            ..Default::default()
        },
        temp_root: Some(work.path().to_path_buf()),
        ..Default::default()
    };

    let mut runner = BatchRunner::new(
        config,
        registry,
        source,
        mapper.as_ref(),
        simulator.as_ref(),
        &server,
        RunLedger::default(),
    );
    let mut out = Vec::new();
    let summary = runner.run(&mut out)?;
    assert_eq!(summary.completed, 1);
    assert_eq!(server.requested.borrow().len(), 2);

    let registry = runner.registry();
    assert_eq!(registry.get(0)?.sim_read_count(), Some(50));
    assert!(registry.get(1)?.pairwise_sam(0).is_some());

    let text = String::from_utf8(out).unwrap();
    let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.len(), 7);
        assert_eq!(row[0], "mgm0000001.3");
        assert_eq!(row[2], "5000");
        let corrected: f64 = row[4].parse().unwrap();
        assert!(corrected >= 0.0);
    }
    assert!(rows[0][1].ends_with("ref_a.fa"));
    assert!(rows[1][1].ends_with("ref_b.fa"));
    assert_eq!(rows[0][3], "5000");
    assert_eq!(rows[1][3], "0");

    // workspace removed after the metagenome
    let leftovers = fs::read_dir(work.path())?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("mgm0000001.3"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

fn gasic_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gasic-batch"))
}

#[test]
fn test_rerun_replays_last_run() -> io::Result<()> {
    let bin = TempDir::new()?;
    let work = TempDir::new()?;
    install_tools(bin.path());
    let names = write_names(work.path());

    let metadata = work.path().join("meta.tsv");
    fs::write(&metadata, "id\tseq_method\nmgm1234567.3\tIllumina\n")?;
    let prior = "mgm1234567.3\tref_a.fa\t100\t60\t0.600000\t0.010000\t0.000000\n\
                 mgm1234567.3\tref_b.fa\t100\t0\t0.000000\t0.000000\t1.000000\n";
    let last_run = work.path().join("last_run.tsv");
    fs::write(&last_run, prior)?;
    let output = work.path().join("out.tsv");

    let result = Command::new(gasic_binary())
        .env("PATH", bin.path())
        .args(["batch", "-v", "0", "--base-url", "http://127.0.0.1:9", "--max-iterations", "1"])
        .arg("--names")
        .arg(&names)
        .arg("--metadata")
        .arg(&metadata)
        .arg("--last-run")
        .arg(&last_run)
        .arg("--output")
        .arg(&output)
        .output()?;
    assert!(
        result.status.success(),
        "batch failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    assert_eq!(fs::read_to_string(&output)?, prior);
    Ok(())
}

#[test]
fn test_missing_mapper_is_fatal() -> io::Result<()> {
    let bin = TempDir::new()?;
    let work = TempDir::new()?;
    let names = write_names(work.path());
    let metadata = work.path().join("meta.tsv");
    fs::write(&metadata, "id\nmgm1234567.3\n")?;

    let result = Command::new(gasic_binary())
        .env("PATH", bin.path())
        .args(["batch", "-v", "0"])
        .arg("--names")
        .arg(&names)
        .arg("--metadata")
        .arg(&metadata)
        .output()?;
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("bowtie2"));
    assert!(stderr.contains("is not in your $PATH"));
    Ok(())
}

#[test]
fn test_quality_check_command() -> io::Result<()> {
    let work = TempDir::new()?;
    let sam = work.path().join("sample.sam");
    fs::write(
        &sam,
        "@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:ref\tLN:20\n\
         r1\t0\tref\t1\t42\t4M\t*\t0\t0\tACGT\tIIII\n\
         r2\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\tIIII\n",
    )?;
    let outdir = work.path().join("qc");

    let result = Command::new(gasic_binary())
        .args(["quality-check", "-v", "0"])
        .arg(&sam)
        .arg("--outdir")
        .arg(&outdir)
        .output()?;
    assert!(result.status.success());
    let report = fs::read_to_string(outdir.join("sample_info.txt"))?;
    assert!(report.contains("Total Reads:\t2\n"));
    assert!(report.contains("Mapped Reads:\t1\n"));
    assert!(report.contains("Low overall coverage."));
    Ok(())
}
