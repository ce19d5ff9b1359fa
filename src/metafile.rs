//! Metagenome metadata tables and read download.
//!
//! A metadata table is tab-delimited with a header line. MG-RAST tables must
//! carry an `id` column holding the metagenome accession; SRA tables must
//! carry an `ftp` column holding the link to the run's reads.

use crate::fetch::Fetcher;
use crate::seqfile::{self, SeqFormat};
use flate2::read::MultiGzDecoder;
use log::{info, warn};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "http://api.metagenomics.anl.gov/1/download";
pub const DEFAULT_STAGES: [u32; 2] = [150, 100];
pub const DEFAULT_MAX_ITERATIONS: u32 = 9;

/// Sequence database the metadata table comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDb {
    Mgrast,
    Sra,
}

impl SeqDb {
    fn id_column(&self) -> &'static str {
        match self {
            SeqDb::Mgrast => "id",
            SeqDb::Sra => "ftp",
        }
    }

    fn id_pattern(&self) -> Regex {
        let pattern = match self {
            SeqDb::Mgrast => r"^((mgm)*\d{7}\.\d)",
            SeqDb::Sra => r"([SDE]RR\d{6,})",
        };
        // Constant patterns
        Regex::new(pattern).unwrap()
    }
}

impl FromStr for SeqDb {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mgrast" | "mg-rast" => Ok(SeqDb::Mgrast),
            "sra" => Ok(SeqDb::Sra),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seqDB must be \"MGRAST\" or \"SRA\", got \"{}\"", s),
            )),
        }
    }
}

/// Sequencing technology inferred from metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Illumina,
    Roche454,
    Sanger,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Illumina => "illumina",
            Platform::Roche454 => "454",
            Platform::Sanger => "sanger",
        }
    }

    /// Classify a free-text sequencing method; None if unrecognised
    pub fn classify(seq_method: &str) -> Option<Platform> {
        let lower = seq_method.to_lowercase();
        if lower.contains("454") || lower.contains("pyro") {
            Some(Platform::Roche454)
        } else if lower.contains("illumina") {
            Some(Platform::Illumina)
        } else if lower.contains("sanger") {
            Some(Platform::Sanger)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::classify(s).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unknown platform: '{}'. Valid: illumina, 454, sanger", s),
            )
        })
    }
}

/// Retry policy for read downloads
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub base_url: String,
    /// MG-RAST pipeline stages, tried in order
    pub stages: Vec<u32>,
    /// Iterations tried per stage (or attempts per link for SRA)
    pub max_iterations: u32,
    /// Lines sampled for format detection
    pub sample_lines: usize,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        DownloadPolicy {
            base_url: DEFAULT_BASE_URL.to_string(),
            stages: DEFAULT_STAGES.to_vec(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            sample_lines: seqfile::DEFAULT_SAMPLE_LINES,
        }
    }
}

/// A downloaded read file and its detected format
#[derive(Debug, Clone, PartialEq)]
pub struct ReadFile {
    pub path: PathBuf,
    pub format: SeqFormat,
}

#[derive(Debug)]
pub enum TableError {
    Empty,
    MissingColumn(&'static str),
    InvalidId { row: usize, value: String },
    Io(io::Error),
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::Empty => write!(f, "Metadata table is empty"),
            TableError::MissingColumn(c) => {
                write!(f, "Metadata table does not have \"{}\" column", c)
            }
            TableError::InvalidId { row, value } => {
                write!(f, "Row {}: id \"{}\" is not in correct format", row, value)
            }
            TableError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for TableError {}

impl From<TableError> for io::Error {
    fn from(e: TableError) -> Self {
        match e {
            TableError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Metadata table of one sequence database
pub struct MetagenomeSource {
    kind: SeqDb,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    id_col: usize,
    policy: DownloadPolicy,
}

impl MetagenomeSource {
    pub fn from_path<P: AsRef<Path>>(path: P, kind: SeqDb, policy: DownloadPolicy) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to open metadata file '{}': {}", path.display(), e),
            )
        })?;
        Ok(Self::from_reader(BufReader::new(file), kind, policy)?)
    }

    pub fn from_reader<R: BufRead>(reader: R, kind: SeqDb, policy: DownloadPolicy) -> Result<Self, TableError> {
        let mut lines = reader
            .lines()
            .map(|l| l.map(|l| l.trim_end_matches('\r').to_string()))
            .filter(|l| !matches!(l, Ok(l) if l.trim().is_empty()));

        let header: Vec<String> = match lines.next() {
            Some(line) => line
                .map_err(TableError::Io)?
                .split('\t')
                .map(|s| s.trim().to_string())
                .collect(),
            None => return Err(TableError::Empty),
        };
        let id_col = header
            .iter()
            .position(|c| c == kind.id_column())
            .ok_or(TableError::MissingColumn(kind.id_column()))?;

        let mut rows = Vec::new();
        for line in lines {
            let mut fields: Vec<String> = line
                .map_err(TableError::Io)?
                .split('\t')
                .map(str::to_string)
                .collect();
            fields.resize(header.len().max(fields.len()), String::new());
            rows.push(fields);
        }

        Ok(MetagenomeSource {
            kind,
            header,
            rows,
            id_col,
            policy,
        })
    }

    pub fn kind(&self) -> SeqDb {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in table order. Every call starts over from the first row.
    pub fn rows(&self) -> impl Iterator<Item = Result<MetagenomeRow, TableError>> + '_ {
        let pattern = self.kind.id_pattern();
        let method_col = self.header.iter().position(|c| c == "seq_method");
        self.rows.iter().enumerate().map(move |(row_index, fields)| {
            let raw = fields[self.id_col].trim();
            let id = pattern
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| TableError::InvalidId {
                    row: row_index + 1,
                    value: raw.to_string(),
                })?;
            Ok(MetagenomeRow {
                id,
                link: raw.to_string(),
                seq_method: method_col.map(|c| fields[c].trim().to_string()),
                row_index,
                kind: self.kind,
                policy: self.policy.clone(),
                read_file: None,
            })
        })
    }
}

/// One metagenome of the metadata table
#[derive(Debug, Clone)]
pub struct MetagenomeRow {
    pub id: String,
    /// Raw identifier column (the ftp link for SRA tables)
    pub link: String,
    pub seq_method: Option<String>,
    pub row_index: usize,
    kind: SeqDb,
    policy: DownloadPolicy,
    read_file: Option<ReadFile>,
}

impl MetagenomeRow {
    pub fn platform(&self) -> Option<Platform> {
        self.seq_method.as_deref().and_then(Platform::classify)
    }

    pub fn read_file(&self) -> Option<&ReadFile> {
        self.read_file.as_ref()
    }

    pub fn set_read_file(&mut self, read_file: ReadFile) {
        self.read_file = Some(read_file);
    }

    /// Every URL tried, in order, with the stage label used for file names
    fn attempts(&self) -> Vec<(String, String)> {
        match self.kind {
            SeqDb::Mgrast => self
                .policy
                .stages
                .iter()
                .flat_map(|stage| {
                    (1..=self.policy.max_iterations).map(move |iteration| {
                        (
                            stage.to_string(),
                            format!(
                                "{}/{}?file={}.{}",
                                self.policy.base_url.trim_end_matches('/'),
                                self.id,
                                stage,
                                iteration
                            ),
                        )
                    })
                })
                .collect(),
            SeqDb::Sra => {
                let url = https_link(&self.link);
                (1..=self.policy.max_iterations)
                    .map(|_| ("sra".to_string(), url.clone()))
                    .collect()
            }
        }
    }

    /// Download the reads into `workdir`, trying each stage and iteration in
    /// turn. Returns false, leaving no read file set, once every attempt has
    /// failed. Only IO errors on the local workspace are raised.
    pub fn download(&mut self, fetcher: &dyn Fetcher, workdir: &Path) -> io::Result<bool> {
        self.read_file = None;
        let mut failures: Vec<String> = Vec::new();

        for (stage, url) in self.attempts() {
            info!("For ID \"{}\", sending request: \"{}\"", self.id, url);
            let out_file = workdir.join(format!("{}_stage{}.reads", self.id, stage));
            match self.try_download(fetcher, &url, &out_file) {
                Ok(format) => {
                    info!("File written: {} ({})", out_file.display(), format);
                    self.read_file = Some(ReadFile {
                        path: out_file,
                        format,
                    });
                    return Ok(true);
                }
                Err(reason) => {
                    warn!("  {}", reason);
                    failures.push(format!("{}: {}", url, reason));
                    if out_file.exists() {
                        fs::remove_file(&out_file)?;
                    }
                }
            }
        }

        warn!(
            "Exceeded download attempts for \"{}\" ({} failures). Giving up",
            self.id,
            failures.len()
        );
        Ok(false)
    }

    fn try_download(&self, fetcher: &dyn Fetcher, url: &str, out_file: &Path) -> Result<SeqFormat, String> {
        let response = fetcher.get(url).map_err(|e| e.to_string())?;
        if response.status != 200 {
            return Err(format!("Request status {} != 200", response.status));
        }

        let written = (|| -> io::Result<u64> {
            let mut writer = BufWriter::new(File::create(out_file)?);
            let mut decoder = MultiGzDecoder::new(response.body);
            let n = io::copy(&mut decoder, &mut writer)?;
            writer.flush()?;
            Ok(n)
        })()
        .map_err(|e| format!("Content was not a compressed sequence file: {}", e))?;

        if written == 0 {
            return Err("Requested content was empty".to_string());
        }
        seqfile::detect_format(out_file, self.policy.sample_lines).map_err(|e| e.to_string())
    }

    /// Convert a FASTQ read file to FASTA in place of the original.
    /// FASTA files are left untouched.
    pub fn normalize_format(&mut self) -> io::Result<()> {
        let Some(read_file) = self.read_file.clone() else {
            return Ok(());
        };
        if read_file.format == SeqFormat::Fasta {
            return Ok(());
        }
        let dir = read_file.path.parent().unwrap_or_else(|| Path::new("."));
        let fasta = dir.join(format!("{}.fasta", self.id));
        let n = seqfile::fastq_to_fasta(&read_file.path, &fasta)?;
        info!("Converted {} FASTQ records to {}", n, fasta.display());
        fs::remove_file(&read_file.path)?;
        self.read_file = Some(ReadFile {
            path: fasta,
            format: SeqFormat::Fasta,
        });
        Ok(())
    }

    /// Read-length statistics of the downloaded reads; None if there is no
    /// read file or it holds no record
    pub fn read_stats(&self) -> io::Result<Option<seqfile::ReadStats>> {
        match &self.read_file {
            Some(read_file) if read_file.format == SeqFormat::Fasta => {
                seqfile::read_stats(&read_file.path)
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Read statistics require a FASTA read file",
            )),
            None => Ok(None),
        }
    }
}

/// Rewrite an SRA read link for the HTTP fetcher. ENA serves its `ftp`
/// column paths over HTTPS too, and those links often come without a scheme.
pub fn https_link(link: &str) -> String {
    let link = link.trim();
    if let Some(rest) = link.strip_prefix("ftp://") {
        format!("https://{}", rest)
    } else if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("https://{}", link)
    }
}
