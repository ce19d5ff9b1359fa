//! Sequence file helpers: FASTA/FASTQ detection, read-length statistics and
//! FASTQ to FASTA conversion.

use log::debug;
use noodles::{fasta, fastq};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Write};
use std::path::Path;

/// Number of leading lines inspected when guessing a file's format
pub const DEFAULT_SAMPLE_LINES: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    Fasta,
    Fastq,
}

impl SeqFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeqFormat::Fasta => "fasta",
            SeqFormat::Fastq => "fastq",
        }
    }
}

impl std::fmt::Display for SeqFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub enum FormatError {
    /// Neither parser recovered a record
    Unrecognized,
    /// Both parsers recovered the same, nonzero, number of records
    Ambiguous(usize),
    Io(io::Error),
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::Unrecognized => write!(f, "Not a FASTA or FASTQ file"),
            FormatError::Ambiguous(n) => write!(
                f,
                "Ambiguous sequence format: {} records parse as both FASTA and FASTQ",
                n
            ),
            FormatError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<FormatError> for io::Error {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Decide between FASTA and FASTQ from per-format record counts.
/// The strictly larger count wins; a tie is an error.
pub fn classify_counts(fasta_records: usize, fastq_records: usize) -> Result<SeqFormat, FormatError> {
    if fasta_records > fastq_records {
        Ok(SeqFormat::Fasta)
    } else if fastq_records > fasta_records {
        Ok(SeqFormat::Fastq)
    } else if fasta_records == 0 {
        Err(FormatError::Unrecognized)
    } else {
        Err(FormatError::Ambiguous(fasta_records))
    }
}

/// Guess the format of `path` by parsing its first `sample_lines` lines with
/// both the FASTA and the FASTQ parser.
pub fn detect_format<P: AsRef<Path>>(path: P, sample_lines: usize) -> Result<SeqFormat, FormatError> {
    let file = File::open(path.as_ref()).map_err(FormatError::Io)?;
    let mut reader = BufReader::new(file);
    let mut sample = Vec::new();
    let mut line = Vec::new();
    for _ in 0..sample_lines {
        line.clear();
        if reader.read_until(b'\n', &mut line).map_err(FormatError::Io)? == 0 {
            break;
        }
        sample.extend_from_slice(&line);
    }

    let fasta_records = count_fasta_records(Cursor::new(&sample));
    let fastq_records = count_fastq_records(Cursor::new(&sample));
    debug!(
        "{}: {} FASTA / {} FASTQ records in sample",
        path.as_ref().display(),
        fasta_records,
        fastq_records
    );
    classify_counts(fasta_records, fastq_records)
}

/// Records parsed before the first error
fn count_fasta_records<R: BufRead>(inner: R) -> usize {
    let mut reader = fasta::io::Reader::new(inner);
    reader.records().take_while(|r| r.is_ok()).count()
}

fn count_fastq_records<R: BufRead>(inner: R) -> usize {
    let mut reader = fastq::io::Reader::new(inner);
    reader.records().take_while(|r| r.is_ok()).count()
}

/// Number of records in a sequence file of known format
pub fn count_records<P: AsRef<Path>>(path: P, format: SeqFormat) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut count = 0;
    match format {
        SeqFormat::Fasta => {
            let mut reader = fasta::io::Reader::new(reader);
            for record in reader.records() {
                record?;
                count += 1;
            }
        }
        SeqFormat::Fastq => {
            let mut reader = fastq::io::Reader::new(reader);
            for record in reader.records() {
                record?;
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Read-length distribution of a read file
#[derive(Debug, Clone, PartialEq)]
pub struct ReadStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
}

impl ReadStats {
    /// Summary statistics of `lengths`; None when empty.
    /// The standard deviation is the population one.
    pub fn from_lengths(lengths: &[usize]) -> Option<Self> {
        if lengths.is_empty() {
            return None;
        }
        let mut sorted = lengths.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let mean = sorted.iter().sum::<usize>() as f64 / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) as f64 / 2.0
        } else {
            sorted[count / 2] as f64
        };
        let variance = sorted
            .iter()
            .map(|&l| (l as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        Some(ReadStats {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            median,
            stdev: variance.sqrt(),
        })
    }
}

/// Read-length statistics of a FASTA file. Fails closed: returns `Ok(None)`
/// when the file has no parseable record.
pub fn read_stats<P: AsRef<Path>>(path: P) -> io::Result<Option<ReadStats>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut reader = fasta::io::Reader::new(reader);
    let mut lengths = Vec::new();
    for record in reader.records() {
        match record {
            Ok(record) => lengths.push(record.sequence().len()),
            Err(e) => {
                debug!("Stopped reading {}: {}", path.as_ref().display(), e);
                break;
            }
        }
    }
    Ok(ReadStats::from_lengths(&lengths))
}

/// Convert a FASTQ file to FASTA, dropping the qualities. Returns the number
/// of records written.
pub fn fastq_to_fasta<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> io::Result<usize> {
    let reader = BufReader::new(File::open(input.as_ref())?);
    let mut reader = fastq::io::Reader::new(reader);
    let mut writer = BufWriter::new(File::create(output.as_ref())?);

    let mut count = 0;
    for record in reader.records() {
        let record = record?;
        writer.write_all(b">")?;
        writer.write_all(record.name())?;
        writer.write_all(b"\n")?;
        writer.write_all(record.sequence())?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}
