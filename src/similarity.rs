//! Cross-mapping tensor built from simulated reads.
//!
//! Element `[q][s][k]` is 1 when simulated read `k` of reference `q` mapped
//! to reference `s`. The mean over `k` estimates how often a read truly from
//! `q` is observed on `s`. No symmetry between `[q][s]` and `[s][q]` is
//! assumed.

use crate::sam;
use log::{debug, warn};
use rayon::prelude::*;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

/// What to do when references yield different numbers of simulated reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMismatch {
    /// Use the first reference's count: longer rows are truncated and
    /// shorter ones zero-filled, with a warning per divergent reference
    #[default]
    Warn,
    /// Refuse to build the tensor
    Fail,
}

impl FromStr for CountMismatch {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" | "truncate" => Ok(CountMismatch::Warn),
            "fail" => Ok(CountMismatch::Fail),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unknown count mismatch policy: '{}'. Valid: warn, fail", s),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityTensor {
    n_refs: usize,
    n_reads: usize,
    data: Vec<u8>,
}

impl SimilarityTensor {
    pub fn new(n_refs: usize, n_reads: usize) -> Self {
        SimilarityTensor {
            n_refs,
            n_reads,
            data: vec![0; n_refs * n_refs * n_reads],
        }
    }

    pub fn n_refs(&self) -> usize {
        self.n_refs
    }

    pub fn n_reads(&self) -> usize {
        self.n_reads
    }

    #[inline]
    fn offset(&self, query: usize, subject: usize) -> usize {
        (query * self.n_refs + subject) * self.n_reads
    }

    pub fn get(&self, query: usize, subject: usize, read: usize) -> u8 {
        self.data[self.offset(query, subject) + read]
    }

    pub fn set(&mut self, query: usize, subject: usize, read: usize, value: u8) {
        let offset = self.offset(query, subject);
        self.data[offset + read] = value;
    }

    /// Indicators of all simulated reads of `query` against `subject`
    pub fn row(&self, query: usize, subject: usize) -> &[u8] {
        let offset = self.offset(query, subject);
        &self.data[offset..offset + self.n_reads]
    }

    /// Fill one (query, subject) layer, truncating or zero-filling to `n_reads`
    pub fn set_row(&mut self, query: usize, subject: usize, indicators: &[u8]) {
        let offset = self.offset(query, subject);
        let n = indicators.len().min(self.n_reads);
        let row = &mut self.data[offset..offset + self.n_reads];
        row[..n].copy_from_slice(&indicators[..n]);
        row[n..].fill(0);
    }

    /// Fraction of `query`'s simulated reads that mapped to `subject`
    pub fn row_density(&self, query: usize, subject: usize) -> f64 {
        if self.n_reads == 0 {
            return 0.0;
        }
        let mapped: usize = self.row(query, subject).iter().map(|&v| v as usize).sum();
        mapped as f64 / self.n_reads as f64
    }
}

/// One pairwise mapping: simulated reads of `query` against the index of `subject`
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseOutput {
    pub query: usize,
    pub subject: usize,
    pub sam_file: PathBuf,
}

#[derive(Debug)]
pub enum TensorError {
    /// Simulated read counts differ and the policy forbids it
    CountMismatch { reference: usize, expected: usize, found: usize },
    Io(io::Error),
}

impl std::fmt::Display for TensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorError::CountMismatch {
                reference,
                expected,
                found,
            } => write!(
                f,
                "Reference {} produced {} simulated reads, expected {}",
                reference, found, expected
            ),
            TensorError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for TensorError {}

/// Build the tensor from all pairwise SAM files. `sim_counts[i]` is the
/// number of reads simulated from reference `i`; the first one fixes the
/// tensor's read dimension.
pub fn build_similarity_tensor(
    n_refs: usize,
    pairwise: &[PairwiseOutput],
    sim_counts: &[usize],
    policy: CountMismatch,
) -> Result<SimilarityTensor, TensorError> {
    let n_reads = sim_counts.first().copied().unwrap_or(0);
    for (reference, &found) in sim_counts.iter().enumerate().skip(1) {
        if found != n_reads {
            match policy {
                CountMismatch::Warn => warn!(
                    "Reference {} produced {} simulated reads but the similarity tensor uses {} (from reference 0); {}",
                    reference,
                    found,
                    n_reads,
                    if found > n_reads { "truncating" } else { "zero-filling" }
                ),
                CountMismatch::Fail => {
                    return Err(TensorError::CountMismatch {
                        reference,
                        expected: n_reads,
                        found,
                    })
                }
            }
        }
    }

    let rows: Vec<(usize, usize, Vec<u8>)> = pairwise
        .par_iter()
        .map(|p| {
            sam::mapped_indicators(&p.sam_file).map(|indicators| (p.query, p.subject, indicators))
        })
        .collect::<io::Result<_>>()
        .map_err(TensorError::Io)?;

    let mut tensor = SimilarityTensor::new(n_refs, n_reads);
    for (query, subject, indicators) in rows {
        if query >= n_refs || subject >= n_refs {
            return Err(TensorError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Pair ({}, {}) outside of {} references", query, subject, n_refs),
            )));
        }
        if indicators.len() != n_reads {
            debug!(
                "SAM for pair ({}, {}) has {} records, tensor expects {}",
                query,
                subject,
                indicators.len(),
                n_reads
            );
        }
        tensor.set_row(query, subject, &indicators);
    }
    Ok(tensor)
}
