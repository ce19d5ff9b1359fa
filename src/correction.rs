//! Similarity correction of raw read counts.
//!
//! The fraction of reads observed on reference `j` is modelled as
//! `f_j = sum_i a_i * S[i][j]`, with `S[i][j]` the cross-mapping rate from the
//! similarity tensor and `a` the true abundances. `a` is estimated by
//! non-negative least squares; bootstrap resampling of both the real reads
//! and the simulated reads gives its standard error and a p-value for the
//! abundance exceeding a detection threshold.

use crate::sam;
use crate::similarity::SimilarityTensor;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::io;
use std::path::Path;

/// Configuration of the bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Number of bootstrap samples; 1 disables resampling
    pub samples: usize,
    pub seed: u64,
    /// Abundance at or below which a sample counts against presence
    pub threshold: f64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            samples: 100,
            seed: 0,
            threshold: 5e-4,
        }
    }
}

/// Mapping status of every real read against every reference
#[derive(Debug, Clone)]
pub struct MappedMatrix {
    /// Reads in the metagenome (records of the first SAM file)
    pub total: usize,
    /// `rows[i][k]` is 1 when read `k` mapped to reference `i`
    pub rows: Vec<Vec<u8>>,
}

impl MappedMatrix {
    /// Scan one SAM file per reference. All files are assumed to come from the
    /// same read set; the first one fixes the read count.
    pub fn from_sam_files<P: AsRef<Path> + Sync>(paths: &[P]) -> io::Result<Self> {
        let mut rows: Vec<Vec<u8>> = paths
            .par_iter()
            .map(|p| sam::mapped_indicators(p.as_ref()))
            .collect::<io::Result<_>>()?;
        let total = rows.first().map(|r| r.len()).unwrap_or(0);
        info!("...found {} reads", total);
        for row in &mut rows {
            row.resize(total, 0);
        }
        Ok(MappedMatrix { total, rows })
    }

    pub fn n_refs(&self) -> usize {
        self.rows.len()
    }

    /// Mapped reads per reference
    pub fn mapped_counts(&self) -> Vec<usize> {
        self.rows
            .iter()
            .map(|r| r.iter().map(|&v| v as usize).sum())
            .collect()
    }
}

/// Corrected abundances of one metagenome
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionResult {
    pub total: usize,
    pub mapped: Vec<usize>,
    pub corrected: Vec<f64>,
    pub std_error: Vec<f64>,
    pub p_value: Vec<f64>,
}

/// Run the bootstrap similarity correction
pub fn correct_abundances(
    mapped: &MappedMatrix,
    tensor: &SimilarityTensor,
    config: &BootstrapConfig,
) -> io::Result<CorrectionResult> {
    let n = mapped.n_refs();
    if n != tensor.n_refs() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Mapped matrix has {} references but the similarity tensor has {}",
                n,
                tensor.n_refs()
            ),
        ));
    }
    if config.samples == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Number of bootstrap samples must be at least 1",
        ));
    }

    let estimates: Vec<DVector<f64>> = if config.samples == 1 {
        vec![estimate(
            &observed_fractions(mapped, None),
            &similarity_matrix(tensor, None),
        )?]
    } else {
        (0..config.samples)
            .into_par_iter()
            .map(|b| {
                let mut rng = ChaCha20Rng::seed_from_u64(config.seed.wrapping_add(b as u64));
                let reads = resample(mapped.total, &mut rng);
                let sim_reads: Vec<Vec<usize>> = (0..n)
                    .map(|_| resample(tensor.n_reads(), &mut rng))
                    .collect();
                estimate(
                    &observed_fractions(mapped, Some(&reads)),
                    &similarity_matrix(tensor, Some(&sim_reads)),
                )
            })
            .collect::<io::Result<_>>()?
    };

    let samples = estimates.len() as f64;
    let mut corrected = vec![0.0; n];
    let mut std_error = vec![0.0; n];
    let mut p_value = vec![0.0; n];
    for i in 0..n {
        let mean = estimates.iter().map(|e| e[i]).sum::<f64>() / samples;
        let var = estimates.iter().map(|e| (e[i] - mean).powi(2)).sum::<f64>() / samples;
        let below = estimates.iter().filter(|e| e[i] <= config.threshold).count();
        corrected[i] = mean;
        std_error[i] = var.sqrt();
        p_value[i] = below as f64 / samples;
    }

    Ok(CorrectionResult {
        total: mapped.total,
        mapped: mapped.mapped_counts(),
        corrected,
        std_error,
        p_value,
    })
}

/// `n` indices drawn uniformly with replacement from `0..n`
fn resample(n: usize, rng: &mut ChaCha20Rng) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

/// Fraction of (resampled) reads mapped to each reference
fn observed_fractions(mapped: &MappedMatrix, sample: Option<&[usize]>) -> DVector<f64> {
    let total = mapped.total;
    DVector::from_iterator(
        mapped.n_refs(),
        mapped.rows.iter().map(|row| {
            if total == 0 {
                return 0.0;
            }
            let hits: usize = match sample {
                Some(idx) => idx.iter().map(|&k| row[k] as usize).sum(),
                None => row.iter().map(|&v| v as usize).sum(),
            };
            hits as f64 / total as f64
        }),
    )
}

/// `S[i][j]`: rate at which simulated reads of `i` map to `j`. With
/// `samples`, row `i` is computed over the resampled reads `samples[i]`.
fn similarity_matrix(tensor: &SimilarityTensor, samples: Option<&[Vec<usize>]>) -> DMatrix<f64> {
    let n = tensor.n_refs();
    let n_reads = tensor.n_reads();
    DMatrix::from_fn(n, n, |i, j| {
        if n_reads == 0 {
            return 0.0;
        }
        let row = tensor.row(i, j);
        let hits: usize = match samples {
            Some(s) => s[i].iter().map(|&k| row[k] as usize).sum(),
            None => row.iter().map(|&v| v as usize).sum(),
        };
        hits as f64 / n_reads as f64
    })
}

/// Solve `S^T a = f` for `a >= 0`
fn estimate(observed: &DVector<f64>, smat: &DMatrix<f64>) -> io::Result<DVector<f64>> {
    nnls(&smat.transpose(), observed)
}

const NNLS_TOL: f64 = 1e-12;

/// Lawson-Hanson active-set non-negative least squares: minimise
/// `||A x - b||` subject to `x >= 0`.
pub fn nnls(a: &DMatrix<f64>, b: &DVector<f64>) -> io::Result<DVector<f64>> {
    let n = a.ncols();
    if a.nrows() != b.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("NNLS shape mismatch: {} rows vs {} observations", a.nrows(), b.len()),
        ));
    }

    let mut x = DVector::zeros(n);
    let mut passive = vec![false; n];
    let max_iter = 3 * n.max(1);
    let mut iter = 0;

    loop {
        let w = a.transpose() * (b - a * &x);
        let next = (0..n)
            .filter(|&j| !passive[j] && w[j] > NNLS_TOL)
            .max_by(|&i, &j| w[i].partial_cmp(&w[j]).unwrap_or(Ordering::Equal));
        let Some(j) = next else { break };
        if iter >= max_iter {
            warn!("NNLS did not converge after {} iterations", max_iter);
            break;
        }
        iter += 1;
        passive[j] = true;

        loop {
            let idx: Vec<usize> = (0..n).filter(|&k| passive[k]).collect();
            if idx.is_empty() {
                break;
            }
            let z_p = least_squares(&a.select_columns(idx.iter()), b)?;
            let mut z = DVector::zeros(n);
            for (pos, &k) in idx.iter().enumerate() {
                z[k] = z_p[pos];
            }

            if idx.iter().all(|&k| z[k] > NNLS_TOL) {
                x = z;
                break;
            }

            let alpha = idx
                .iter()
                .filter(|&&k| z[k] <= NNLS_TOL)
                .map(|&k| {
                    let d = x[k] - z[k];
                    if d > 0.0 {
                        x[k] / d
                    } else {
                        0.0
                    }
                })
                .fold(f64::INFINITY, f64::min);
            x = &x + (z - &x) * alpha;
            for &k in &idx {
                if x[k] <= NNLS_TOL {
                    passive[k] = false;
                    x[k] = 0.0;
                }
            }
        }
    }
    Ok(x)
}

fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> io::Result<DVector<f64>> {
    a.clone()
        .svd(true, true)
        .solve(b, NNLS_TOL)
        .map_err(|e| io::Error::other(format!("Least squares solve failed: {}", e)))
}
