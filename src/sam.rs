//! SAM scanning with rust-htslib.

use rust_htslib::bam::{self, Read as BamRead};
use rustc_hash::FxHashSet;
use std::io;
use std::path::Path;

fn open_sam(path: &Path) -> io::Result<bam::Reader> {
    bam::Reader::from_path(path).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to open SAM file '{}': {}", path.display(), e),
        )
    })
}

fn record_error(path: &Path, e: rust_htslib::errors::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Failed to read record from '{}': {}", path.display(), e),
    )
}

/// One entry per SAM record: 1 if the record is mapped, 0 otherwise
pub fn mapped_indicators(path: &Path) -> io::Result<Vec<u8>> {
    let mut reader = open_sam(path)?;
    let mut indicators = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| record_error(path, e))?;
        indicators.push(u8::from(!record.is_unmapped()));
    }
    Ok(indicators)
}

/// Number of records in a SAM file
pub fn count_records(path: &Path) -> io::Result<usize> {
    let mut reader = open_sam(path)?;
    let mut count = 0;
    for record in reader.records() {
        record.map_err(|e| record_error(path, e))?;
        count += 1;
    }
    Ok(count)
}

fn mapped_read_names(path: &Path) -> io::Result<FxHashSet<Vec<u8>>> {
    let mut reader = open_sam(path)?;
    let mut names = FxHashSet::default();
    for record in reader.records() {
        let record = record.map_err(|e| record_error(path, e))?;
        if !record.is_unmapped() {
            names.insert(record.qname().to_vec());
        }
    }
    Ok(names)
}

/// For each SAM file, the number of mapped reads whose name is mapped in
/// no other file of the set
pub fn unique_read_counts<P: AsRef<Path>>(paths: &[P]) -> io::Result<Vec<usize>> {
    let mapped: Vec<FxHashSet<Vec<u8>>> = paths
        .iter()
        .map(|p| mapped_read_names(p.as_ref()))
        .collect::<io::Result<_>>()?;

    Ok((0..mapped.len())
        .map(|n| {
            mapped[n]
                .iter()
                .filter(|name| {
                    mapped
                        .iter()
                        .enumerate()
                        .all(|(m, others)| m == n || !others.contains(*name))
                })
                .count()
        })
        .collect())
}

/// Mapping and coverage summary of one SAM file
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageStats {
    pub total_reads: usize,
    pub mapped_reads: usize,
    pub genome_length: u64,
    pub num_contigs: usize,
    pub max_coverage: u32,
    pub mean_coverage: f64,
    /// Fraction of reference bases covered by no read
    pub zero_coverage_fraction: f64,
}

/// Per-base coverage over the concatenated references of the SAM header
pub fn coverage_stats(path: &Path) -> io::Result<CoverageStats> {
    let mut reader = open_sam(path)?;
    let header = reader.header().clone();
    let num_contigs = header.target_count() as usize;
    let lengths: Vec<u64> = (0..header.target_count())
        .map(|tid| header.target_len(tid).unwrap_or(0))
        .collect();
    let mut offsets = Vec::with_capacity(lengths.len());
    let mut genome_length = 0u64;
    for len in &lengths {
        offsets.push(genome_length);
        genome_length += len;
    }

    let mut coverage = vec![0u32; genome_length as usize];
    let mut total_reads = 0;
    let mut mapped_reads = 0;
    for record in reader.records() {
        let record = record.map_err(|e| record_error(path, e))?;
        total_reads += 1;
        if record.is_unmapped() || record.tid() < 0 {
            continue;
        }
        mapped_reads += 1;
        let tid = record.tid() as usize;
        let contig_end = offsets[tid] + lengths[tid];
        // aligned reference span; clipped bases cover nothing
        let pos = record.pos().max(0);
        let ref_end = record.cigar().end_pos().max(pos);
        let start = (offsets[tid] + pos as u64).min(contig_end);
        let end = (offsets[tid] + ref_end as u64).min(contig_end);
        for base in &mut coverage[start as usize..end as usize] {
            *base += 1;
        }
    }

    let (max_coverage, mean_coverage, zero_coverage_fraction) = if coverage.is_empty() {
        (0, 0.0, 0.0)
    } else {
        let sum: u64 = coverage.iter().map(|&c| c as u64).sum();
        let zeros = coverage.iter().filter(|&&c| c == 0).count();
        (
            coverage.iter().copied().max().unwrap_or(0),
            sum as f64 / coverage.len() as f64,
            zeros as f64 / coverage.len() as f64,
        )
    };

    Ok(CoverageStats {
        total_reads,
        mapped_reads,
        genome_length,
        num_contigs,
        max_coverage,
        mean_coverage,
        zero_coverage_fraction,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// SAM text with one 20bp contig `ref`; `mapped[i]` decides record i
    pub(crate) fn sam_text(names: &[&str], mapped: &[bool]) -> String {
        let mut text = String::from("@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:ref\tLN:20\n");
        for (name, &m) in names.iter().zip(mapped) {
            if m {
                text.push_str(&format!("{}\t0\tref\t1\t42\t4M\t*\t0\t0\tACGT\tIIII\n", name));
            } else {
                text.push_str(&format!("{}\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\tIIII\n", name));
            }
        }
        text
    }

    pub(crate) fn write_sam(dir: &Path, file: &str, names: &[&str], mapped: &[bool]) -> std::path::PathBuf {
        let path = dir.join(file);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sam_text(names, mapped).as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_mapped_indicators() {
        let dir = tempfile::tempdir().unwrap();
        let sam = write_sam(dir.path(), "a.sam", &["r1", "r2", "r3"], &[true, false, true]);
        assert_eq!(mapped_indicators(&sam).unwrap(), vec![1, 0, 1]);
        assert_eq!(count_records(&sam).unwrap(), 3);
    }

    #[test]
    fn test_unique_read_counts() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["r1", "r2", "r3", "r4"];
        let a = write_sam(dir.path(), "a.sam", &names, &[true, true, false, false]);
        let b = write_sam(dir.path(), "b.sam", &names, &[false, true, true, true]);
        assert_eq!(unique_read_counts(&[a, b]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_coverage_stats() {
        let dir = tempfile::tempdir().unwrap();
        let sam = write_sam(dir.path(), "a.sam", &["r1", "r2", "r3"], &[true, true, false]);
        let stats = coverage_stats(&sam).unwrap();
        assert_eq!(stats.total_reads, 3);
        assert_eq!(stats.mapped_reads, 2);
        assert_eq!(stats.genome_length, 20);
        assert_eq!(stats.num_contigs, 1);
        assert_eq!(stats.max_coverage, 2);
        // 2 reads x 4 bases over 20 bases
        assert!((stats.mean_coverage - 0.4).abs() < 1e-12);
        assert!((stats.zero_coverage_fraction - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_coverage_ignores_clipped_bases() {
        let dir = tempfile::tempdir().unwrap();
        let sam = dir.path().join("clipped.sam");
        std::fs::write(
            &sam,
            "@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:ref\tLN:20\n\
             r1\t0\tref\t3\t42\t2S4M2S\t*\t0\t0\tTTACGTTT\tIIIIIIII\n\
             r2\t0\tref\t16\t42\t2M1D1M5S\t*\t0\t0\tACGTTTTT\tIIIIIIII\n",
        )
        .unwrap();
        let stats = coverage_stats(&sam).unwrap();
        assert_eq!(stats.mapped_reads, 2);
        // r1 covers 3..=6, r2 covers 16..=19 including the deletion
        let covered = 4.0 + 4.0;
        assert!((stats.mean_coverage - covered / 20.0).abs() < 1e-12);
        assert!((stats.zero_coverage_fraction - (20.0 - covered) / 20.0).abs() < 1e-12);
        assert_eq!(stats.max_coverage, 1);
    }
}
