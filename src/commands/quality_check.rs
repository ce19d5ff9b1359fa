use crate::sam::{self, CoverageStats};
use log::info;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Mapping sanity report of one SAM file
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub sam_file: PathBuf,
    pub stats: CoverageStats,
    /// Mapped reads found in no other SAM file of the checked set
    pub unique_reads: usize,
}

impl QualityReport {
    pub fn dataset_name(&self) -> String {
        self.sam_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string())
    }

    /// Warnings for the user about coverage that suggests an unfit reference
    /// set or an absent species
    pub fn comments(&self) -> Vec<String> {
        let mut comments = Vec::new();
        let stats = &self.stats;
        if stats.mean_coverage < 1.0 {
            let mapped_fraction = if stats.total_reads == 0 {
                0.0
            } else {
                stats.mapped_reads as f64 / stats.total_reads as f64
            };
            if mapped_fraction > 0.01 {
                comments.push("Low overall coverage. Consider using a larger dataset.".to_string());
            } else {
                comments.push(
                    "Low overall coverage. Abundance of this or related sequences is below 0.01."
                        .to_string(),
                );
            }
        }
        // Poisson probability of a base receiving no read
        let expected_zero = (-stats.mean_coverage).exp();
        if stats.zero_coverage_fraction > 2.0 * expected_zero {
            comments.push(
                "Unnaturally many bases with zero coverage. Consider that this species is not present in the dataset."
                    .to_string(),
            );
        }
        comments
    }

    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        let stats = &self.stats;
        writeln!(out, "Name:\t{}", self.sam_file.display())?;
        writeln!(out, "Total Genome Length:\t{}", stats.genome_length)?;
        writeln!(out, "Num. Contigs:\t{}", stats.num_contigs)?;
        writeln!(out)?;
        writeln!(out, "Mapping Results:")?;
        writeln!(out, "Total Reads:\t{}", stats.total_reads)?;
        writeln!(out, "Mapped Reads:\t{}", stats.mapped_reads)?;
        writeln!(out, "Unique Reads:\t{}", self.unique_reads)?;
        writeln!(out, "Max Coverage:\t{}", stats.max_coverage)?;
        writeln!(out, "Average Coverage:\t{:.6}", stats.mean_coverage)?;
        writeln!(
            out,
            "Fraction of bases with 0 Coverage:\t{:.6}",
            stats.zero_coverage_fraction
        )?;
        writeln!(out)?;
        writeln!(out, "Comments:")?;
        for comment in self.comments() {
            writeln!(out, "{}", comment)?;
        }
        out.flush()
    }
}

pub fn quality_reports<P: AsRef<Path> + Sync>(sam_files: &[P]) -> io::Result<Vec<QualityReport>> {
    let unique = sam::unique_read_counts(sam_files)?;
    let stats: Vec<CoverageStats> = sam_files
        .par_iter()
        .map(|p| sam::coverage_stats(p.as_ref()))
        .collect::<io::Result<_>>()?;
    Ok(sam_files
        .iter()
        .zip(stats)
        .zip(unique)
        .map(|((p, stats), unique_reads)| QualityReport {
            sam_file: p.as_ref().to_path_buf(),
            stats,
            unique_reads,
        })
        .collect())
}

/// Write `<outdir>/<name>_info.txt` for every SAM file
pub fn run_quality_check<P: AsRef<Path> + Sync>(
    sam_files: &[P],
    outdir: &Path,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(outdir)?;
    let reports = quality_reports(sam_files)?;
    let mut written = Vec::with_capacity(reports.len());
    for report in &reports {
        let path = outdir.join(format!("{}_info.txt", report.dataset_name()));
        report.write(BufWriter::new(File::create(&path)?))?;
        info!(
            "{}: {} of {} reads mapped, mean coverage {:.3}",
            report.dataset_name(),
            report.stats.mapped_reads,
            report.stats.total_reads,
            report.stats.mean_coverage
        );
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::tests::write_sam;

    #[test]
    fn test_reports_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["r1", "r2", "r3", "r4"];
        let a = write_sam(dir.path(), "a.sam", &names, &[true, true, false, false]);
        let b = write_sam(dir.path(), "b.sam", &names, &[false, true, false, false]);

        let reports = quality_reports(&[a, b]).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].dataset_name(), "a");
        assert_eq!(reports[0].unique_reads, 1);
        assert_eq!(reports[1].unique_reads, 0);

        // 8 bases covered out of 20, mean 0.4
        let comments = reports[0].comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("larger dataset"));
        // 4 bases of 20, mean 0.2: 80% zero-coverage vs expected ~82%
        assert_eq!(reports[1].comments().len(), 1);
    }

    #[test]
    fn test_absent_species_comment() {
        let stats = CoverageStats {
            total_reads: 1000,
            mapped_reads: 900,
            genome_length: 100,
            num_contigs: 1,
            max_coverage: 90,
            mean_coverage: 9.0,
            zero_coverage_fraction: 0.9,
        };
        let report = QualityReport {
            sam_file: PathBuf::from("x.sam"),
            stats,
            unique_reads: 900,
        };
        let comments = report.comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("Unnaturally many bases"));
    }

    #[test]
    fn test_run_writes_info_files() {
        let dir = tempfile::tempdir().unwrap();
        let sam = write_sam(dir.path(), "sample.sam", &["r1"], &[true]);
        let outdir = dir.path().join("qc");
        let written = run_quality_check(&[sam], &outdir).unwrap();
        assert_eq!(written, vec![outdir.join("sample_info.txt")]);
        let text = fs::read_to_string(&written[0]).unwrap();
        assert!(text.contains("Total Reads:\t1\n"));
        assert!(text.contains("Mapped Reads:\t1\n"));
        assert!(text.contains("Num. Contigs:\t1\n"));
    }
}
