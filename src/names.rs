//! Reference name table
//!
//! The name table lists the candidate reference genomes, one per line, with
//! up to two tab-delimited columns: the reference FASTA and the read mapper
//! index. When the index column is missing it defaults to the FASTA path.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One reference genome and the per-run outputs derived from it.
#[derive(Debug, Clone)]
pub struct Reference {
    pub row_index: usize,
    pub ref_file: PathBuf,
    pub index_file: PathBuf,
    sim_reads: Option<PathBuf>,
    sim_read_count: Option<usize>,
    sam_file: Option<PathBuf>,
    /// Pairwise SAM outputs of this reference's simulated reads, by subject index
    pairwise_sams: Vec<Option<PathBuf>>,
}

impl Reference {
    /// Name used in output rows (the first column of the name table)
    pub fn name(&self) -> String {
        self.ref_file.to_string_lossy().into_owned()
    }

    pub fn sim_reads(&self) -> Option<&Path> {
        self.sim_reads.as_deref()
    }

    pub fn sim_read_count(&self) -> Option<usize> {
        self.sim_read_count
    }

    pub fn sam_file(&self) -> Option<&Path> {
        self.sam_file.as_deref()
    }

    pub fn pairwise_sam(&self, subject: usize) -> Option<&Path> {
        self.pairwise_sams.get(subject).and_then(|p| p.as_deref())
    }
}

/// Ordered, fixed-length collection of references.
///
/// Entries are addressed by their row index. Worker pools never touch the
/// registry; results are written back by the driver after each join.
#[derive(Debug, Clone)]
pub struct ReferenceRegistry {
    references: Vec<Reference>,
}

impl ReferenceRegistry {
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to open name file '{}': {}", path.display(), e),
            )
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut rows = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let ref_file = fields.next().unwrap_or("").trim();
            if ref_file.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Name file line {}: empty reference column", line_no + 1),
                ));
            }
            let index_file = match fields.next().map(str::trim) {
                Some(index) if !index.is_empty() => index,
                _ => ref_file,
            };
            rows.push((PathBuf::from(ref_file), PathBuf::from(index_file)));
        }
        Ok(Self::from_rows(rows))
    }

    pub fn from_rows(rows: Vec<(PathBuf, PathBuf)>) -> Self {
        let n = rows.len();
        let references = rows
            .into_iter()
            .enumerate()
            .map(|(row_index, (ref_file, index_file))| Reference {
                row_index,
                ref_file,
                index_file,
                sim_reads: None,
                sim_read_count: None,
                sam_file: None,
                pairwise_sams: vec![None; n],
            })
            .collect();
        ReferenceRegistry { references }
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.references.iter()
    }

    pub fn get(&self, i: usize) -> io::Result<&Reference> {
        self.references.get(i).ok_or_else(|| row_not_found(i))
    }

    fn get_mut(&mut self, i: usize) -> io::Result<&mut Reference> {
        self.references.get_mut(i).ok_or_else(|| row_not_found(i))
    }

    /// Forget every per-run output before the next metagenome
    pub fn reset_outputs(&mut self) {
        let n = self.references.len();
        for reference in &mut self.references {
            reference.sim_reads = None;
            reference.sim_read_count = None;
            reference.sam_file = None;
            reference.pairwise_sams = vec![None; n];
        }
    }

    pub fn set_sim_reads(&mut self, i: usize, path: PathBuf, count: usize) -> io::Result<()> {
        let reference = self.get_mut(i)?;
        reference.sim_reads = Some(path);
        reference.sim_read_count = Some(count);
        Ok(())
    }

    pub fn set_sam_file(&mut self, i: usize, path: PathBuf) -> io::Result<()> {
        self.get_mut(i)?.sam_file = Some(path);
        Ok(())
    }

    pub fn set_pairwise_sam(&mut self, query: usize, subject: usize, path: PathBuf) -> io::Result<()> {
        if subject >= self.references.len() {
            return Err(row_not_found(subject));
        }
        self.get_mut(query)?.pairwise_sams[subject] = Some(path);
        Ok(())
    }

    /// Real-mapping SAM files in reference order; fails if any is unset
    pub fn sam_files(&self) -> io::Result<Vec<PathBuf>> {
        self.references
            .iter()
            .map(|r| {
                r.sam_file.clone().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("No SAM file recorded for reference '{}'", r.name()),
                    )
                })
            })
            .collect()
    }
}

fn row_not_found(i: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("row index {} not found", i),
    )
}
