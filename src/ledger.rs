use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Rows emitted by a previous run, keyed by metagenome id
#[derive(Debug, Default)]
pub struct RunLedger {
    rows: FxHashMap<String, Vec<String>>,
}

impl RunLedger {
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to open last-run file '{}': {}", path.display(), e),
            )
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Headerless tab-delimited rows; the first column is the metagenome id
    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut rows: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let id = line.split('\t').next().unwrap_or("").trim();
            rows.entry(id.to_string()).or_default().push(line.to_string());
        }
        Ok(RunLedger { rows })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Previously emitted lines for `id`, in file order
    pub fn rows(&self, id: &str) -> Option<&[String]> {
        self.rows.get(id).map(|v| v.as_slice())
    }

    /// Number of metagenomes recorded
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rows_grouped_by_id() {
        let text = "mgm1234567.3\tref_a.fa\t100\t40\t0.400000\t0.010000\t0.000000\n\
                    mgm1234567.3\tref_b.fa\t100\t10\t0.100000\t0.020000\t0.030000\n\
                    \n\
                    mgm7654321.3\tERROR:undesired_platform\tNA\tNA\tNA\tNA\tNA\n";
        let ledger = RunLedger::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("mgm1234567.3"));
        assert!(!ledger.contains("mgm0000001.3"));
        let rows = ledger.rows("mgm1234567.3").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].starts_with("mgm1234567.3\tref_b.fa"));
        assert_eq!(
            ledger.rows("mgm7654321.3").unwrap()[0],
            "mgm7654321.3\tERROR:undesired_platform\tNA\tNA\tNA\tNA\tNA"
        );
    }

    #[test]
    fn test_empty_ledger() {
        let ledger = RunLedger::from_reader(Cursor::new("")).unwrap();
        assert!(ledger.is_empty());
        assert!(ledger.rows("anything").is_none());
    }
}
