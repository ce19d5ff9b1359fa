//! Result rows written to the primary output stream.

use crate::correction::CorrectionResult;
use std::io::{self, Write};

/// Reason a metagenome was skipped without aborting the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftFailure {
    NoReadFile,
    UndesiredPlatform,
    UndeterminedPlatform,
    SimulationError,
    FormatConversionError,
}

impl SoftFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            SoftFailure::NoReadFile => "no_metagenome_read_file",
            SoftFailure::UndesiredPlatform => "undesired_platform",
            SoftFailure::UndeterminedPlatform => "undetermined_platform",
            SoftFailure::SimulationError => "read_simulation_error",
            SoftFailure::FormatConversionError => "read_file_format_conversion_error",
        }
    }
}

impl std::fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR:{}", self.reason())
    }
}

pub struct OutputWriter<W: Write> {
    writer: W,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(writer: W) -> Self {
        OutputWriter { writer }
    }

    /// One row per reference, in registry order
    pub fn write_result(
        &mut self,
        id: &str,
        ref_names: &[String],
        result: &CorrectionResult,
    ) -> io::Result<()> {
        if ref_names.len() != result.corrected.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} reference names for {} corrected abundances",
                    ref_names.len(),
                    result.corrected.len()
                ),
            ));
        }
        for (i, name) in ref_names.iter().enumerate() {
            writeln!(
                self.writer,
                "{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}",
                id,
                name,
                result.total,
                result.mapped[i],
                result.corrected[i],
                result.std_error[i],
                result.p_value[i]
            )?;
        }
        self.writer.flush()
    }

    pub fn write_error(&mut self, id: &str, failure: SoftFailure) -> io::Result<()> {
        writeln!(self.writer, "{}\t{}\tNA\tNA\tNA\tNA\tNA", id, failure)?;
        self.writer.flush()
    }

    /// Re-emit lines of a previous run unchanged
    pub fn replay(&mut self, lines: &[String]) -> io::Result<()> {
        for line in lines {
            writeln!(self.writer, "{}", line)?;
        }
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
