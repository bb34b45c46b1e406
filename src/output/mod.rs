pub mod file;
pub mod json;
pub mod text;

use std::io::Write;

use crate::classifier::ClassifierResult;
use crate::cli::OutputFormat;
use crate::error::DnsbpfError;

/// Write a classifier artifact in the specified format.
pub fn write_classifier(
    result: &ClassifierResult,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), DnsbpfError> {
    match format {
        OutputFormat::Bytecode => text::write_bytecode(result, writer),
        OutputFormat::Assembly => text::write_assembly(result, writer),
        OutputFormat::Json => json::write_json(result, writer),
    }
}
