use std::io::Write;

use crate::classifier::ClassifierResult;
use crate::error::DnsbpfError;

/// Write the classifier artifact as JSON to the given writer.
pub fn write_json(result: &ClassifierResult, writer: &mut impl Write) -> Result<(), DnsbpfError> {
    serde_json::to_writer_pretty(&mut *writer, result)
        .map_err(|e| DnsbpfError::Serialization(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(DnsbpfError::Serialization)
}
