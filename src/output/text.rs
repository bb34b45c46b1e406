use std::io::Write;

use crate::classifier::ClassifierResult;
use crate::error::DnsbpfError;

/// Write the xt_bpf bytecode on a single line, ready for `--bytecode`.
pub fn write_bytecode(
    result: &ClassifierResult,
    writer: &mut impl Write,
) -> Result<(), DnsbpfError> {
    writeln!(writer, "{}", result.bytecode).map_err(DnsbpfError::Serialization)
}

/// Write the disassembly, preceded by the command that produced it.
pub fn write_assembly(
    result: &ClassifierResult,
    writer: &mut impl Write,
) -> Result<(), DnsbpfError> {
    writeln!(writer, "; {}", result.command).map_err(DnsbpfError::Serialization)?;
    writeln!(writer, "{}", result.assembly).map_err(DnsbpfError::Serialization)
}
