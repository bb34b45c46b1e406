//! Classic BPF instructions and the xt_bpf textual bytecode format.
//!
//! The iptables `bpf` match takes a program as `--bytecode "N,c t f k,c t f k,..."`:
//! a decimal instruction count followed by one comma-separated entry per
//! instruction, each entry being the four `sock_filter` fields in decimal.

pub mod disasm;
#[cfg(test)]
pub(crate) mod vm;

use std::fmt::Write;

use crate::error::DnsbpfError;

/// A single classic BPF instruction, matching the kernel `struct sock_filter`.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct bpf_insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<bpf_insn>() == 8);

/// Largest program the xt_bpf match accepts (`XT_BPF_MAX_NUM_INSTR`).
pub const XT_BPF_MAX_NUM_INSTR: usize = 64;

// ---------------------------------------------------------------------------
// Opcode fields
// ---------------------------------------------------------------------------

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// LD/LDX sizes
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// LD/LDX modes
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// ALU operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;

// JMP operations
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// Operand source
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// RET operand
pub const BPF_A: u16 = 0x10;

// MISC operations
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Extract the instruction class from an opcode.
pub const fn class(code: u16) -> u16 {
    code & 0x07
}

/// Construct a single `bpf_insn` with the given fields.
pub fn insn(code: u16, jt: u8, jf: u8, k: u32) -> bpf_insn {
    bpf_insn { code, jt, jf, k }
}

/// Render a program in xt_bpf bytecode form.
pub fn to_bytecode(program: &[bpf_insn]) -> String {
    let mut out = program.len().to_string();
    for i in program {
        // Writing to a String cannot fail.
        let _ = write!(out, ",{} {} {} {}", i.code, i.jt, i.jf, i.k);
    }
    out
}

/// Read the instruction count declared in the leading field of `bytecode`.
pub fn declared_len(bytecode: &str) -> Result<usize, DnsbpfError> {
    let head = bytecode.split(',').next().unwrap_or_default().trim();
    head.parse().map_err(|_| {
        DnsbpfError::MalformedBytecode(format!("'{head}' is not an instruction count"))
    })
}

/// Parse xt_bpf bytecode back into instructions.
///
/// The declared count must agree with the number of instructions present.
pub fn parse_bytecode(bytecode: &str) -> Result<Vec<bpf_insn>, DnsbpfError> {
    let declared = declared_len(bytecode)?;
    let program = bytecode
        .split(',')
        .skip(1)
        .enumerate()
        .map(|(idx, entry)| parse_entry(idx, entry))
        .collect::<Result<Vec<_>, _>>()?;

    if program.len() != declared {
        return Err(DnsbpfError::MalformedBytecode(format!(
            "declares {declared} instructions but contains {}",
            program.len()
        )));
    }
    Ok(program)
}

fn parse_entry(idx: usize, entry: &str) -> Result<bpf_insn, DnsbpfError> {
    let malformed = || {
        DnsbpfError::MalformedBytecode(format!(
            "instruction {idx} ('{}') is not 'code jt jf k'",
            entry.trim()
        ))
    };
    let fields: Vec<&str> = entry.split_whitespace().collect();
    let [code, jt, jf, k] = fields.as_slice() else {
        return Err(malformed());
    };
    Ok(insn(
        code.parse().map_err(|_| malformed())?,
        jt.parse().map_err(|_| malformed())?,
        jf.parse().map_err(|_| malformed())?,
        k.parse().map_err(|_| malformed())?,
    ))
}
