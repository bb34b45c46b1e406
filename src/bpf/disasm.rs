//! Human-readable listing of classic BPF programs, in the style of `tcpdump -d`.
//!
//! Jump targets are printed as absolute instruction indices so the listing can
//! be read top to bottom without doing offset arithmetic.

use super::*;

/// Disassemble `program`, one instruction per line.
pub fn disassemble(program: &[bpf_insn]) -> String {
    program
        .iter()
        .enumerate()
        .map(|(pc, i)| format!("({pc:03}) {}", format_insn(pc, i)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn op(mnemonic: &str, operand: impl std::fmt::Display) -> String {
    format!("{mnemonic:<8} {operand}")
}

fn operand(code: u16, k: u32) -> String {
    if code & BPF_X != 0 {
        "x".to_string()
    } else {
        format!("#{k:#x}")
    }
}

fn format_insn(pc: usize, i: &bpf_insn) -> String {
    let code = i.code;
    let k = i.k;
    let unknown = || op(".word", format!("{code:#06x}"));

    match class(code) {
        BPF_LD => {
            let mnemonic = match code & 0x18 {
                BPF_W => "ld",
                BPF_H => "ldh",
                BPF_B => "ldb",
                _ => return unknown(),
            };
            match code & 0xe0 {
                BPF_ABS => op(mnemonic, format!("[{k}]")),
                BPF_IND => op(mnemonic, format!("[x + {k}]")),
                BPF_IMM => op("ld", format!("#{k:#x}")),
                BPF_MEM => op("ld", format!("M[{k}]")),
                BPF_LEN => op("ld", "#pktlen"),
                _ => unknown(),
            }
        }
        BPF_LDX => match code & 0xe0 {
            BPF_IMM => op("ldx", format!("#{k:#x}")),
            BPF_MEM => op("ldx", format!("M[{k}]")),
            BPF_MSH => op("ldxb", format!("4*([{k}]&0xf)")),
            BPF_LEN => op("ldx", "#pktlen"),
            _ => unknown(),
        },
        BPF_ST => op("st", format!("M[{k}]")),
        BPF_STX => op("stx", format!("M[{k}]")),
        BPF_ALU => {
            let mnemonic = match code & 0xf0 {
                BPF_ADD => "add",
                BPF_SUB => "sub",
                BPF_MUL => "mul",
                BPF_DIV => "div",
                BPF_OR => "or",
                BPF_AND => "and",
                BPF_LSH => "lsh",
                BPF_RSH => "rsh",
                BPF_NEG => return "neg".to_string(),
                _ => return unknown(),
            };
            op(mnemonic, operand(code, k))
        }
        BPF_JMP => {
            let mnemonic = match code & 0xf0 {
                BPF_JA => return op("ja", pc + 1 + k as usize),
                BPF_JEQ => "jeq",
                BPF_JGT => "jgt",
                BPF_JGE => "jge",
                BPF_JSET => "jset",
                _ => return unknown(),
            };
            let jt = pc + 1 + i.jt as usize;
            let jf = pc + 1 + i.jf as usize;
            op(mnemonic, format!("{} jt {jt} jf {jf}", operand(code, k)))
        }
        BPF_RET => {
            if code & 0x18 == BPF_A {
                op("ret", "a")
            } else {
                op("ret", format!("#{k}"))
            }
        }
        BPF_MISC => match code & 0xf8 {
            BPF_TAX => "tax".to_string(),
            BPF_TXA => "txa".to_string(),
            _ => unknown(),
        },
        _ => unknown(),
    }
}
