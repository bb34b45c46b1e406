//! DNS question-name classifier.
//!
//! Builds a program that matches UDP DNS queries whose first question name
//! equals one of the given domains. A domain is a dot-separated name where a
//! label of `*` matches any single label, e.g. `*.example.com`.
//!
//! The program locates the question name (UDP header 8 bytes, DNS header 12
//! bytes past the end of the IP header) and compares the length-prefixed wire
//! encoding of each domain against the packet, one word at a time:
//!
//! ```text
//!   ldxb  4*([0]&0xf)         ; X = IPv4 header length (IPv6: ldx #60)
//!   ld    #20                 ; UDP + DNS headers
//!   add   x
//!   tax                       ; X = offset of the question name
//!   stx   M[0]                ; only with several domains
//! domain_0:
//!   ld    [x + 0]             ; "\x07exa"
//!   jeq   #0x07657861, +0, domain_1
//!   ...
//!   ret   #1
//! domain_1:
//!   ldx   M[0]
//!   ...
//!   ret   #0
//! ```
//!
//! IPv6 packets are assumed to carry UDP directly after the fixed header;
//! queries behind extension headers are not matched.

use clap::Parser;

use super::{Classifier, ClassifierKind, ClassifierResult, IpFamily, command_line};
use crate::bpf::disasm::disassemble;
use crate::bpf::*;
use crate::error::DnsbpfError;

const UDP_HEADER_LEN: u32 = 8;
const DNS_HEADER_LEN: u32 = 12;
const IPV6_HEADER_LEN: u32 = 40;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// Scratch slot holding the question name offset.
const QNAME_SLOT: u32 = 0;

/// Value returned on match; xt_bpf treats any non-zero value as a match.
const MATCH: u32 = 1;
const NO_MATCH: u32 = 0;

#[derive(Parser, Debug)]
#[command(
    name = "dnsbpf compile dns --",
    no_binary_name = true,
    about = "Match DNS queries for the given domains"
)]
struct DnsArgs {
    /// Compare ASCII letters case-insensitively
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Domains to match; a '*' label matches any single label
    #[arg(required = true, value_name = "DOMAIN")]
    domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
    Literal(Vec<u8>),
    Any,
}

/// A parsed domain pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    labels: Vec<Label>,
}

impl Pattern {
    fn parse(domain: &str) -> Result<Self, DnsbpfError> {
        let invalid =
            |why: &str| DnsbpfError::InvalidParameters(format!("domain '{domain}': {why}"));

        let trimmed = domain.strip_suffix('.').unwrap_or(domain);
        if trimmed.is_empty() {
            return Err(invalid("empty name"));
        }

        let mut labels = Vec::new();
        let mut encoded_len = 1; // root label
        for label in trimmed.split('.') {
            if label == "*" {
                labels.push(Label::Any);
                // A wildcard stands for at least a one-byte label.
                encoded_len += 2;
                continue;
            }
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(invalid("label longer than 63 bytes"));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            {
                return Err(invalid(
                    "labels may contain only letters, digits, '-' and '_'",
                ));
            }
            encoded_len += 1 + label.len();
            labels.push(Label::Literal(label.as_bytes().to_vec()));
        }

        if encoded_len > MAX_NAME_LEN {
            return Err(invalid("name longer than 255 bytes"));
        }
        Ok(Pattern { labels })
    }

    /// Identifier fragment: labels joined with '_', wildcards spelled "any".
    ///
    /// Case is kept unless the program ignores it, so programs that match
    /// different names never share an identifier.
    fn ident(&self, ignore_case: bool) -> String {
        self.labels
            .iter()
            .map(|l| match l {
                Label::Literal(bytes) if ignore_case => {
                    String::from_utf8_lossy(bytes).to_ascii_lowercase()
                }
                Label::Literal(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Label::Any => "any".to_string(),
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Instructions for one domain, with mismatch jumps resolved once the block
/// length is known.
struct Block {
    insns: Vec<bpf_insn>,
    /// Indices of instructions whose `jt` (true) or `jf` (false) branch must
    /// reach the first instruction after this block.
    fail_jumps: Vec<(usize, bool)>,
}

impl Block {
    fn new() -> Self {
        Block {
            insns: Vec::new(),
            fail_jumps: Vec::new(),
        }
    }

    fn push(&mut self, i: bpf_insn) {
        self.insns.push(i);
    }

    fn push_fail_if_false(&mut self, code: u16, k: u32) {
        self.fail_jumps.push((self.insns.len(), false));
        self.push(insn(code, 0, 0, k));
    }

    fn push_fail_if_true(&mut self, code: u16, k: u32) {
        self.fail_jumps.push((self.insns.len(), true));
        self.push(insn(code, 0, 0, k));
    }

    fn finish(mut self) -> Result<Vec<bpf_insn>, DnsbpfError> {
        let len = self.insns.len();
        for (idx, on_true) in self.fail_jumps {
            let offset = u8::try_from(len - idx - 1).map_err(|_| {
                DnsbpfError::Assembly(format!(
                    "jump over {} instructions exceeds the 255 limit",
                    len - idx - 1
                ))
            })?;
            if on_true {
                self.insns[idx].jt = offset;
            } else {
                self.insns[idx].jf = offset;
            }
        }
        Ok(self.insns)
    }
}

/// Emit comparisons of `bytes` against the packet at `[x + offset]`.
fn compare_bytes(block: &mut Block, bytes: &[u8], mut offset: u32, ignore_case: bool) -> u32 {
    let mut rest = bytes;
    while !rest.is_empty() {
        let (size, width) = match rest.len() {
            1 => (BPF_B, 1),
            2 | 3 => (BPF_H, 2),
            _ => (BPF_W, 4),
        };
        let (chunk, tail) = rest.split_at(width);

        let mut value = 0u32;
        let mut mask = 0u32;
        for b in chunk {
            let letter = ignore_case && b.is_ascii_alphabetic();
            let byte = if letter { b.to_ascii_lowercase() } else { *b };
            value = (value << 8) | byte as u32;
            mask = (mask << 8) | if letter { 0x20 } else { 0 };
        }

        block.push(insn(BPF_LD | size | BPF_IND, 0, 0, offset));
        if mask != 0 {
            block.push(insn(BPF_ALU | BPF_OR | BPF_K, 0, 0, mask));
        }
        block.push_fail_if_false(BPF_JMP | BPF_JEQ | BPF_K, value);

        offset += width as u32;
        rest = tail;
    }
    offset
}

fn pattern_block(
    pattern: &Pattern,
    reload_x: bool,
    ignore_case: bool,
) -> Result<Vec<bpf_insn>, DnsbpfError> {
    let mut block = Block::new();
    if reload_x {
        block.push(insn(BPF_LDX | BPF_W | BPF_MEM, 0, 0, QNAME_SLOT));
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut offset = 0u32;
    for label in &pattern.labels {
        match label {
            Label::Literal(bytes) => {
                pending.push(bytes.len() as u8);
                pending.extend_from_slice(bytes);
            }
            Label::Any => {
                offset = compare_bytes(&mut block, &pending, offset, ignore_case);
                pending.clear();
                // Skip one label of any length: X += offset + 1 + len.
                block.push(insn(BPF_LD | BPF_B | BPF_IND, 0, 0, offset));
                block.push_fail_if_true(BPF_JMP | BPF_JEQ | BPF_K, 0);
                block.push(insn(BPF_ALU | BPF_ADD | BPF_X, 0, 0, 0));
                block.push(insn(BPF_ALU | BPF_ADD | BPF_K, 0, 0, offset + 1));
                block.push(insn(BPF_MISC | BPF_TAX, 0, 0, 0));
                offset = 0;
            }
        }
    }
    pending.push(0);
    compare_bytes(&mut block, &pending, offset, ignore_case);
    block.push(insn(BPF_RET | BPF_K, 0, 0, MATCH));
    block.finish()
}

fn build_program(
    patterns: &[Pattern],
    family: IpFamily,
    l3_offset: u32,
    ignore_case: bool,
) -> Result<Vec<bpf_insn>, DnsbpfError> {
    let headers = UDP_HEADER_LEN + DNS_HEADER_LEN;
    let mut program = match family {
        IpFamily::V4 => vec![
            insn(BPF_LDX | BPF_B | BPF_MSH, 0, 0, l3_offset),
            insn(BPF_LD | BPF_IMM, 0, 0, l3_offset + headers),
            insn(BPF_ALU | BPF_ADD | BPF_X, 0, 0, 0),
            insn(BPF_MISC | BPF_TAX, 0, 0, 0),
        ],
        IpFamily::V6 => vec![insn(
            BPF_LDX | BPF_W | BPF_IMM,
            0,
            0,
            l3_offset + IPV6_HEADER_LEN + headers,
        )],
    };
    if patterns.len() > 1 {
        program.push(insn(BPF_STX, 0, 0, QNAME_SLOT));
    }

    for (idx, pattern) in patterns.iter().enumerate() {
        program.extend(pattern_block(pattern, idx > 0, ignore_case)?);
    }
    program.push(insn(BPF_RET | BPF_K, 0, 0, NO_MATCH));
    Ok(program)
}

/// Generator for the `dns` classifier type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsClassifier;

impl Classifier for DnsClassifier {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Dns
    }

    fn generate(
        &self,
        params: &[String],
        family: IpFamily,
        l3_offset: u32,
    ) -> Result<ClassifierResult, DnsbpfError> {
        let args = DnsArgs::try_parse_from(params)
            .map_err(|e| DnsbpfError::InvalidParameters(e.to_string().trim_end().to_string()))?;

        let patterns = args
            .domains
            .iter()
            .map(|d| Pattern::parse(d))
            .collect::<Result<Vec<_>, _>>()?;

        let program = build_program(&patterns, family, l3_offset, args.ignore_case)?;

        let idents: Vec<String> = patterns
            .iter()
            .map(|p| p.ident(args.ignore_case))
            .collect();
        let mut name = idents.join("-");
        if args.ignore_case {
            name.insert_str(0, "icase-");
        }

        Ok(ClassifierResult {
            command: command_line(self.kind(), family, params)?,
            bytecode: to_bytecode(&program),
            assembly: disassemble(&program),
            name,
        })
    }
}
