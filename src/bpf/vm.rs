//! Minimal classic BPF interpreter used by the tests to run generated programs.
//!
//! Follows the kernel's `sk_run_filter` semantics for the instructions the
//! generators emit: out-of-bounds loads and division by zero reject the packet,
//! jumps are relative to the next instruction, and falling off the end rejects.

use super::*;

fn load(packet: &[u8], off: usize, size: u16) -> Option<u32> {
    let width = match size {
        BPF_W => 4,
        BPF_H => 2,
        BPF_B => 1,
        _ => return None,
    };
    let bytes = packet.get(off..off.checked_add(width)?)?;
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Execute `program` against `packet` and return the `RET` value (0 = no match).
pub(crate) fn execute(program: &[bpf_insn], packet: &[u8]) -> u32 {
    run(program, packet).unwrap_or(0)
}

fn run(program: &[bpf_insn], packet: &[u8]) -> Option<u32> {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; 16];
    let mut pc = 0usize;

    while let Some(inst) = program.get(pc) {
        let code = inst.code;
        let k = inst.k;
        let size = code & 0x18;
        let src = if code & BPF_X != 0 { x } else { k };

        match class(code) {
            BPF_LD => {
                a = match code & 0xe0 {
                    BPF_ABS => load(packet, k as usize, size)?,
                    BPF_IND => load(packet, x.checked_add(k)? as usize, size)?,
                    BPF_IMM => k,
                    BPF_MEM => *mem.get(k as usize)?,
                    BPF_LEN => packet.len() as u32,
                    _ => return None,
                }
            }
            BPF_LDX => {
                x = match code & 0xe0 {
                    BPF_IMM => k,
                    BPF_MEM => *mem.get(k as usize)?,
                    BPF_MSH => (load(packet, k as usize, BPF_B)? & 0x0f) * 4,
                    BPF_LEN => packet.len() as u32,
                    _ => return None,
                }
            }
            BPF_ST => *mem.get_mut(k as usize)? = a,
            BPF_STX => *mem.get_mut(k as usize)? = x,
            BPF_ALU => {
                a = match code & 0xf0 {
                    BPF_ADD => a.wrapping_add(src),
                    BPF_SUB => a.wrapping_sub(src),
                    BPF_MUL => a.wrapping_mul(src),
                    BPF_DIV => a.checked_div(src)?,
                    BPF_OR => a | src,
                    BPF_AND => a & src,
                    BPF_LSH => a.wrapping_shl(src),
                    BPF_RSH => a.wrapping_shr(src),
                    BPF_NEG => a.wrapping_neg(),
                    _ => return None,
                }
            }
            BPF_JMP => {
                let taken = match code & 0xf0 {
                    BPF_JA => {
                        pc += k as usize;
                        None
                    }
                    BPF_JEQ => Some(a == src),
                    BPF_JGT => Some(a > src),
                    BPF_JGE => Some(a >= src),
                    BPF_JSET => Some(a & src != 0),
                    _ => return None,
                };
                match taken {
                    Some(true) => pc += inst.jt as usize,
                    Some(false) => pc += inst.jf as usize,
                    None => {}
                }
            }
            BPF_RET => {
                return Some(if size == BPF_A { a } else { k });
            }
            BPF_MISC => match code & 0xf8 {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return None,
            },
            _ => return None,
        }
        pc += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_constant() {
        assert_eq!(execute(&[insn(BPF_RET | BPF_K, 0, 0, 7)], &[]), 7);
    }

    #[test]
    fn falling_off_the_end_rejects() {
        assert_eq!(execute(&[insn(BPF_LD | BPF_IMM, 0, 0, 1)], &[]), 0);
    }

    #[test]
    fn out_of_bounds_load_rejects() {
        let prog = [
            insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, 2),
            insn(BPF_RET | BPF_K, 0, 0, 1),
        ];
        assert_eq!(execute(&prog, &[1, 2, 3, 4, 5]), 0);
        assert_eq!(execute(&prog, &[1, 2, 3, 4, 5, 6]), 1);
    }

    #[test]
    fn msh_computes_header_length() {
        let prog = [
            insn(BPF_LDX | BPF_B | BPF_MSH, 0, 0, 0),
            insn(BPF_MISC | BPF_TXA, 0, 0, 0),
            insn(BPF_RET | BPF_A, 0, 0, 0),
        ];
        assert_eq!(execute(&prog, &[0x46]), 24);
    }

    #[test]
    fn conditional_jumps_are_relative() {
        let prog = [
            insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 0),
            insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 0x2a),
            insn(BPF_RET | BPF_K, 0, 0, 0),
            insn(BPF_RET | BPF_K, 0, 0, 1),
        ];
        assert_eq!(execute(&prog, &[0x2a]), 1);
        assert_eq!(execute(&prog, &[0x2b]), 0);
    }

    #[test]
    fn scratch_memory_round_trips_x() {
        let prog = [
            insn(BPF_LDX | BPF_IMM, 0, 0, 9),
            insn(BPF_STX, 0, 0, 3),
            insn(BPF_LDX | BPF_IMM, 0, 0, 0),
            insn(BPF_LD | BPF_MEM, 0, 0, 3),
            insn(BPF_RET | BPF_A, 0, 0, 0),
        ];
        assert_eq!(execute(&prog, &[]), 9);
    }
}
