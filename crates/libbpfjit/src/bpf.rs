//! Classical BPF program representation, as installed by the guest through
//! the seccomp and socket-filter syscalls, plus the install-time validator
//! that decides whether a program stays inside the translated subset.

use std::fmt;
use std::mem;

// Instruction class, low three bits of the opcode.
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// Load size.
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// Load mode.
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// ALU / jump operation.
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// Operand source.
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;
// Third return-value source, only meaningful for BPF_RET.
pub const BPF_A: u16 = 0x10;

pub const BPF_MAXINSNS: usize = 4096;

pub const fn bpf_class(code: u16) -> u16 {
    code & 0x07
}

pub const fn bpf_size(code: u16) -> u16 {
    code & 0x18
}

pub const fn bpf_mode(code: u16) -> u16 {
    code & 0xe0
}

pub const fn bpf_op(code: u16) -> u16 {
    code & 0xf0
}

pub const fn bpf_src(code: u16) -> u16 {
    code & 0x08
}

pub const fn bpf_rval(code: u16) -> u16 {
    code & 0x18
}

// Seccomp return actions.
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

/// One classical BPF instruction, identical layout to the kernel's
/// `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

/// The 64 bit guest's `struct sock_fprog`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// The frame the translated dispatch path synthesizes on the native stack
/// from the guest register file. Compiled filters read nothing else.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompData {
    pub nr: u32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

pub const SECCOMP_DATA_SIZE: usize = mem::size_of::<SeccompData>();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("filter program is empty")]
    Empty,
    #[error("filter program has {0} instructions, more than the {BPF_MAXINSNS} the kernel accepts")]
    TooLong(usize),
    #[error("filter program pointer is null")]
    NullProgram,
    #[error("instruction {index}: unsupported class {code:#06x}")]
    UnsupportedClass { index: usize, code: u16 },
    #[error("instruction {index}: only 32 bit absolute loads from seccomp_data are supported")]
    UnsupportedLoad { index: usize },
    #[error("instruction {index}: load offset {k:#x} outside seccomp_data")]
    LoadOutOfBounds { index: usize, k: u32 },
    #[error("instruction {index}: unsupported ALU op {op:#04x}")]
    UnsupportedAluOp { index: usize, op: u16 },
    #[error("instruction {index}: unsupported jump op {op:#04x}")]
    UnsupportedJumpOp { index: usize, op: u16 },
    #[error("instruction {index}: jump target past the end of the program")]
    JumpOutOfBounds { index: usize },
    #[error("instruction {index}: return value from X or A is not supported")]
    UnsupportedReturn { index: usize },
    #[error("filter ran off the end of the program")]
    FellOffEnd,
}

/// Install-time check that a program stays inside the subset the translator
/// understands. Programs using scratch memory, packet-style loads or the
/// unimplemented return sources are rejected here instead of being compiled
/// into crash stubs.
pub fn validate(prog: &[SockFilter]) -> Result<(), FilterError> {
    if prog.is_empty() {
        return Err(FilterError::Empty);
    }
    if prog.len() > BPF_MAXINSNS {
        return Err(FilterError::TooLong(prog.len()));
    }

    for (index, insn) in prog.iter().enumerate() {
        let code = insn.code;
        match bpf_class(code) {
            BPF_LD => {
                if bpf_size(code) != BPF_W || bpf_mode(code) != BPF_ABS {
                    return Err(FilterError::UnsupportedLoad { index });
                }
                let k = insn.k as usize;
                if k % 4 != 0 || k + 4 > SECCOMP_DATA_SIZE {
                    return Err(FilterError::LoadOutOfBounds { index, k: insn.k });
                }
            }
            BPF_ALU => match bpf_op(code) {
                BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_OR | BPF_AND | BPF_LSH | BPF_RSH
                | BPF_NEG | BPF_XOR => {}
                op => return Err(FilterError::UnsupportedAluOp { index, op }),
            },
            BPF_JMP => {
                match bpf_op(code) {
                    BPF_JA | BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET => {}
                    op => return Err(FilterError::UnsupportedJumpOp { index, op }),
                }
                // Both arms must land on an instruction that exists.
                let reachable = |delta: u8| index + 1 + (delta as usize) < prog.len();
                if !reachable(insn.jt) || (bpf_op(code) != BPF_JA && !reachable(insn.jf)) {
                    return Err(FilterError::JumpOutOfBounds { index });
                }
            }
            BPF_RET => {
                if bpf_rval(code) != BPF_K {
                    return Err(FilterError::UnsupportedReturn { index });
                }
            }
            _ => {
                return Err(FilterError::UnsupportedClass { index, code });
            }
        }
    }

    Ok(())
}

impl fmt::Display for SockFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code;
        let class = match bpf_class(code) {
            BPF_LD => "BPF_LD",
            BPF_LDX => "BPF_LDX",
            BPF_ST => "BPF_ST",
            BPF_STX => "BPF_STX",
            BPF_ALU => "BPF_ALU",
            BPF_JMP => "BPF_JMP",
            BPF_RET => "BPF_RET",
            _ => "BPF_MISC",
        };
        let size = match bpf_size(code) {
            BPF_W => "BPF_W",
            BPF_H => "BPF_H",
            _ => "BPF_B",
        };
        let mode = match bpf_mode(code) {
            BPF_IMM => "BPF_IMM",
            BPF_ABS => "BPF_ABS",
            BPF_IND => "BPF_IND",
            BPF_MEM => "BPF_MEM",
            BPF_LEN => "BPF_LEN",
            _ => "BPF_MSH",
        };
        let op = match bpf_op(code) {
            BPF_ADD => "BPF_ADD",
            BPF_SUB => "BPF_SUB",
            BPF_MUL => "BPF_MUL",
            BPF_DIV => "BPF_DIV",
            BPF_OR => "BPF_OR",
            BPF_AND => "BPF_AND",
            BPF_LSH => "BPF_LSH",
            BPF_RSH => "BPF_RSH",
            BPF_NEG => "BPF_NEG",
            BPF_MOD => "BPF_MOD",
            _ => "BPF_XOR",
        };
        let jop = match bpf_op(code) {
            BPF_JA => "BPF_JA",
            BPF_JEQ => "BPF_JEQ",
            BPF_JGT => "BPF_JGT",
            BPF_JGE => "BPF_JGE",
            BPF_JSET => "BPF_JSET",
            _ => "BPF_J???",
        };
        let src = if bpf_src(code) == BPF_K { "BPF_K" } else { "BPF_X" };

        match bpf_class(code) {
            BPF_LD | BPF_LDX | BPF_ST | BPF_STX => {
                write!(f, "{class} | {size} | {mode} (k: {:#x})", self.k)
            }
            BPF_ALU => write!(f, "{class} | {op} | {src} (k: {:#x})", self.k),
            BPF_JMP => write!(
                f,
                "{class} | {jop} | {src} (k: {:#x}, jt: {:#x}, jf: {:#x})",
                self.k, self.jt, self.jf
            ),
            BPF_RET => write!(f, "{class} | {src} (k: {:#x})", self.k),
            _ => write!(f, "{class} (k: {:#x})", self.k),
        }
    }
}
