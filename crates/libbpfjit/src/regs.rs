//! Register convention shared with the recompiler.
//!
//! The recompiler statically allocates every guest general purpose register
//! to a host register and reserves x28 through x31 as scratch. Code spliced
//! into the translated stream, like the compiled seccomp filters, may only
//! clobber the scratch set.

use crate::asm::{Reg, A6, S0, S1, S10, S11, S2, S3, S4, S5, S6, S7, S8, S9, T0, T1, T2};

/// Guest x86-64 general purpose registers, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Host register statically holding the given guest register between
/// translated blocks.
pub const fn allocated_gpr(gpr: X86Gpr) -> Reg {
    match gpr {
        X86Gpr::Rax => S0,
        X86Gpr::Rcx => S1,
        X86Gpr::Rdx => S2,
        X86Gpr::Rbx => S3,
        X86Gpr::Rsp => S4,
        X86Gpr::Rbp => S5,
        X86Gpr::Rsi => S6,
        X86Gpr::Rdi => S7,
        X86Gpr::R8 => S8,
        X86Gpr::R9 => S9,
        X86Gpr::R10 => S10,
        X86Gpr::R11 => S11,
        X86Gpr::R12 => T0,
        X86Gpr::R13 => T1,
        X86Gpr::R14 => T2,
        X86Gpr::R15 => A6,
    }
}

/// Whether `reg` belongs to the recompiler's scratch set.
pub const fn is_scratch(reg: Reg) -> bool {
    reg.0 >= 28
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_registers_never_live_in_scratch() {
        for gpr in [
            X86Gpr::Rax,
            X86Gpr::Rcx,
            X86Gpr::Rdx,
            X86Gpr::Rbx,
            X86Gpr::Rsp,
            X86Gpr::Rbp,
            X86Gpr::Rsi,
            X86Gpr::Rdi,
            X86Gpr::R8,
            X86Gpr::R9,
            X86Gpr::R10,
            X86Gpr::R11,
            X86Gpr::R12,
            X86Gpr::R13,
            X86Gpr::R14,
            X86Gpr::R15,
        ] {
            assert!(!is_scratch(allocated_gpr(gpr)));
        }
    }
}
