//! Reference interpreter for the translated BPF subset.
//!
//! The dump path uses it to show what an installed filter decides for a
//! given syscall frame, and the test suite uses it as the behavioural
//! oracle for the native translation.

use crate::bpf::*;

fn load_word(data: &SeccompData, k: u32) -> u32 {
    // repr(C) with no padding, so a byte view of the frame is well defined.
    let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(data as *const SeccompData as *const u8, SECCOMP_DATA_SIZE)
    };
    let k = k as usize;
    u32::from_ne_bytes(bytes[k..k + 4].try_into().unwrap())
}

/// Runs `prog` over `data` and returns the `SECCOMP_RET_*` action word.
pub fn execute(prog: &[SockFilter], data: &SeccompData) -> Result<u32, FilterError> {
    validate(prog)?;

    let mut acc: u32 = 0;
    // The index register exists in the model but nothing in the translated
    // subset can write it, so it stays zero.
    let index: u32 = 0;
    let mut pc = 0usize;

    while pc < prog.len() {
        let insn = &prog[pc];
        let code = insn.code;
        let operand = if bpf_src(code) == BPF_K { insn.k } else { index };

        match bpf_class(code) {
            BPF_LD => acc = load_word(data, insn.k),
            BPF_ALU => {
                acc = match bpf_op(code) {
                    BPF_ADD => acc.wrapping_add(operand),
                    BPF_SUB => acc.wrapping_sub(operand),
                    BPF_MUL => acc.wrapping_mul(operand),
                    BPF_DIV => acc.checked_div(operand).unwrap_or(0),
                    BPF_OR => acc | operand,
                    BPF_AND => acc & operand,
                    BPF_LSH => acc.wrapping_shl(operand),
                    BPF_RSH => acc.wrapping_shr(operand),
                    BPF_NEG => acc.wrapping_neg(),
                    _ => acc ^ operand,
                };
            }
            BPF_JMP => {
                let taken = match bpf_op(code) {
                    BPF_JA => true,
                    BPF_JEQ => acc == operand,
                    BPF_JGT => acc > operand,
                    BPF_JGE => acc >= operand,
                    _ => acc & operand != 0,
                };
                let delta = if taken { insn.jt } else { insn.jf };
                pc += 1 + delta as usize;
                continue;
            }
            BPF_RET => return Ok(insn.k),
            _ => unreachable!("rejected by validate"),
        }

        pc += 1;
    }

    Err(FilterError::FellOffEnd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(nr: u32) -> SeccompData {
        SeccompData {
            nr,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0x40_1000,
            args: [1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn kill_on_matching_syscall_number() {
        // Deny exit(60), allow everything else.
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 0),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 60, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];
        assert_eq!(execute(&prog, &frame(60)), Ok(SECCOMP_RET_KILL_PROCESS));
        assert_eq!(execute(&prog, &frame(59)), Ok(SECCOMP_RET_ALLOW));
        assert_eq!(execute(&prog, &frame(0)), Ok(SECCOMP_RET_ALLOW));
    }

    #[test]
    fn loads_arguments_from_the_frame() {
        // args[0] is at offset 16; the test frame stores 1 there.
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 16),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_THREAD),
        ];
        assert_eq!(execute(&prog, &frame(0)), Ok(SECCOMP_RET_ALLOW));
    }

    #[test]
    fn arithmetic_wraps_and_division_by_zero_yields_zero() {
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 0),
            SockFilter::stmt(BPF_ALU | BPF_DIV | BPF_K, 0),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRAP),
        ];
        assert_eq!(execute(&prog, &frame(0xffff_ffff)), Ok(SECCOMP_RET_ALLOW));
    }

    #[test]
    fn unsigned_comparisons() {
        // 0x8000_0000 > 1 only under unsigned comparison.
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 0),
            SockFilter::jump(BPF_JMP | BPF_JGT | BPF_K, 1, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
        ];
        assert_eq!(execute(&prog, &frame(0x8000_0000)), Ok(SECCOMP_RET_ALLOW));
        assert_eq!(execute(&prog, &frame(1)), Ok(SECCOMP_RET_KILL_PROCESS));
    }

    #[test]
    fn ja_takes_the_true_displacement() {
        let prog = [
            SockFilter::jump(BPF_JMP | BPF_JA, 0, 1, 0),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];
        assert_eq!(execute(&prog, &frame(0)), Ok(SECCOMP_RET_ALLOW));
    }
}
