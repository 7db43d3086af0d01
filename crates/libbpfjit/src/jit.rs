//! Compiles classical BPF seccomp filters to native RV64 code.
//!
//! The generated code runs inline in the recompiler's syscall entry path,
//! after the dispatch stub has spilled the guest register file. It builds a
//! `seccomp_data` frame on the native stack, evaluates the filter against
//! it, and either falls through to the syscall (allow) or kills the guest
//! the way the kernel would have.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::asm::{Assembler, Label, Reg, A0, A1, A2, A7, RA, SP, T3, T4, T5, T6, ZERO};
use crate::bpf::*;
use crate::regs::{allocated_gpr, is_scratch, X86Gpr};

// Filter code uses the recompiler's scratch registers only:
// X -> x28, A -> x29, temporary -> x30, seccomp_data pointer -> x31.
const X: Reg = T3;
const A: Reg = T4;
const TEMP: Reg = T5;
const POINTER: Reg = T6;

const _: () = assert!(is_scratch(X));
const _: () = assert!(is_scratch(A));
const _: () = assert!(is_scratch(TEMP));
const _: () = assert!(is_scratch(POINTER));

// Host syscall numbers burned into the kill stubs.
const RISCV_NR_KILL: i64 = 129;
const RISCV_NR_TGKILL: i64 = 131;
const SIGKILL: i64 = libc::SIGKILL as i64;

const FRAME_SIZE: i32 = SECCOMP_DATA_SIZE as i32;

const NR_OFFSET: i32 = 0;
const ARCH_OFFSET: i32 = 4;
const RIP_OFFSET: i32 = 8;
const ARGS_OFFSET: i32 = 16;

/// Last-resort landing pad for filter code that reached a state the
/// translation cannot represent. Never returns.
pub extern "C" fn filter_abort() -> ! {
    std::process::abort()
}

pub fn filter_abort_address() -> u64 {
    filter_abort as usize as u64
}

struct BpfJit<'a> {
    asm: &'a mut Assembler,
    rip: u64,
    labels: Vec<Label>,
    end_of_program: Label,
    dump: bool,
}

impl<'a> BpfJit<'a> {
    fn new(asm: &'a mut Assembler, rip: u64, dump: bool) -> Self {
        let end_of_program = asm.new_label();
        Self {
            asm,
            rip,
            labels: Vec::new(),
            end_of_program,
            dump,
        }
    }

    fn compile_program(&mut self, prog: &[SockFilter]) -> Result<(), FilterError> {
        validate(prog)?;

        self.labels = (0..prog.len()).map(|_| self.asm.new_label()).collect();
        self.prologue();
        for (index, insn) in prog.iter().enumerate() {
            if self.dump {
                tracing::debug!("seccomp insn {index}: {insn}");
            }
            self.compile_instruction(insn, index);
        }
        // Well-formed BPF always returns. Guard the fall-through anyway.
        self.emit_crash_stub();
        self.asm.bind(self.end_of_program);
        self.epilogue();
        Ok(())
    }

    /// Builds the seccomp_data frame from the guest register file. The
    /// syscall number is the truncated guest rax, the architecture is always
    /// reported as x86-64 and the argument slots follow the x86-64 syscall
    /// argument order.
    fn prologue(&mut self) {
        self.asm.addi(SP, SP, -FRAME_SIZE);
        self.asm.mv(POINTER, SP);

        self.asm.sw(allocated_gpr(X86Gpr::Rax), NR_OFFSET, POINTER);

        self.asm.li(TEMP, AUDIT_ARCH_X86_64 as i32 as i64);
        self.asm.sw(TEMP, ARCH_OFFSET, POINTER);

        self.asm.li(TEMP, self.rip as i64);
        self.asm.sd(TEMP, RIP_OFFSET, POINTER);

        let args = [
            X86Gpr::Rdi,
            X86Gpr::Rsi,
            X86Gpr::Rdx,
            X86Gpr::R10,
            X86Gpr::R8,
            X86Gpr::R9,
        ];
        for (i, gpr) in args.into_iter().enumerate() {
            self.asm.sd(allocated_gpr(gpr), ARGS_OFFSET + 8 * i as i32, POINTER);
        }
    }

    fn epilogue(&mut self) {
        self.asm.addi(SP, SP, FRAME_SIZE);
    }

    /// Loads the kill-stub trampoline address and calls into it; control
    /// never comes back, the illegal word is a backstop.
    fn emit_crash_stub(&mut self) {
        self.asm.li(RA, filter_abort_address() as i64);
        self.asm.jalr(RA, RA, 0);
        self.asm.unimp();
    }

    /// Every live 32 bit value is kept sign extended to 64 bits: loads use
    /// lw, constants are materialized from their sign extended low half and
    /// the W-form ALU ops preserve the property. Under that invariant bltu
    /// and bgeu order 64 bit values exactly like the 32 bit unsigned
    /// comparison BPF asks for.
    fn compile_instruction(&mut self, insn: &SockFilter, index: usize) {
        let code = insn.code;
        self.asm.bind(self.labels[index]);

        let src = if bpf_src(code) == BPF_K { TEMP } else { X };

        match bpf_class(code) {
            BPF_LD => {
                self.asm.lw(A, insn.k as i32, POINTER);
            }
            BPF_ALU => {
                if bpf_src(code) == BPF_K {
                    self.asm.li(TEMP, insn.k as i32 as i64);
                }
                match bpf_op(code) {
                    BPF_ADD => self.asm.addw(A, A, src),
                    BPF_SUB => self.asm.subw(A, A, src),
                    BPF_MUL => self.asm.mulw(A, A, src),
                    BPF_DIV => {
                        // BPF division by zero yields zero instead of a trap.
                        let is_zero = self.asm.new_label();
                        let done = self.asm.new_label();
                        self.asm.beqz(src, is_zero);
                        self.asm.divw(A, A, src);
                        self.asm.j(done);
                        self.asm.bind(is_zero);
                        self.asm.mv(A, ZERO);
                        self.asm.bind(done);
                    }
                    BPF_OR => self.asm.or_(A, A, src),
                    BPF_AND => self.asm.and_(A, A, src),
                    BPF_LSH => self.asm.sllw(A, A, src),
                    BPF_RSH => self.asm.srlw(A, A, src),
                    BPF_NEG => self.asm.negw(A, A),
                    _ => self.asm.xor_(A, A, src),
                }
            }
            BPF_JMP => {
                let jump_true = self.labels[index + 1 + insn.jt as usize];
                if bpf_op(code) == BPF_JA {
                    self.asm.j(jump_true);
                    return;
                }
                let jump_false = self.labels[index + 1 + insn.jf as usize];
                if bpf_src(code) == BPF_K {
                    self.asm.li(TEMP, insn.k as i32 as i64);
                }
                match bpf_op(code) {
                    BPF_JEQ => self.asm.beq(A, src, jump_true),
                    BPF_JGT => self.asm.bltu(src, A, jump_true),
                    BPF_JGE => self.asm.bgeu(A, src, jump_true),
                    _ => {
                        // BPF_JSET
                        self.asm.and_(TEMP, A, src);
                        self.asm.bnez(TEMP, jump_true);
                    }
                }
                if insn.jf != 0 {
                    self.asm.j(jump_false);
                }
            }
            BPF_RET => match insn.k {
                SECCOMP_RET_KILL_PROCESS => {
                    self.asm.li(A7, RISCV_NR_KILL);
                    self.asm.li(A0, std::process::id() as i64);
                    self.asm.li(A1, SIGKILL);
                    self.asm.ecall();
                    self.emit_crash_stub();
                }
                SECCOMP_RET_KILL_THREAD => {
                    let tid = unsafe { libc::gettid() };
                    self.asm.li(A7, RISCV_NR_TGKILL);
                    self.asm.li(A0, std::process::id() as i64);
                    self.asm.li(A1, tid as i64);
                    self.asm.li(A2, SIGKILL);
                    self.asm.ecall();
                    self.emit_crash_stub();
                }
                SECCOMP_RET_LOG => {
                    tracing::warn!("SECCOMP_RET_LOG, treating as SECCOMP_RET_ALLOW");
                    self.asm.j(self.end_of_program);
                }
                SECCOMP_RET_ALLOW => {
                    self.asm.j(self.end_of_program);
                }
                other => {
                    tracing::warn!("unknown seccomp return value {other:#x}");
                    self.asm.unimp();
                }
            },
            _ => unreachable!("rejected by validate"),
        }
    }
}

#[derive(Default)]
struct FilterSlab {
    code: Vec<u8>,
    index: usize,
}

static FILTERS: Lazy<Mutex<FilterSlab>> = Lazy::new(|| Mutex::new(FilterSlab::default()));

/// Compiles `prog` and appends it to the accumulated filter slab. The slab
/// is emitted verbatim into the recompiled syscall entry, so filters run in
/// installation order, matching the kernel's newest-first... oldest-last
/// evaluation of stacked seccomp programs closely enough for the guests we
/// run (a single filter is by far the common case).
pub fn set_filter(flags: u32, prog: &[SockFilter], rip: u64, dump: bool) -> Result<(), FilterError> {
    if flags != 0 {
        tracing::warn!("unsupported seccomp filter flags: {flags:#x}");
    }

    let mut asm = Assembler::new();
    let mut jit = BpfJit::new(&mut asm, rip, dump);
    jit.compile_program(prog)?;
    let code = asm.into_code();
    assert!(code.len() % 4 == 0);

    let mut slab = FILTERS.lock().expect("filter slab mutex poisoned");
    while slab.code.len() - slab.index < code.len() {
        let grown = slab.code.len() + 4096;
        slab.code.resize(grown, 0);
    }
    let at = slab.index;
    slab.code[at..at + code.len()].copy_from_slice(&code);
    slab.index += code.len();
    tracing::warn!("seccomp filter installed");
    Ok(())
}

/// Raw-pointer entry used by the syscall layer. `fprog` is the guest's
/// `sock_fprog`; both the struct and the instruction array live in guest
/// memory, which is mapped in-process.
///
/// # Safety
/// `fprog` and the array it points to must be readable for the advertised
/// length.
pub unsafe fn set_filter_raw(
    flags: u32,
    fprog: *const SockFprog,
    rip: u64,
    dump: bool,
) -> Result<(), FilterError> {
    if fprog.is_null() {
        return Err(FilterError::NullProgram);
    }
    let fprog = &*fprog;
    if fprog.filter.is_null() {
        return Err(FilterError::NullProgram);
    }
    let prog = std::slice::from_raw_parts(fprog.filter, fprog.len as usize);
    set_filter(flags, prog, rip, dump)
}

/// Writes the accumulated filter code at the assembler's current position.
pub fn emit_filters(asm: &mut Assembler) {
    let slab = FILTERS.lock().expect("filter slab mutex poisoned");
    for word in slab.code[..slab.index].chunks(4) {
        asm.emit32(u32::from_le_bytes(word.try_into().unwrap()));
    }
}

pub fn has_filters() -> bool {
    FILTERS.lock().expect("filter slab mutex poisoned").index != 0
}

#[cfg(test)]
pub(crate) fn clear_filters() {
    let mut slab = FILTERS.lock().expect("filter slab mutex poisoned");
    slab.code.clear();
    slab.index = 0;
}
