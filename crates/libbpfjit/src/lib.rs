//! Native translation of guest-installed classical BPF filters.
//!
//! Guests may install seccomp filters; since guest syscalls never reach the
//! host kernel as themselves, the filters are instead compiled to RV64 code
//! that the recompiler splices into its syscall entry path.

pub mod asm;
pub mod bpf;
pub mod interp;
pub mod jit;
pub mod regs;

pub use bpf::{FilterError, SeccompData, SockFilter, SockFprog};
pub use jit::{emit_filters, has_filters, set_filter, set_filter_raw};
