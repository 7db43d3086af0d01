//! Guest seccomp installation.
//!
//! The syscall dispatcher calls [`set_filter`] when the guest issues
//! seccomp(SECCOMP_SET_MODE_FILTER); the program is compiled to native code
//! by libbpfjit and later spliced into the recompiled dispatch path via
//! [`emit_filters`].

use libbpfjit::bpf::SockFprog;

pub use libbpfjit::{emit_filters, has_filters};

use crate::config;

/// Compiles and installs a guest supplied filter. Returns false when the
/// program is rejected, in which case the guest sees the syscall fail.
///
/// # Safety
/// `args` must point at a readable guest sock_fprog whose filter array is
/// readable for the advertised length.
pub unsafe fn set_filter(flags: u32, args: *const SockFprog, rip: u64) -> bool {
    let dump = config::current().dump_seccomp;
    match libbpfjit::set_filter_raw(flags, args, rip, dump) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("rejecting seccomp filter: {err}");
            false
        }
    }
}
