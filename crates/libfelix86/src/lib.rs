//! Runtime services for the felix86 emulator: configuration, the sandboxed
//! guest filesystem view, file descriptor protection, the 32 bit socket ABI
//! shims and seccomp filter installation.
//!
//! The recompiler, ELF loader and thread state machine live elsewhere and
//! consume these services through the process-wide state in [`state`].

pub mod config;
pub mod fd;
pub mod fs;
pub mod seccomp;
pub mod socket32;
pub mod state;
pub mod sudo;
pub mod utils;

use nix::errno::Errno;

/// Full startup sequence for an emulator process: configuration (the
/// cross-execve child path when the parent left a snapshot, the file and
/// environment path otherwise), then the rootfs view, trusted folders and
/// emulated nodes derived from it.
pub fn initialize_runtime() -> anyhow::Result<()> {
    if std::env::var_os(config::CONFIG_ENV).is_some() {
        config::initialize_child()?;
    } else {
        config::initialize(false)?;
    }

    let rootfs = config::current().rootfs_path.clone();
    state::initialize_rootfs(&rootfs)?;
    state::install_trusted_folders(&config::trusted_paths()?);
    fs::emulated::initialize_emulated_nodes();
    Ok(())
}

/// Result of a translated syscall: the host return value, or the errno the
/// guest should observe.
pub type SysResult = Result<i64, Errno>;

/// Collapses a [`SysResult`] into the `-errno` convention the translated
/// code expects. Nothing on the JITed-code boundary unwinds.
pub fn sysret(result: SysResult) -> i64 {
    match result {
        Ok(value) => value,
        Err(errno) => -(errno as i32) as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn sysret_maps_errors_to_negative_errno() {
        assert_eq!(sysret(Ok(7)), 7);
        assert_eq!(sysret(Err(Errno::ENOENT)), -2);
        assert_eq!(sysret(Err(Errno::EBADF)), -9);
    }

    #[test]
    #[serial]
    fn runtime_initialization_wires_config_into_the_resolver() {
        let home = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let rootfs_path = rootfs.path().canonicalize().unwrap();

        let old_home = env::var_os("HOME");
        env::set_var("HOME", home.path());
        env::remove_var("SUDO_HOME");
        env::remove_var(config::CONFIG_ENV);
        env::set_var("FELIX86_ROOTFS", &rootfs_path);

        let result = initialize_runtime();

        env::remove_var("FELIX86_ROOTFS");
        match old_home {
            Some(v) => env::set_var("HOME", v),
            None => env::remove_var("HOME"),
        }

        result.unwrap();
        let state = state::lock();
        assert_eq!(state.rootfs_path, rootfs_path);
        assert!(state.rootfs_fd > 2);
        assert!(state.protected_fds.contains(&state.rootfs_fd));
    }
}
