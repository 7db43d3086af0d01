//! Process-wide emulator state.
//!
//! One mutex guards everything that guest threads can race on: the
//! protected descriptor set, the fake mount table and the rootfs
//! identity. Syscall translation reads the pieces it needs under the lock
//! and performs the actual host syscalls unlocked.

use std::collections::BTreeSet;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

use crate::fd;
use crate::utils::PathBufExt;

/// Overlays a host directory at a guest visible location, bypassing rootfs
/// containment for everything below `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    /// Host side source.
    pub src: PathBuf,
    /// Guest visible destination prefix.
    pub dst: PathBuf,
}

/// Guest destination under which trusted folders appear.
pub const TRUSTED_MOUNT_ROOT: &str = "/run/felix86/trusted";

#[derive(Debug)]
pub struct EmuState {
    /// Host path the guest observes as `/`. Always lexically normalized so
    /// prefix checks cannot be defeated by trailing slashes.
    pub rootfs_path: PathBuf,
    /// O_PATH descriptor on `rootfs_path`; stays in sync with it.
    pub rootfs_fd: RawFd,
    /// Absolute host path of the loaded guest executable, recorded by the
    /// ELF loader. Answers `/proc/self/exe`.
    pub executable_path: PathBuf,
    pub fake_mounts: Vec<FakeMount>,
    pub protected_fds: BTreeSet<RawFd>,
}

impl EmuState {
    fn new() -> Self {
        Self {
            rootfs_path: PathBuf::new(),
            rootfs_fd: -1,
            executable_path: PathBuf::new(),
            fake_mounts: Vec::new(),
            protected_fds: BTreeSet::new(),
        }
    }
}

static STATES: Lazy<Mutex<EmuState>> = Lazy::new(|| Mutex::new(EmuState::new()));

pub fn lock() -> MutexGuard<'static, EmuState> {
    STATES.lock().expect("emulator state mutex poisoned")
}

/// Records the rootfs and opens the long lived O_PATH descriptor on it.
/// The descriptor is protected so the guest cannot close it.
pub fn initialize_rootfs(path: &Path) -> Result<()> {
    let normalized = path.normalize();
    let fd = open_rootfs_fd(&normalized)
        .with_context(|| format!("failed to open rootfs {}", normalized.display()))?;

    let mut state = lock();
    let old_fd = state.rootfs_fd;
    if old_fd >= 0 {
        state.protected_fds.remove(&old_fd);
        unsafe { libc::close(old_fd) };
    }
    state.rootfs_path = normalized;
    state.rootfs_fd = fd;
    fd::protect_with(&mut state, fd);
    Ok(())
}

pub(crate) fn open_rootfs_fd(path: &Path) -> std::result::Result<RawFd, nix::errno::Errno> {
    let cpath = crate::utils::to_cstring(path)?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(fd)
}

pub fn set_executable_path(path: &Path) {
    lock().executable_path = path.normalize();
}

/// Registers a fake mount. First registration wins on overlapping prefixes,
/// matching resolution order.
pub fn add_fake_mount(src: &Path, dst: &Path) {
    let mut state = lock();
    let mount = FakeMount {
        src: src.normalize(),
        dst: dst.normalize(),
    };
    tracing::debug!("fake mount {} -> {}", mount.dst.display(), mount.src.display());
    state.fake_mounts.push(mount);
}

/// Exposes user-trusted host folders inside the guest view, each mounted at
/// a synthesized destination below [`TRUSTED_MOUNT_ROOT`].
pub fn install_trusted_folders(paths: &[PathBuf]) {
    for path in paths {
        let Some(name) = path.file_name() else {
            tracing::warn!("ignoring trusted path without a final component: {}", path.display());
            continue;
        };
        let dst = Path::new(TRUSTED_MOUNT_ROOT).join(name);
        add_fake_mount(path, &dst);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Points the resolver at a scratch rootfs and clears leftover mounts
    /// and the recorded executable. Callers run under `#[serial]`.
    pub fn set_rootfs(path: &Path) {
        let normalized = path.normalize();
        let fd = open_rootfs_fd(&normalized).expect("failed to open test rootfs");
        let mut state = lock();
        let old_fd = state.rootfs_fd;
        if old_fd >= 0 {
            state.protected_fds.remove(&old_fd);
            unsafe { libc::close(old_fd) };
        }
        state.rootfs_path = normalized;
        state.rootfs_fd = fd;
        crate::fd::protect_with(&mut state, fd);
        state.fake_mounts.clear();
        state.executable_path = PathBuf::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn trusted_folders_become_fake_mounts() {
        let dir = tempfile::tempdir().unwrap();
        test_support::set_rootfs(dir.path());

        install_trusted_folders(&[PathBuf::from("/opt/games"), PathBuf::from("/")]);

        let state = lock();
        assert_eq!(state.fake_mounts.len(), 1);
        assert_eq!(state.fake_mounts[0].src, PathBuf::from("/opt/games"));
        assert_eq!(
            state.fake_mounts[0].dst,
            PathBuf::from("/run/felix86/trusted/games")
        );
    }
}
