//! Sandboxed path resolution.
//!
//! Every guest supplied `(dirfd, path)` pair is rewritten so the guest sees
//! the rootfs as `/` while the host kernel operates on real paths. The
//! kernel's `RESOLVE_IN_ROOT` does the heavy lifting: symlinks and `..`
//! traversal are contained below the rootfs descriptor, and magic /proc
//! links never resolve behind our back.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::state;
use crate::utils::{to_cstring, PathBufExt};

pub const AT_FDCWD: RawFd = libc::AT_FDCWD;

/// A host-usable `(dirfd, path)` pair produced from a guest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub dirfd: RawFd,
    pub path: Option<PathBuf>,
}

impl Resolved {
    fn at_cwd(path: PathBuf) -> Self {
        Self {
            dirfd: AT_FDCWD,
            path: Some(path),
        }
    }
}

// linux/openat2.h
#[repr(C)]
#[derive(Default)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

const RESOLVE_NO_MAGICLINKS: u64 = 0x02;
const RESOLVE_IN_ROOT: u64 = 0x10;

/// True for the /proc spellings of "my own executable". The kernel would
/// answer with the emulator binary; the guest must see its own.
pub fn is_proc_self_exe(path: &Path) -> bool {
    if path == Path::new("/proc/self/exe") || path == Path::new("/proc/thread-self/exe") {
        return true;
    }
    path == Path::new(&format!("/proc/{}/exe", std::process::id()))
}

/// Rewrites a host path for guest eyes: the rootfs itself becomes `/`, and
/// anything below it loses the prefix. Paths outside the rootfs pass
/// through untouched.
pub fn remove_rootfs_prefix(path: &str) -> String {
    let rootfs = state::lock().rootfs_path.clone();
    remove_prefix_of(path, &rootfs)
}

fn remove_prefix_of(path: &str, rootfs: &Path) -> String {
    // The rootfs is stored normalized; normalizing again keeps the prefix
    // check sound if a caller handed us a raw path.
    let rootfs = rootfs.normalize();
    let rootfs = rootfs.to_string_lossy();
    if rootfs.is_empty() {
        return path.to_string();
    }

    match path.strip_prefix(rootfs.as_ref()) {
        Some(rest) if rest.is_empty() || rest == "/" => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        // "/tmp/rootfs2" must not match a rootfs of "/tmp/rootfs".
        _ => path.to_string(),
    }
}

fn proc_fd_path(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{fd}"))
}

/// openat2 beneath the rootfs descriptor, refusing to escape it and to
/// follow magic links. Returns the opened O_PATH descriptor.
fn openat2_in_root(rootfs_fd: RawFd, path: &Path) -> Option<RawFd> {
    let cpath = to_cstring(path).ok()?;
    let how = OpenHow {
        flags: (libc::O_PATH | libc::O_CLOEXEC) as u64,
        mode: 0,
        resolve: RESOLVE_IN_ROOT | RESOLVE_NO_MAGICLINKS,
    };
    let fd = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            rootfs_fd,
            cpath.as_ptr(),
            &how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    if fd < 0 {
        return None;
    }
    Some(fd as RawFd)
}

/// Opens `path` below the rootfs and reads back where the kernel actually
/// landed. `None` when the kernel refused or the path does not exist yet.
fn resolve_in_root(rootfs_fd: RawFd, path: &Path) -> Option<PathBuf> {
    let fd = openat2_in_root(rootfs_fd, path)?;
    let real = std::fs::read_link(proc_fd_path(fd));
    unsafe { libc::close(fd) };
    real.ok()
}

/// Resolves an absolute guest path to an absolute host path.
fn resolve_absolute(path: &Path, follow_last_symlink: bool) -> PathBuf {
    let (rootfs_path, rootfs_fd, fake_mounts) = {
        let state = state::lock();
        (
            state.rootfs_path.clone(),
            state.rootfs_fd,
            state.fake_mounts.clone(),
        )
    };

    // Fake mounts overlay host directories into the guest view and bypass
    // rootfs containment entirely.
    for mount in &fake_mounts {
        if let Ok(rest) = path.strip_prefix(&mount.dst) {
            return mount.src.join(rest);
        }
    }

    let fallback = || rootfs_path.join(path.normalize().to_string_lossy().trim_start_matches('/'));

    if follow_last_symlink {
        match resolve_in_root(rootfs_fd, path) {
            Some(real) => real,
            // Component may not exist yet; hand back a path below the
            // rootfs so creating syscalls still land in the right place.
            None => fallback(),
        }
    } else {
        // Resolve the parent only, then reattach the final component, so
        // unlink/lstat/readlink operate on the link itself.
        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            // "/", "/.." and friends have no final component to protect.
            _ => {
                return match resolve_in_root(rootfs_fd, path) {
                    Some(real) => real,
                    None => fallback(),
                }
            }
        };
        match resolve_in_root(rootfs_fd, parent) {
            Some(real_parent) => real_parent.join(name),
            None => fallback(),
        }
    }
}

/// The full `(dirfd, path)` form used by the *at syscall family.
pub fn resolve(dirfd: RawFd, path: Option<&Path>, follow_last_symlink: bool) -> Resolved {
    let Some(path) = path else {
        // fstatat with AT_EMPTY_PATH and friends.
        return Resolved { dirfd, path: None };
    };

    if path.as_os_str().is_empty() {
        return Resolved {
            dirfd,
            path: Some(PathBuf::new()),
        };
    }

    let (rootfs_path, executable_path) = {
        let state = state::lock();
        (state.rootfs_path.clone(), state.executable_path.clone())
    };

    if path == Path::new("/") {
        return Resolved::at_cwd(rootfs_path);
    }

    if is_proc_self_exe(path) {
        return Resolved::at_cwd(executable_path);
    }

    if path.is_absolute() {
        return Resolved::at_cwd(resolve_absolute(path, follow_last_symlink));
    }

    // Relative: anchor at the descriptor (or the working directory), strip
    // the rootfs prefix off the anchor and resolve the joined guest path.
    let anchor = if dirfd == AT_FDCWD {
        match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(err) => {
                tracing::warn!("failed to read the current directory: {err}");
                return Resolved {
                    dirfd,
                    path: Some(path.to_path_buf()),
                };
            }
        }
    } else {
        match std::fs::read_link(proc_fd_path(dirfd)) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!("failed to read path for fd {dirfd} and pathname {}: {err}", path.display());
                return Resolved {
                    dirfd,
                    path: Some(path.to_path_buf()),
                };
            }
        }
    };

    let joined = anchor.join(path);
    let guest_view = remove_rootfs_prefix(&joined.to_string_lossy());
    Resolved::at_cwd(resolve_absolute(Path::new(&guest_view), follow_last_symlink))
}

/// Single-path form used by syscalls without a dirfd. Relative paths pass
/// through untouched; the host resolves them against the real working
/// directory, which already lives inside the rootfs.
pub fn resolve_path(path: Option<&Path>, follow_last_symlink: bool) -> Option<PathBuf> {
    let path = path?;
    if path.is_absolute() {
        resolve(AT_FDCWD, Some(path), follow_last_symlink).path
    } else {
        Some(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::set_rootfs;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::symlink;

    /// A scratch rootfs with its canonical path, so expectations are immune
    /// to symlinked temp directories.
    fn scratch_rootfs(test_name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::Builder::new().prefix(test_name).tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    #[serial]
    fn prefix_stripping() {
        let (_dir, root_path) = scratch_rootfs("felix86-prefix");
        set_rootfs(&root_path);
        let root = root_path.to_string_lossy().to_string();

        // Below, exactly, trailing slash, outside.
        assert_eq!(remove_rootfs_prefix(&format!("{root}/somedir")), "/somedir");
        assert_eq!(remove_rootfs_prefix(&root), "/");
        assert_eq!(remove_rootfs_prefix(&format!("{root}/")), "/");
        assert_eq!(remove_rootfs_prefix("/home"), "/home");
        // A sibling whose name shares the prefix must pass through.
        assert_eq!(remove_rootfs_prefix(&format!("{root}2/x")), format!("{root}2/x"));
    }

    #[test]
    #[serial]
    fn absolute_paths_resolve_below_the_rootfs() {
        let (_dir, root) = scratch_rootfs("felix86-abs");
        set_rootfs(&root);
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();

        let resolved = resolve(AT_FDCWD, Some(Path::new("/etc/passwd")), true);
        assert_eq!(resolved.dirfd, AT_FDCWD);
        assert_eq!(resolved.path.unwrap(), root.join("etc/passwd"));
    }

    #[test]
    #[serial]
    fn missing_components_fall_back_below_the_rootfs() {
        let (_dir, root) = scratch_rootfs("felix86-missing");
        set_rootfs(&root);

        let resolved = resolve(AT_FDCWD, Some(Path::new("/does/not/exist")), true);
        assert_eq!(resolved.path.unwrap(), root.join("does/not/exist"));
    }

    #[test]
    #[serial]
    fn dotdot_escapes_clamp_to_the_rootfs() {
        let (_dir, root) = scratch_rootfs("felix86-escape");
        set_rootfs(&root);
        fs::create_dir_all(root.join("subdir")).unwrap();

        let resolved = resolve(AT_FDCWD, Some(Path::new("/subdir/../../..")), true);
        assert_eq!(resolved.path.unwrap(), root);
    }

    #[test]
    #[serial]
    fn symlinks_resolve_inside_the_rootfs() {
        let (_dir, root) = scratch_rootfs("felix86-symlink");
        set_rootfs(&root);
        fs::create_dir_all(root.join("temp1/temp1_a/temp1_a_a")).unwrap();
        symlink("../temp1/temp1_a/temp1_a_a", root.join("temp1/link1")).unwrap();

        let resolved = resolve(AT_FDCWD, Some(Path::new("/temp1/link1")), true);
        assert_eq!(resolved.path.unwrap(), root.join("temp1/temp1_a/temp1_a_a"));
    }

    #[test]
    #[serial]
    fn absolute_symlinks_stay_contained() {
        let (_dir, root) = scratch_rootfs("felix86-abslink");
        set_rootfs(&root);
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/hostname"), "guest\n").unwrap();
        // An absolute link target is re-anchored at the rootfs, not the host.
        symlink("/etc/hostname", root.join("hostname-link")).unwrap();

        let resolved = resolve(AT_FDCWD, Some(Path::new("/hostname-link")), true);
        assert_eq!(resolved.path.unwrap(), root.join("etc/hostname"));
    }

    #[test]
    #[serial]
    fn unfollowed_last_component_is_reattached() {
        let (_dir, root) = scratch_rootfs("felix86-nofollow");
        set_rootfs(&root);
        fs::create_dir_all(root.join("dir")).unwrap();
        symlink("target", root.join("dir/link")).unwrap();

        let resolved = resolve(AT_FDCWD, Some(Path::new("/dir/link")), false);
        // The link itself, not its target.
        assert_eq!(resolved.path.unwrap(), root.join("dir/link"));
    }

    #[test]
    #[serial]
    fn root_and_null_and_empty_edges() {
        let (_dir, root) = scratch_rootfs("felix86-edges");
        set_rootfs(&root);

        let resolved = resolve(AT_FDCWD, Some(Path::new("/")), true);
        assert_eq!(resolved.path.unwrap(), root);

        let resolved = resolve(7, None, false);
        assert_eq!(resolved.dirfd, 7);
        assert_eq!(resolved.path, None);

        let resolved = resolve(AT_FDCWD, Some(Path::new("")), true);
        assert_eq!(resolved.path.unwrap(), PathBuf::new());
    }

    #[test]
    #[serial]
    fn relative_paths_resolve_against_a_directory_fd() {
        let (_dir, root) = scratch_rootfs("felix86-dirfd");
        set_rootfs(&root);
        fs::create_dir_all(root.join("work/sub")).unwrap();

        let dirfd = unsafe {
            let c = std::ffi::CString::new(root.join("work").to_str().unwrap()).unwrap();
            libc::open(c.as_ptr(), libc::O_PATH | libc::O_DIRECTORY)
        };
        assert!(dirfd > 0);

        let resolved = resolve(dirfd, Some(Path::new("sub")), true);
        assert_eq!(resolved.dirfd, AT_FDCWD);
        assert_eq!(resolved.path.unwrap(), root.join("work/sub"));

        unsafe { libc::close(dirfd) };
    }

    #[test]
    #[serial]
    fn fake_mounts_bypass_the_rootfs() {
        let (_dir, root) = scratch_rootfs("felix86-fakemount");
        set_rootfs(&root);
        state::add_fake_mount(Path::new("/proc"), Path::new("/proc"));

        let resolved = resolve(AT_FDCWD, Some(Path::new("/proc/self/ns/user")), true);
        assert_eq!(resolved.path.unwrap(), PathBuf::from("/proc/self/ns/user"));
    }

    #[test]
    #[serial]
    fn trusted_folder_contents_resolve_to_the_host() {
        let (_dir, root) = scratch_rootfs("felix86-trusted");
        let (_outside_dir, outside) = scratch_rootfs("felix86-outside");
        set_rootfs(&root);
        state::install_trusted_folders(&[outside.clone()]);

        let name = outside.file_name().unwrap().to_str().unwrap().to_string();
        let guest = format!("/run/felix86/trusted/{name}/data.bin");
        let resolved = resolve(AT_FDCWD, Some(Path::new(&guest)), true);
        assert_eq!(resolved.path.unwrap(), outside.join("data.bin"));
    }

    #[test]
    #[serial]
    fn proc_self_exe_short_circuits_to_the_guest_executable() {
        let (_dir, root) = scratch_rootfs("felix86-exe");
        set_rootfs(&root);
        state::set_executable_path(&root.join("usr/bin/ls"));

        for spelling in [
            "/proc/self/exe".to_string(),
            "/proc/thread-self/exe".to_string(),
            format!("/proc/{}/exe", std::process::id()),
        ] {
            let resolved = resolve(AT_FDCWD, Some(Path::new(&spelling)), true);
            assert_eq!(
                resolved.path.clone().unwrap(),
                root.join("usr/bin/ls"),
                "{spelling}"
            );
        }

        // Another process's exe link resolves like any other path.
        let resolved = resolve(AT_FDCWD, Some(Path::new("/proc/1/exe")), false);
        assert!(resolved.path.unwrap().starts_with(&root));
    }
}
