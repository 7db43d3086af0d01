//! Filesystem syscall translation.
//!
//! Every path-accepting guest syscall is rewritten through the resolver and
//! then issued as the raw host syscall, bypassing the C library so errno
//! semantics and path handling stay exactly the kernel's. Results that leak
//! host paths back to the guest (readlink, getcwd) are rewritten so the
//! rootfs stays invisible.

pub mod emulated;
pub mod resolver;

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;

use crate::fd;
use crate::state;
use crate::utils::{to_cstring, PathBufExt};
use crate::SysResult;

use resolver::{is_proc_self_exe, remove_rootfs_prefix, resolve, resolve_path, Resolved, AT_FDCWD};

// Not in every libc version we build against.
const MS_NOSYMFOLLOW: u64 = 0x100;
const UMOUNT_NOFOLLOW: i32 = 0x2;

fn sys(ret: libc::c_long) -> SysResult {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn opt_cstring(path: Option<&Path>) -> Result<Option<CString>, Errno> {
    path.map(to_cstring).transpose()
}

fn ptr_of(c: &Option<CString>) -> *const libc::c_char {
    c.as_ref().map_or(std::ptr::null(), |c| c.as_ptr())
}

fn resolved_cstring(resolved: &Resolved) -> Result<Option<CString>, Errno> {
    opt_cstring(resolved.path.as_deref())
}

pub fn openat(dirfd: RawFd, path: Option<&Path>, flags: i32, mode: u64) -> SysResult {
    let follow = flags & libc::O_NOFOLLOW == 0;
    let resolved = resolve(dirfd, path, follow);
    openat_internal(resolved.dirfd, resolved.path.as_deref(), flags, mode)
}

fn openat_internal(dirfd: RawFd, path: Option<&Path>, flags: i32, mode: u64) -> SysResult {
    let c = opt_cstring(path)?;
    let fd = sys(unsafe { libc::syscall(libc::SYS_openat, dirfd, ptr_of(&c), flags, mode) })?;
    if let Some(replacement) = emulated::replace_if_emulated(fd as RawFd, path, flags) {
        return replacement;
    }
    Ok(fd)
}

pub fn creat(path: Option<&Path>, mode: u64) -> SysResult {
    let resolved = resolve_path(path, false);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_openat,
            AT_FDCWD,
            ptr_of(&c),
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode,
        )
    })
}

pub fn faccessat(dirfd: RawFd, path: Option<&Path>, mode: i32, flags: i32) -> SysResult {
    let follow = flags & libc::AT_SYMLINK_NOFOLLOW == 0;
    let resolved = resolve(dirfd, path, follow);
    let c = resolved_cstring(&resolved)?;
    sys(unsafe { libc::syscall(libc::SYS_faccessat2, resolved.dirfd, ptr_of(&c), mode, flags) })
}

/// fstatat, including the null-path AT_EMPTY_PATH form.
///
/// # Safety
/// `stat` must be valid for writes.
pub unsafe fn fstatat(
    dirfd: RawFd,
    path: Option<&Path>,
    stat: *mut libc::stat,
    flags: i32,
) -> SysResult {
    let follow = flags & libc::AT_SYMLINK_NOFOLLOW == 0;
    let resolved = resolve(dirfd, path, follow);
    let c = resolved_cstring(&resolved)?;
    sys(libc::syscall(
        libc::SYS_newfstatat,
        resolved.dirfd,
        ptr_of(&c),
        stat,
        flags,
    ))
}

/// # Safety
/// `buf` must be valid for writes.
pub unsafe fn statx(
    dirfd: RawFd,
    path: Option<&Path>,
    flags: i32,
    mask: u32,
    buf: *mut libc::statx,
) -> SysResult {
    let follow = flags & libc::AT_SYMLINK_NOFOLLOW == 0;
    let resolved = resolve(dirfd, path, follow);
    let c = resolved_cstring(&resolved)?;
    sys(libc::syscall(
        libc::SYS_statx,
        resolved.dirfd,
        ptr_of(&c),
        flags,
        mask,
        buf,
    ))
}

/// # Safety
/// `buf` must be valid for writes.
pub unsafe fn statfs(path: Option<&Path>, buf: *mut libc::statfs) -> SysResult {
    let Some(path) = path else {
        tracing::warn!("statfs with null filename?");
        return Err(Errno::EINVAL);
    };
    let resolved = resolve_path(Some(path), true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(libc::syscall(libc::SYS_statfs, ptr_of(&c), buf))
}

pub fn readlinkat(dirfd: RawFd, path: Option<&Path>, buf: &mut [u8]) -> SysResult {
    if let Some(path) = path {
        if is_proc_self_exe(path) {
            // Resolving then readlinking would fail, the resolved path is
            // not a link. Hand out the guest view of the executable path.
            let resolved = resolve(dirfd, Some(path), false);
            let Some(exe) = resolved.path else {
                return Err(Errno::ENOENT);
            };
            let guest = remove_rootfs_prefix(&exe.to_string_lossy());
            let bytes = guest.as_bytes();
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            return Ok(n as i64);
        }
    }

    let resolved = resolve(dirfd, path, false);
    let c = resolved_cstring(&resolved)?;
    let n = sys(unsafe {
        libc::syscall(
            libc::SYS_readlinkat,
            resolved.dirfd,
            ptr_of(&c),
            buf.as_mut_ptr(),
            buf.len(),
        )
    })?;

    if n > 0 {
        // Link targets below the rootfs (/proc contents mostly) must come
        // back in guest coordinates.
        let target = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
        let stripped = remove_rootfs_prefix(&target);
        let bytes = stripped.as_bytes();
        let m = bytes.len().min(buf.len());
        buf[..m].copy_from_slice(&bytes[..m]);
        return Ok(m as i64);
    }
    Ok(n)
}

pub fn getcwd(buf: &mut [u8]) -> SysResult {
    let n = sys(unsafe { libc::syscall(libc::SYS_getcwd, buf.as_mut_ptr(), buf.len()) })?;
    if n > 0 {
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let cwd = String::from_utf8_lossy(&buf[..len]).into_owned();
        let stripped = remove_rootfs_prefix(&cwd);
        let bytes = stripped.as_bytes();
        if bytes.len() + 1 > buf.len() {
            return Err(Errno::ERANGE);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = 0;
        return Ok(bytes.len() as i64);
    }
    Ok(n)
}

pub fn chdir(path: Option<&Path>) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_chdir, ptr_of(&c)) })
}

pub fn symlinkat(target: Option<&Path>, newdirfd: RawFd, linkpath: Option<&Path>) -> SysResult {
    let (Some(target), Some(linkpath)) = (target, linkpath) else {
        return Err(Errno::EINVAL);
    };

    // The link content is guest data and is stored verbatim; only the link
    // location goes through the resolver.
    let resolved = resolve(newdirfd, Some(linkpath), false);
    let target_c = to_cstring(target)?;
    let c = resolved_cstring(&resolved)?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_symlinkat,
            target_c.as_ptr(),
            resolved.dirfd,
            ptr_of(&c),
        )
    })
}

pub fn linkat(
    olddirfd: RawFd,
    oldpath: Option<&Path>,
    newdirfd: RawFd,
    newpath: Option<&Path>,
    flags: i32,
) -> SysResult {
    let follow = flags & libc::AT_SYMLINK_FOLLOW != 0;
    let old = resolve(olddirfd, oldpath, follow);
    let new = resolve(newdirfd, newpath, follow);
    let old_c = resolved_cstring(&old)?;
    let new_c = resolved_cstring(&new)?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_linkat,
            old.dirfd,
            ptr_of(&old_c),
            new.dirfd,
            ptr_of(&new_c),
            flags,
        )
    })
}

pub fn unlinkat(dirfd: RawFd, path: Option<&Path>, flags: i32) -> SysResult {
    if path.is_none() {
        tracing::warn!("unlink with null filename?");
        return Err(Errno::EINVAL);
    }
    let resolved = resolve(dirfd, path, false);
    let c = resolved_cstring(&resolved)?;
    sys(unsafe { libc::syscall(libc::SYS_unlinkat, resolved.dirfd, ptr_of(&c), flags) })
}

pub fn rmdir(path: Option<&Path>) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_unlinkat,
            AT_FDCWD,
            ptr_of(&c),
            libc::AT_REMOVEDIR,
        )
    })
}

pub fn renameat2(
    olddirfd: RawFd,
    oldpath: Option<&Path>,
    newdirfd: RawFd,
    newpath: Option<&Path>,
    flags: u32,
) -> SysResult {
    if oldpath.is_none() || newpath.is_none() {
        return Err(Errno::EINVAL);
    }
    let old = resolve(olddirfd, oldpath, false);
    let new = resolve(newdirfd, newpath, false);
    let old_c = resolved_cstring(&old)?;
    let new_c = resolved_cstring(&new)?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            old.dirfd,
            ptr_of(&old_c),
            new.dirfd,
            ptr_of(&new_c),
            flags,
        )
    })
}

pub fn mkdirat(dirfd: RawFd, path: Option<&Path>, mode: u64) -> SysResult {
    let resolved = resolve(dirfd, path, true);
    let c = resolved_cstring(&resolved)?;
    sys(unsafe { libc::syscall(libc::SYS_mkdirat, resolved.dirfd, ptr_of(&c), mode) })
}

pub fn mknodat(dirfd: RawFd, path: Option<&Path>, mode: u64, dev: u64) -> SysResult {
    let resolved = resolve(dirfd, path, true);
    let c = resolved_cstring(&resolved)?;
    sys(unsafe { libc::syscall(libc::SYS_mknodat, resolved.dirfd, ptr_of(&c), mode, dev) })
}

pub fn fchmodat(dirfd: RawFd, path: Option<&Path>, mode: u64) -> SysResult {
    let resolved = resolve(dirfd, path, true);
    let c = resolved_cstring(&resolved)?;
    sys(unsafe { libc::syscall(libc::SYS_fchmodat, resolved.dirfd, ptr_of(&c), mode) })
}

pub fn chmod(path: Option<&Path>, mode: u64) -> SysResult {
    if path.is_none() {
        return Err(Errno::EINVAL);
    }
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_fchmodat, AT_FDCWD, ptr_of(&c), mode) })
}

pub fn chown(path: Option<&Path>, owner: u64, group: u64) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(libc::SYS_fchownat, AT_FDCWD, ptr_of(&c), owner, group, 0)
    })
}

pub fn lchown(path: Option<&Path>, owner: u64, group: u64) -> SysResult {
    let resolved = resolve_path(path, false);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_fchownat,
            AT_FDCWD,
            ptr_of(&c),
            owner,
            group,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn truncate(path: Option<&Path>, length: u64) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_truncate, ptr_of(&c), length) })
}

/// # Safety
/// `times` must be null or valid for reads of two timespecs.
pub unsafe fn utimensat(
    dirfd: RawFd,
    path: Option<&Path>,
    times: *const libc::timespec,
    flags: i32,
) -> SysResult {
    let resolved = resolve(dirfd, path, true);
    let c = resolved_cstring(&resolved)?;
    sys(libc::syscall(
        libc::SYS_utimensat,
        resolved.dirfd,
        ptr_of(&c),
        times,
        flags,
    ))
}

pub fn getxattr(path: Option<&Path>, name: &CString, value: *mut u8, size: usize) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(libc::SYS_getxattr, ptr_of(&c), name.as_ptr(), value, size)
    })
}

pub fn lgetxattr(path: Option<&Path>, name: &CString, value: *mut u8, size: usize) -> SysResult {
    let resolved = resolve_path(path, false);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(libc::SYS_lgetxattr, ptr_of(&c), name.as_ptr(), value, size)
    })
}

pub fn setxattr(
    path: Option<&Path>,
    name: &CString,
    value: *const u8,
    size: usize,
    flags: i32,
) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_setxattr,
            ptr_of(&c),
            name.as_ptr(),
            value,
            size,
            flags,
        )
    })
}

pub fn lsetxattr(
    path: Option<&Path>,
    name: &CString,
    value: *const u8,
    size: usize,
    flags: i32,
) -> SysResult {
    let resolved = resolve_path(path, false);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe {
        libc::syscall(
            libc::SYS_lsetxattr,
            ptr_of(&c),
            name.as_ptr(),
            value,
            size,
            flags,
        )
    })
}

pub fn listxattr(path: Option<&Path>, list: *mut u8, size: usize, llist: bool) -> SysResult {
    let resolved = resolve_path(path, !llist);
    let c = opt_cstring(resolved.as_deref())?;
    let nr = if llist {
        libc::SYS_llistxattr
    } else {
        libc::SYS_listxattr
    };
    sys(unsafe { libc::syscall(nr, ptr_of(&c), list, size) })
}

pub fn removexattr(path: Option<&Path>, name: &CString) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_removexattr, ptr_of(&c), name.as_ptr()) })
}

pub fn lremovexattr(path: Option<&Path>, name: &CString) -> SysResult {
    let resolved = resolve_path(path, false);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_lremovexattr, ptr_of(&c), name.as_ptr()) })
}

pub fn inotify_add_watch(fd: RawFd, path: Option<&Path>, mask: u32) -> SysResult {
    let resolved = resolve_path(path, true);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_inotify_add_watch, fd, ptr_of(&c), mask) })
}

/// # Safety
/// `data` must be null or point at filesystem specific mount data.
pub unsafe fn mount(
    source: Option<&Path>,
    target: Option<&Path>,
    fstype: Option<&CString>,
    flags: u64,
    data: *const libc::c_void,
) -> SysResult {
    let follow = flags & MS_NOSYMFOLLOW == 0;
    let source = resolve_path(source, follow);
    let target = resolve_path(target, follow);
    let source_c = opt_cstring(source.as_deref())?;
    let target_c = opt_cstring(target.as_deref())?;
    sys(libc::syscall(
        libc::SYS_mount,
        ptr_of(&source_c),
        ptr_of(&target_c),
        fstype.map_or(std::ptr::null(), |c| c.as_ptr()),
        flags,
        data,
    ))
}

pub fn umount2(path: Option<&Path>, flags: i32) -> SysResult {
    let follow = flags & UMOUNT_NOFOLLOW == 0;
    let resolved = resolve_path(path, follow);
    let c = opt_cstring(resolved.as_deref())?;
    sys(unsafe { libc::syscall(libc::SYS_umount2, ptr_of(&c), flags) })
}

/// The guest's chroot narrows the emulated view: the rootfs is re-pointed
/// at the resolved target and the long lived descriptor follows it.
pub fn chroot(path: Option<&Path>) -> SysResult {
    // A no-op host chroot probes whether the guest would have been allowed
    // to chroot at all.
    let root = to_cstring(Path::new("/"))?;
    sys(unsafe { libc::syscall(libc::SYS_chroot, root.as_ptr()) })?;

    let Some(path) = path else {
        return Err(Errno::EINVAL);
    };
    let Some(target) = resolve_path(Some(path), true) else {
        return Err(Errno::EINVAL);
    };
    let target = target.normalize();
    let new_fd = state::open_rootfs_fd(&target)?;

    let mut state = state::lock();
    let old_fd = state.rootfs_fd;
    if old_fd >= 0 {
        fd::unprotect_and_close_with(&mut state, old_fd);
    }
    state.rootfs_path = target;
    state.rootfs_fd = new_fd;
    fd::protect_with(&mut state, new_fd);
    Ok(0)
}
