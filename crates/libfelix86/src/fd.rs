//! Protection of the emulator's own file descriptors.
//!
//! The guest shares a descriptor table with the emulator and is free to
//! spray close() or dup2() over it. Descriptors the emulator depends on
//! (the rootfs handle, log files, thunk handles) are registered here; the
//! translated close family then skips them while keeping the guest
//! convinced it succeeded.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::state::{self, EmuState};
use crate::SysResult;

pub(crate) fn protect_with(state: &mut EmuState, fd: RawFd) {
    assert!(fd > 2, "refusing to protect a standard descriptor: {fd}");
    state.protected_fds.insert(fd);

    // If a process sharing the descriptor table calls execve, the table is
    // unshared first, so FD_CLOEXEC never takes descriptors away from
    // CLONE_FILES siblings that keep emulating.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if result != 0 {
        tracing::warn!("failed to set FD_CLOEXEC for fd {fd}");
    }
}

pub(crate) fn unprotect_and_close_with(state: &mut EmuState, fd: RawFd) {
    assert!(
        state.protected_fds.remove(&fd),
        "fd {fd} was not protected"
    );
    let result = unsafe { libc::close(fd) };
    if result != 0 {
        tracing::error!("failed to close our protected fd {fd}");
    }
}

/// Marks `fd` as owned by the emulator. Must be greater than 2.
pub fn protect(fd: RawFd) {
    protect_with(&mut state::lock(), fd);
}

/// Removes `fd` from the protected set and closes it for real.
pub fn unprotect_and_close(fd: RawFd) {
    unprotect_and_close_with(&mut state::lock(), fd);
}

fn host_close(fd: RawFd) -> SysResult {
    match unsafe { libc::close(fd) } {
        0 => Ok(0),
        _ => Err(Errno::last()),
    }
}

/// The guest's close(2). Protected descriptors report success without
/// closing anything.
pub fn close(fd: RawFd) -> SysResult {
    if fd <= 2 {
        return host_close(fd);
    }

    let state = state::lock();
    if state.protected_fds.contains(&fd) {
        tracing::warn!("program tried to close one of our fds: {fd}");
        return Ok(0);
    }
    host_close(fd)
}

fn host_close_range(start: u32, end: u32, flags: u32) -> SysResult {
    let result = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            start as libc::c_uint,
            end as libc::c_uint,
            flags as libc::c_uint,
        )
    };
    if result < 0 {
        return Err(Errno::last());
    }
    Ok(result as i64)
}

/// The guest's close_range(2), issued as one or more host calls that step
/// over every protected descriptor.
pub fn close_range(start: u32, end: u32, flags: u32) -> SysResult {
    let state = state::lock();
    let mut current_start = start;
    for &protected_fd in &state.protected_fds {
        let protected_fd = protected_fd as u32;
        if protected_fd < current_start || protected_fd > end {
            continue;
        }
        tracing::warn!("program tried to close one of our fds: {protected_fd}");
        if protected_fd > current_start {
            host_close_range(current_start, protected_fd - 1, flags)?;
        }
        current_start = protected_fd + 1;
    }

    if current_start <= end {
        return host_close_range(current_start, end, flags);
    }
    Ok(0)
}

/// The guest's dup2(2). Overwriting a protected descriptor is refused.
pub fn dup2(old_fd: RawFd, new_fd: RawFd) -> SysResult {
    let state = state::lock();
    if state.protected_fds.contains(&new_fd) {
        tracing::warn!("program tried to dup2 over one of our fds: {new_fd}");
        return Err(Errno::EBADF);
    }
    if state.protected_fds.contains(&old_fd) {
        tracing::warn!("program duplicated one of our fds: {old_fd}");
    }
    drop(state);

    match unsafe { libc::dup2(old_fd, new_fd) } {
        -1 => Err(Errno::last()),
        fd => Ok(fd as i64),
    }
}

/// The guest's dup3(2). Same protection rules as [`dup2`].
pub fn dup3(old_fd: RawFd, new_fd: RawFd, flags: i32) -> SysResult {
    let state = state::lock();
    if state.protected_fds.contains(&new_fd) {
        tracing::warn!("program tried to dup3 over one of our fds: {new_fd}");
        return Err(Errno::EBADF);
    }
    if state.protected_fds.contains(&old_fd) {
        tracing::warn!("program duplicated one of our fds: {old_fd}");
    }
    drop(state);

    match unsafe { libc::dup3(old_fd, new_fd, flags) } {
        -1 => Err(Errno::last()),
        fd => Ok(fd as i64),
    }
}

const HIGH_RANGE_START: i32 = 512;
const HIGH_RANGE_END: i32 = 1024;
const HIGH_PROBE_ATTEMPTS: u32 = 50;

/// Moves `fd` to a random free number in [512, 1024), keeping it out of the
/// low range guests like to iterate over. Returns the new descriptor; the
/// old one is closed. The caller decides whether to protect the result.
pub fn move_to_high_number(fd: RawFd) -> SysResult {
    for _ in 0..HIGH_PROBE_ATTEMPTS {
        let target = fastrand::i32(HIGH_RANGE_START..HIGH_RANGE_END);
        let occupied = unsafe { libc::fcntl(target, libc::F_GETFD) } >= 0;
        if occupied {
            continue;
        }
        let new_fd = unsafe { libc::dup2(fd, target) };
        if new_fd < 0 {
            return Err(Errno::last());
        }
        let result = unsafe { libc::close(fd) };
        if result != 0 {
            tracing::warn!("failed to close fd {fd} after moving it to {new_fd}");
        }
        return Ok(new_fd as i64);
    }
    tracing::warn!("no free high descriptor found for fd {fd}");
    Err(Errno::EMFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::io::AsRawFd;

    fn scratch_fd() -> RawFd {
        let file = tempfile::tempfile().unwrap();
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        assert!(fd > 2);
        fd
    }

    fn is_open(fd: RawFd) -> bool {
        (unsafe { libc::fcntl(fd, libc::F_GETFD) }) >= 0
    }

    #[test]
    #[serial]
    fn close_spares_protected_descriptors() {
        let fd = scratch_fd();
        protect(fd);

        assert_eq!(close(fd), Ok(0));
        assert!(is_open(fd), "protected fd was closed");

        unprotect_and_close(fd);
        assert!(!is_open(fd));
    }

    #[test]
    #[serial]
    fn protect_sets_cloexec() {
        let fd = scratch_fd();
        protect(fd);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
        unprotect_and_close(fd);
    }

    #[test]
    #[serial]
    fn dup_refuses_to_overwrite_protected_descriptors() {
        let fd = scratch_fd();
        let other = scratch_fd();
        protect(fd);

        assert_eq!(dup2(other, fd), Err(Errno::EBADF));
        assert_eq!(dup3(other, fd, 0), Err(Errno::EBADF));
        assert!(is_open(fd));

        unprotect_and_close(fd);
        assert_eq!(close(other), Ok(0));
    }

    #[test]
    #[serial]
    fn close_range_steps_over_protected_descriptors() {
        let a = scratch_fd();
        let b = scratch_fd();
        let c = scratch_fd();
        protect(b);

        let lo = a.min(b).min(c) as u32;
        let hi = a.max(b).max(c) as u32;
        assert!(close_range(lo, hi, 0).is_ok());

        assert!(is_open(b), "protected fd was closed by close_range");
        assert!(!is_open(a));
        assert!(!is_open(c));

        unprotect_and_close(b);
    }

    #[test]
    #[serial]
    fn move_to_high_number_lands_in_range() {
        let fd = scratch_fd();
        let moved = move_to_high_number(fd).unwrap() as RawFd;
        assert!((512..1024).contains(&moved));
        assert!(!is_open(fd));
        assert!(is_open(moved));
        assert_eq!(close(moved), Ok(0));
    }
}
