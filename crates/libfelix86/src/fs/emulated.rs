//! Synthesized guest files.
//!
//! Some /proc files must not leak host contents: an x86-64 guest reading
//! /proc/cpuinfo on a RISC-V host would see nonsense. Each emulated node
//! records the inode identity of the real file below the rootfs; when an
//! openat lands on one of them, the opened descriptor is swapped for a
//! sealed memfd whose content is produced at open time.

use std::mem;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::errno::Errno;
use once_cell::sync::Lazy;

use crate::state;
use crate::utils::to_cstring;
use crate::SysResult;

pub struct EmulatedNode {
    /// Guest visible path, also used as the memfd name.
    pub path: PathBuf,
    /// Inode identity of the backing file below the rootfs, if it exists.
    pub stat: Option<libc::statx>,
    /// Produces the replacement descriptor.
    pub open_fn: fn(&Path, i32) -> SysResult,
}

static NODES: Lazy<Mutex<Vec<EmulatedNode>>> = Lazy::new(|| Mutex::new(Vec::new()));

const STATX_MASK: u32 = libc::STATX_TYPE | libc::STATX_INO | libc::STATX_MNT_ID;

fn statx_at(dirfd: RawFd, path: &Path, flags: i32) -> Option<libc::statx> {
    let cpath = to_cstring(path).ok()?;
    let mut out: libc::statx = unsafe { mem::zeroed() };
    let result = unsafe { libc::statx(dirfd, cpath.as_ptr(), flags, STATX_MASK, &mut out) };
    if result != 0 {
        return None;
    }
    Some(out)
}

fn statx_fd(fd: RawFd) -> Option<libc::statx> {
    let mut out: libc::statx = unsafe { mem::zeroed() };
    let empty = b"\0";
    let result = unsafe {
        libc::statx(
            fd,
            empty.as_ptr().cast(),
            libc::AT_EMPTY_PATH,
            STATX_MASK,
            &mut out,
        )
    };
    if result != 0 {
        return None;
    }
    Some(out)
}

fn statx_inode_same(a: &libc::statx, b: &libc::statx) -> bool {
    const WANTED: u32 = libc::STATX_TYPE | libc::STATX_INO;
    a.stx_mask != 0
        && b.stx_mask != 0
        && a.stx_mask & WANTED == WANTED
        && b.stx_mask & WANTED == WANTED
        && (a.stx_mode ^ b.stx_mode) & libc::S_IFMT as u16 == 0
        && a.stx_dev_major == b.stx_dev_major
        && a.stx_dev_minor == b.stx_dev_minor
        && a.stx_ino == b.stx_ino
}

// memfd names are limited to 249 bytes.
const MEMFD_NAME_MAX: usize = 249;

pub(crate) fn generate_memfd(name: &Path, flags: i32) -> Result<RawFd, Errno> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = name.as_os_str().as_bytes();
    let truncated = &bytes[..bytes.len().min(MEMFD_NAME_MAX)];
    let cname = std::ffi::CString::new(truncated).map_err(|_| Errno::EINVAL)?;

    let mut memfd_flags = libc::MFD_ALLOW_SEALING;
    if flags & libc::O_CLOEXEC != 0 {
        memfd_flags |= libc::MFD_CLOEXEC;
    }
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), memfd_flags) };
    if fd < 0 {
        return Err(Errno::last());
    }
    Ok(fd)
}

pub(crate) fn seal_memfd(fd: RawFd) -> Result<(), Errno> {
    let seals = libc::F_SEAL_SEAL
        | libc::F_SEAL_SHRINK
        | libc::F_SEAL_GROW
        | libc::F_SEAL_WRITE
        | libc::F_SEAL_FUTURE_WRITE;
    let result = unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) };
    if result != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Builds a sealed memfd holding `content`, positioned at offset zero.
fn sealed_memfd(name: &Path, flags: i32, content: &str) -> SysResult {
    let fd = generate_memfd(name, flags)?;
    let bytes = content.as_bytes();
    let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    if written != bytes.len() as isize {
        let errno = Errno::last();
        unsafe { libc::close(fd) };
        return Err(errno);
    }
    // The guest must start reading from the beginning.
    if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } != 0 {
        let errno = Errno::last();
        unsafe { libc::close(fd) };
        return Err(errno);
    }
    seal_memfd(fd)?;
    Ok(fd as i64)
}

fn open_cpuinfo(path: &Path, flags: i32) -> SysResult {
    sealed_memfd(path, flags, &cpuinfo_text())
}

fn open_maps(path: &Path, flags: i32) -> SysResult {
    sealed_memfd(path, flags, &maps_text())
}

/// An x86-64 /proc/cpuinfo for the guest, one entry per host CPU. The
/// feature list matches what the recompiler actually implements.
pub fn cpuinfo_text() -> String {
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1);
    let flags = "fpu vme de pse tsc msr pae mce cx8 apic sep mtrr pge mca cmov \
                 pat pse36 clflush mmx fxsr sse sse2 ht syscall nx lm \
                 ssse3 cx16 sse4_1 sse4_2 popcnt aes f16c rdrand lahf_lm";

    let mut out = String::new();
    for cpu in 0..cpus {
        out.push_str(&format!("processor\t: {cpu}\n"));
        out.push_str("vendor_id\t: GenuineIntel\n");
        out.push_str("cpu family\t: 6\n");
        out.push_str("model\t\t: 60\n");
        out.push_str("model name\t: felix86 emulated x86-64 CPU\n");
        out.push_str("stepping\t: 3\n");
        out.push_str("microcode\t: 0x0\n");
        out.push_str("cpu MHz\t\t: 1500.000\n");
        out.push_str("cache size\t: 2048 KB\n");
        out.push_str(&format!("physical id\t: 0\nsiblings\t: {cpus}\n"));
        out.push_str(&format!("core id\t\t: {cpu}\ncpu cores\t: {cpus}\n"));
        out.push_str(&format!("apicid\t\t: {cpu}\n"));
        out.push_str("fpu\t\t: yes\nfpu_exception\t: yes\n");
        out.push_str("cpuid level\t: 13\nwp\t\t: yes\n");
        out.push_str(&format!("flags\t\t: {flags}\n"));
        out.push_str("bogomips\t: 3000.00\n");
        out.push_str("clflush size\t: 64\ncache_alignment\t: 64\n");
        out.push_str("address sizes\t: 48 bits physical, 48 bits virtual\n");
        out.push_str("power management:\n\n");
    }
    out
}

/// The guest's memory map. Guest mappings are host mappings of this
/// process, so the host view is the right starting point; addresses are
/// already the ones the guest observes.
pub fn maps_text() -> String {
    std::fs::read_to_string("/proc/self/maps").unwrap_or_default()
}

/// Records the inode identity of every emulated node's backing file below
/// the rootfs. Called once the rootfs is known. Files that do not exist in
/// the rootfs simply never match.
pub fn initialize_emulated_nodes() {
    let rootfs = state::lock().rootfs_path.clone();

    let mut nodes = vec![
        EmulatedNode {
            path: PathBuf::from("/proc/cpuinfo"),
            stat: None,
            open_fn: open_cpuinfo,
        },
        EmulatedNode {
            path: PathBuf::from("/proc/self/maps"),
            stat: None,
            open_fn: open_maps,
        },
    ];

    for node in &mut nodes {
        let host_path = rootfs.join(node.path.strip_prefix("/").unwrap_or(&node.path));
        node.stat = statx_at(libc::AT_FDCWD, &host_path, 0);
    }

    *NODES.lock().expect("emulated nodes mutex poisoned") = nodes;
}

/// If the freshly opened descriptor is one of the emulated nodes, closes it
/// and returns the synthesized replacement.
pub(crate) fn replace_if_emulated(fd: RawFd, path: Option<&Path>, flags: i32) -> Option<SysResult> {
    let nodes = NODES.lock().expect("emulated nodes mutex poisoned");
    if nodes.iter().all(|node| node.stat.is_none()) {
        return None;
    }

    let opened = statx_fd(fd)?;
    for node in nodes.iter() {
        if let Some(stat) = &node.stat {
            if statx_inode_same(&opened, stat) {
                unsafe { libc::close(fd) };
                let name = path.unwrap_or(&node.path);
                return Some((node.open_fn)(name, flags));
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) fn register_test_node(node: EmulatedNode) {
    NODES.lock().expect("emulated nodes mutex poisoned").push(node);
}

#[cfg(test)]
pub(crate) fn clear_nodes() {
    NODES.lock().expect("emulated nodes mutex poisoned").clear();
}
