//! Socket ABI translation for 32 bit guests.
//!
//! A 32 bit guest's msghdr carries 32 bit pointers and a 12 byte cmsghdr,
//! four bytes shorter than the host's. Control messages are repacked in
//! both directions; ancillary payloads (SCM_RIGHTS descriptors and
//! friends) are copied verbatim. Guest pointers are plain u32 values that
//! are valid addresses in this process, the guest lives in our lower
//! address space.

use std::mem;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::SysResult;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Iovec {
    pub iov_base: u32,
    pub iov_len: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Msghdr {
    pub msg_name: u32,
    pub msg_namelen: u32,
    pub msg_iov: u32,
    pub msg_iovlen: u32,
    pub msg_control: u32,
    pub msg_controllen: u32,
    pub msg_flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Cmsghdr {
    pub cmsg_len: u32,
    pub cmsg_level: i32,
    pub cmsg_type: i32,
    // data follows, 4 byte aligned
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Mmsghdr {
    pub msg_hdr: X86Msghdr,
    pub msg_len: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Timeval {
    pub tv_sec: i32,
    pub tv_usec: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Timespec {
    pub tv_sec: i32,
    pub tv_nsec: i32,
}

/// The host cmsghdr header is this much larger than the guest one.
const CMSG_SIZE_DIFF: usize = mem::size_of::<libc::cmsghdr>() - mem::size_of::<X86Cmsghdr>();

fn sys(ret: libc::c_long) -> SysResult {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

unsafe fn guest_iovecs(iov: u32, iovlen: u32) -> Vec<libc::iovec> {
    (0..iovlen as usize)
        .map(|i| {
            let g = &*(iov as u64 as *const X86Iovec).add(i);
            libc::iovec {
                iov_base: g.iov_base as u64 as *mut libc::c_void,
                iov_len: g.iov_len as usize,
            }
        })
        .collect()
}

unsafe fn cmsg32_data(cmsg: *mut X86Cmsghdr) -> *mut u8 {
    cmsg.cast::<u8>().add(mem::size_of::<X86Cmsghdr>())
}

/// Repacks the guest control message chain at `control` into `host`, whose
/// msg_control buffer must be at least twice `controllen` bytes.
/// Adjusts host msg_controllen for the per-entry header growth.
unsafe fn copy_cmsgs_from_guest(control: u64, controllen: u32, host: &mut libc::msghdr) {
    if controllen == 0 {
        return;
    }

    let mut guest_ptr = control;
    let mut host_cmsg = host.msg_control as *mut libc::cmsghdr;

    loop {
        let guest_cmsg = &*(guest_ptr as *const X86Cmsghdr);
        (*host_cmsg).cmsg_level = guest_cmsg.cmsg_level;
        (*host_cmsg).cmsg_type = guest_cmsg.cmsg_type;

        if guest_cmsg.cmsg_len != 0 {
            (*host_cmsg).cmsg_len = guest_cmsg.cmsg_len as usize + CMSG_SIZE_DIFF;
            host.msg_controllen += CMSG_SIZE_DIFF;
            std::ptr::copy_nonoverlapping(
                cmsg32_data(guest_ptr as *mut X86Cmsghdr).cast_const(),
                libc::CMSG_DATA(host_cmsg),
                guest_cmsg.cmsg_len as usize - mem::size_of::<X86Cmsghdr>(),
            );
        }

        host_cmsg = libc::CMSG_NXTHDR(host, host_cmsg);

        if guest_cmsg.cmsg_len < mem::size_of::<X86Cmsghdr>() as u32 {
            break;
        }
        guest_ptr = (guest_ptr + guest_cmsg.cmsg_len as u64 + 3) & !3u64;
        if guest_ptr >= control + controllen as u64 || host_cmsg.is_null() {
            break;
        }
    }
}

/// Repacks the host control message chain into the guest buffer at
/// `control`, shrinking each header. Returns the guest msg_controllen.
unsafe fn copy_cmsgs_to_guest(host: &libc::msghdr, control: u64) -> u32 {
    let mut guest_controllen = 0u32;
    if host.msg_controllen == 0 {
        return 0;
    }

    let mut guest_ptr = control;
    let mut host_cmsg = libc::CMSG_FIRSTHDR(host);
    while !host_cmsg.is_null() {
        let guest_cmsg = guest_ptr as *mut X86Cmsghdr;
        (*guest_cmsg).cmsg_level = (*host_cmsg).cmsg_level;
        (*guest_cmsg).cmsg_type = (*host_cmsg).cmsg_type;

        if (*host_cmsg).cmsg_len != 0 {
            let guest_len = (*host_cmsg).cmsg_len - CMSG_SIZE_DIFF;
            (*guest_cmsg).cmsg_len = guest_len as u32;
            guest_controllen += guest_len as u32;
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(host_cmsg).cast_const(),
                cmsg32_data(guest_cmsg),
                (*host_cmsg).cmsg_len - mem::size_of::<libc::cmsghdr>(),
            );
            guest_ptr = (guest_ptr + guest_len as u64 + 3) & !3u64;
        }

        host_cmsg = libc::CMSG_NXTHDR(host, host_cmsg);
    }
    guest_controllen
}

/// # Safety
/// `guest_msghdr` and every guest pointer inside it must be valid.
pub unsafe fn recvmsg32(fd: RawFd, guest_msghdr: *mut X86Msghdr, flags: i32) -> SysResult {
    let guest = &mut *guest_msghdr;

    let mut host: libc::msghdr = mem::zeroed();
    host.msg_name = guest.msg_name as u64 as *mut libc::c_void;
    host.msg_namelen = guest.msg_namelen;

    let mut iovecs = guest_iovecs(guest.msg_iov, guest.msg_iovlen);
    host.msg_iov = iovecs.as_mut_ptr();
    host.msg_iovlen = guest.msg_iovlen as usize;

    let mut control = vec![0u8; guest.msg_controllen as usize * 2];
    if !control.is_empty() {
        host.msg_control = control.as_mut_ptr().cast();
        host.msg_controllen = control.len();
    }

    let result = sys(libc::recvmsg(fd, &mut host, flags) as libc::c_long)?;

    guest.msg_namelen = host.msg_namelen;
    guest.msg_flags = host.msg_flags as u32;
    guest.msg_controllen = copy_cmsgs_to_guest(&host, guest.msg_control as u64);
    Ok(result)
}

/// # Safety
/// `guest_msghdr` and every guest pointer inside it must be valid.
pub unsafe fn sendmsg32(fd: RawFd, guest_msghdr: *const X86Msghdr, flags: i32) -> SysResult {
    let guest = &*guest_msghdr;

    let mut host: libc::msghdr = mem::zeroed();
    host.msg_name = guest.msg_name as u64 as *mut libc::c_void;
    host.msg_namelen = guest.msg_namelen;

    let mut iovecs = guest_iovecs(guest.msg_iov, guest.msg_iovlen);
    host.msg_iov = iovecs.as_mut_ptr();
    host.msg_iovlen = guest.msg_iovlen as usize;

    let mut control = vec![0u8; guest.msg_controllen as usize * 2];
    if !control.is_empty() {
        host.msg_control = control.as_mut_ptr().cast();
        host.msg_controllen = guest.msg_controllen as usize;
        copy_cmsgs_from_guest(guest.msg_control as u64, guest.msg_controllen, &mut host);
    }

    sys(libc::sendmsg(fd, &host, flags) as libc::c_long)
}

/// # Safety
/// `messages` must point at `n` guest mmsghdrs with valid interior pointers.
pub unsafe fn recvmmsg32(
    fd: RawFd,
    messages: *mut X86Mmsghdr,
    n: u32,
    flags: i32,
    timeout: *mut X86Timespec,
) -> SysResult {
    if n == 0 {
        return Err(Errno::EINVAL);
    }

    let mut host_timeout = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let host_timeout_ptr = if timeout.is_null() {
        std::ptr::null_mut()
    } else {
        host_timeout.tv_sec = (*timeout).tv_sec as libc::time_t;
        host_timeout.tv_nsec = (*timeout).tv_nsec as libc::c_long;
        &mut host_timeout as *mut libc::timespec
    };

    let mut all_iovecs: Vec<Vec<libc::iovec>> = Vec::with_capacity(n as usize);
    let mut controls: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
    let mut host_mmsgs: Vec<libc::mmsghdr> = vec![mem::zeroed(); n as usize];

    for i in 0..n as usize {
        let guest = &mut (*messages.add(i)).msg_hdr;
        let host = &mut host_mmsgs[i].msg_hdr;

        all_iovecs.push(guest_iovecs(guest.msg_iov, guest.msg_iovlen));
        host.msg_name = guest.msg_name as u64 as *mut libc::c_void;
        host.msg_namelen = guest.msg_namelen;
        host.msg_iov = all_iovecs[i].as_mut_ptr();
        host.msg_iovlen = guest.msg_iovlen as usize;
        host.msg_flags = guest.msg_flags as i32;

        controls.push(vec![0u8; guest.msg_controllen as usize * 2]);
        if !controls[i].is_empty() {
            host.msg_control = controls[i].as_mut_ptr().cast();
            host.msg_controllen = controls[i].len();
        }

        host_mmsgs[i].msg_len = (*messages.add(i)).msg_len;
    }

    let result = sys(libc::recvmmsg(fd, host_mmsgs.as_mut_ptr(), n, flags, host_timeout_ptr)
        as libc::c_long)?;

    for i in 0..n as usize {
        let guest = &mut (*messages.add(i)).msg_hdr;
        let host = &host_mmsgs[i].msg_hdr;
        guest.msg_namelen = host.msg_namelen;
        guest.msg_flags = host.msg_flags as u32;
        guest.msg_controllen = copy_cmsgs_to_guest(host, guest.msg_control as u64);
        (*messages.add(i)).msg_len = host_mmsgs[i].msg_len;
    }

    if !timeout.is_null() {
        (*timeout).tv_sec = host_timeout.tv_sec as i32;
        (*timeout).tv_nsec = host_timeout.tv_nsec as i32;
    }

    Ok(result)
}

/// # Safety
/// `messages` must point at `n` guest mmsghdrs with valid interior pointers.
pub unsafe fn sendmmsg32(fd: RawFd, messages: *mut X86Mmsghdr, n: u32, flags: i32) -> SysResult {
    let mut all_iovecs: Vec<Vec<libc::iovec>> = Vec::with_capacity(n as usize);
    let mut controls: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
    let mut host_mmsgs: Vec<libc::mmsghdr> = vec![mem::zeroed(); n as usize];

    for i in 0..n as usize {
        let guest = &(*messages.add(i)).msg_hdr;
        host_mmsgs[i].msg_len = (*messages.add(i)).msg_len;
        let host = &mut host_mmsgs[i].msg_hdr;

        all_iovecs.push(guest_iovecs(guest.msg_iov, guest.msg_iovlen));
        host.msg_name = guest.msg_name as u64 as *mut libc::c_void;
        host.msg_namelen = guest.msg_namelen;
        host.msg_iov = all_iovecs[i].as_mut_ptr();
        host.msg_iovlen = guest.msg_iovlen as usize;
        host.msg_flags = guest.msg_flags as i32;

        controls.push(vec![0u8; guest.msg_controllen as usize * 2]);
        if !controls[i].is_empty() {
            host.msg_control = controls[i].as_mut_ptr().cast();
            host.msg_controllen = guest.msg_controllen as usize;
            copy_cmsgs_from_guest(guest.msg_control as u64, guest.msg_controllen, host);
        }
    }

    let result = sys(libc::sendmmsg(fd, host_mmsgs.as_mut_ptr(), n, flags) as libc::c_long)?;

    for i in 0..result as usize {
        (*messages.add(i)).msg_len = host_mmsgs[i].msg_len;
    }
    Ok(result)
}

// asm-generic socket option numbers; the x86 guest and the RISC-V host
// agree on all of them.
mod sopt {
    pub const SOL_SOCKET: i32 = 1;

    pub const SO_DEBUG: i32 = 1;
    pub const SO_REUSEADDR: i32 = 2;
    pub const SO_TYPE: i32 = 3;
    pub const SO_ERROR: i32 = 4;
    pub const SO_DONTROUTE: i32 = 5;
    pub const SO_BROADCAST: i32 = 6;
    pub const SO_SNDBUF: i32 = 7;
    pub const SO_RCVBUF: i32 = 8;
    pub const SO_KEEPALIVE: i32 = 9;
    pub const SO_OOBINLINE: i32 = 10;
    pub const SO_NO_CHECK: i32 = 11;
    pub const SO_PRIORITY: i32 = 12;
    pub const SO_LINGER: i32 = 13;
    pub const SO_BSDCOMPAT: i32 = 14;
    pub const SO_REUSEPORT: i32 = 15;
    pub const SO_PASSCRED: i32 = 16;
    pub const SO_PEERCRED: i32 = 17;
    pub const SO_RCVLOWAT: i32 = 18;
    pub const SO_SNDLOWAT: i32 = 19;
    pub const SO_RCVTIMEO_OLD: i32 = 20;
    pub const SO_SNDTIMEO_OLD: i32 = 21;
    pub const SO_SECURITY_AUTHENTICATION: i32 = 22;
    pub const SO_SECURITY_ENCRYPTION_TRANSPORT: i32 = 23;
    pub const SO_SECURITY_ENCRYPTION_NETWORK: i32 = 24;
    pub const SO_ATTACH_FILTER: i32 = 26;
    pub const SO_DETACH_FILTER: i32 = 27;
    pub const SO_PEERNAME: i32 = 28;
    pub const SO_TIMESTAMP_OLD: i32 = 29;
    pub const SO_ACCEPTCONN: i32 = 30;
    pub const SO_PEERSEC: i32 = 31;
    pub const SO_SNDBUFFORCE: i32 = 32;
    pub const SO_RCVBUFFORCE: i32 = 33;
    pub const SO_PASSSEC: i32 = 34;
    pub const SO_TIMESTAMPNS_OLD: i32 = 35;
    pub const SO_MARK: i32 = 36;
    pub const SO_TIMESTAMPING_OLD: i32 = 37;
    pub const SO_PROTOCOL: i32 = 38;
    pub const SO_DOMAIN: i32 = 39;
    pub const SO_RXQ_OVFL: i32 = 40;
    pub const SO_WIFI_STATUS: i32 = 41;
    pub const SO_PEEK_OFF: i32 = 42;
    pub const SO_NOFCS: i32 = 43;
    pub const SO_LOCK_FILTER: i32 = 44;
    pub const SO_SELECT_ERR_QUEUE: i32 = 45;
    pub const SO_BUSY_POLL: i32 = 46;
    pub const SO_MAX_PACING_RATE: i32 = 47;
    pub const SO_BPF_EXTENSIONS: i32 = 48;
    pub const SO_INCOMING_CPU: i32 = 49;
    pub const SO_ATTACH_BPF: i32 = 50;
    pub const SO_ATTACH_REUSEPORT_CBPF: i32 = 51;
    pub const SO_ATTACH_REUSEPORT_EBPF: i32 = 52;
    pub const SO_CNX_ADVICE: i32 = 53;
    pub const SO_MEMINFO: i32 = 55;
    pub const SO_INCOMING_NAPI_ID: i32 = 56;
    pub const SO_COOKIE: i32 = 57;
    pub const SO_PEERGROUPS: i32 = 59;
    pub const SO_ZEROCOPY: i32 = 60;
    pub const SO_TXTIME: i32 = 61;
    pub const SO_BINDTOIFINDEX: i32 = 62;
    pub const SO_TIMESTAMP_NEW: i32 = 63;
    pub const SO_TIMESTAMPNS_NEW: i32 = 64;
    pub const SO_TIMESTAMPING_NEW: i32 = 65;
    pub const SO_RCVTIMEO_NEW: i32 = 66;
    pub const SO_SNDTIMEO_NEW: i32 = 67;
    pub const SO_DETACH_REUSEPORT_BPF: i32 = 68;
    pub const SO_PREFER_BUSY_POLL: i32 = 69;
    pub const SO_BUSY_POLL_BUDGET: i32 = 70;
    pub const SO_NETNS_COOKIE: i32 = 71;
    pub const SO_BUF_LOCK: i32 = 72;
    pub const SO_RESERVE_MEM: i32 = 73;
    pub const SO_TXREHASH: i32 = 74;
    pub const SO_RCVMARK: i32 = 75;
    pub const SO_PASSPIDFD: i32 = 76;
    pub const SO_PEERPIDFD: i32 = 77;
}

use sopt::*;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockFprog32 {
    len: u16,
    filter: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockFprog64 {
    len: u16,
    filter: u64,
}

/// # Safety
/// `optval` and `optlen` must be valid.
pub unsafe fn getsockopt32(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_char,
    optlen: *mut u32,
) -> SysResult {
    if level != SOL_SOCKET {
        return sys(libc::getsockopt(fd, level, optname, optval.cast(), optlen) as libc::c_long);
    }

    match optname {
        SO_DEBUG | SO_REUSEADDR | SO_TYPE | SO_ERROR | SO_DONTROUTE | SO_BROADCAST | SO_SNDBUF
        | SO_RCVBUF | SO_SNDBUFFORCE | SO_RCVBUFFORCE | SO_KEEPALIVE | SO_OOBINLINE
        | SO_NO_CHECK | SO_PRIORITY | SO_LINGER | SO_BSDCOMPAT | SO_REUSEPORT | SO_PASSCRED
        | SO_PEERCRED | SO_RCVLOWAT | SO_SNDLOWAT | SO_SECURITY_AUTHENTICATION
        | SO_SECURITY_ENCRYPTION_TRANSPORT | SO_SECURITY_ENCRYPTION_NETWORK | SO_ATTACH_FILTER
        | SO_DETACH_FILTER | SO_PEERNAME | SO_TIMESTAMP_OLD | SO_ACCEPTCONN | SO_PEERSEC
        | SO_PASSSEC | SO_TIMESTAMPNS_OLD | SO_MARK | SO_TIMESTAMPING_OLD | SO_PROTOCOL
        | SO_DOMAIN | SO_RXQ_OVFL | SO_WIFI_STATUS | SO_PEEK_OFF | SO_NOFCS | SO_LOCK_FILTER
        | SO_SELECT_ERR_QUEUE | SO_BUSY_POLL | SO_MAX_PACING_RATE | SO_BPF_EXTENSIONS
        | SO_INCOMING_CPU | SO_ATTACH_BPF | SO_ATTACH_REUSEPORT_CBPF | SO_ATTACH_REUSEPORT_EBPF
        | SO_CNX_ADVICE | SO_MEMINFO | SO_INCOMING_NAPI_ID | SO_COOKIE | SO_PEERGROUPS
        | SO_ZEROCOPY | SO_TXTIME | SO_BINDTOIFINDEX | SO_TIMESTAMP_NEW | SO_TIMESTAMPNS_NEW
        | SO_TIMESTAMPING_NEW | SO_RCVTIMEO_NEW | SO_SNDTIMEO_NEW | SO_DETACH_REUSEPORT_BPF
        | SO_PREFER_BUSY_POLL | SO_BUSY_POLL_BUDGET | SO_NETNS_COOKIE | SO_BUF_LOCK
        | SO_RESERVE_MEM | SO_RCVTIMEO_OLD | SO_SNDTIMEO_OLD => {
            sys(libc::getsockopt(fd, level, optname, optval.cast(), optlen) as libc::c_long)
        }
        _ => {
            tracing::warn!("unhandled getsockopt optname: {optname}");
            Err(Errno::ENOSYS)
        }
    }
}

/// # Safety
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt32(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_char,
    optlen: u32,
) -> SysResult {
    if level != SOL_SOCKET {
        return sys(libc::setsockopt(fd, level, optname, optval.cast(), optlen) as libc::c_long);
    }

    match optname {
        SO_ATTACH_FILTER | SO_ATTACH_REUSEPORT_CBPF => {
            // The guest fprog carries a 32 bit pointer to the filter array;
            // the kernel wants the 64 bit layout.
            if optlen as usize != mem::size_of::<SockFprog32>() {
                return Err(Errno::EINVAL);
            }
            let prog = &*(optval as *const SockFprog32);
            let prog64 = SockFprog64 {
                len: prog.len,
                filter: prog.filter as u64,
            };
            sys(libc::setsockopt(
                fd,
                level,
                optname,
                (&prog64 as *const SockFprog64).cast(),
                mem::size_of::<SockFprog64>() as u32,
            ) as libc::c_long)
        }
        SO_RCVTIMEO_OLD | SO_SNDTIMEO_OLD => {
            let guest = &*(optval as *const X86Timeval);
            let timeval = libc::timeval {
                tv_sec: guest.tv_sec as libc::time_t,
                tv_usec: guest.tv_usec as libc::suseconds_t,
            };
            let new_optname = if optname == SO_RCVTIMEO_OLD {
                SO_RCVTIMEO_NEW
            } else {
                SO_SNDTIMEO_NEW
            };
            sys(libc::setsockopt(
                fd,
                level,
                new_optname,
                (&timeval as *const libc::timeval).cast(),
                mem::size_of::<libc::timeval>() as u32,
            ) as libc::c_long)
        }
        SO_DEBUG | SO_REUSEADDR | SO_TYPE | SO_ERROR | SO_DONTROUTE | SO_BROADCAST | SO_SNDBUF
        | SO_RCVBUF | SO_SNDBUFFORCE | SO_RCVBUFFORCE | SO_KEEPALIVE | SO_OOBINLINE
        | SO_NO_CHECK | SO_PRIORITY | SO_LINGER | SO_BSDCOMPAT | SO_REUSEPORT | SO_PASSCRED
        | SO_PEERCRED | SO_RCVLOWAT | SO_SNDLOWAT | SO_SECURITY_AUTHENTICATION
        | SO_SECURITY_ENCRYPTION_TRANSPORT | SO_SECURITY_ENCRYPTION_NETWORK | SO_DETACH_FILTER
        | SO_PEERNAME | SO_TIMESTAMP_OLD | SO_ACCEPTCONN | SO_PEERSEC | SO_PASSSEC
        | SO_TIMESTAMPNS_OLD | SO_MARK | SO_TIMESTAMPING_OLD | SO_PROTOCOL | SO_DOMAIN
        | SO_RXQ_OVFL | SO_WIFI_STATUS | SO_PEEK_OFF | SO_NOFCS | SO_LOCK_FILTER
        | SO_SELECT_ERR_QUEUE | SO_BUSY_POLL | SO_MAX_PACING_RATE | SO_BPF_EXTENSIONS
        | SO_INCOMING_CPU | SO_ATTACH_BPF | SO_ATTACH_REUSEPORT_EBPF | SO_CNX_ADVICE
        | SO_MEMINFO | SO_INCOMING_NAPI_ID | SO_COOKIE | SO_PEERGROUPS | SO_ZEROCOPY
        | SO_TXTIME | SO_BINDTOIFINDEX | SO_TIMESTAMP_NEW | SO_TIMESTAMPNS_NEW
        | SO_TIMESTAMPING_NEW | SO_RCVTIMEO_NEW | SO_SNDTIMEO_NEW | SO_DETACH_REUSEPORT_BPF
        | SO_PREFER_BUSY_POLL | SO_BUSY_POLL_BUDGET | SO_NETNS_COOKIE | SO_BUF_LOCK
        | SO_RESERVE_MEM | SO_TXREHASH | SO_RCVMARK | SO_PASSPIDFD | SO_PEERPIDFD => {
            sys(libc::setsockopt(fd, level, optname, optval.cast(), optlen) as libc::c_long)
        }
        _ => {
            tracing::warn!("unhandled setsockopt optname: {optname}");
            Err(Errno::ENOSYS)
        }
    }
}
