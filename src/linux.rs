//! Linux-specific constants and types for fanotify
//!
//! This module collects the parts of the fanotify ABI that are either too
//! new or too obscure to rely on from every libc build: the post-5.0 event
//! and init bits, the info-record types delivered in FID mode, and thin
//! wrappers for the syscalls libc does not expose as functions.
//! Everything long-stable (`fanotify_init`, `fanotify_mark`, the metadata
//! and response structs, the classic `FAN_*` bits) is consumed from the
//! `libc` crate directly.

use libc::{c_int, c_long, c_uint};

// Event mask bits added in kernels 5.0/5.1; values from
// include/uapi/linux/fanotify.h.
pub const FAN_ATTRIB: u64 = 0x0000_0004;
pub const FAN_MOVED_FROM: u64 = 0x0000_0040;
pub const FAN_MOVED_TO: u64 = 0x0000_0080;
pub const FAN_CREATE: u64 = 0x0000_0100;
pub const FAN_DELETE: u64 = 0x0000_0200;
pub const FAN_DELETE_SELF: u64 = 0x0000_0400;
pub const FAN_MOVE_SELF: u64 = 0x0000_0800;
pub const FAN_OPEN_EXEC: u64 = 0x0000_1000;
pub const FAN_Q_OVERFLOW: u64 = 0x0000_4000;
pub const FAN_OPEN_EXEC_PERM: u64 = 0x0004_0000;
pub const FAN_MOVE: u64 = FAN_MOVED_FROM | FAN_MOVED_TO;

// fanotify_init flags
pub const FAN_ENABLE_AUDIT: c_uint = 0x0000_0040;
pub const FAN_REPORT_FID: c_uint = 0x0000_0200;
pub const FAN_REPORT_DIR_FID: c_uint = 0x0000_0400;
pub const FAN_REPORT_NAME: c_uint = 0x0000_0800;
pub const FAN_REPORT_DFID_NAME: c_uint = FAN_REPORT_DIR_FID | FAN_REPORT_NAME;

// Info record types following the event metadata in FID mode
pub const FAN_EVENT_INFO_TYPE_FID: u8 = 1;
pub const FAN_EVENT_INFO_TYPE_DFID_NAME: u8 = 2;
pub const FAN_EVENT_INFO_TYPE_DFID: u8 = 3;
pub const FAN_EVENT_INFO_TYPE_PIDFD: u8 = 4;
pub const FAN_EVENT_INFO_TYPE_ERROR: u8 = 5;

// The userspace O_LARGEFILE is 0 on 64-bit glibc; the kernel still wants
// the raw bit in fanotify event_f_flags.
pub const O_LARGEFILE: c_int = 0o100000;

/// Upper bound for the name embedded in a DFID_NAME info record.
pub const NAME_MAX: usize = 255;

// Capability query ABI (linux/capability.h)
pub const CAP_SYS_ADMIN: u32 = 21;
pub const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct cap_user_header {
    pub version: u32,
    pub pid: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct cap_user_data {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

/// `capget(2)`. libc carries the syscall number but no wrapper.
pub unsafe fn capget(header: *mut cap_user_header, data: *mut cap_user_data) -> c_int {
    libc::syscall(libc::SYS_capget, header, data) as c_int
}

/// `open_by_handle_at(2)`. The handle argument points at a packed
/// `struct file_handle`: `handle_bytes: u32`, `handle_type: i32`, then
/// `handle_bytes` opaque bytes.
pub unsafe fn open_by_handle_at(mount_fd: c_int, handle: *const u8, flags: c_int) -> c_int {
    libc::syscall(
        libc::SYS_open_by_handle_at,
        mount_fd as c_long,
        handle as c_long,
        flags as c_long,
    ) as c_int
}

/// Last errno for the calling thread.
pub fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}
