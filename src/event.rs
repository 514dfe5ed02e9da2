use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use bitflags::bitflags;
use log::warn;

use crate::error::{Result, WatcherError};
use crate::flags::EventMask;
#[cfg(test)]
use crate::linux;

bitflags! {
    /// The operations an event reports.
    ///
    /// One event can carry several operations at once; the kernel ors the
    /// raw mask bits and this set mirrors that.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u32 {
        const CREATE = 1 << 0;
        const REMOVE = 1 << 1;
        const WRITE = 1 << 2;
        const RENAME = 1 << 3;
        const CHMOD = 1 << 4;
        const READ = 1 << 5;
        const CLOSE = 1 << 6;
        const OPEN = 1 << 7;
        const EXECUTE = 1 << 8;
        const PERMISSION_TO_OPEN = 1 << 9;
        const PERMISSION_TO_EXECUTE = 1 << 10;
        const PERMISSION_TO_READ = 1 << 11;

        const PERMISSION = Self::PERMISSION_TO_OPEN.bits()
            | Self::PERMISSION_TO_EXECUTE.bits()
            | Self::PERMISSION_TO_READ.bits();
    }
}

impl Op {
    /// Map a raw fanotify mask to operations.
    ///
    /// `FAN_ONDIR` is a marker qualifying the object, not an operation,
    /// and is cleared before mapping.
    pub fn from_raw_mask(raw: u64) -> Op {
        let raw = raw & !libc::FAN_ONDIR;
        let mask = EventMask::from_bits_truncate(raw);
        let mut op = Op::empty();
        if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            op |= Op::CREATE;
        }
        if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF) {
            op |= Op::REMOVE;
        }
        if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE) {
            op |= Op::WRITE;
        }
        if mask.intersects(EventMask::MOVE_SELF | EventMask::MOVED_FROM) {
            op |= Op::RENAME;
        }
        if mask.contains(EventMask::ATTRIB) {
            op |= Op::CHMOD;
        }
        if mask.contains(EventMask::ACCESS) {
            op |= Op::READ;
        }
        if mask.contains(EventMask::CLOSE_NOWRITE) {
            op |= Op::CLOSE;
        }
        if mask.contains(EventMask::OPEN) {
            op |= Op::OPEN;
        }
        if mask.contains(EventMask::OPEN_EXEC) {
            op |= Op::EXECUTE;
        }
        if mask.contains(EventMask::OPEN_PERM) {
            op |= Op::PERMISSION_TO_OPEN;
        }
        if mask.contains(EventMask::OPEN_EXEC_PERM) {
            op |= Op::PERMISSION_TO_EXECUTE;
        }
        if mask.contains(EventMask::ACCESS_PERM) {
            op |= Op::PERMISSION_TO_READ;
        }
        op
    }

    /// True if any permission-gating operation is present.
    pub fn is_permission(&self) -> bool {
        self.intersects(Op::PERMISSION)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(Op, &str)] = &[
            (Op::CREATE, "CREATE"),
            (Op::REMOVE, "REMOVE"),
            (Op::WRITE, "WRITE"),
            (Op::RENAME, "RENAME"),
            (Op::CHMOD, "CHMOD"),
            (Op::READ, "READ"),
            (Op::CLOSE, "CLOSE"),
            (Op::OPEN, "OPEN"),
            (Op::EXECUTE, "EXECUTE"),
            (Op::PERMISSION_TO_OPEN, "PERMISSION_TO_OPEN"),
            (Op::PERMISSION_TO_EXECUTE, "PERMISSION_TO_EXECUTE"),
            (Op::PERMISSION_TO_READ, "PERMISSION_TO_READ"),
        ];
        let mut first = true;
        for &(op, name) in NAMES {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("UNKNOWN")?;
        }
        Ok(())
    }
}

/// A notification event.
///
/// The descriptor is owned by the event: the consumer inherits it on
/// delivery and it is closed when the event is dropped.
#[derive(Debug)]
pub struct Event {
    /// Absolute path of the file or directory the event refers to
    pub path: PathBuf,
    /// The operations reported
    pub op: Op,
    /// Open descriptor for the file the event refers to
    pub fd: OwnedFd,
    /// Process that caused the event
    pub pid: i32,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} (pid {}, fd {})",
            self.op,
            self.path,
            self.pid,
            self.fd.as_raw_fd()
        )
    }
}

/// A permission request.
///
/// The originating syscall stays blocked until [`allow`](Self::allow) or
/// [`deny`](Self::deny) writes the verdict back to the notification group.
/// Dropping an unanswered request denies it.
#[derive(Debug)]
pub struct PermissionEvent {
    /// Absolute path of the file access being gated
    pub path: PathBuf,
    /// The operations requested
    pub op: Op,
    /// Process requesting access
    pub pid: i32,
    fd: Option<OwnedFd>,
    notify_fd: RawFd,
}

impl PermissionEvent {
    pub(crate) fn new(path: PathBuf, op: Op, pid: i32, fd: OwnedFd, notify_fd: RawFd) -> Self {
        PermissionEvent {
            path,
            op,
            pid,
            fd: Some(fd),
            notify_fd,
        }
    }

    /// The descriptor the kernel opened for the gated file.
    pub fn fd(&self) -> BorrowedFd<'_> {
        // Only respond() takes the fd, and it consumes self.
        self.fd.as_ref().expect("fd present until responded").as_fd()
    }

    /// Grant the requested access.
    pub fn allow(mut self) -> Result<()> {
        self.respond(libc::FAN_ALLOW)
    }

    /// Refuse the requested access.
    pub fn deny(mut self) -> Result<()> {
        self.respond(libc::FAN_DENY)
    }

    fn respond(&mut self, response: u32) -> Result<()> {
        let fd = match self.fd.take() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let record = libc::fanotify_response {
            fd: fd.as_raw_fd(),
            response,
        };
        let written = unsafe {
            libc::write(
                self.notify_fd,
                &record as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::fanotify_response>(),
            )
        };
        if written < 0 {
            return Err(WatcherError::last_os_error());
        }
        Ok(())
    }
}

impl Drop for PermissionEvent {
    fn drop(&mut self) {
        if self.fd.is_some() {
            if let Err(err) = self.respond(libc::FAN_DENY) {
                warn!("denying unanswered permission event on drop failed: {err}");
            }
        }
    }
}

impl fmt::Display for PermissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} (pid {})", self.op, self.path, self.pid)
    }
}
