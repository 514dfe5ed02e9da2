use bitflags::bitflags;
use libc::c_uint;

use crate::error::{Result, WatcherError};
use crate::kernel::KernelVersion;
use crate::linux;

bitflags! {
    /// Flags for fanotify initialization
    ///
    /// The notification class is not part of this set; it is derived from
    /// the watcher's [`PermissionMode`] and or-ed in at init time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InitFlags: c_uint {
        /// Close-on-exec flag on the notification fd
        const CLOEXEC = libc::FAN_CLOEXEC;

        /// Non-blocking notification fd
        const NONBLOCK = libc::FAN_NONBLOCK;

        /// Remove the limit on the event queue depth
        const UNLIMITED_QUEUE = libc::FAN_UNLIMITED_QUEUE;

        /// Remove the limit on the number of marks
        const UNLIMITED_MARKS = libc::FAN_UNLIMITED_MARKS;

        /// Emit audit log records for permission decisions
        const ENABLE_AUDIT = linux::FAN_ENABLE_AUDIT;

        /// Report file identifiers instead of open fds (kernel 5.1+)
        const REPORT_FID = linux::FAN_REPORT_FID;

        /// Report the identifier of the parent directory (kernel 5.9+)
        const REPORT_DIR_FID = linux::FAN_REPORT_DIR_FID;

        /// Report the file name within its directory (kernel 5.9+)
        const REPORT_NAME = linux::FAN_REPORT_NAME;

        /// Directory identifier plus name
        const REPORT_DFID_NAME = linux::FAN_REPORT_DFID_NAME;
    }
}

bitflags! {
    /// Event mask for fanotify marks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u64 {
        const ACCESS = libc::FAN_ACCESS;
        const MODIFY = libc::FAN_MODIFY;
        const ATTRIB = linux::FAN_ATTRIB;
        const CLOSE_WRITE = libc::FAN_CLOSE_WRITE;
        const CLOSE_NOWRITE = libc::FAN_CLOSE_NOWRITE;
        const OPEN = libc::FAN_OPEN;
        const OPEN_EXEC = linux::FAN_OPEN_EXEC;
        const MOVED_FROM = linux::FAN_MOVED_FROM;
        const MOVED_TO = linux::FAN_MOVED_TO;
        const CREATE = linux::FAN_CREATE;
        const DELETE = linux::FAN_DELETE;
        const DELETE_SELF = linux::FAN_DELETE_SELF;
        const MOVE_SELF = linux::FAN_MOVE_SELF;
        const Q_OVERFLOW = linux::FAN_Q_OVERFLOW;

        const OPEN_PERM = libc::FAN_OPEN_PERM;
        const OPEN_EXEC_PERM = linux::FAN_OPEN_EXEC_PERM;
        const ACCESS_PERM = libc::FAN_ACCESS_PERM;

        const ONDIR = libc::FAN_ONDIR;
        const EVENT_ON_CHILD = libc::FAN_EVENT_ON_CHILD;

        /// Everything a notification-only watch subscribes to
        const NOTIFICATION = Self::ACCESS.bits() | Self::MODIFY.bits()
            | Self::OPEN.bits() | Self::OPEN_EXEC.bits()
            | Self::ATTRIB.bits() | Self::CREATE.bits()
            | Self::DELETE.bits() | Self::DELETE_SELF.bits()
            | Self::MOVED_FROM.bits() | Self::MOVED_TO.bits()
            | Self::MOVE_SELF.bits();

        /// The notification set plus permission gates; plain ACCESS is
        /// dropped because ACCESS_PERM covers it
        const WITH_PERMISSIONS = (Self::NOTIFICATION.bits()
            & !Self::ACCESS.bits())
            | Self::OPEN_PERM.bits() | Self::OPEN_EXEC_PERM.bits()
            | Self::ACCESS_PERM.bits();

        /// The subset that is legal on a mount-scope mark
        const MOUNT_SCOPE = Self::ACCESS.bits() | Self::MODIFY.bits()
            | Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits()
            | Self::OPEN.bits() | Self::OPEN_EXEC.bits();

        /// All permission-gating bits
        const PERMISSION_EVENTS = Self::OPEN_PERM.bits()
            | Self::OPEN_EXEC_PERM.bits() | Self::ACCESS_PERM.bits();
    }
}

/// When permission events must be requested, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Notification events only
    #[default]
    None,
    /// Gate access before files contain their final data
    PreContent,
    /// Gate access once files contain their final content
    PostContent,
}

impl PermissionMode {
    /// The fanotify notification class for this mode.
    pub(crate) fn class_bits(self) -> c_uint {
        match self {
            PermissionMode::None => libc::FAN_CLASS_NOTIF,
            PermissionMode::PreContent => libc::FAN_CLASS_PRE_CONTENT,
            PermissionMode::PostContent => libc::FAN_CLASS_CONTENT,
        }
    }

    /// True for the two content classes.
    pub fn is_permission(self) -> bool {
        !matches!(self, PermissionMode::None)
    }
}

/// File status flags applied to event fds handed out by the kernel.
pub(crate) const EVENT_F_FLAGS: c_uint =
    (libc::O_RDONLY | linux::O_LARGEFILE | libc::O_CLOEXEC) as c_uint;

/// Pick init flags for the detected kernel.
///
/// FID reporting moves the fd out of the event and permission events never
/// arrive in FID mode, so a permission-mode watcher stays on the classic
/// scheme regardless of kernel.
pub fn negotiated_init_flags(kernel: KernelVersion, mode: PermissionMode) -> InitFlags {
    if mode.is_permission() {
        return InitFlags::CLOEXEC;
    }
    if kernel.at_least(5, 9) {
        InitFlags::CLOEXEC | InitFlags::REPORT_DIR_FID | InitFlags::REPORT_NAME
    } else if kernel.at_least(5, 1) {
        InitFlags::CLOEXEC | InitFlags::REPORT_FID
    } else {
        InitFlags::CLOEXEC
    }
}

/// Reject init flag combinations the kernel would refuse.
pub fn flags_valid(flags: InitFlags, mode: PermissionMode) -> Result<()> {
    if flags.contains(InitFlags::REPORT_FID) && mode.is_permission() {
        return Err(WatcherError::invalid_flags(
            "FAN_REPORT_FID cannot be combined with a content class",
        ));
    }
    if flags.contains(InitFlags::REPORT_NAME) && !flags.contains(InitFlags::REPORT_DIR_FID) {
        return Err(WatcherError::invalid_flags(
            "FAN_REPORT_NAME requires FAN_REPORT_DIR_FID",
        ));
    }
    Ok(())
}

/// Reject mask bits that are invalid on a mount-scope mark.
pub fn mount_mask_valid(mask: EventMask) -> Result<()> {
    let illegal = EventMask::CREATE
        | EventMask::ATTRIB
        | EventMask::MOVED_FROM
        | EventMask::MOVED_TO
        | EventMask::DELETE_SELF
        | EventMask::DELETE;
    if mask.intersects(illegal) {
        return Err(WatcherError::invalid_flags(
            "a mount cannot be watched for create, attrib, move or delete event types",
        ));
    }
    Ok(())
}

const INIT_FLAG_KERNELS: &[(InitFlags, u32, u32, &str)] = &[
    (InitFlags::ENABLE_AUDIT, 4, 15, "FAN_ENABLE_AUDIT"),
    (InitFlags::REPORT_FID, 5, 1, "FAN_REPORT_FID"),
    (InitFlags::REPORT_DIR_FID, 5, 9, "FAN_REPORT_DIR_FID"),
    (InitFlags::REPORT_NAME, 5, 9, "FAN_REPORT_NAME"),
];

const MARK_MASK_KERNELS: &[(EventMask, u32, u32, &str)] = &[
    (EventMask::OPEN_EXEC, 5, 0, "FAN_OPEN_EXEC"),
    (EventMask::ATTRIB, 5, 1, "FAN_ATTRIB"),
    (EventMask::CREATE, 5, 1, "FAN_CREATE"),
    (EventMask::DELETE, 5, 1, "FAN_DELETE"),
    (EventMask::DELETE_SELF, 5, 1, "FAN_DELETE_SELF"),
    (EventMask::MOVED_FROM, 5, 1, "FAN_MOVED_FROM"),
    (EventMask::MOVED_TO, 5, 1, "FAN_MOVED_TO"),
];

/// Check every set init flag against its minimum kernel.
pub fn init_flags_supported(flags: InitFlags, kernel: KernelVersion) -> Result<()> {
    for &(flag, major, minor, name) in INIT_FLAG_KERNELS {
        if flags.contains(flag) && !kernel.at_least(major, minor) {
            return Err(WatcherError::UnsupportedOnKernel { what: name, kernel });
        }
    }
    Ok(())
}

/// Check every set mark mask bit against its minimum kernel.
pub fn mark_mask_supported(mask: EventMask, kernel: KernelVersion) -> Result<()> {
    for &(bit, major, minor, name) in MARK_MASK_KERNELS {
        if mask.contains(bit) && !kernel.at_least(major, minor) {
            return Err(WatcherError::UnsupportedOnKernel { what: name, kernel });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(major: u32, minor: u32) -> KernelVersion {
        KernelVersion {
            major,
            minor,
            patch: 0,
        }
    }

    #[test]
    fn negotiation_follows_kernel_version() {
        assert_eq!(
            negotiated_init_flags(kernel(4, 19), PermissionMode::None),
            InitFlags::CLOEXEC
        );
        assert_eq!(
            negotiated_init_flags(kernel(5, 0), PermissionMode::None),
            InitFlags::CLOEXEC
        );
        assert_eq!(
            negotiated_init_flags(kernel(5, 1), PermissionMode::None),
            InitFlags::CLOEXEC | InitFlags::REPORT_FID
        );
        assert_eq!(
            negotiated_init_flags(kernel(5, 8), PermissionMode::None),
            InitFlags::CLOEXEC | InitFlags::REPORT_FID
        );
        assert_eq!(
            negotiated_init_flags(kernel(5, 9), PermissionMode::None),
            InitFlags::CLOEXEC | InitFlags::REPORT_DIR_FID | InitFlags::REPORT_NAME
        );
        assert_eq!(
            negotiated_init_flags(kernel(6, 2), PermissionMode::None),
            InitFlags::CLOEXEC | InitFlags::REPORT_DIR_FID | InitFlags::REPORT_NAME
        );
    }

    #[test]
    fn permission_mode_never_negotiates_fid() {
        for mode in [PermissionMode::PreContent, PermissionMode::PostContent] {
            let flags = negotiated_init_flags(kernel(6, 2), mode);
            assert!(!flags.intersects(
                InitFlags::REPORT_FID | InitFlags::REPORT_DIR_FID | InitFlags::REPORT_NAME
            ));
        }
    }

    #[test]
    fn report_fid_clashes_with_content_classes() {
        let flags = InitFlags::CLOEXEC | InitFlags::REPORT_FID;
        assert!(flags_valid(flags, PermissionMode::None).is_ok());
        assert!(matches!(
            flags_valid(flags, PermissionMode::PreContent),
            Err(WatcherError::InvalidFlagCombination { .. })
        ));
        assert!(matches!(
            flags_valid(flags, PermissionMode::PostContent),
            Err(WatcherError::InvalidFlagCombination { .. })
        ));
    }

    #[test]
    fn report_name_requires_dir_fid() {
        let flags = InitFlags::CLOEXEC | InitFlags::REPORT_NAME;
        assert!(matches!(
            flags_valid(flags, PermissionMode::None),
            Err(WatcherError::InvalidFlagCombination { .. })
        ));
        let flags = InitFlags::CLOEXEC | InitFlags::REPORT_DFID_NAME;
        assert!(flags_valid(flags, PermissionMode::None).is_ok());
    }

    #[test]
    fn mount_scope_rejects_directory_entry_masks() {
        assert!(mount_mask_valid(EventMask::MOUNT_SCOPE).is_ok());
        for bad in [
            EventMask::CREATE,
            EventMask::ATTRIB,
            EventMask::MOVED_FROM,
            EventMask::MOVED_TO,
            EventMask::DELETE,
            EventMask::DELETE_SELF,
        ] {
            assert!(
                mount_mask_valid(EventMask::MOUNT_SCOPE | bad).is_err(),
                "expected {bad:?} to be rejected on a mount mark"
            );
        }
    }

    #[test]
    fn init_support_checks_every_set_flag() {
        // REPORT_FID alone is fine on 5.1, but adding REPORT_DIR_FID
        // must still fail there.
        let ok = InitFlags::CLOEXEC | InitFlags::REPORT_FID;
        assert!(init_flags_supported(ok, kernel(5, 1)).is_ok());
        let too_new = ok | InitFlags::REPORT_DIR_FID;
        assert!(matches!(
            init_flags_supported(too_new, kernel(5, 1)),
            Err(WatcherError::UnsupportedOnKernel { .. })
        ));
        assert!(init_flags_supported(too_new, kernel(5, 9)).is_ok());
        assert!(matches!(
            init_flags_supported(InitFlags::ENABLE_AUDIT, kernel(4, 14)),
            Err(WatcherError::UnsupportedOnKernel { .. })
        ));
        assert!(init_flags_supported(InitFlags::ENABLE_AUDIT, kernel(4, 15)).is_ok());
    }

    #[test]
    fn mark_support_checks_directory_entry_bits() {
        assert!(mark_mask_supported(EventMask::NOTIFICATION, kernel(5, 1)).is_ok());
        assert!(matches!(
            mark_mask_supported(EventMask::NOTIFICATION, kernel(5, 0)),
            Err(WatcherError::UnsupportedOnKernel { .. })
        ));
        let classic = EventMask::ACCESS | EventMask::MODIFY | EventMask::OPEN;
        assert!(mark_mask_supported(classic, kernel(4, 4)).is_ok());
        assert!(matches!(
            mark_mask_supported(classic | EventMask::OPEN_EXEC, kernel(4, 19)),
            Err(WatcherError::UnsupportedOnKernel { .. })
        ));
    }

    #[test]
    fn permission_mask_drops_plain_access() {
        assert!(!EventMask::WITH_PERMISSIONS.contains(EventMask::ACCESS));
        assert!(EventMask::WITH_PERMISSIONS.contains(EventMask::PERMISSION_EVENTS));
    }
}
