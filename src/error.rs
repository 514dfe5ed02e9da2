use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::kernel::KernelVersion;

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while constructing or driving a watcher
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The process lacks CAP_SYS_ADMIN
    #[error("process lacks the CAP_SYS_ADMIN capability")]
    MissingCapability,

    /// The capability subsystem could not be queried
    #[error("cannot query process capabilities: {0}")]
    CapabilityQuery(#[source] io::Error),

    /// The kernel release string could not be parsed
    #[error("cannot parse kernel release string {release:?}")]
    KernelVersionParse { release: String },

    /// The flag bitmask violates a fanotify combination rule
    #[error("invalid flag bitmask: {message}")]
    InvalidFlagCombination { message: String },

    /// A requested flag needs a newer kernel than the one detected
    #[error("{what} requires a newer kernel than {kernel}")]
    UnsupportedOnKernel {
        what: &'static str,
        kernel: KernelVersion,
    },

    /// No mount table entry matched the device of the requested path
    #[error("no mount table entry matches the device of {path:?}")]
    MountNotFound { path: PathBuf },

    /// Mount resolution failed while stat-ing mount table entries
    #[error("cannot stat mount table entries: {0}")]
    MountResolveStat(#[source] io::Error),

    /// The path lives on a different device than the bound mount
    #[error("path {path:?} is outside the watched mount")]
    PathOutsideMount { path: PathBuf },

    /// The watcher has been closed
    #[error("watcher is closed")]
    Closed,

    /// A syscall failed after construction
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WatcherError {
    /// Wrap the last OS error of the calling thread.
    pub(crate) fn last_os_error() -> Self {
        WatcherError::Io(io::Error::last_os_error())
    }

    pub(crate) fn invalid_flags(message: impl Into<String>) -> Self {
        WatcherError::InvalidFlagCombination {
            message: message.into(),
        }
    }
}

impl From<i32> for WatcherError {
    fn from(errno: i32) -> Self {
        WatcherError::Io(io::Error::from_raw_os_error(errno))
    }
}
