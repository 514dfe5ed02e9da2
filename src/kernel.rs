//! Capability and kernel version probing
//!
//! The watcher needs two facts about the host before it can negotiate
//! fanotify flags: whether the process holds CAP_SYS_ADMIN, and which
//! kernel it is running on. Both are read once at construction.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;

use crate::error::{Result, WatcherError};
use crate::linux;

/// A kernel release, as parsed from the `uname` release string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Probe the running kernel via `uname(2)`.
    pub fn detect() -> Result<Self> {
        let mut info = MaybeUninit::<libc::utsname>::zeroed();
        let rc = unsafe { libc::uname(info.as_mut_ptr()) };
        if rc != 0 {
            return Err(WatcherError::last_os_error());
        }
        let info = unsafe { info.assume_init() };
        let release: String = info
            .release
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect();
        Self::parse(&release)
    }

    /// Parse a release string such as `5.15.0-92-generic`.
    ///
    /// The first three decimal runs are taken as major, minor and patch;
    /// anything else in the string is ignored.
    pub fn parse(release: &str) -> Result<Self> {
        let mut parts = [0u32; 3];
        let mut found = 0;
        let mut digits = release.chars().peekable();
        while found < 3 {
            while digits.peek().is_some_and(|c| !c.is_ascii_digit()) {
                digits.next();
            }
            if digits.peek().is_none() {
                break;
            }
            let mut value: u32 = 0;
            while let Some(&c) = digits.peek() {
                if let Some(d) = c.to_digit(10) {
                    value = value.saturating_mul(10).saturating_add(d);
                    digits.next();
                } else {
                    break;
                }
            }
            parts[found] = value;
            found += 1;
        }
        if found < 3 {
            return Err(WatcherError::KernelVersionParse {
                release: release.to_string(),
            });
        }
        Ok(KernelVersion {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }

    /// True if this kernel is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Return true if the process carries CAP_SYS_ADMIN in its effective set.
pub fn have_sys_admin() -> Result<bool> {
    let mut header = linux::cap_user_header {
        version: linux::LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 reports 64-bit capability sets as two 32-bit words.
    let mut data = [linux::cap_user_data::default(); 2];
    let rc = unsafe { linux::capget(&mut header, data.as_mut_ptr()) };
    if rc != 0 {
        return Err(WatcherError::CapabilityQuery(io::Error::last_os_error()));
    }
    let word = (linux::CAP_SYS_ADMIN / 32) as usize;
    let bit = 1u32 << (linux::CAP_SYS_ADMIN % 32);
    Ok(data[word].effective & bit != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_distro_release_strings() {
        let v = KernelVersion::parse("5.15.0-92-generic").unwrap();
        assert_eq!(
            v,
            KernelVersion {
                major: 5,
                minor: 15,
                patch: 0
            }
        );

        let v = KernelVersion::parse("6.1.55+").unwrap();
        assert_eq!(v.major, 6);
        assert_eq!(v.minor, 1);
        assert_eq!(v.patch, 55);

        let v = KernelVersion::parse("4.19.0-25-cloud-amd64").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (4, 19, 0));
    }

    #[test]
    fn rejects_release_with_too_few_groups() {
        assert!(matches!(
            KernelVersion::parse("5.15"),
            Err(WatcherError::KernelVersionParse { .. })
        ));
        assert!(matches!(
            KernelVersion::parse("linux"),
            Err(WatcherError::KernelVersionParse { .. })
        ));
    }

    #[test]
    fn at_least_compares_major_then_minor() {
        let v = KernelVersion {
            major: 5,
            minor: 9,
            patch: 3,
        };
        assert!(v.at_least(5, 9));
        assert!(v.at_least(5, 1));
        assert!(v.at_least(4, 20));
        assert!(!v.at_least(5, 10));
        assert!(!v.at_least(6, 0));
    }

    #[test]
    fn detect_reads_running_kernel() {
        let v = KernelVersion::detect().unwrap();
        assert!(v.major >= 4);
    }

    #[test]
    fn capability_query_succeeds() {
        // The answer depends on the test environment; only the query
        // itself must not fail.
        have_sys_admin().unwrap();
    }

    #[test]
    fn displays_dotted_triple() {
        let v = KernelVersion {
            major: 5,
            minor: 4,
            patch: 17,
        };
        assert_eq!(v.to_string(), "5.4.17");
    }
}
