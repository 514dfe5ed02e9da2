//! Mount resolution
//!
//! fanotify resolves file handles relative to an open descriptor on the
//! mount the watched paths live on. Given an arbitrary path, the watcher
//! finds the owning mount by scanning the system mount table and matching
//! device ids, then keeps the mount root open for its whole lifetime.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Result, WatcherError};

const MOUNT_TABLE: &str = "/etc/fstab";

/// One usable record from the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// The mount a watcher is bound to: an open descriptor on the mount root
/// plus the device id shared by everything underneath it.
#[derive(Debug)]
pub struct Mount {
    pub(crate) root: File,
    pub(crate) device: u64,
    pub(crate) path: PathBuf,
}

impl Mount {
    /// Resolve the mount containing `path` and open its root read-only.
    pub fn resolve(path: &Path) -> Result<Self> {
        let device = device_of(path)?;
        let table = File::open(MOUNT_TABLE).map_err(WatcherError::Io)?;
        let entries = parse_mount_table(BufReader::new(table)).map_err(WatcherError::Io)?;

        let mut first_stat_err = None;
        for entry in entries {
            match std::fs::metadata(&entry.mount_point) {
                Ok(meta) => {
                    if meta.dev() == device {
                        debug!(
                            "path {path:?} resolves to {} ({}) mounted at {:?}",
                            entry.source, entry.fs_type, entry.mount_point
                        );
                        let root = File::open(&entry.mount_point).map_err(WatcherError::Io)?;
                        return Ok(Mount {
                            root,
                            device,
                            path: entry.mount_point,
                        });
                    }
                }
                Err(err) => {
                    if first_stat_err.is_none() {
                        first_stat_err = Some(err);
                    }
                }
            }
        }
        match first_stat_err {
            Some(err) => Err(WatcherError::MountResolveStat(err)),
            None => Err(WatcherError::MountNotFound {
                path: path.to_path_buf(),
            }),
        }
    }

    /// True if `path` lives on this mount's device.
    pub fn contains(&self, path: &Path) -> Result<bool> {
        Ok(device_of(path)? == self.device)
    }

    /// The mount point this watcher is anchored at.
    pub fn mount_point(&self) -> &Path {
        &self.path
    }
}

/// Device id of the filesystem object at `path`.
pub(crate) fn device_of(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(WatcherError::Io)?;
    Ok(meta.dev())
}

/// Parse an fstab-style mount table.
///
/// Comment and blank lines are skipped, as are swap records and lines too
/// short to carry a mount point. Read errors surface verbatim.
pub(crate) fn parse_mount_table<R: BufRead>(reader: R) -> std::io::Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            warn!("skipping malformed mount table line: {line:?}");
            continue;
        }
        if fields[2] == "swap" {
            continue;
        }
        // TODO decode \040 and \011 escapes in the mount point (fstab(5))
        entries.push(MountEntry {
            source: fields[0].to_string(),
            mount_point: PathBuf::from(fields[1]),
            fs_type: fields[2].to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TABLE: &str = "\
# /etc/fstab: static file system information.
#
# <file system> <mount point>   <type>  <options>       <dump>  <pass>
UUID=9a7ec376-6325-4fcb-b4d2-48aff4e30da5 /               ext4    errors=remount-ro 0       1
UUID=C0D4-72A5  /boot/efi       vfat    umask=0077      0       1

/dev/sda3       none            swap    sw              0       0
   /dev/sdb1    /mnt/data       xfs     defaults        0       2
broken-line
";

    #[test]
    fn parses_fstab_records() {
        let entries = parse_mount_table(Cursor::new(TABLE)).unwrap();
        let points: Vec<_> = entries
            .iter()
            .map(|e| e.mount_point.to_str().unwrap())
            .collect();
        assert_eq!(points, ["/", "/boot/efi", "/mnt/data"]);
        assert_eq!(entries[2].source, "/dev/sdb1");
        assert_eq!(entries[2].fs_type, "xfs");
    }

    #[test]
    fn skips_comments_blanks_and_swap() {
        let entries = parse_mount_table(Cursor::new(TABLE)).unwrap();
        assert!(entries.iter().all(|e| e.fs_type != "swap"));
        assert!(entries.iter().all(|e| !e.source.starts_with('#')));
    }

    #[test]
    fn tolerates_leading_whitespace() {
        let entries = parse_mount_table(Cursor::new("  \t/dev/x /y ext4 defaults 0 0\n")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, PathBuf::from("/y"));
    }

    #[test]
    fn empty_table_yields_no_entries() {
        let entries = parse_mount_table(Cursor::new("# only comments\n\n")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn device_of_missing_path_is_io_error() {
        let err = device_of(Path::new("/nonexistent-fanotify-watcher-test")).unwrap_err();
        assert!(matches!(err, WatcherError::Io(_)));
    }
}
