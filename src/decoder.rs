//! Event-stream decoding
//!
//! A read from the notification fd returns one or more variable-length
//! records: a fixed metadata header, optionally followed by info records
//! carrying a filesystem id, a kernel file handle, and (with
//! FAN_REPORT_NAME) an embedded NUL-terminated name. The kernel writes
//! these as packed little-endian structs; this module decodes them field
//! by field with every length checked against the buffer, never by
//! overlaying struct pointers.
//!
//! Iteration follows the kernel's own contract: a record is usable while
//! `remaining >= metadata_len && event_len >= metadata_len && event_len <=
//! remaining`, and the cursor advances by exactly `event_len`. Nothing
//! else moves the cursor, so a buffer of well-formed records of total
//! length L is consumed in exactly L bytes.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;

use crate::linux;

/// Size of the fixed metadata header on the wire.
pub(crate) const EVENT_METADATA_LEN: usize = 24;

/// Offset of the first info record is given per event; the info header
/// itself is 4 bytes, the fsid 8, and the handle prefix 8 more.
const INFO_FIXED_LEN: usize = 20;

/// Decoded `fanotify_event_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventMetadata {
    pub event_len: u32,
    pub vers: u8,
    pub metadata_len: u16,
    pub mask: u64,
    pub fd: i32,
    pub pid: i32,
}

impl EventMetadata {
    /// Decode the fixed header from the front of `buf`, if it fits.
    pub fn parse(buf: &[u8]) -> Option<EventMetadata> {
        if buf.len() < EVENT_METADATA_LEN {
            return None;
        }
        Some(EventMetadata {
            event_len: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            vers: buf[4],
            // buf[5] is reserved
            metadata_len: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            mask: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            fd: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
            pid: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }

    /// True if this event still carries the kernel-supplied fd scheme.
    pub fn has_fd(&self) -> bool {
        self.fd != libc::FAN_NOFD
    }
}

/// A malformed record body. The caller must drop the whole remaining
/// buffer; resynchronizing mid-stream is not possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The record is too short for the structure it claims to carry.
    Truncated { have: usize, need: usize },
    /// The embedded file handle does not fit inside the record.
    HandleOverrun { handle_bytes: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { have, need } => {
                write!(f, "record truncated: have {have} bytes, need {need}")
            }
            DecodeError::HandleOverrun { handle_bytes } => {
                write!(f, "file handle of {handle_bytes} bytes overruns its record")
            }
        }
    }
}

/// Iterator over the records in one read buffer.
pub(crate) struct RecordIter<'a> {
    buf: &'a [u8],
}

impl<'a> RecordIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        RecordIter { buf }
    }

    /// Bytes not consumed by iteration. Non-zero after exhaustion means
    /// the kernel handed us a partial or corrupt trailing record.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = (EventMetadata, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let meta = EventMetadata::parse(self.buf)?;
        let event_len = meta.event_len as usize;
        if event_len < EVENT_METADATA_LEN || event_len > self.buf.len() {
            return None;
        }
        let (record, rest) = self.buf.split_at(event_len);
        self.buf = rest;
        Some((meta, record))
    }
}

/// One decoded FID info record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FidInfo {
    pub info_type: u8,
    /// The packed `struct file_handle` bytes (`handle_bytes`,
    /// `handle_type`, then the opaque handle), ready to pass to
    /// `open_by_handle_at`.
    pub handle: Vec<u8>,
    /// Child name for DFID_NAME records.
    pub name: Option<OsString>,
}

impl FidInfo {
    /// Decode the info record that starts `metadata_len` bytes into
    /// `record`.
    pub fn parse(record: &[u8], metadata_len: u16) -> Result<FidInfo, DecodeError> {
        let info_off = metadata_len as usize;
        let info = record.get(info_off..).unwrap_or(&[]);
        if info.len() < INFO_FIXED_LEN {
            return Err(DecodeError::Truncated {
                have: info.len(),
                need: INFO_FIXED_LEN,
            });
        }
        let info_type = info[0];
        // info[1] is padding
        let info_len = u16::from_le_bytes(info[2..4].try_into().unwrap()) as usize;
        // header (4) + fsid (8) precede the packed file handle
        let handle_bytes = u32::from_le_bytes(info[12..16].try_into().unwrap());
        let handle_end = INFO_FIXED_LEN + handle_bytes as usize;
        if handle_end > info.len() || handle_end > info_len.max(INFO_FIXED_LEN) {
            return Err(DecodeError::HandleOverrun { handle_bytes });
        }
        let handle = info[12..handle_end].to_vec();

        let name = if info_type == linux::FAN_EVENT_INFO_TYPE_DFID_NAME {
            let limit = info_len.min(info.len()).min(handle_end + linux::NAME_MAX);
            let name_region = &info[handle_end..limit.max(handle_end)];
            let len = name_region
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_region.len());
            if len == 0 {
                None
            } else {
                Some(OsString::from_vec(name_region[..len].to_vec()))
            }
        } else {
            None
        };

        Ok(FidInfo {
            info_type,
            handle,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_bytes(event_len: u32, metadata_len: u16, mask: u64, fd: i32, pid: i32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EVENT_METADATA_LEN);
        buf.extend_from_slice(&event_len.to_le_bytes());
        buf.push(libc::FANOTIFY_METADATA_VERSION);
        buf.push(0); // reserved
        buf.extend_from_slice(&metadata_len.to_le_bytes());
        buf.extend_from_slice(&mask.to_le_bytes());
        buf.extend_from_slice(&fd.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf
    }

    fn classic_record(mask: u64, fd: i32, pid: i32) -> Vec<u8> {
        metadata_bytes(EVENT_METADATA_LEN as u32, EVENT_METADATA_LEN as u16, mask, fd, pid)
    }

    fn fid_record(
        mask: u64,
        info_type: u8,
        handle_type: i32,
        handle: &[u8],
        name: Option<&str>,
    ) -> Vec<u8> {
        let name_len = name.map(|n| n.len() + 1).unwrap_or(0);
        let info_len = INFO_FIXED_LEN + handle.len() + name_len;
        let event_len = EVENT_METADATA_LEN + info_len;
        let mut buf = metadata_bytes(
            event_len as u32,
            EVENT_METADATA_LEN as u16,
            mask,
            libc::FAN_NOFD,
            77,
        );
        buf.push(info_type);
        buf.push(0); // pad
        buf.extend_from_slice(&(info_len as u16).to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]); // fsid
        buf.extend_from_slice(&(handle.len() as u32).to_le_bytes());
        buf.extend_from_slice(&handle_type.to_le_bytes());
        buf.extend_from_slice(handle);
        if let Some(n) = name {
            buf.extend_from_slice(n.as_bytes());
            buf.push(0);
        }
        assert_eq!(buf.len(), event_len);
        buf
    }

    #[test]
    fn decodes_metadata_fields() {
        let buf = classic_record(libc::FAN_OPEN, 42, 1234);
        let meta = EventMetadata::parse(&buf).unwrap();
        assert_eq!(meta.event_len, EVENT_METADATA_LEN as u32);
        assert_eq!(meta.vers, libc::FANOTIFY_METADATA_VERSION);
        assert_eq!(meta.metadata_len, EVENT_METADATA_LEN as u16);
        assert_eq!(meta.mask, libc::FAN_OPEN);
        assert_eq!(meta.fd, 42);
        assert_eq!(meta.pid, 1234);
        assert!(meta.has_fd());
    }

    #[test]
    fn short_buffers_are_not_metadata() {
        assert!(EventMetadata::parse(&[0u8; EVENT_METADATA_LEN - 1]).is_none());
        assert!(EventMetadata::parse(&[]).is_none());
    }

    #[test]
    fn iterates_concatenated_records_consuming_exact_length() {
        let mut buf = classic_record(libc::FAN_OPEN, 10, 1);
        buf.extend(classic_record(libc::FAN_MODIFY, 11, 2));
        buf.extend(fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_DFID_NAME,
            1,
            &[0xaa; 8],
            Some("child.txt"),
        ));
        let total = buf.len();

        let mut iter = RecordIter::new(&buf);
        let records: Vec<_> = iter.by_ref().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(iter.remaining(), 0);
        let consumed: usize = records.iter().map(|(m, _)| m.event_len as usize).sum();
        assert_eq!(consumed, total);
    }

    #[test]
    fn stops_on_truncated_trailing_record() {
        let mut buf = classic_record(libc::FAN_OPEN, 10, 1);
        buf.extend(&classic_record(libc::FAN_MODIFY, 11, 2)[..10]);
        let mut iter = RecordIter::new(&buf);
        assert_eq!(iter.by_ref().count(), 1);
        assert_eq!(iter.remaining(), 10);
    }

    #[test]
    fn rejects_event_len_below_metadata_size() {
        let buf = metadata_bytes(8, EVENT_METADATA_LEN as u16, 0, 1, 1);
        assert_eq!(RecordIter::new(&buf).count(), 0);
    }

    #[test]
    fn rejects_event_len_beyond_buffer() {
        let buf = metadata_bytes(1024, EVENT_METADATA_LEN as u16, 0, 1, 1);
        assert_eq!(RecordIter::new(&buf).count(), 0);
    }

    #[test]
    fn parses_fid_info_without_name() {
        let handle = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let record = fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_FID,
            42,
            &handle,
            None,
        );
        let (meta, body) = RecordIter::new(&record).next().unwrap();
        assert!(!meta.has_fd());
        let fid = FidInfo::parse(body, meta.metadata_len).unwrap();
        assert_eq!(fid.info_type, linux::FAN_EVENT_INFO_TYPE_FID);
        assert!(fid.name.is_none());
        // The packed handle leads with handle_bytes and handle_type.
        assert_eq!(&fid.handle[0..4], &(handle.len() as u32).to_le_bytes());
        assert_eq!(&fid.handle[4..8], &42i32.to_le_bytes());
        assert_eq!(&fid.handle[8..], &handle);
    }

    #[test]
    fn parses_fid_info_with_embedded_name() {
        let record = fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_DFID_NAME,
            1,
            &[9u8; 12],
            Some("notes.md"),
        );
        let (meta, body) = RecordIter::new(&record).next().unwrap();
        let fid = FidInfo::parse(body, meta.metadata_len).unwrap();
        assert_eq!(fid.name.as_deref(), Some("notes.md".as_ref()));
    }

    #[test]
    fn name_stops_at_first_nul() {
        let mut record = fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_DFID_NAME,
            1,
            &[9u8; 4],
            Some("abc"),
        );
        // Append garbage past the NUL terminator, still inside event_len.
        let garbage = b"zzz";
        let new_len = (record.len() + garbage.len()) as u32;
        record.extend_from_slice(garbage);
        record[0..4].copy_from_slice(&new_len.to_le_bytes());
        let info_len_off = EVENT_METADATA_LEN + 2;
        let info_len = (new_len as usize - EVENT_METADATA_LEN) as u16;
        record[info_len_off..info_len_off + 2].copy_from_slice(&info_len.to_le_bytes());

        let (meta, body) = RecordIter::new(&record).next().unwrap();
        let fid = FidInfo::parse(body, meta.metadata_len).unwrap();
        assert_eq!(fid.name.as_deref(), Some("abc".as_ref()));
    }

    #[test]
    fn rejects_truncated_info_record() {
        let mut record = fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_FID,
            1,
            &[1u8; 8],
            None,
        );
        // Claim an info region that cannot hold even the fixed prefix.
        record.truncate(EVENT_METADATA_LEN + 10);
        let new_len = record.len() as u32;
        record[0..4].copy_from_slice(&new_len.to_le_bytes());
        let (meta, body) = RecordIter::new(&record).next().unwrap();
        assert!(matches!(
            FidInfo::parse(body, meta.metadata_len),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_handle_overrunning_record() {
        let mut record = fid_record(
            linux::FAN_CREATE,
            linux::FAN_EVENT_INFO_TYPE_FID,
            1,
            &[1u8; 8],
            None,
        );
        // Lie about handle_bytes: far larger than the record.
        let off = EVENT_METADATA_LEN + 12;
        record[off..off + 4].copy_from_slice(&4096u32.to_le_bytes());
        let (meta, body) = RecordIter::new(&record).next().unwrap();
        assert!(matches!(
            FidInfo::parse(body, meta.metadata_len),
            Err(DecodeError::HandleOverrun { .. })
        ));
    }
}
