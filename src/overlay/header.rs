//! Fixed-length binary header prepended to every per-inode overlay file.
//!
//! The header identifies whether the body is a serialized directory listing
//! or raw file contents, carries the container format version, and reserves
//! space for three `{sec, nsec}` timestamps. All integers are big-endian.

use crate::{Error, Result};

/// Total on-disk header length, padding included. Bodies start at this
/// offset; bumping header content within the padding does not move them.
pub const HEADER_LEN: usize = 64;
/// Current entry container format version.
pub const HEADER_VERSION: u32 = 1;

const IDENTIFIER_LEN: usize = 8;
const IDENTIFIER_DIR: &[u8; IDENTIFIER_LEN] = b"OVDR\0\0\0\0";
const IDENTIFIER_FILE: &[u8; IDENTIFIER_LEN] = b"OVFL\0\0\0\0";

const VERSION_OFFSET: usize = IDENTIFIER_LEN;
const ATIME_OFFSET: usize = VERSION_OFFSET + 4;
const CTIME_OFFSET: usize = ATIME_OFFSET + 16;
const MTIME_OFFSET: usize = CTIME_OFFSET + 16;

/// Which of the two body kinds a per-inode file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

impl EntryKind {
    fn identifier(self) -> &'static [u8; IDENTIFIER_LEN] {
        match self {
            EntryKind::Dir => IDENTIFIER_DIR,
            EntryKind::File => IDENTIFIER_FILE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            EntryKind::Dir => "directory",
            EntryKind::File => "file",
        }
    }
}

/// Seconds/nanoseconds pair stored in the header. The store writes zeros;
/// the fields are reserved and round-trip whatever is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u64,
}

/// Decoded header fields, identifier excluded (the caller states the
/// expected kind up front).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub version: u32,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
}

pub fn encode_header(
    kind: EntryKind,
    version: u32,
    atime: Timespec,
    ctime: Timespec,
    mtime: Timespec,
) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[..IDENTIFIER_LEN].copy_from_slice(kind.identifier());
    buf[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&version.to_be_bytes());
    put_timespec(&mut buf, ATIME_OFFSET, atime);
    put_timespec(&mut buf, CTIME_OFFSET, ctime);
    put_timespec(&mut buf, MTIME_OFFSET, mtime);
    buf
}

/// Decode the header at the front of `bytes`, which may extend past
/// `HEADER_LEN` into the body.
pub fn decode_header(bytes: &[u8], expected: EntryKind) -> Result<EntryHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::CorruptHeader {
            reason: format!(
                "{} bytes is too short for the {HEADER_LEN}-byte entry header",
                bytes.len()
            ),
        }
        .into());
    }

    let identifier = &bytes[..IDENTIFIER_LEN];
    if identifier != expected.identifier() {
        return Err(Error::WrongKind {
            expected: expected.label().to_string(),
            actual: hex(identifier),
        }
        .into());
    }

    let version = u32::from_be_bytes(bytes[VERSION_OFFSET..VERSION_OFFSET + 4].try_into().unwrap());
    if version != HEADER_VERSION {
        return Err(Error::UnsupportedVersion {
            found: version,
            expected: HEADER_VERSION,
        }
        .into());
    }

    Ok(EntryHeader {
        version,
        atime: get_timespec(bytes, ATIME_OFFSET),
        ctime: get_timespec(bytes, CTIME_OFFSET),
        mtime: get_timespec(bytes, MTIME_OFFSET),
    })
}

fn put_timespec(buf: &mut [u8], offset: usize, ts: Timespec) {
    buf[offset..offset + 8].copy_from_slice(&ts.sec.to_be_bytes());
    buf[offset + 8..offset + 16].copy_from_slice(&ts.nsec.to_be_bytes());
}

fn get_timespec(bytes: &[u8], offset: usize) -> Timespec {
    Timespec {
        sec: u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap()),
        nsec: u64::from_be_bytes(bytes[offset + 8..offset + 16].try_into().unwrap()),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
