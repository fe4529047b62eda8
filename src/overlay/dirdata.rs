//! Serialized directory listings.
//!
//! A directory body is a mapping from entry name to `{mode, inode | hash}`.
//! An entry is either *materialized* (it has its own per-inode overlay file,
//! identified by a non-zero inode number) or *tracked* (it delegates to
//! source control by content hash). Exactly one of the two forms holds for
//! every entry; the in-memory enum cannot express anything else, and the
//! decoder rejects wire records that try.
//!
//! Wire schema, bincode little-endian fixed-int, entries sorted by name:
//!
//! ```text
//! u64 entry_count
//! repeated: u64 name_len || name bytes || u32 mode || u64 inode
//!           || u64 hash_len || hash bytes
//! ```
//!
//! `inode == 0` marks a tracked entry. The schema version rides in the entry
//! header, not in the body.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirContents {
    pub entries: BTreeMap<OsString, DirEntry>,
}

impl DirContents {
    pub fn insert(&mut self, name: impl Into<OsString>, entry: DirEntry) {
        self.entries.insert(name.into(), entry);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub mode: u32,
    pub backing: EntryBacking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBacking {
    /// Locally authoritative; the child's state lives in its own overlay file.
    Materialized { inode: u64 },
    /// Delegated to source control by content hash.
    Tracked { hash: Vec<u8> },
}

impl DirEntry {
    pub fn materialized(mode: u32, inode: u64) -> Self {
        debug_assert_ne!(inode, 0, "materialized entries need a real inode number");
        Self {
            mode,
            backing: EntryBacking::Materialized { inode },
        }
    }

    pub fn tracked(mode: u32, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            mode,
            backing: EntryBacking::Tracked { hash: hash.into() },
        }
    }

    /// Inode number for materialized entries, `None` for tracked ones.
    pub fn inode(&self) -> Option<u64> {
        match self.backing {
            EntryBacking::Materialized { inode } => Some(inode),
            EntryBacking::Tracked { .. } => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    name: Vec<u8>,
    mode: u32,
    inode: u64,
    hash: Vec<u8>,
}

pub fn encode_dir(dir: &DirContents) -> Result<Vec<u8>> {
    let entries: Vec<WireEntry> = dir
        .entries
        .iter()
        .map(|(name, entry)| {
            let (inode, hash) = match &entry.backing {
                EntryBacking::Materialized { inode } => (*inode, Vec::new()),
                EntryBacking::Tracked { hash } => (0, hash.clone()),
            };
            WireEntry {
                name: name.as_bytes().to_vec(),
                mode: entry.mode,
                inode,
                hash,
            }
        })
        .collect();
    Ok(bincode::serialize(&entries)?)
}

pub fn decode_dir(bytes: &[u8]) -> Result<DirContents> {
    let entries: Vec<WireEntry> = bincode::deserialize(bytes).map_err(|err| Error::CorruptDir {
        reason: err.to_string(),
    })?;

    let mut dir = DirContents::default();
    for raw in entries {
        let name = OsString::from_vec(raw.name);
        let backing = match (raw.inode, raw.hash.is_empty()) {
            (0, false) => EntryBacking::Tracked { hash: raw.hash },
            (0, true) => {
                return Err(Error::CorruptDir {
                    reason: format!("entry {name:?} has neither an inode number nor a hash"),
                }
                .into());
            }
            (inode, true) => EntryBacking::Materialized { inode },
            (inode, false) => {
                return Err(Error::CorruptDir {
                    reason: format!("entry {name:?} has both inode {inode} and a hash"),
                }
                .into());
            }
        };

        let prior = dir.entries.insert(
            name.clone(),
            DirEntry {
                mode: raw.mode,
                backing,
            },
        );
        if prior.is_some() {
            return Err(Error::CorruptDir {
                reason: format!("duplicate entry name {name:?}"),
            }
            .into());
        }
    }

    Ok(dir)
}
