//! On-disk overlay store for materialized inodes.
//!
//! The checkout filesystem serves most inodes straight from source-control
//! storage; anything locally modified is *materialized* and must survive
//! across mounts. This module persists those inodes: one file per inode in a
//! 256-way sharded directory tree, each file carrying a fixed binary header
//! (`header`) followed by either a serialized directory listing (`dirdata`)
//! or raw file contents. The overlay root holds an info file that doubles as
//! the mount lock.

pub mod dirdata;
pub mod header;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{Error, Result};
use dirdata::DirContents;
use header::{EntryKind, Timespec, HEADER_LEN, HEADER_VERSION};

/// Inode number of the mount root directory. Inode 0 is reserved as the
/// "not materialized" sentinel and never appears on disk.
pub const ROOT_INODE: u64 = 1;

const INFO_FILE: &str = "info";
const INFO_MAGIC: [u8; 4] = [0xed, 0xe0, 0x00, 0x01];
const INFO_LEN: usize = INFO_MAGIC.len() + 4;
/// Current overlay directory format version, stored in the info file.
const FORMAT_VERSION: u32 = 1;
/// Pre-v1 layouts kept materialized data under a `tree` subdirectory.
const LEGACY_TREE_DIR: &str = "tree";

/// Handle on an overlay root directory.
///
/// Holds an exclusive advisory lock on the info file for its whole lifetime,
/// so at most one process has a given overlay open. Operations on distinct
/// inode numbers touch distinct files and may run concurrently from any
/// thread; per-inode exclusion is the caller's job.
#[derive(Debug)]
pub struct Overlay {
    local_dir: PathBuf,
    info_file: File,
    metrics: OverlayMetricsInner,
}

/// Point-in-time copy of the store's operation counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayMetrics {
    pub dirs_loaded: u64,
    pub dirs_saved: u64,
    pub files_created: u64,
    pub files_opened: u64,
    pub files_removed: u64,
    pub scans: u64,
}

#[derive(Debug, Default)]
struct OverlayMetricsInner {
    dirs_loaded: AtomicU64,
    dirs_saved: AtomicU64,
    files_created: AtomicU64,
    files_opened: AtomicU64,
    files_removed: AtomicU64,
    scans: AtomicU64,
}

impl OverlayMetricsInner {
    fn snapshot(&self) -> OverlayMetrics {
        OverlayMetrics {
            dirs_loaded: self.dirs_loaded.load(Ordering::Relaxed),
            dirs_saved: self.dirs_saved.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            files_removed: self.files_removed.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }
}

impl Overlay {
    /// Open the overlay rooted at `local_dir`, formatting it first if the
    /// directory is not an overlay yet, and take the mount lock.
    pub fn open<P: AsRef<Path>>(local_dir: P) -> Result<Self> {
        let local_dir = local_dir.as_ref().to_path_buf();

        if local_dir.join(LEGACY_TREE_DIR).symlink_metadata().is_ok() {
            return Err(Error::LegacyFormat(local_dir).into());
        }

        let info_path = local_dir.join(INFO_FILE);
        let info_file = match File::open(&info_path) {
            Ok(mut file) => {
                validate_info(&mut file, &info_path)?;
                file
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                init_overlay_root(&local_dir)?;
                File::open(&info_path)?
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = info_file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(Error::AlreadyOpen(local_dir).into());
            }
            return Err(err.into());
        }

        info!(local_dir = %local_dir.display(), "overlay_opened");
        Ok(Self {
            local_dir,
            info_file,
            metrics: OverlayMetricsInner::default(),
        })
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Path of the per-inode file for `inode`. Pure; the file may not exist.
    pub fn file_path(&self, inode: u64) -> PathBuf {
        self.shard_dir(inode).join(inode.to_string())
    }

    /// Load the directory listing stored for `inode`, or `None` if that
    /// inode has no overlay file.
    pub fn load_dir(&self, inode: u64) -> Result<Option<DirContents>> {
        let path = self.file_path(inode);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        header::decode_header(&data, EntryKind::Dir)?;
        let dir = dirdata::decode_dir(&data[HEADER_LEN..])?;
        self.metrics.dirs_loaded.fetch_add(1, Ordering::Relaxed);
        debug!(inode, entries = dir.entries.len(), "dir_loaded");
        Ok(Some(dir))
    }

    /// Persist a directory listing for `inode`, replacing whatever file was
    /// there before (of either kind) in a single atomic rename.
    pub fn save_dir(&self, inode: u64, dir: &DirContents) -> Result<()> {
        let body = dirdata::encode_dir(dir)?;
        let head = header::encode_header(
            EntryKind::Dir,
            HEADER_VERSION,
            Timespec::default(),
            Timespec::default(),
            Timespec::default(),
        );

        let mut data = Vec::with_capacity(HEADER_LEN + body.len());
        data.extend_from_slice(&head);
        data.extend_from_slice(&body);
        write_atomic(&self.shard_dir(inode), &self.file_path(inode), &data)?;

        self.metrics.dirs_saved.fetch_add(1, Ordering::Relaxed);
        debug!(inode, entries = dir.entries.len(), bytes = body.len(), "dir_saved");
        Ok(())
    }

    /// Unlink the overlay file for `inode`. Missing files are fine: a
    /// concurrent remove or a never-materialized inode is not an error.
    pub fn remove(&self, inode: u64) -> Result<()> {
        match fs::remove_file(self.file_path(inode)) {
            Ok(()) => {
                self.metrics.files_removed.fetch_add(1, Ordering::Relaxed);
                debug!(inode, "entry_removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Create the overlay file for a newly materialized file inode and
    /// return a read/write handle positioned just past the header. The
    /// caller owns the handle and the body bytes from here on.
    pub fn create_file(&self, inode: u64) -> Result<File> {
        let path = self.file_path(inode);
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::Exists(path).into());
            }
            Err(err) => return Err(err.into()),
        };

        let head = header::encode_header(
            EntryKind::File,
            HEADER_VERSION,
            Timespec::default(),
            Timespec::default(),
            Timespec::default(),
        );
        if let Err(err) = file.write_all(&head) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }

        self.metrics.files_created.fetch_add(1, Ordering::Relaxed);
        debug!(inode, "file_created");
        Ok(file)
    }

    /// Open an existing overlay file, validate its header, and return the
    /// handle positioned just past it.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<File> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut head = [0u8; HEADER_LEN];
        if let Err(err) = file.read_exact(&mut head) {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Err(Error::CorruptHeader {
                    reason: format!("{} is too short for the entry header", path.display()),
                }
                .into());
            }
            return Err(err.into());
        }
        header::decode_header(&head, EntryKind::File)?;

        self.metrics.files_opened.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "file_opened");
        Ok(file)
    }

    /// Largest inode number ever allocated in this overlay, so the inode
    /// allocator can resume past it on mount.
    ///
    /// Walks the materialized directory tree from the root, then sweeps the
    /// shard subdirectories for files the walk cannot reach (inodes that were
    /// unlinked while still open). Missing directory files prune their
    /// subtree; corrupt ones fail the scan.
    pub fn max_recorded_inode(&self) -> Result<u64> {
        let start = Instant::now();
        let mut max = ROOT_INODE;

        let mut pending = vec![ROOT_INODE];
        while let Some(dir_inode) = pending.pop() {
            let dir = match self.load_dir(dir_inode)? {
                Some(dir) => dir,
                None => continue,
            };
            for entry in dir.entries.values() {
                let Some(inode) = entry.inode() else { continue };
                max = max.max(inode);
                if entry.is_dir() {
                    pending.push(inode);
                }
            }
        }

        for shard_entry in WalkDir::new(&self.local_dir).min_depth(2).max_depth(2) {
            let shard_entry = shard_entry.map_err(io::Error::from)?;
            let parsed = shard_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok());
            if let Some(inode) = parsed {
                max = max.max(inode);
            }
        }

        self.metrics.scans.fetch_add(1, Ordering::Relaxed);
        info!(
            max_inode = max,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "overlay_scan_done"
        );
        Ok(max)
    }

    pub fn metrics(&self) -> OverlayMetrics {
        self.metrics.snapshot()
    }

    fn shard_dir(&self, inode: u64) -> PathBuf {
        // Low byte, high nibble first. Allocation is monotonic, so the low
        // byte varies fastest and spreads entries across all 256 shards.
        self.local_dir.join(format!("{:02x}", inode & 0xff))
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        if let Err(err) = self.info_file.unlock() {
            warn!(local_dir = %self.local_dir.display(), %err, "failed to release overlay lock");
        }
    }
}

fn validate_info(file: &mut File, path: &Path) -> Result<()> {
    let mut buf = [0u8; INFO_LEN];
    if let Err(err) = file.read_exact(&mut buf) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::CorruptInfo(path.to_path_buf()).into());
        }
        return Err(err.into());
    }

    if buf[..INFO_MAGIC.len()] != INFO_MAGIC {
        return Err(Error::CorruptInfo(path.to_path_buf()).into());
    }
    let version = u32::from_be_bytes(buf[INFO_MAGIC.len()..].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        }
        .into());
    }
    Ok(())
}

fn init_overlay_root(local_dir: &Path) -> Result<()> {
    fs::create_dir_all(local_dir)?;
    for n in 0..256u32 {
        fs::create_dir_all(local_dir.join(format!("{n:02x}")))?;
    }

    let mut info = [0u8; INFO_LEN];
    info[..INFO_MAGIC.len()].copy_from_slice(&INFO_MAGIC);
    info[INFO_MAGIC.len()..].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    write_atomic(local_dir, &local_dir.join(INFO_FILE), &info)?;

    info!(local_dir = %local_dir.display(), "overlay_initialized");
    Ok(())
}

/// Whole-file replace via temp file + rename in the destination directory,
/// so readers observe either the prior contents or the new ones.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
