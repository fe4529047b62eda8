use std::path::PathBuf;

use thiserror::Error;

pub mod logging;
pub mod overlay;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("obsolete overlay layout (legacy tree directory) at {0}")]
    LegacyFormat(PathBuf),
    #[error("bad magic in overlay info file {0}")]
    CorruptInfo(PathBuf),
    #[error("unsupported overlay format version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("corrupt overlay entry header: {reason}")]
    CorruptHeader { reason: String },
    #[error("unexpected overlay header identifier: expected {expected}, got {actual}")]
    WrongKind { expected: String, actual: String },
    #[error("corrupt overlay directory: {reason}")]
    CorruptDir { reason: String },
    #[error("overlay already open: {0}")]
    AlreadyOpen(PathBuf),
    #[error("overlay file already exists: {0}")]
    Exists(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
