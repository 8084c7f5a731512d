//! Error types for pdbpatch-core

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Binary format error: {0}")]
    BinRw(String),

    #[error("Unsupported mapping {source_ext} -> {target_ext}: {reason}")]
    UnsupportedMapping {
        source_ext: String,
        target_ext: String,
        reason: String,
    },

    #[error("Export root not found: {0:?}")]
    RootNotFound(PathBuf),

    #[error("Database not found under {0:?}")]
    DatabaseNotFound(PathBuf),

    #[error("Invalid rename {old} -> {new}: {reason}")]
    InvalidRename {
        old: String,
        new: String,
        reason: String,
    },

    #[error("Failed to write {path:?}: {source}")]
    PatchWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Structural inconsistency at offset {offset:#x}: {reason}")]
    StructuralInconsistency { offset: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}
