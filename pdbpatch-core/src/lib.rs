//! pdbpatch-core: in-place patching of Pioneer exports after transcoding
//!
//! This crate rewrites, without changing any file length:
//! - export.pdb / exportExt.pdb (DeviceSQL database) - little-endian
//! - ANLZ files (.DAT, .EXT, .2EX) - big-endian
//!
//! so that tracks converted to another format keep their cues, beat grids
//! and playlists. Based on Deep Symmetry's reverse engineering.

pub mod anlz;
pub mod devicesql;
pub mod error;
pub mod format;
pub mod layout;
pub mod mapping;
pub mod pdb;
pub mod rename;
pub mod report;
pub mod writeback;

pub use anlz::{patch_analysis, patch_analysis_file, patch_analysis_files};
pub use error::{Error, Result};
pub use format::FileType;
pub use layout::ExportLayout;
pub use mapping::{ExtensionMapping, MappingPolicy};
pub use pdb::{patch_databases, PdbPatchStats, PdbPatcher};
pub use rename::{RenameEntry, RenameMap};
pub use report::{FileReport, FileStatus, StageSummary};
pub use writeback::WriteOptions;
