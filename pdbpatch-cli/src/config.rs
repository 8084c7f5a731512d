//! Run configuration
//!
//! Built once from the command line and passed by reference to every stage.

use std::path::PathBuf;

use clap::ValueEnum;
use serde::Serialize;

use pdbpatch_core::{MappingPolicy, WriteOptions};

/// Where the encoder writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Encode straight onto the medium; few workers to keep its I/O queue short
    OnDevice,
    /// Encode to local storage, then copy onto the medium
    CacheFirst,
}

impl Strategy {
    pub fn default_workers(&self) -> usize {
        match self {
            Strategy::OnDevice => 2,
            Strategy::CacheFirst => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Which pipeline stages run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stages {
    Full,
    /// Skip conversion; the rename map comes from files already converted
    PatchOnly,
    ConvertOnly,
}

impl Stages {
    pub fn from_flags(patch_only: bool, convert_only: bool) -> Self {
        match (patch_only, convert_only) {
            (true, _) => Stages::PatchOnly,
            (false, true) => Stages::ConvertOnly,
            (false, false) => Stages::Full,
        }
    }

    pub fn converts(&self) -> bool {
        !matches!(self, Stages::PatchOnly)
    }

    pub fn patches(&self) -> bool {
        !matches!(self, Stages::ConvertOnly)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the export medium
    pub root: PathBuf,
    /// Validated source -> target mappings
    pub policy: MappingPolicy,
    pub stages: Stages,
    /// Keep source files after conversion
    pub keep_originals: bool,
    pub strategy: Strategy,
    /// Max concurrent encoder processes
    pub workers: usize,
    /// Local staging directory for cache-first conversion
    pub cache_dir: Option<PathBuf>,
    pub write: WriteOptions,
}
