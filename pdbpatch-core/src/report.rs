//! Per-file patch reports and stage summaries

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Patched,
    /// Nothing to patch (already patched, or not a converted track)
    Skipped,
    Failed,
}

/// xxh3 digests of a file before and after patching
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digests {
    pub before: String,
    pub after: String,
}

impl Digests {
    pub fn new(before: u64, after: u64) -> Self {
        Self {
            before: format!("{:016x}", before),
            after: format!("{:016x}", after),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub status: FileStatus,
    /// Byte substitutions applied (extensions + identifiers)
    pub replacements: usize,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digests: Option<Digests>,
}

impl FileReport {
    pub fn patched(path: &Path, replacements: usize, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            status: FileStatus::Patched,
            replacements,
            detail: detail.into(),
            digests: None,
        }
    }

    pub fn skipped(path: &Path, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            status: FileStatus::Skipped,
            replacements: 0,
            detail: detail.into(),
            digests: None,
        }
    }

    pub fn failed(path: &Path, error: &Error) -> Self {
        Self {
            path: path.to_path_buf(),
            status: FileStatus::Failed,
            replacements: 0,
            detail: error.to_string(),
            digests: None,
        }
    }

    pub fn with_digests(mut self, digests: Digests) -> Self {
        self.digests = Some(digests);
        self
    }
}

/// Counts for one pipeline stage
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageSummary {
    pub patched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub files: Vec<FileReport>,
}

impl StageSummary {
    pub fn record(&mut self, report: FileReport) {
        match report.status {
            FileStatus::Patched => self.patched += 1,
            FileStatus::Skipped => self.skipped += 1,
            FileStatus::Failed => self.failed += 1,
        }
        self.files.push(report);
    }

    pub fn total(&self) -> usize {
        self.patched + self.skipped + self.failed
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.status == FileStatus::Failed)
    }
}
