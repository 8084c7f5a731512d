//! Atomic write-back
//!
//! Patched buffers are written to a temporary file in the target's own
//! directory and renamed over the original. If anything fails before the
//! rename, the temporary file is dropped and the original is untouched.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};

use crate::error::{Error, Result};

/// How patched files are written back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Keep a one-time `<name>.backup` copy of database files
    pub backup: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { backup: true }
    }
}

/// Replace `path` with `data` via temporary file + rename
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let wrap = |source: io::Error| Error::PatchWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = temp_beside(path).map_err(wrap)?;

    tmp.write_all(data).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;

    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(wrap)?;
    }

    tmp.persist(path).map_err(|e| wrap(e.error))?;
    Ok(())
}

/// Path of the backup copy kept next to `path`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}

/// Copy `path` to its backup location unless a backup already exists.
///
/// An existing backup is kept: it holds the pre-patch original from the
/// first run. The copy is staged in a temporary file, so an interrupted copy
/// never leaves a partial backup under the final name.
pub fn backup_once(path: &Path) -> Result<Option<PathBuf>> {
    let backup = backup_path(path);
    if backup.exists() {
        return Ok(None);
    }
    let wrap = |source: io::Error| Error::PatchWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut original = File::open(path)?;
    let mut tmp = temp_beside(path).map_err(wrap)?;
    io::copy(&mut original, &mut tmp).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;

    match tmp.persist_noclobber(&backup) {
        Ok(_) => Ok(Some(backup)),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(wrap(e.error)),
    }
}

/// Temporary file in the same directory as `path`, so the final rename
/// never crosses a filesystem
fn temp_beside(path: &Path) -> io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Builder::new()
        .prefix(".pdbpatch-")
        .suffix(".tmp")
        .tempfile_in(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.pdb");
        fs::write(&path, b"old content").unwrap();

        write_atomic(&path, b"new content").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new content");
        // Only the target remains, no stray temporary files
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_failure_reports_patch_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing-dir").join("export.pdb");

        let err = write_atomic(&path, b"data").unwrap_err();
        assert!(matches!(err, Error::PatchWrite { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_backup_once_keeps_first_original() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.pdb");
        fs::write(&path, b"pristine").unwrap();

        let backup = backup_once(&path).unwrap().unwrap();
        assert_eq!(backup, tmp.path().join("export.pdb.backup"));

        fs::write(&path, b"patched").unwrap();
        assert!(backup_once(&path).unwrap().is_none());
        assert_eq!(fs::read(&backup).unwrap(), b"pristine");
    }

    #[test]
    fn test_leftover_temp_file_is_not_a_backup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.pdb");
        fs::write(&path, b"pristine").unwrap();
        // A copy cut short by an earlier crash
        fs::write(tmp.path().join(".pdbpatch-crashed.tmp"), b"pri").unwrap();

        let backup = backup_once(&path).unwrap().unwrap();
        assert_eq!(fs::read(&backup).unwrap(), b"pristine");

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".pdbpatch-") && n != ".pdbpatch-crashed.tmp")
            .collect();
        assert!(names.is_empty());
    }

    #[test]
    fn test_backup_of_missing_file_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.pdb");

        assert!(backup_once(&path).is_err());
        assert!(!backup_path(&path).exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
