//! Export medium layout
//!
//! - PIONEER/rekordbox/export.pdb (primary database)
//! - PIONEER/rekordbox/exportExt.pdb (extended database, optional)
//! - PIONEER/USBANLZ/Pxxx/[hex]/ANLZ0000.{DAT,EXT,2EX}
//! - Contents/[audio files]

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::format::FileType;

/// Directory casings seen on real exports
const REKORDBOX_DIRS: [&str; 3] = ["rekordbox", "Rekordbox", "REKORDBOX"];

const PRIMARY_DB: &str = "export.pdb";
const EXTENDED_DB: &str = "exportExt.pdb";

const ANLZ_EXTENSIONS: [&str; 3] = ["dat", "ext", "2ex"];

#[derive(Debug, Clone)]
pub struct ExportLayout {
    pub root: PathBuf,
    pub contents_dir: PathBuf,
    pub rekordbox_dir: Option<PathBuf>,
    pub anlz_dir: PathBuf,
}

impl ExportLayout {
    /// Locate the export structure under `root`
    pub fn discover(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::RootNotFound(root.to_path_buf()));
        }
        // Unreadable roots fail here rather than half way through a run
        std::fs::read_dir(root).map_err(|_| Error::RootNotFound(root.to_path_buf()))?;

        let pioneer_dir = root.join("PIONEER");
        let rekordbox_dir = REKORDBOX_DIRS
            .iter()
            .map(|name| pioneer_dir.join(name))
            .find(|dir| dir.join(PRIMARY_DB).is_file());

        let layout = Self {
            root: root.to_path_buf(),
            contents_dir: root.join("Contents"),
            rekordbox_dir,
            anlz_dir: pioneer_dir.join("USBANLZ"),
        };
        debug!("Export layout: {:?}", layout);
        Ok(layout)
    }

    pub fn primary_database(&self) -> Option<PathBuf> {
        self.rekordbox_dir
            .as_ref()
            .map(|dir| dir.join(PRIMARY_DB))
            .filter(|p| p.is_file())
    }

    /// Primary database followed by the extended one if present; fails if
    /// there is no primary database
    pub fn database_files(&self) -> Result<Vec<PathBuf>> {
        let primary = self
            .primary_database()
            .ok_or_else(|| Error::DatabaseNotFound(self.root.join("PIONEER")))?;

        let mut files = vec![primary];
        if let Some(dir) = &self.rekordbox_dir {
            let extended = dir.join(EXTENDED_DB);
            if extended.is_file() {
                files.push(extended);
            }
        }
        Ok(files)
    }

    /// Every ANLZ*.DAT/.EXT/.2EX file under USBANLZ
    pub fn analysis_files(&self) -> Vec<PathBuf> {
        walk_files(&self.anlz_dir)
            .filter(|path| {
                let stem_ok = file_name(path)
                    .map(|n| n.to_ascii_uppercase().starts_with("ANLZ"))
                    .unwrap_or(false);
                let ext_ok = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| ANLZ_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                stem_ok && ext_ok
            })
            .collect()
    }

    /// Audio files of one format under Contents
    pub fn audio_files(&self, file_type: FileType) -> Vec<PathBuf> {
        walk_files(&self.contents_dir)
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .and_then(FileType::from_extension)
                    == Some(file_type)
            })
            .collect()
    }

    /// Export-relative path with forward slashes, as stored in the database
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Regular files below `dir`, skipping AppleDouble (`._*`) companions
fn walk_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !file_name(p).map(|n| n.starts_with("._")).unwrap_or(true))
        .collect();
    files.sort();
    files.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_missing_root() {
        let err = ExportLayout::discover(Path::new("/nonexistent/usb")).unwrap_err();
        assert!(matches!(err, Error::RootNotFound(_)));
    }

    #[test]
    fn test_discover_layout() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("PIONEER/REKORDBOX/export.pdb"));
        touch(&root.join("PIONEER/REKORDBOX/exportExt.pdb"));
        touch(&root.join("PIONEER/USBANLZ/P016/0000875E/ANLZ0000.DAT"));
        touch(&root.join("PIONEER/USBANLZ/P016/0000875E/ANLZ0000.2EX"));
        touch(&root.join("PIONEER/USBANLZ/P016/0000875E/._ANLZ0000.EXT"));
        touch(&root.join("PIONEER/USBANLZ/P016/0000875E/notes.txt"));
        touch(&root.join("Contents/Artist/01 Track.flac"));
        touch(&root.join("Contents/Artist/._01 Track.flac"));
        touch(&root.join("Contents/Artist/02 Track.mp3"));

        let layout = ExportLayout::discover(root).unwrap();

        let dbs = layout.database_files().unwrap();
        assert_eq!(dbs.len(), 2);
        assert!(dbs[0].ends_with("export.pdb"));
        assert_eq!(layout.analysis_files().len(), 2);

        let flacs = layout.audio_files(FileType::Flac);
        assert_eq!(flacs.len(), 1);
        assert_eq!(
            layout.relative(&flacs[0]).unwrap(),
            "Contents/Artist/01 Track.flac"
        );
    }

    #[test]
    fn test_missing_database() {
        let tmp = TempDir::new().unwrap();
        let layout = ExportLayout::discover(tmp.path()).unwrap();
        assert!(layout.primary_database().is_none());
        assert!(matches!(
            layout.database_files(),
            Err(Error::DatabaseNotFound(_))
        ));
        assert!(layout.analysis_files().is_empty());
    }
}
