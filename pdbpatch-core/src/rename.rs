//! Rename map shared between the conversion stage and the patchers
//!
//! Keys are export-relative paths with forward slashes and no leading slash
//! (`Contents/Artist/01 Track.flac`). Entries only ever change the extension,
//! and the old and new extension always have the same byte length.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::{Error, Result};

/// One converted track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameEntry {
    pub old: String,
    pub new: String,
}

impl RenameEntry {
    pub fn old_basename(&self) -> &str {
        basename(&self.old)
    }

    pub fn new_basename(&self) -> &str {
        basename(&self.new)
    }

    /// Extension of the new path, without the dot
    pub fn new_extension(&self) -> &str {
        split_extension(&self.new).map(|(_, ext)| ext).unwrap_or("")
    }

    /// Extension of the old path, without the dot
    pub fn old_extension(&self) -> &str {
        split_extension(&self.old).map(|(_, ext)| ext).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenameMap {
    entries: BTreeMap<String, RenameEntry>,
    by_basename: HashMap<String, Vec<String>>,
    held_back: BTreeSet<String>,
    held_back_basenames: HashSet<String>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conversion; rejects anything other than an equal-length
    /// extension swap
    pub fn insert(&mut self, old: &str, new: &str) -> Result<()> {
        let old = normalize(old);
        let new = normalize(new);
        let invalid = |reason: &str| Error::InvalidRename {
            old: old.clone(),
            new: new.clone(),
            reason: reason.to_string(),
        };

        let (old_stem, old_ext) = split_extension(&old).ok_or_else(|| invalid("old path has no extension"))?;
        let (new_stem, new_ext) = split_extension(&new).ok_or_else(|| invalid("new path has no extension"))?;

        if old_stem != new_stem {
            return Err(invalid("only the extension may change"));
        }
        if !old_ext.is_ascii() || !new_ext.is_ascii() {
            return Err(invalid("extensions must be ASCII"));
        }
        if old_ext.len() != new_ext.len() {
            return Err(invalid("extensions differ in length"));
        }
        if old_ext == new_ext {
            return Err(invalid("extension unchanged"));
        }

        if let Some(existing) = self.entries.get(&old) {
            if existing.new == new {
                return Ok(());
            }
            return Err(invalid("path already renamed to a different target"));
        }

        self.by_basename
            .entry(basename(&old).to_string())
            .or_default()
            .push(old.clone());
        self.entries.insert(old.clone(), RenameEntry { old, new });
        Ok(())
    }

    /// Record a path that was not converted (e.g. encoder failure). Bare
    /// filename references sharing its name are never patched.
    pub fn hold_back(&mut self, path: &str) {
        let path = normalize(path);
        if self.held_back.insert(path.clone()) {
            self.held_back_basenames.insert(basename(&path).to_string());
        }
    }

    pub fn get(&self, old: &str) -> Option<&RenameEntry> {
        self.entries.get(&normalize(old))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenameEntry> {
        self.entries.values()
    }

    pub fn held_back(&self) -> impl Iterator<Item = &str> {
        self.held_back.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct old extensions (as written in the paths, without the dot)
    pub fn source_extensions(&self) -> BTreeSet<&str> {
        self.entries.values().map(RenameEntry::old_extension).collect()
    }

    /// Resolve a path or filename found inside a database or analysis file.
    ///
    /// Full paths must match an entry exactly (after normalization) or end
    /// with `/<entry path>`. A bare filename resolves only when every entry
    /// with that filename renames it the same way and no held-back path
    /// shares it.
    pub fn resolve(&self, text: &str) -> Option<&RenameEntry> {
        let norm = normalize(text);
        if let Some(entry) = self.entries.get(&norm) {
            return Some(entry);
        }

        let candidates = self.by_basename.get(basename(&norm))?;

        if norm.contains('/') {
            return candidates
                .iter()
                .filter_map(|key| self.entries.get(key))
                .find(|entry| {
                    norm.len() > entry.old.len()
                        && norm.ends_with(entry.old.as_str())
                        && norm.as_bytes()[norm.len() - entry.old.len() - 1] == b'/'
                });
        }

        if self.held_back_basenames.contains(norm.as_str()) {
            return None;
        }
        let first = self.entries.get(candidates.first()?)?;
        candidates
            .iter()
            .filter_map(|key| self.entries.get(key))
            .all(|entry| entry.new_basename() == first.new_basename())
            .then_some(first)
    }
}

/// Forward slashes, no leading slash
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Split `dir/name.ext` into (`dir/name`, `ext`); the dot must be in the
/// final component and not lead it
fn split_extension(path: &str) -> Option<(&str, &str)> {
    let (stem, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') || stem.is_empty() || stem.ends_with('/') {
        return None;
    }
    Some((stem, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RenameMap {
        let mut map = RenameMap::new();
        map.insert("Contents/Artist/01 Track.flac", "Contents/Artist/01 Track.aiff")
            .unwrap();
        map.insert("/Contents/Other/02 Tune.m4a", "/Contents/Other/02 Tune.mp3")
            .unwrap();
        map
    }

    #[test]
    fn test_insert_rejects_non_extension_changes() {
        let mut map = RenameMap::new();
        assert!(map.insert("a/x.flac", "a/y.aiff").is_err());
        assert!(map.insert("a/x.flac", "a/x.mp3").is_err());
        assert!(map.insert("a/x.flac", "a/x.flac").is_err());
        assert!(map.insert("a/x", "a/x.aiff").is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut map = sample();
        map.insert("Contents/Artist/01 Track.flac", "Contents/Artist/01 Track.aiff")
            .unwrap();
        assert_eq!(map.len(), 2);
        assert!(map
            .insert("Contents/Artist/01 Track.flac", "Contents/Artist/01 Track.wave")
            .is_err());
    }

    #[test]
    fn test_resolve_full_paths() {
        let map = sample();
        let entry = map.resolve("/Contents/Artist/01 Track.flac").unwrap();
        assert_eq!(entry.new, "Contents/Artist/01 Track.aiff");
        assert_eq!(entry.new_extension(), "aiff");

        // Suffix match needs a directory boundary
        assert!(map.resolve("/Volumes/USB/Contents/Artist/01 Track.flac").is_some());
        assert!(map.resolve("/XContents/Artist/01 Track.flac").is_none());
        assert!(map.resolve("/Contents/Elsewhere/01 Track.flac").is_none());
    }

    #[test]
    fn test_resolve_bare_filename() {
        let mut map = sample();
        assert_eq!(
            map.resolve("02 Tune.m4a").map(|e| e.new_basename()),
            Some("02 Tune.mp3")
        );

        map.hold_back("Contents/Failed/02 Tune.m4a");
        assert!(map.resolve("02 Tune.m4a").is_none());
        // Full paths are still unambiguous
        assert!(map.resolve("/Contents/Other/02 Tune.m4a").is_some());
    }

    #[test]
    fn test_source_extensions() {
        let map = sample();
        let exts: Vec<_> = map.source_extensions().into_iter().collect();
        assert_eq!(exts, vec!["flac", "m4a"]);
    }
}
