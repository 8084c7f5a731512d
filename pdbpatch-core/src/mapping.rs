//! Extension mapping policy
//!
//! Every patch this crate performs is length-preserving only because each
//! source/target pair is validated here, once, before any file is opened.
//! A pair whose encoded forms differ in length rejects the whole policy.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::format::FileType;

/// One source -> target format substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtensionMapping {
    pub source: FileType,
    pub target: FileType,
}

impl ExtensionMapping {
    /// Validate a single pair
    pub fn new(source: FileType, target: FileType) -> Result<Self> {
        let unsupported = |reason: String| Error::UnsupportedMapping {
            source_ext: source.extension().to_string(),
            target_ext: target.extension().to_string(),
            reason,
        };

        if source == target {
            return Err(unsupported("source and target are the same format".into()));
        }

        let (src, dst) = (source.extension(), target.extension());
        if !src.is_ascii() || !dst.is_ascii() {
            return Err(unsupported("extensions must be ASCII".into()));
        }
        if src.len() != dst.len() {
            return Err(unsupported(format!(
                "encoded lengths differ ({} vs {} bytes), patching would shift database offsets",
                src.len(),
                dst.len()
            )));
        }
        // UTF-16 forms (database wide strings, ANLZ paths) follow from ASCII,
        // but the invariant is what the patchers rely on so check it directly.
        if utf16_len(src) != utf16_len(dst) {
            return Err(unsupported("UTF-16 encoded lengths differ".into()));
        }

        Ok(Self { source, target })
    }

    /// Parse `src=dst` (e.g. `flac=aiff`)
    pub fn parse(pair: &str) -> Result<Self> {
        let (src, dst) = pair.split_once('=').ok_or_else(|| Error::UnsupportedMapping {
            source_ext: pair.to_string(),
            target_ext: String::new(),
            reason: "expected SOURCE=TARGET".into(),
        })?;
        let lookup = |ext: &str| {
            FileType::from_extension(ext.trim()).ok_or_else(|| Error::UnsupportedMapping {
                source_ext: src.trim().to_string(),
                target_ext: dst.trim().to_string(),
                reason: format!("unknown audio format '{}'", ext.trim()),
            })
        };
        Self::new(lookup(src)?, lookup(dst)?)
    }

    /// Dotted source extension, e.g. `.flac`
    pub fn dotted_source(&self) -> String {
        format!(".{}", self.source.extension())
    }

    /// Dotted target extension, e.g. `.aiff`
    pub fn dotted_target(&self) -> String {
        format!(".{}", self.target.extension())
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// The validated set of mappings for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingPolicy {
    mappings: Vec<ExtensionMapping>,
}

impl MappingPolicy {
    /// Build from `src=dst` pairs; fails on the first invalid pair
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mappings = pairs
            .into_iter()
            .map(|p| ExtensionMapping::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(mappings)
    }

    pub fn new(mappings: Vec<ExtensionMapping>) -> Result<Self> {
        if mappings.is_empty() {
            return Err(Error::UnsupportedMapping {
                source_ext: String::new(),
                target_ext: String::new(),
                reason: "no mappings configured".into(),
            });
        }

        for (i, m) in mappings.iter().enumerate() {
            // Re-validate; a hand-built ExtensionMapping bypasses new()
            ExtensionMapping::new(m.source, m.target)?;

            if mappings[..i].iter().any(|prev| prev.source == m.source) {
                return Err(Error::UnsupportedMapping {
                    source_ext: m.source.extension().to_string(),
                    target_ext: m.target.extension().to_string(),
                    reason: "source format mapped more than once".into(),
                });
            }
        }

        Ok(Self { mappings })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionMapping> {
        self.mappings.iter()
    }

    pub fn for_source(&self, source: FileType) -> Option<&ExtensionMapping> {
        self.mappings.iter().find(|m| m.source == source)
    }

    /// Mapping whose source extension matches `ext` (no dot, any case)
    pub fn for_source_extension(&self, ext: &str) -> Option<&ExtensionMapping> {
        FileType::from_extension(ext).and_then(|ft| self.for_source(ft))
    }

    pub fn for_target(&self, target: FileType) -> impl Iterator<Item = &ExtensionMapping> {
        self.mappings.iter().filter(move |m| m.target == target)
    }
}

impl Default for MappingPolicy {
    fn default() -> Self {
        Self {
            mappings: vec![ExtensionMapping {
                source: FileType::Flac,
                target: FileType::Aiff,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_length_pairs_accepted() {
        let policy = MappingPolicy::from_pairs(["flac=aiff", "m4a=mp3"]).unwrap();
        assert_eq!(policy.iter().count(), 2);
        assert_eq!(
            policy.for_source(FileType::M4a).map(|m| m.target),
            Some(FileType::Mp3)
        );
    }

    #[test]
    fn test_length_mismatch_rejects_policy() {
        let err = MappingPolicy::from_pairs(["m4a=mp3", "flac=mp3"]).unwrap_err();
        match err {
            Error::UnsupportedMapping { source_ext, target_ext, .. } => {
                assert_eq!(source_ext, "flac");
                assert_eq!(target_ext, "mp3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_and_degenerate_pairs() {
        assert!(ExtensionMapping::parse("flac=opus").is_err());
        assert!(ExtensionMapping::parse("flac").is_err());
        assert!(ExtensionMapping::parse("flac=FLAC").is_err());
        assert!(MappingPolicy::from_pairs(["flac=aiff", "flac=aiff"]).is_err());
        assert!(MappingPolicy::from_pairs(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = MappingPolicy::default();
        let rebuilt = MappingPolicy::new(policy.iter().copied().collect()).unwrap();
        assert_eq!(rebuilt, policy);
        assert_eq!(policy.for_source_extension("FLAC").unwrap().dotted_target(), ".aiff");
    }
}
