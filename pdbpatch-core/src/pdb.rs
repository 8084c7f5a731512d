//! export.pdb / exportExt.pdb patching
//!
//! The database is treated as an opaque, fixed-length byte buffer. Track
//! references are found by pattern: a dotted source extension that either
//! ends a DeviceSQL string frame or is followed by a terminator byte, whose
//! enclosing path resolves in the rename map. Each reference's row carries
//! a format-type identifier behind a fixed marker:
//!
//! ```text
//! 29 00 | color rating | id_lo id_hi | 03 00
//! ```
//!
//! Only references that were replaced get their identifier rewritten, so a
//! row is never relabelled without its path changing and vice versa.
//!
//! Native rows written for the target format carry an extra marker byte
//! that identifier-patched rows lack. The player then shows a mismatched
//! format label; playback and analysis are unaffected. Fixing that needs
//! byte insertion and is out of reach for a length-preserving patcher.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::devicesql::{frames_ending_at, MAX_FRAME_BODY};
use crate::error::Result;
use crate::format::FileType;
use crate::rename::{normalize, RenameEntry, RenameMap};
use crate::report::{Digests, FileReport, StageSummary};
use crate::writeback::{backup_once, write_atomic, WriteOptions};

/// Page size in bytes (always 4096 for Pioneer databases). Rows never
/// straddle pages, so identifier lookups stay inside the reference's page.
pub const PAGE_SIZE: usize = 4096;

/// Fixed bytes before and after the identifier pair
const MARKER_LEAD: [u8; 2] = [0x29, 0x00];
const MARKER_TRAIL: [u8; 2] = [0x03, 0x00];
const IDENTIFIER_OFFSET: usize = 4;
const MARKER_LEN: usize = 8;

/// Counters for one patch pass over a database buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PdbPatchStats {
    /// Source-extension occurrences, anchored or not
    pub occurrences: usize,
    pub references_patched: usize,
    /// Anchored occurrences that do not belong to a converted track
    pub unresolved: usize,
    pub identifiers_patched: usize,
    pub identifiers_already_target: usize,
    /// Patched references with no identifier marker in their page
    pub identifiers_missing: usize,
    /// Identifier present but neither the source nor target code
    pub identifiers_unexpected: usize,
}

impl PdbPatchStats {
    pub fn changed(&self) -> bool {
        self.replacements() > 0
    }

    pub fn replacements(&self) -> usize {
        self.references_patched + self.identifiers_patched
    }
}

/// An anchored occurrence of a source extension
struct Occurrence {
    end: usize,
    wide: bool,
    /// Identifier marker of the row the occurrence sits in
    marker: Option<usize>,
    /// Start offset and text of every string ending at `end`, preferred first
    strings: Vec<(usize, String)>,
}

/// A resolved occurrence: where its string starts, where the extension
/// ends, and which conversion it belongs to
struct TrackReference<'m> {
    start: usize,
    end: usize,
    wide: bool,
    marker: Option<usize>,
    entry: &'m RenameEntry,
}

/// Patches database buffers against one rename map
pub struct PdbPatcher<'m> {
    renames: &'m RenameMap,
}

impl<'m> PdbPatcher<'m> {
    pub fn new(renames: &'m RenameMap) -> Self {
        Self { renames }
    }

    /// Patch a database buffer in place.
    ///
    /// Takes a slice, so the buffer length cannot change.
    pub fn patch(&self, buf: &mut [u8]) -> PdbPatchStats {
        let mut stats = PdbPatchStats::default();
        let mut claimed_markers = HashSet::new();

        let extensions: BTreeSet<String> = self
            .renames
            .source_extensions()
            .into_iter()
            .map(str::to_ascii_lowercase)
            .collect();

        for ext in extensions {
            let dotted = format!(".{}", ext);

            let mut occurrences = Vec::new();
            for wide in [false, true] {
                let needle_len = dotted.len() * if wide { 2 } else { 1 };
                for end in find_extension(buf, dotted.as_bytes(), wide) {
                    stats.occurrences += 1;
                    let strings = anchored_strings(buf, end, wide);
                    if strings.is_empty() {
                        stats.unresolved += 1;
                        debug!("Unanchored {} at {:#x}, leaving untouched", dotted, end);
                        continue;
                    }
                    occurrences.push(Occurrence {
                        end,
                        wide,
                        marker: find_marker(buf, end - needle_len),
                        strings,
                    });
                }
            }

            for reference in self.resolve_rows(&occurrences, &mut stats) {
                replace_extension(buf, &reference);
                stats.references_patched += 1;
                debug!(
                    "Patched reference at {:#x}: {} -> {}",
                    reference.start, reference.entry.old, reference.entry.new
                );
                self.patch_identifier(buf, &reference, &mut claimed_markers, &mut stats);
            }
        }

        stats
    }

    /// Read, patch and atomically write back one database file
    pub fn patch_file(&self, path: &Path, options: &WriteOptions) -> Result<FileReport> {
        let mut data = fs::read(path)?;
        let before = xxh3_64(&data);

        let stats = self.patch(&mut data);
        if !stats.changed() {
            info!(
                "{:?}: nothing to patch ({} occurrences, {} unresolved)",
                path, stats.occurrences, stats.unresolved
            );
            return Ok(FileReport::skipped(path, "no references to converted tracks"));
        }

        if options.backup {
            if let Some(backup) = backup_once(path)? {
                info!("Created backup: {:?}", backup);
            }
        }
        write_atomic(path, &data)?;

        let after = xxh3_64(&data);
        info!(
            "Patched {:?}: {} references, {} identifiers ({} bytes unchanged in length)",
            path,
            stats.references_patched,
            stats.identifiers_patched,
            data.len()
        );
        if stats.identifiers_missing + stats.identifiers_unexpected > 0 {
            warn!(
                "{:?}: {} references without a recognised format identifier",
                path,
                stats.identifiers_missing + stats.identifiers_unexpected
            );
        }

        let detail = format!(
            "{} references, {} identifiers, {} unresolved",
            stats.references_patched, stats.identifiers_patched, stats.unresolved
        );
        Ok(FileReport::patched(path, stats.replacements(), detail)
            .with_digests(Digests::new(before, after)))
    }

    /// Resolve occurrences row by row.
    ///
    /// Full paths resolve on their own. A bare filename resolves through the
    /// path of its own row, or through the rename map when the row has no
    /// path. A row is patched only when every occurrence in it resolves to
    /// the same track, so its strings and identifier always change together.
    fn resolve_rows(
        &self,
        occurrences: &[Occurrence],
        stats: &mut PdbPatchStats,
    ) -> Vec<TrackReference<'m>> {
        let mut resolved: Vec<Option<(usize, &'m RenameEntry)>> = occurrences
            .iter()
            .map(|occ| {
                occ.strings.iter().find_map(|(start, text)| {
                    if !text.contains(['/', '\\']) {
                        return None;
                    }
                    self.renames.resolve(text).map(|entry| (*start, entry))
                })
            })
            .collect();

        let mut rows: HashMap<usize, &'m RenameEntry> = HashMap::new();
        for (occ, hit) in occurrences.iter().zip(&resolved) {
            if let (Some(marker), Some((_, entry))) = (occ.marker, hit) {
                rows.entry(marker).or_insert(*entry);
            }
        }

        for (occ, hit) in occurrences.iter().zip(resolved.iter_mut()) {
            if hit.is_some() {
                continue;
            }
            let row = occ.marker.and_then(|marker| rows.get(&marker).copied());
            *hit = occ.strings.iter().find_map(|(start, text)| {
                let entry = match row {
                    Some(entry) => (normalize(text) == entry.old_basename()).then_some(entry),
                    None => self.renames.resolve(text),
                };
                entry.map(|entry| (*start, entry))
            });
        }

        let mut blocked = HashSet::new();
        for (occ, hit) in occurrences.iter().zip(&resolved) {
            let Some(marker) = occ.marker else {
                continue;
            };
            let consistent = match (hit, rows.get(&marker)) {
                (None, _) => false,
                (Some((_, entry)), Some(row)) => entry.old == row.old,
                (Some(_), None) => true,
            };
            if !consistent && blocked.insert(marker) && rows.contains_key(&marker) {
                warn!(
                    "Row at {:#x} left unpatched: its references do not all resolve to one converted track",
                    marker
                );
            }
        }

        let mut references = Vec::new();
        for (occ, hit) in occurrences.iter().zip(resolved) {
            let in_blocked_row = occ.marker.is_some_and(|m| blocked.contains(&m));
            match hit {
                Some((start, entry)) if !in_blocked_row => references.push(TrackReference {
                    start,
                    end: occ.end,
                    wide: occ.wide,
                    marker: occ.marker,
                    entry,
                }),
                _ => {
                    stats.unresolved += 1;
                    debug!("Unresolved reference at {:#x}, leaving untouched", occ.end);
                }
            }
        }
        references.sort_by_key(|r| r.start);
        references
    }

    fn patch_identifier(
        &self,
        buf: &mut [u8],
        reference: &TrackReference<'_>,
        claimed: &mut HashSet<usize>,
        stats: &mut PdbPatchStats,
    ) {
        let Some(marker) = reference.marker else {
            stats.identifiers_missing += 1;
            debug!("No format marker before reference at {:#x}", reference.start);
            return;
        };
        // The filename and the full path of one row share a marker
        if !claimed.insert(marker) {
            return;
        }

        let (Some(source), Some(target)) = (
            FileType::from_extension(reference.entry.old_extension()),
            FileType::from_extension(reference.entry.new_extension()),
        ) else {
            stats.identifiers_unexpected += 1;
            return;
        };

        let at = marker + IDENTIFIER_OFFSET;
        let current = [buf[at], buf[at + 1]];
        if current == source.identifier_bytes() {
            buf[at..at + 2].copy_from_slice(&target.identifier_bytes());
            stats.identifiers_patched += 1;
            debug!("Identifier at {:#x}: {} -> {}", at, source, target);
        } else if current == target.identifier_bytes() {
            stats.identifiers_already_target += 1;
        } else {
            stats.identifiers_unexpected += 1;
            debug!(
                "Identifier at {:#x} is {:02x}{:02x}, expected {}",
                at, current[0], current[1], source
            );
        }
    }
}

/// Patch every database file; per-file failures are recorded, not raised
pub fn patch_databases(
    paths: &[PathBuf],
    renames: &RenameMap,
    options: &WriteOptions,
) -> StageSummary {
    let patcher = PdbPatcher::new(renames);
    let mut summary = StageSummary::default();

    for path in paths {
        let report = patcher.patch_file(path, options).unwrap_or_else(|e| {
            warn!("Failed to patch {:?}: {}", path, e);
            FileReport::failed(path, &e)
        });
        summary.record(report);
    }

    summary
}

/// End offsets of every case-insensitive occurrence of `dotted`, either as
/// ASCII bytes or as UTF-16LE code units
fn find_extension(buf: &[u8], dotted: &[u8], wide: bool) -> Vec<usize> {
    let stride = if wide { 2 } else { 1 };
    let needle_len = dotted.len() * stride;
    if buf.len() < needle_len {
        return Vec::new();
    }

    (0..=buf.len() - needle_len)
        .filter(|&pos| {
            dotted.iter().enumerate().all(|(i, &expected)| {
                let at = pos + i * stride;
                buf[at].eq_ignore_ascii_case(&expected) && (!wide || buf[at + 1] == 0)
            })
        })
        .map(|pos| pos + needle_len)
        .collect()
}

fn replace_extension(buf: &mut [u8], reference: &TrackReference<'_>) {
    let ext = reference.entry.new_extension().as_bytes();
    if reference.wide {
        let start = reference.end - ext.len() * 2;
        for (i, &b) in ext.iter().enumerate() {
            buf[start + i * 2] = b;
            buf[start + i * 2 + 1] = 0;
        }
    } else {
        let start = reference.end - ext.len();
        buf[start..reference.end].copy_from_slice(ext);
    }
}

/// Strings that end exactly at `end`: DeviceSQL frames, then for ASCII a
/// run of path characters closed by a terminator byte
fn anchored_strings(buf: &[u8], end: usize, wide: bool) -> Vec<(usize, String)> {
    let mut strings: Vec<(usize, String)> = frames_ending_at(buf, end, wide)
        .into_iter()
        .filter_map(|frame| frame.text(buf).map(|text| (frame.header, text)))
        .collect();

    if !wide && is_terminator(buf.get(end).copied()) {
        let floor = end.saturating_sub(MAX_FRAME_BODY);
        let mut start = end;
        while start > floor && is_loose_path_byte(buf[start - 1]) {
            start -= 1;
        }
        if let Ok(text) = std::str::from_utf8(&buf[start..end]) {
            strings.push((start, text.to_string()));
        }
    }

    strings
}

/// Nearest identifier marker ending before `before`, within the same page
fn find_marker(buf: &[u8], before: usize) -> Option<usize> {
    let page_start = (before / PAGE_SIZE) * PAGE_SIZE;
    let mut pos = before.checked_sub(MARKER_LEN)?;
    loop {
        if pos < page_start {
            return None;
        }
        let window = &buf[pos..pos + MARKER_LEN];
        if window[..2] == MARKER_LEAD && window[6..] == MARKER_TRAIL {
            return Some(pos);
        }
        pos = pos.checked_sub(1)?;
    }
}

fn is_terminator(byte: Option<u8>) -> bool {
    matches!(byte, None | Some(0x00) | Some(b'"') | Some(b'\''))
}

fn is_loose_path_byte(b: u8) -> bool {
    (b == b' ' || b.is_ascii_graphic()) && b != b'"' && b != b'\''
}
