//! ANLZ file patching (.DAT, .EXT, .2EX)
//!
//! ANLZ files are **big-endian** and contain tagged sections after a
//! `PMAI` file header:
//!
//! ```text
//! PMAI | header_len | file_len | ...
//! tag  | header_len | section_len | section body ...
//! ```
//!
//! Only `PPTH` (file path) is touched. Its body is
//! `path_len: u32` followed by the path in UTF-16BE, usually NUL-terminated.
//! rekordbox writes `path_len` in bytes; some third-party writers use
//! UTF-16 units. Either is accepted as long as it matches the payload.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/anlz.html

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use binrw::{binrw, BinRead, BinReaderExt};
use tracing::{debug, info, warn};

use crate::devicesql::decode_utf16;
use crate::error::{Error, Result};
use crate::rename::RenameMap;
use crate::report::{FileReport, StageSummary};
use crate::writeback::write_atomic;

const PPTH_TAG: &[u8; 4] = b"PPTH";

/// tag + header_len + section_len
const SECTION_HEADER_LEN: usize = 12;

/// Section header + path_len
const PPTH_BODY_OFFSET: usize = 16;

/// ANLZ file header
#[binrw]
#[brw(big, magic = b"PMAI")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnlzHeader {
    /// Header length including the tag
    pub header_len: u32,
    /// Total file length
    pub file_len: u32,
}

/// Common header of every tagged section
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub tag: [u8; 4],
    pub header_len: u32,
    /// Section length including this header
    pub section_len: u32,
}

/// A section and where it sits in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub header: SectionHeader,
    /// PPTH only: the declared path length
    pub path_len: Option<u32>,
}

impl Section {
    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.header.tag).into_owned()
    }

    fn end(&self) -> usize {
        self.offset + self.header.section_len as usize
    }
}

/// Result of patching one analysis buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnlzPatchStats {
    pub paths_seen: usize,
    pub paths_patched: usize,
}

/// Walk the section list, checking every length against the buffer
pub fn parse_sections(buf: &[u8]) -> Result<Vec<Section>> {
    let mut cursor = Cursor::new(buf);
    let header = AnlzHeader::read(&mut cursor)?;

    if header.file_len as usize != buf.len() {
        return Err(inconsistent(
            8,
            format!(
                "PMAI file length {} does not match actual length {}",
                header.file_len,
                buf.len()
            ),
        ));
    }

    let mut sections = Vec::new();
    let mut offset = header.header_len as usize;
    if offset > buf.len() {
        return Err(inconsistent(4, "PMAI header runs past end of file"));
    }

    while offset + SECTION_HEADER_LEN <= buf.len() {
        cursor.set_position(offset as u64);
        let header = SectionHeader::read(&mut cursor)?;
        let section_len = header.section_len as usize;

        if section_len < SECTION_HEADER_LEN || (header.header_len as usize) > section_len {
            return Err(inconsistent(
                offset,
                format!("section {} has impossible lengths", String::from_utf8_lossy(&header.tag)),
            ));
        }
        if offset + section_len > buf.len() {
            return Err(inconsistent(
                offset,
                format!(
                    "section {} runs past end of file",
                    String::from_utf8_lossy(&header.tag)
                ),
            ));
        }

        let path_len = if &header.tag == PPTH_TAG {
            if section_len < PPTH_BODY_OFFSET {
                return Err(inconsistent(offset, "PPTH section shorter than its header"));
            }
            Some(cursor.read_be::<u32>()?)
        } else {
            None
        };

        sections.push(Section {
            offset,
            header,
            path_len,
        });
        offset += section_len;
    }

    Ok(sections)
}

/// Patch every PPTH path in `buf` that resolves in the rename map
pub fn patch_analysis(buf: &mut [u8], renames: &RenameMap) -> Result<AnlzPatchStats> {
    let sections = parse_sections(buf)?;
    let mut stats = AnlzPatchStats::default();

    for section in sections.iter().filter(|s| s.path_len.is_some()) {
        stats.paths_seen += 1;
        let body_start = section.offset + PPTH_BODY_OFFSET;
        let payload = &buf[body_start..section.end()];

        let Some(text) = decode_utf16(payload, u16::from_be_bytes) else {
            return Err(inconsistent(body_start, "PPTH path is not valid UTF-16BE"));
        };
        let path = text.trim_end_matches('\0');

        let Some(entry) = renames.resolve(path) else {
            debug!("PPTH path {:?} not in rename map", path);
            continue;
        };
        // Length fields only matter for sections that are about to change
        check_path_len(section, payload.len())?;

        let old_ext = entry.old_extension();
        let new_ext = entry.new_extension();
        let units = path.encode_utf16().count();
        let ext_units = old_ext.encode_utf16().count();
        if new_ext.encode_utf16().count() != ext_units || ext_units > units {
            return Err(inconsistent(body_start, "replacement would change the path length"));
        }

        let ext_start = body_start + (units - ext_units) * 2;
        for (i, unit) in new_ext.encode_utf16().enumerate() {
            buf[ext_start + i * 2..ext_start + i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        stats.paths_patched += 1;
        debug!("PPTH at {:#x}: {} -> {}", section.offset, entry.old, entry.new);
    }

    // Nothing but path characters may have moved
    if stats.paths_patched > 0 && parse_sections(buf)? != sections {
        return Err(inconsistent(0, "section headers changed while patching"));
    }

    Ok(stats)
}

/// Read, patch and atomically write back one analysis file
pub fn patch_analysis_file(path: &Path, renames: &RenameMap) -> Result<FileReport> {
    let mut data = fs::read(path)?;
    let stats = patch_analysis(&mut data, renames)?;

    if stats.paths_patched == 0 {
        let detail = if stats.paths_seen == 0 {
            "no path section"
        } else {
            "path not converted or already patched"
        };
        debug!("Skipped {:?}: {}", path, detail);
        return Ok(FileReport::skipped(path, detail));
    }

    write_atomic(path, &data)?;
    info!("Patched {:?} ({} path sections)", path, stats.paths_patched);
    Ok(FileReport::patched(
        path,
        stats.paths_patched,
        format!("{} of {} path sections", stats.paths_patched, stats.paths_seen),
    ))
}

/// Patch every analysis file; per-file failures are recorded, not raised
pub fn patch_analysis_files(paths: &[PathBuf], renames: &RenameMap) -> StageSummary {
    let mut summary = StageSummary::default();

    for path in paths {
        let report = patch_analysis_file(path, renames).unwrap_or_else(|e| {
            warn!("Failed to patch {:?}: {}", path, e);
            FileReport::failed(path, &e)
        });
        summary.record(report);
    }

    info!(
        "Analysis files: {} patched, {} skipped, {} failed",
        summary.patched, summary.skipped, summary.failed
    );
    summary
}

fn check_path_len(section: &Section, payload_bytes: usize) -> Result<()> {
    let declared = section.path_len.unwrap_or(0) as usize;
    if payload_bytes % 2 != 0 || (declared != payload_bytes && declared * 2 != payload_bytes) {
        return Err(inconsistent(
            section.offset + SECTION_HEADER_LEN,
            format!(
                "PPTH path length {} does not describe a {}-byte payload",
                declared, payload_bytes
            ),
        ));
    }
    Ok(())
}

fn inconsistent(offset: usize, reason: impl Into<String>) -> Error {
    Error::StructuralInconsistency {
        offset,
        reason: reason.into(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Build an ANLZ file with a PPTH section and an opaque beat grid section
    pub fn anlz_file(path: &str, nul_terminated: bool, len_in_units: bool) -> Vec<u8> {
        let mut data: Vec<u8> = path.encode_utf16().flat_map(u16::to_be_bytes).collect();
        if nul_terminated {
            data.extend_from_slice(&[0, 0]);
        }
        let path_len = if len_in_units { data.len() / 2 } else { data.len() } as u32;

        let mut ppth = b"PPTH".to_vec();
        ppth.extend_from_slice(&16u32.to_be_bytes());
        ppth.extend_from_slice(&((16 + data.len()) as u32).to_be_bytes());
        ppth.extend_from_slice(&path_len.to_be_bytes());
        ppth.extend(data);

        let mut pqtz = b"PQTZ".to_vec();
        pqtz.extend_from_slice(&24u32.to_be_bytes());
        pqtz.extend_from_slice(&32u32.to_be_bytes());
        pqtz.extend_from_slice(&[0, 0, 0, 0, 0, 0x80, 0, 0, 0, 0, 0, 1]);
        pqtz.extend_from_slice(&[0, 1, 0x32, 0, 0, 0, 0, 0x64]);

        let total = 28 + ppth.len() + pqtz.len();
        let mut file = b"PMAI".to_vec();
        file.extend_from_slice(&28u32.to_be_bytes());
        file.extend_from_slice(&(total as u32).to_be_bytes());
        file.extend_from_slice(&[0u8; 16]);
        file.extend(ppth);
        file.extend(pqtz);
        file
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::anlz_file;
    use super::*;
    use tempfile::TempDir;

    fn renames() -> RenameMap {
        let mut map = RenameMap::new();
        map.insert("Contents/Artist/01 Track.flac", "Contents/Artist/01 Track.aiff")
            .unwrap();
        map
    }

    fn ppth(buf: &[u8]) -> Section {
        parse_sections(buf)
            .unwrap()
            .into_iter()
            .find(|s| s.path_len.is_some())
            .unwrap()
    }

    fn path_text(buf: &[u8]) -> String {
        let section = ppth(buf);
        decode_utf16(&buf[section.offset + 16..section.end()], u16::from_be_bytes).unwrap()
    }

    #[test]
    fn test_parse_sections() {
        let buf = anlz_file("/Contents/a.flac", true, false);
        let sections = parse_sections(&buf).unwrap();
        let tags: Vec<String> = sections.iter().map(Section::tag_str).collect();
        assert_eq!(tags, vec!["PPTH", "PQTZ"]);
        assert_eq!(sections[0].path_len, Some(34));
        assert_eq!(sections[1].path_len, None);
    }

    #[test]
    fn test_patch_bare_filename_path() {
        let mut buf = anlz_file("01 Track.flac", false, true);
        let before = ppth(&buf);
        let len = buf.len();

        let stats = patch_analysis(&mut buf, &renames()).unwrap();

        assert_eq!(stats.paths_patched, 1);
        assert_eq!(buf.len(), len);
        assert_eq!(path_text(&buf), "01 Track.aiff");
        let after = ppth(&buf);
        assert_eq!(after.header.section_len, before.header.section_len);
        assert_eq!(after.path_len, before.path_len);
    }

    #[test]
    fn test_patch_full_path_with_terminator() {
        let mut buf = anlz_file("/Contents/Artist/01 Track.flac", true, false);
        patch_analysis(&mut buf, &renames()).unwrap();
        assert_eq!(path_text(&buf), "/Contents/Artist/01 Track.aiff\0");
    }

    #[test]
    fn test_unknown_or_patched_path_is_skipped() {
        let mut buf = anlz_file("/Contents/Other/02 Song.flac", true, false);
        let original = buf.clone();
        let stats = patch_analysis(&mut buf, &renames()).unwrap();
        assert_eq!(stats, AnlzPatchStats { paths_seen: 1, paths_patched: 0 });
        assert_eq!(buf, original);

        let mut buf = anlz_file("/Contents/Artist/01 Track.aiff", true, false);
        assert_eq!(patch_analysis(&mut buf, &renames()).unwrap().paths_patched, 0);
    }

    #[test]
    fn test_bad_path_length_is_structural_inconsistency() {
        let mut buf = anlz_file("/Contents/Artist/01 Track.flac", true, false);
        let offset = ppth(&buf).offset;
        buf[offset + 12..offset + 16].copy_from_slice(&7u32.to_be_bytes());
        let original = buf.clone();

        let err = patch_analysis(&mut buf, &renames()).unwrap_err();
        assert!(matches!(err, Error::StructuralInconsistency { .. }));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_bad_path_length_on_unconverted_track_is_skipped() {
        let mut buf = anlz_file("/Contents/Other/02 Kept.flac", true, false);
        let offset = ppth(&buf).offset;
        buf[offset + 12..offset + 16].copy_from_slice(&7u32.to_be_bytes());
        let original = buf.clone();

        let stats = patch_analysis(&mut buf, &renames()).unwrap();
        assert_eq!((stats.paths_seen, stats.paths_patched), (1, 0));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let mut buf = anlz_file("/Contents/Artist/01 Track.flac", true, false);
        buf.truncate(buf.len() - 4);
        assert!(matches!(
            parse_sections(&buf),
            Err(Error::StructuralInconsistency { .. })
        ));

        assert!(matches!(parse_sections(b"NOPE0000"), Err(Error::BinRw(_))));
    }

    #[test]
    fn test_patch_analysis_files_summary() {
        let tmp = TempDir::new().unwrap();
        let dat = tmp.path().join("ANLZ0000.DAT");
        let ext = tmp.path().join("ANLZ0000.EXT");
        let other = tmp.path().join("ANLZ0001.DAT");
        let broken = tmp.path().join("ANLZ0002.DAT");
        fs::write(&dat, anlz_file("/Contents/Artist/01 Track.flac", true, false)).unwrap();
        fs::write(&ext, anlz_file("/Contents/Artist/01 Track.flac", true, false)).unwrap();
        fs::write(&other, anlz_file("/Contents/B/x.flac", true, false)).unwrap();
        fs::write(&broken, b"PMAI\0\0\0\x1c").unwrap();

        let summary = patch_analysis_files(&[dat.clone(), ext, other, broken], &renames());

        assert_eq!((summary.patched, summary.skipped, summary.failed), (2, 1, 1));
        assert_eq!(
            path_text(&fs::read(&dat).unwrap()),
            "/Contents/Artist/01 Track.aiff\0"
        );
    }
}
