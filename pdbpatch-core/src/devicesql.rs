//! DeviceSQL string framing
//!
//! Strings in export.pdb rows use three header formats:
//! - Short ASCII: one header byte `((len + 1) << 1) | 1`, max 126 chars
//! - Long ASCII: `[0x40, len_lo, len_hi, 0x00]` + ASCII data
//! - UTF-16LE: `[0x90, len_lo, len_hi, 0x00]` + UTF-16LE data
//!
//! Long lengths include the 4-byte header. The patcher never walks the row
//! offset tables; instead it works backwards from a candidate extension to a
//! header whose declared length ends exactly there.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/exports.html

/// Maximum length for short ASCII strings
const MAX_SHORT_ASCII_LEN: usize = 126;

/// Flag byte values
const FLAG_LONG_ASCII: u8 = 0x40;
const FLAG_UTF16LE: u8 = 0x90;

const LONG_HEADER_LEN: usize = 4;

/// Longest long-form string body searched for, in bytes
pub const MAX_FRAME_BODY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    ShortAscii,
    LongAscii,
    Utf16Le,
}

impl StringEncoding {
    pub fn is_wide(&self) -> bool {
        matches!(self, StringEncoding::Utf16Le)
    }
}

/// A string located in the buffer: `header..body` is the header,
/// `body..end` the encoded text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringFrame {
    pub header: usize,
    pub body: usize,
    pub end: usize,
    pub encoding: StringEncoding,
}

impl StringFrame {
    pub fn text(&self, buf: &[u8]) -> Option<String> {
        let body = buf.get(self.body..self.end)?;
        match self.encoding {
            StringEncoding::ShortAscii | StringEncoding::LongAscii => {
                std::str::from_utf8(body).ok().map(str::to_string)
            }
            StringEncoding::Utf16Le => decode_utf16(body, u16::from_le_bytes),
        }
    }
}

/// All frames of the given width whose body ends exactly at `end`,
/// longest first
pub fn frames_ending_at(buf: &[u8], end: usize, wide: bool) -> Vec<StringFrame> {
    let mut frames = Vec::new();
    if end > buf.len() {
        return frames;
    }

    let (flag, encoding) = if wide {
        (FLAG_UTF16LE, StringEncoding::Utf16Le)
    } else {
        (FLAG_LONG_ASCII, StringEncoding::LongAscii)
    };

    let lowest = end.saturating_sub(MAX_FRAME_BODY + LONG_HEADER_LEN);
    let highest = end.saturating_sub(LONG_HEADER_LEN);
    for header in lowest..=highest {
        if header + LONG_HEADER_LEN > end {
            break;
        }
        if buf[header] != flag || buf[header + 3] != 0x00 {
            continue;
        }
        let declared = u16::from_le_bytes([buf[header + 1], buf[header + 2]]) as usize;
        let body = header + LONG_HEADER_LEN;
        if declared != end - header || (wide && (end - body) % 2 != 0) {
            continue;
        }
        frames.push(StringFrame { header, body, end, encoding });
    }

    if !wide {
        for len in (1..=MAX_SHORT_ASCII_LEN).rev() {
            let Some(header) = end.checked_sub(len + 1) else {
                continue;
            };
            let flag = buf[header];
            if flag & 1 == 1 && (flag >> 1) as usize == len + 1 && is_path_text(&buf[header + 1..end]) {
                frames.push(StringFrame {
                    header,
                    body: header + 1,
                    end,
                    encoding: StringEncoding::ShortAscii,
                });
            }
        }
    }

    frames.sort_by_key(|f| f.header);
    frames
}

fn is_path_text(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == b' ' || b.is_ascii_graphic())
}

/// Decode UTF-16 code units in the given byte order
pub fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| unit([c[0], c[1]])).collect();
    String::from_utf16(&units).ok()
}

/// Test fixtures: encode strings the way rekordbox writes them
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn short_ascii(s: &str) -> Vec<u8> {
        let mut out = vec![(((s.len() + 1) as u8) << 1) | 1];
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn long_ascii(s: &str) -> Vec<u8> {
        let total = (LONG_HEADER_LEN + s.len()) as u16;
        let mut out = vec![FLAG_LONG_ASCII];
        out.extend_from_slice(&total.to_le_bytes());
        out.push(0x00);
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn utf16le(s: &str) -> Vec<u8> {
        let data: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let total = (LONG_HEADER_LEN + data.len()) as u16;
        let mut out = vec![FLAG_UTF16LE];
        out.extend_from_slice(&total.to_le_bytes());
        out.push(0x00);
        out.extend(data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn framed(prefix: &[u8], encoded: &[u8]) -> (Vec<u8>, usize) {
        let mut buf = prefix.to_vec();
        buf.extend_from_slice(encoded);
        let end = buf.len();
        buf.extend_from_slice(&[0u8; 8]);
        (buf, end)
    }

    #[test]
    fn test_short_ascii_frame() {
        let (buf, end) = framed(&[0xAA, 0xBB], &short_ascii("/Contents/a.flac"));
        let frames = frames_ending_at(&buf, end, false);
        let frame = frames.first().unwrap();
        assert_eq!(frame.header, 2);
        assert_eq!(frame.encoding, StringEncoding::ShortAscii);
        assert_eq!(frame.text(&buf).unwrap(), "/Contents/a.flac");
    }

    #[test]
    fn test_long_ascii_frame() {
        let path = format!("/Contents/{}/track.flac", "x".repeat(150));
        let (buf, end) = framed(&[0x00; 3], &long_ascii(&path));
        let frames = frames_ending_at(&buf, end, false);
        assert_eq!(frames[0].encoding, StringEncoding::LongAscii);
        assert_eq!(frames[0].text(&buf).unwrap(), path);
    }

    #[test]
    fn test_utf16le_frame() {
        let (buf, end) = framed(&[0x11], &utf16le("/Contents/Café/01 Ça.flac"));
        let frames = frames_ending_at(&buf, end, true);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].encoding.is_wide());
        assert_eq!(frames[0].text(&buf).unwrap(), "/Contents/Café/01 Ça.flac");
    }

    #[test]
    fn test_no_frame_for_unframed_text() {
        let mut buf = vec![0x00, 0x00];
        buf.extend_from_slice(b"track.flac");
        let end = buf.len();
        assert!(frames_ending_at(&buf, end, false).is_empty());
        assert!(frames_ending_at(&buf, end, true).is_empty());
        assert!(frames_ending_at(&buf, buf.len() + 1, false).is_empty());
    }
}
