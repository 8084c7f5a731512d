//! Audio format catalogue
//!
//! Every format the patcher knows about, with the extension written on the
//! medium and the format-type code rekordbox stores in each track row.

use serde::{Deserialize, Serialize};

/// Audio file type as labelled by the player
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum FileType {
    Mp3 = 0x01,
    M4a = 0x04,
    Flac = 0x05,
    Wav = 0x0B,
    Aiff = 0x0C,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Mp3,
        FileType::M4a,
        FileType::Flac,
        FileType::Wav,
        FileType::Aiff,
    ];

    /// Parse a bare extension (no dot), case-insensitive
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.');
        Self::ALL
            .into_iter()
            .find(|ft| ft.extension().eq_ignore_ascii_case(ext))
    }

    /// Canonical lowercase extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Mp3 => "mp3",
            FileType::M4a => "m4a",
            FileType::Flac => "flac",
            FileType::Wav => "wav",
            FileType::Aiff => "aiff",
        }
    }

    /// Format-type code as stored in the track row
    pub fn type_code(&self) -> u16 {
        *self as u16
    }

    /// The two identifier bytes as they appear in the database (little-endian)
    pub fn identifier_bytes(&self) -> [u8; 2] {
        self.type_code().to_le_bytes()
    }

    pub fn from_identifier_bytes(bytes: [u8; 2]) -> Option<Self> {
        let code = u16::from_le_bytes(bytes);
        Self::ALL.into_iter().find(|ft| ft.type_code() == code)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}
