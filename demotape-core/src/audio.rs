//! Audio format identification and content sniffing.
//!
//! Formats are identified from file extensions when naming outputs and
//! choosing transcoder arguments, and from header magic bytes when deciding
//! whether a cached demo still looks like audio.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Target formats produced by the batch format processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// MPEG-1 Layer III
    Mp3,
    /// RIFF/WAVE PCM
    Wav,
    /// Free Lossless Audio Codec
    Flac,
    /// Ogg Vorbis
    Ogg,
}

/// Errors raised while interpreting format names.
#[derive(Debug, Error)]
pub enum AudioFormatError {
    /// Name does not match any supported target format.
    #[error("unknown audio format: {name}")]
    Unknown {
        /// The rejected format name.
        name: String,
    },
}

impl AudioFormat {
    /// Every target format, in bundle order.
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Mp3,
        AudioFormat::Wav,
        AudioFormat::Flac,
        AudioFormat::Ogg,
    ];

    /// File extension (and directory name) for this format.
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
        }
    }

    /// MIME type used in `Content-Type` headers.
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
        }
    }

    /// Maps a file extension onto a target format, case-insensitively.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" | "wave" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            _ => None,
        }
    }

    /// Encoder arguments passed to ffmpeg when converting into this format.
    pub fn codec_args(self) -> &'static [&'static str] {
        match self {
            AudioFormat::Mp3 => &["-c:a", "libmp3lame", "-q:a", "2"],
            AudioFormat::Wav => &["-c:a", "pcm_s16le"],
            AudioFormat::Flac => &["-c:a", "flac"],
            AudioFormat::Ogg => &["-c:a", "libvorbis", "-q:a", "5"],
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = AudioFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim()).ok_or_else(|| AudioFormatError::Unknown {
            name: s.to_string(),
        })
    }
}

/// Number of header bytes inspected by [`sniff_mime_type`].
pub const SNIFF_BYTES: usize = 512;

/// Guesses a MIME type from the first bytes of a file.
///
/// Recognizes the common audio containers by magic bytes and classifies
/// anything else as HTML, plain text, or opaque binary. Cached demos that
/// sniff as `text/*` are error pages or truncated downloads, not audio.
pub fn sniff_mime_type(header: &[u8]) -> &'static str {
    if header.is_empty() {
        return "application/x-empty";
    }

    if header.starts_with(b"ID3") {
        return "audio/mpeg";
    }
    if header.starts_with(b"fLaC") {
        return "audio/flac";
    }
    if header.starts_with(b"OggS") {
        return "audio/ogg";
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WAVE" {
        return "audio/wav";
    }
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return "audio/mp4";
    }
    if header.len() >= 2 && header[0] == 0xFF {
        // ADTS (AAC) sets layer bits to 00; MPEG audio frames do not.
        if header[1] & 0xF6 == 0xF0 {
            return "audio/aac";
        }
        if header[1] & 0xE0 == 0xE0 {
            return "audio/mpeg";
        }
    }
    if header.starts_with(b"#EXTM3U") {
        return "application/vnd.apple.mpegurl";
    }

    if looks_like_text(header) {
        let trimmed = header
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|start| &header[start..])
            .unwrap_or_default();
        if trimmed.first() == Some(&b'<') {
            return "text/html";
        }
        return "text/plain";
    }

    "application/octet-stream"
}

/// Returns true for `text/*` MIME types.
pub fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
}

fn looks_like_text(header: &[u8]) -> bool {
    let valid = match std::str::from_utf8(header) {
        Ok(text) => text,
        // A multi-byte character may be cut at the sniff boundary.
        Err(e) if header.len() - e.valid_up_to() < 4 && e.error_len().is_none() => {
            match std::str::from_utf8(&header[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };

    !valid.is_empty()
        && valid
            .chars()
            .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t' | '\u{c}'))
}

/// Sniffs the MIME type of a file on disk.
///
/// # Errors
///
/// - `std::io::Error` - File could not be opened or read
pub async fn sniff_file(path: &Path) -> std::io::Result<&'static str> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64)
        .read_to_end(&mut header)
        .await?;
    Ok(sniff_mime_type(&header))
}

/// Content type for a served file, derived from its extension.
pub fn content_type_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    if let Some(format) = AudioFormat::from_extension(extension) {
        return format.mime_type().to_string();
    }

    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Returns true for segmented playlists, which cannot be byte-truncated.
pub fn is_segmented_extension(extension: &str) -> bool {
    matches!(extension.to_ascii_lowercase().as_str(), "m3u8" | "m3u")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip_by_name() {
        for format in AudioFormat::ALL {
            let parsed: AudioFormat = format.extension().parse().unwrap();
            assert_eq!(parsed, format);
        }
        assert!("aiff".parse::<AudioFormat>().is_err());
        assert_eq!(AudioFormat::from_extension("WAVE"), Some(AudioFormat::Wav));
    }

    #[test]
    fn test_sniff_audio_containers() {
        assert_eq!(sniff_mime_type(b"ID3\x04\x00\x00\x00\x00"), "audio/mpeg");
        assert_eq!(sniff_mime_type(&[0xFF, 0xFB, 0x90, 0x64]), "audio/mpeg");
        assert_eq!(sniff_mime_type(&[0xFF, 0xF1, 0x50, 0x80]), "audio/aac");
        assert_eq!(sniff_mime_type(b"fLaC\x00\x00\x00\x22"), "audio/flac");
        assert_eq!(sniff_mime_type(b"OggS\x00\x02\x00\x00"), "audio/ogg");
        assert_eq!(sniff_mime_type(b"RIFF\x24\x08\x00\x00WAVEfmt "), "audio/wav");
        assert_eq!(
            sniff_mime_type(b"\x00\x00\x00\x20ftypM4A \x00\x00"),
            "audio/mp4"
        );
    }

    #[test]
    fn test_sniff_text_bodies() {
        assert_eq!(sniff_mime_type(b"  <html><body>404</body></html>"), "text/html");
        assert_eq!(sniff_mime_type(b"Not Found\n"), "text/plain");
        assert!(is_text_mime(sniff_mime_type(b"error: access denied")));
    }

    #[test]
    fn test_sniff_binary_and_empty() {
        assert_eq!(sniff_mime_type(&[0u8; 64]), "application/octet-stream");
        assert_eq!(sniff_mime_type(&[]), "application/x-empty");
        assert!(!is_text_mime(sniff_mime_type(&[0x00, 0x01, 0x02])));
    }

    #[test]
    fn test_sniff_text_cut_mid_character() {
        let mut header = "caf\u{e9} ".repeat(10).into_bytes();
        header.push(0xC3);
        assert_eq!(sniff_mime_type(&header), "text/plain");
    }

    #[test]
    fn test_content_type_for_paths() {
        assert_eq!(content_type_for(Path::new("a/song.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(Path::new("song.FLAC")), "audio/flac");
        assert_eq!(content_type_for(Path::new("cover.png")), "image/png");
        assert_eq!(
            content_type_for(Path::new("unknown.zzz")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_segmented_extensions() {
        assert!(is_segmented_extension("m3u8"));
        assert!(is_segmented_extension("M3U8"));
        assert!(!is_segmented_extension("mp3"));
    }
}
