//! Demo generation and the on-disk demo cache.

pub mod cache;
pub mod generator;

use std::path::PathBuf;

pub use cache::{DemoCache, GenerationGuard};
pub use generator::{
    DemoGenerator, DemoMethod, DemoOutcome, FallbackReason, FloorSeconds, TargetLengthPolicy,
};

use crate::audio::is_segmented_extension;

/// Extension of the demo rendered for a source with `source_extension`.
///
/// Segmented playlists are rendered to a single mp3.
pub fn demo_extension(source_extension: &str) -> String {
    if is_segmented_extension(source_extension) || source_extension.is_empty() {
        "mp3".to_string()
    } else {
        source_extension.to_ascii_lowercase()
    }
}

/// Fatal demo generation failures.
///
/// Transcoder problems never surface here; they select the byte-truncation
/// fallback and are reported through [`FallbackReason`].
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("Source {path} is not readable: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Segmented source {path} needs a working transcoder")]
    SegmentedSource { path: PathBuf },

    #[error("Failed to write demo {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_extension() {
        assert_eq!(demo_extension("MP3"), "mp3");
        assert_eq!(demo_extension("m3u8"), "mp3");
        assert_eq!(demo_extension(""), "mp3");
        assert_eq!(demo_extension("flac"), "flac");
    }
}
