//! Content-identity hash over track metadata.

use sha1::{Digest, Sha1};

use crate::catalog::Track;

/// sha1 over `{display_name, source, extension}` of every track, in order.
///
/// Only these three fields participate; file bytes are never read.
pub fn content_identity<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> String {
    let mut hasher = Sha1::new();
    for track in tracks {
        for field in [&track.display_name, &track.source, &track.extension] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrackIndex;

    fn track(name: &str, source: &str) -> Track {
        Track::new(1, TrackIndex::new("0_1"), source).with_display_name(name)
    }

    #[test]
    fn test_identity_is_stable() {
        let tracks = vec![track("One", "/a.wav"), track("Two", "/b.wav")];
        assert_eq!(content_identity(&tracks), content_identity(&tracks));
        assert_eq!(content_identity(&tracks).len(), 40);
    }

    #[test]
    fn test_identity_tracks_relevant_fields() {
        let base = vec![track("One", "/a.wav")];
        let renamed = vec![track("Uno", "/a.wav")];
        let moved = vec![track("One", "/b.wav")];
        let mut retyped = base.clone();
        retyped[0].extension = "flac".to_string();

        let hash = content_identity(&base);
        assert_ne!(hash, content_identity(&renamed));
        assert_ne!(hash, content_identity(&moved));
        assert_ne!(hash, content_identity(&retyped));
    }

    #[test]
    fn test_identity_ignores_index() {
        let a = vec![track("One", "/a.wav")];
        let mut b = a.clone();
        b[0].index = TrackIndex::new("5_1");
        assert_eq!(content_identity(&a), content_identity(&b));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let a = vec![track("ab", "/c.wav")];
        let b = vec![track("a", "b/c.wav")];
        assert_ne!(content_identity(&a), content_identity(&b));
    }
}
