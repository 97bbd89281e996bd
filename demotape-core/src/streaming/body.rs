//! Chunked file bodies.

use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes read from disk per body chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Streams `len` bytes of `path` starting at `start` in bounded chunks.
///
/// The file is opened and positioned before returning, so open and seek
/// failures surface before any response head is committed. A file that
/// shrinks mid-stream ends the body with an `UnexpectedEof` error, which
/// aborts the connection instead of sending a short entity.
///
/// # Errors
///
/// - `std::io::Error` - File could not be opened or positioned
pub async fn file_stream(
    path: &Path,
    start: u64,
    len: u64,
) -> std::io::Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static> {
    let mut file = tokio::fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    Ok(stream::unfold(
        (file, len),
        |(mut file, remaining)| async move {
            if remaining == 0 {
                return None;
            }

            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let mut buf = vec![0u8; want];

            match file.read(&mut buf).await {
                Ok(0) => Some((
                    Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file ended before the announced length",
                    )),
                    (file, 0),
                )),
                Ok(read) => {
                    buf.truncate(read);
                    Some((Ok(Bytes::from(buf)), (file, remaining - read as u64)))
                }
                Err(e) => Some((Err(e), (file, 0))),
            }
        },
    ))
}

/// Response body for `len` bytes of `path` from `start`.
///
/// # Errors
///
/// - `std::io::Error` - File could not be opened or positioned
pub async fn file_body(path: &Path, start: u64, len: u64) -> std::io::Result<Body> {
    Ok(Body::from_stream(file_stream(path, start, len).await?))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tempfile::tempdir;

    use super::*;

    async fn collect(path: &Path, start: u64, len: u64) -> (Vec<u8>, Vec<usize>, bool) {
        let stream = file_stream(path, start, len).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        let mut data = Vec::new();
        let mut sizes = Vec::new();
        let mut failed = false;
        for chunk in chunks {
            match chunk {
                Ok(bytes) => {
                    sizes.push(bytes.len());
                    data.extend_from_slice(&bytes);
                }
                Err(_) => failed = true,
            }
        }
        (data, sizes, failed)
    }

    #[tokio::test]
    async fn test_reads_exact_slice_in_bounded_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let (data, sizes, failed) = collect(&path, 1_000, 20_000).await;
        assert!(!failed);
        assert_eq!(data, content[1_000..21_000]);
        assert!(sizes.iter().all(|&size| size <= CHUNK_SIZE));
    }

    #[tokio::test]
    async fn test_zero_length_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();

        let (data, sizes, failed) = collect(&path, 0, 0).await;
        assert!(data.is_empty() && sizes.is_empty() && !failed);
    }

    #[tokio::test]
    async fn test_short_file_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abcdef").unwrap();

        let (data, _, failed) = collect(&path, 2, 100).await;
        assert_eq!(data, b"cdef");
        assert!(failed);
    }

    #[tokio::test]
    async fn test_missing_file_fails_up_front() {
        let dir = tempdir().unwrap();
        assert!(file_body(&dir.path().join("nope"), 0, 1).await.is_err());
    }
}
