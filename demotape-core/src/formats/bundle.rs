//! Cover discovery and zip archives for format bundles.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::audio::AudioFormat;

const COVER_STEMS: [&str; 2] = ["cover", "folder"];
const COVER_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Finds a cover image in `dir`.
///
/// Matches files whose stem starts with `cover` or `folder` (any case) and
/// whose extension is a common image type. `cover*` wins over `folder*`;
/// ties are broken by file name.
///
/// # Errors
///
/// - `std::io::Error` - Directory could not be listed
pub async fn find_cover(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates: Vec<(usize, String, PathBuf)> = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let (Some(stem), Some(extension)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|e| e.to_str()),
        ) else {
            continue;
        };

        let stem = stem.to_ascii_lowercase();
        let extension = extension.to_ascii_lowercase();
        if !COVER_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        if let Some(rank) = COVER_STEMS.iter().position(|prefix| stem.starts_with(prefix)) {
            let name = entry.file_name().to_string_lossy().into_owned();
            candidates.push((rank, name, path));
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().next().map(|(_, _, path)| path))
}

/// Errors while writing an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive task failed: {reason}")]
    Task { reason: String },
}

/// Writes `files` into a zip at `dest`, stored flat by file name.
///
/// Already-compressed formats are stored; WAV and images are deflated.
/// Runs on the blocking pool.
///
/// # Errors
///
/// - `ArchiveError::Io` / `ArchiveError::Zip` - Input unreadable or archive unwritable
pub async fn write_zip(files: Vec<PathBuf>, dest: PathBuf) -> Result<u64, ArchiveError> {
    tokio::task::spawn_blocking(move || write_zip_blocking(&files, &dest))
        .await
        .map_err(|e| ArchiveError::Task {
            reason: e.to_string(),
        })?
}

fn write_zip_blocking(files: &[PathBuf], dest: &Path) -> Result<u64, ArchiveError> {
    let staging = dest.with_extension("zip.part");
    if let Err(e) = write_entries(files, &staging) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    std::fs::rename(&staging, dest)?;
    Ok(std::fs::metadata(dest)?.len())
}

fn write_entries(files: &[PathBuf], staging: &Path) -> Result<(), ArchiveError> {
    let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(staging)?));

    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let options = SimpleFileOptions::default()
            .compression_method(compression_for(path))
            .large_file(std::fs::metadata(path)?.len() >= u64::from(u32::MAX));

        writer.start_file(name, options)?;
        let mut input = File::open(path)?;
        std::io::copy(&mut input, &mut writer)?;
    }

    let file = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn compression_for(path: &Path) -> CompressionMethod {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match AudioFormat::from_extension(extension) {
        Some(AudioFormat::Wav) | None => CompressionMethod::Deflated,
        Some(_) => CompressionMethod::Stored,
    }
}
