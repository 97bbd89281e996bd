//! Demo rendering with transcoder-first, byte-truncation-fallback semantics.
//!
//! The byte-truncation fallback is best-effort: cutting a compressed stream at
//! an arbitrary byte offset can leave an undecodable tail frame. Most players
//! stop cleanly at that point, so the result is served as-is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::DemoError;
use crate::audio::is_segmented_extension;
use crate::transcoder::{TranscodeError, Transcoder};

/// Computes how much audio a demo keeps.
///
/// Implement this to change rounding, add a minimum length or cap demos.
pub trait TargetLengthPolicy: Send + Sync {
    fn target_length(&self, duration: Duration, percent: u8) -> Duration;
}

/// `floor(duration * percent / 100)` in whole seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloorSeconds;

impl TargetLengthPolicy for FloorSeconds {
    fn target_length(&self, duration: Duration, percent: u8) -> Duration {
        let millis = duration.as_millis() * u128::from(percent.min(100)) / 100;
        Duration::from_secs((millis / 1000) as u64)
    }
}

/// Why a demo was produced by byte truncation instead of re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    TranscoderUnavailable,
    ProbeFailed(String),
    TranscodeFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::TranscoderUnavailable => write!(f, "transcoder unavailable"),
            FallbackReason::ProbeFailed(reason) => write!(f, "probe failed: {reason}"),
            FallbackReason::TranscodeFailed(reason) => write!(f, "transcode failed: {reason}"),
        }
    }
}

/// How the demo bytes were produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoMethod {
    Transcoded { length: Duration },
    ByteTruncated { reason: FallbackReason },
}

/// A written demo.
#[derive(Debug, Clone)]
pub struct DemoOutcome {
    /// Final path; the `o_` secondary path when the rename into place failed.
    pub path: PathBuf,
    pub method: DemoMethod,
    pub size: u64,
}

/// Renders demos from source files.
#[derive(Clone)]
pub struct DemoGenerator {
    transcoder: Arc<dyn Transcoder>,
    policy: Arc<dyn TargetLengthPolicy>,
}

impl std::fmt::Debug for DemoGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoGenerator")
            .field("transcoder_available", &self.transcoder.is_available())
            .finish()
    }
}

impl DemoGenerator {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            transcoder,
            policy: Arc::new(FloorSeconds),
        }
    }

    /// Replaces the target length policy.
    pub fn with_policy(mut self, policy: Arc<dyn TargetLengthPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Writes a demo of `source` keeping `percent` of it to `dest`.
    ///
    /// The demo is written under a private `.part-` sibling of `dest` and only
    /// renamed into place once complete. When that rename fails it is moved to
    /// the `o_`-prefixed sibling instead. Transcoder failures select byte
    /// truncation.
    /// A watermark that is not a readable file is ignored.
    ///
    /// # Errors
    ///
    /// - `DemoError::SourceUnreadable` - Source is missing or unreadable
    /// - `DemoError::SegmentedSource` - Playlist source and no working transcoder
    /// - `DemoError::WriteFailed` - Demo could not be written
    pub async fn make_demo(
        &self,
        source: &Path,
        dest: &Path,
        percent: u8,
        watermark: Option<&Path>,
    ) -> Result<DemoOutcome, DemoError> {
        let percent = percent.min(100);
        let source_size = tokio::fs::metadata(source)
            .await
            .map_err(|e| DemoError::SourceUnreadable {
                path: source.to_path_buf(),
                source: e,
            })?
            .len();

        let working = working_sibling(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DemoError::WriteFailed {
                    path: dest.to_path_buf(),
                    source: e,
                })?;
        }

        let watermark = match watermark {
            Some(path) if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()) => Some(path),
            Some(path) => {
                tracing::warn!("Watermark {} not found, rendering without it", path.display());
                None
            }
            None => None,
        };

        let method = match self.transcode(source, &working, percent, watermark).await {
            Ok(length) => DemoMethod::Transcoded { length },
            Err(reason) => {
                tracing::info!(
                    "Falling back to byte truncation for {}: {}",
                    source.display(),
                    reason
                );

                if source
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(is_segmented_extension)
                {
                    return Err(DemoError::SegmentedSource {
                        path: source.to_path_buf(),
                    });
                }

                if let Err(e) =
                    truncate_copy(source, &working, truncated_len(source_size, percent)).await
                {
                    let _ = tokio::fs::remove_file(&working).await;
                    return Err(e);
                }
                DemoMethod::ByteTruncated { reason }
            }
        };

        let path = publish(&working, dest).await?;

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DemoError::WriteFailed {
                path: path.clone(),
                source: e,
            })?
            .len();

        tracing::debug!(
            "Demo {} ready ({} bytes, {:?})",
            path.display(),
            size,
            method
        );

        Ok(DemoOutcome { path, method, size })
    }

    async fn transcode(
        &self,
        source: &Path,
        working: &Path,
        percent: u8,
        watermark: Option<&Path>,
    ) -> Result<Duration, FallbackReason> {
        if !self.transcoder.is_available() {
            return Err(FallbackReason::TranscoderUnavailable);
        }

        let duration = self
            .transcoder
            .probe_duration(source)
            .await
            .map_err(|e| match e {
                TranscodeError::Unavailable { .. } => FallbackReason::TranscoderUnavailable,
                other => FallbackReason::ProbeFailed(other.to_string()),
            })?;

        let length = self.policy.target_length(duration, percent);

        match self
            .transcoder
            .render_demo(source, working, length, watermark)
            .await
        {
            Ok(()) => Ok(length),
            Err(e) => {
                let _ = tokio::fs::remove_file(working).await;
                Err(FallbackReason::TranscodeFailed(e.to_string()))
            }
        }
    }
}

/// `floor(size * percent / 100)`.
pub fn truncated_len(size: u64, percent: u8) -> u64 {
    (u128::from(size) * u128::from(percent.min(100)) / 100) as u64
}

fn file_name_of(dest: &Path) -> String {
    dest.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn secondary_sibling(dest: &Path) -> PathBuf {
    dest.with_file_name(format!("o_{}", file_name_of(dest)))
}

/// Keeps the extension last; ffmpeg picks the container from it.
fn working_sibling(dest: &Path) -> PathBuf {
    dest.with_file_name(format!(
        ".part-{}-{}",
        uuid::Uuid::new_v4().simple(),
        file_name_of(dest)
    ))
}

/// Moves a finished render to `dest`, or to its `o_` sibling when that fails.
async fn publish(working: &Path, dest: &Path) -> Result<PathBuf, DemoError> {
    let Err(e) = tokio::fs::rename(working, dest).await else {
        return Ok(dest.to_path_buf());
    };

    let secondary = secondary_sibling(dest);
    tracing::warn!(
        "Could not move demo into {}, serving {}: {}",
        dest.display(),
        secondary.display(),
        e
    );

    match tokio::fs::rename(working, &secondary).await {
        Ok(()) => Ok(secondary),
        Err(e) => {
            let _ = tokio::fs::remove_file(working).await;
            Err(DemoError::WriteFailed {
                path: secondary,
                source: e,
            })
        }
    }
}

async fn truncate_copy(source: &Path, dest: &Path, len: u64) -> Result<u64, DemoError> {
    let input = tokio::fs::File::open(source)
        .await
        .map_err(|e| DemoError::SourceUnreadable {
            path: source.to_path_buf(),
            source: e,
        })?;

    let write_failed = |e| DemoError::WriteFailed {
        path: dest.to_path_buf(),
        source: e,
    };

    let mut output = tokio::fs::File::create(dest).await.map_err(write_failed)?;
    let copied = tokio::io::copy(&mut input.take(len), &mut output)
        .await
        .map_err(write_failed)?;
    output.sync_all().await.map_err(write_failed)?;

    Ok(copied)
}
