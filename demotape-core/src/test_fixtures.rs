//! Test fixtures shared by unit tests and the integration test crate.
//!
//! Enabled for `cfg(test)` and through the `test-utils` feature.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::audio::AudioFormat;
use crate::config::DemotapeConfig;
use crate::transcoder::{TranscodeError, Transcoder};

/// A recorded `convert` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: AudioFormat,
}

/// Bytes written before a delayed render pauses.
const PARTIAL_RENDER_BYTES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unavailable,
    Working,
    FailingProbe,
    FailingRender,
}

/// Scripted transcoder that writes recognizable files without any process.
///
/// Rendered demos grow with the requested length so demo sizes stay
/// monotonic in the percentage.
#[derive(Debug)]
pub struct FakeTranscoder {
    mode: Mode,
    duration: Duration,
    render_delay: Option<Duration>,
    failing_formats: Vec<AudioFormat>,
    rendered: Mutex<Vec<Duration>>,
    watermarks: Mutex<Vec<Option<PathBuf>>>,
    conversions: Mutex<Vec<Conversion>>,
}

impl FakeTranscoder {
    fn with_mode(mode: Mode, duration: Duration) -> Self {
        Self {
            mode,
            duration,
            render_delay: None,
            failing_formats: Vec::new(),
            rendered: Mutex::new(Vec::new()),
            watermarks: Mutex::new(Vec::new()),
            conversions: Mutex::new(Vec::new()),
        }
    }

    /// Reports itself as not configured.
    pub fn unavailable() -> Self {
        Self::with_mode(Mode::Unavailable, Duration::ZERO)
    }

    /// Working transcoder that probes every input as `duration` long.
    pub fn with_duration(duration: Duration) -> Self {
        Self::with_mode(Mode::Working, duration)
    }

    pub fn failing_probe() -> Self {
        Self::with_mode(Mode::FailingProbe, Duration::ZERO)
    }

    /// Probes fine, then fails every render.
    pub fn failing_render(duration: Duration) -> Self {
        Self::with_mode(Mode::FailingRender, duration)
    }

    /// Renders stop after a few bytes for `delay` before finishing, leaving a
    /// half-written output on disk meanwhile.
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = Some(delay);
        self
    }

    /// Fails every conversion into `format`.
    pub fn failing_format(mut self, format: AudioFormat) -> Self {
        self.failing_formats.push(format);
        self
    }

    pub fn rendered_lengths(&self) -> Vec<Duration> {
        self.rendered.lock().clone()
    }

    pub fn watermarks(&self) -> Vec<Option<PathBuf>> {
        self.watermarks.lock().clone()
    }

    pub fn conversions(&self) -> Vec<Conversion> {
        self.conversions.lock().clone()
    }

    fn unavailable_error() -> TranscodeError {
        TranscodeError::Unavailable {
            reason: "fake transcoder not configured".to_string(),
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn is_available(&self) -> bool {
        self.mode != Mode::Unavailable
    }

    async fn probe_duration(&self, input: &Path) -> Result<Duration, TranscodeError> {
        match self.mode {
            Mode::Unavailable => Err(Self::unavailable_error()),
            Mode::FailingProbe => Err(TranscodeError::ProbeFailed {
                reason: format!("no duration in {}", input.display()),
            }),
            Mode::Working | Mode::FailingRender => {
                tokio::fs::metadata(input).await?;
                Ok(self.duration)
            }
        }
    }

    async fn render_demo(
        &self,
        _input: &Path,
        output: &Path,
        length: Duration,
        watermark: Option<&Path>,
    ) -> Result<(), TranscodeError> {
        self.rendered.lock().push(length);
        self.watermarks.lock().push(watermark.map(Path::to_path_buf));

        match self.mode {
            Mode::Unavailable => Err(Self::unavailable_error()),
            Mode::FailingRender | Mode::FailingProbe => {
                tokio::fs::write(output, b"partial").await?;
                Err(TranscodeError::NonZeroExit {
                    code: Some(1),
                    stderr: "fake render failure".to_string(),
                })
            }
            Mode::Working => {
                let mut bytes = b"ID3\x04\x00\x00".to_vec();
                bytes.resize(bytes.len() + 64 + length.as_secs() as usize * 128, 0x55);

                let Some(delay) = self.render_delay else {
                    tokio::fs::write(output, bytes).await?;
                    return Ok(());
                };

                let mut file = tokio::fs::File::create(output).await?;
                let (head, tail) = bytes.split_at(PARTIAL_RENDER_BYTES.min(bytes.len()));
                file.write_all(head).await?;
                file.flush().await?;
                tokio::time::sleep(delay).await;
                file.write_all(tail).await?;
                file.sync_all().await?;
                Ok(())
            }
        }
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        format: AudioFormat,
    ) -> Result<(), TranscodeError> {
        if self.mode == Mode::Unavailable {
            return Err(Self::unavailable_error());
        }
        self.conversions.lock().push(Conversion {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            format,
        });

        if self.failing_formats.contains(&format) {
            tokio::fs::write(output, b"partial").await?;
            return Err(TranscodeError::NonZeroExit {
                code: Some(1),
                stderr: format!("fake {format} encoder failure"),
            });
        }

        let mut bytes = magic_for(format).to_vec();
        bytes.extend(tokio::fs::read(input).await?);
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }
}

fn magic_for(format: AudioFormat) -> &'static [u8] {
    match format {
        AudioFormat::Mp3 => b"ID3\x04\x00\x00",
        AudioFormat::Wav => b"RIFF\x24\x00\x00\x00WAVEfmt ",
        AudioFormat::Flac => b"fLaC",
        AudioFormat::Ogg => b"OggS",
    }
}

/// Writes a binary file of `size` deterministic bytes under `dir`.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_source_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..size).map(|i| ((i * 7 + 3) % 251) as u8).collect();
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Temporary root plus a config pointing every directory inside it.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
pub fn temp_workspace() -> (tempfile::TempDir, DemotapeConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = DemotapeConfig::for_testing(dir.path());
    (dir, config)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_source_file_is_deterministic_binary() {
        let (dir, _config) = temp_workspace();
        let a = write_source_file(dir.path(), "a.mp3", 1_000);
        let b = write_source_file(&dir.path().join("nested"), "b.mp3", 1_000);
        let bytes = std::fs::read(&a).unwrap();
        assert_eq!(bytes.len(), 1_000);
        assert_eq!(bytes, std::fs::read(&b).unwrap());
        assert!(bytes.contains(&0));
    }

    #[tokio::test]
    async fn test_fake_render_grows_with_length() {
        let (dir, _config) = temp_workspace();
        let fake = FakeTranscoder::with_duration(Duration::from_secs(60));
        let short = dir.path().join("short.mp3");
        let long = dir.path().join("long.mp3");
        let input = dir.path().join("in.mp3");

        fake.render_demo(&input, &short, Duration::from_secs(1), None)
            .await
            .unwrap();
        fake.render_demo(&input, &long, Duration::from_secs(30), None)
            .await
            .unwrap();

        let short_len = std::fs::metadata(&short).unwrap().len();
        let long_len = std::fs::metadata(&long).unwrap().len();
        assert!(long_len > short_len);
        assert!(std::fs::read(&long).unwrap().starts_with(b"ID3"));
    }

    #[tokio::test]
    async fn test_delayed_render_is_visible_half_written() {
        let (dir, _config) = temp_workspace();
        let fake = Arc::new(
            FakeTranscoder::with_duration(Duration::from_secs(60))
                .with_render_delay(Duration::from_millis(200)),
        );
        let output = dir.path().join("slow.mp3");

        let render = {
            let (fake, input, output) = (fake.clone(), dir.path().join("in.mp3"), output.clone());
            tokio::spawn(async move {
                fake.render_demo(&input, &output, Duration::from_secs(10), None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            std::fs::metadata(&output).unwrap().len(),
            PARTIAL_RENDER_BYTES as u64
        );

        render.await.unwrap().unwrap();
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 6 + 64 + 10 * 128);
        assert_eq!(fake.rendered_lengths().len(), 1);
    }
}
