//! FFmpeg-backed transcoder.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::TranscodeError;
use super::process::run_process;
use crate::audio::AudioFormat;
use crate::config::TranscoderConfig;

/// Gain applied to the watermark before mixing it under the demo.
const WATERMARK_VOLUME: f32 = 0.3;

/// Length of the fade-out applied to watermarked demos.
const FADE_OUT_SECONDS: u64 = 2;

static DURATION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex")
});

/// Operations the demo generator and format processor need from a transcoder.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Whether an executable transcoder is configured.
    fn is_available(&self) -> bool;

    /// Reads the duration of an audio file.
    ///
    /// # Errors
    /// - `TranscodeError::Unavailable` - No transcoder configured
    /// - `TranscodeError::ProbeFailed` - Duration token missing or unparseable
    async fn probe_duration(&self, input: &Path) -> Result<Duration, TranscodeError>;

    /// Re-encodes the first `length` of `input` into `output`.
    ///
    /// With a watermark, the watermark loops under the audio at low gain and
    /// the result fades out over its last two seconds.
    ///
    /// # Errors
    /// - `TranscodeError::Unavailable` - No transcoder configured
    /// - `TranscodeError::TimedOut` / `TranscodeError::NonZeroExit` - Process failed
    /// - `TranscodeError::EmptyOutput` - Process succeeded but wrote nothing
    async fn render_demo(
        &self,
        input: &Path,
        output: &Path,
        length: Duration,
        watermark: Option<&Path>,
    ) -> Result<(), TranscodeError>;

    /// Converts `input` to `format`, writing `output`.
    ///
    /// # Errors
    /// - `TranscodeError::Unavailable` - No transcoder configured
    /// - `TranscodeError::TimedOut` / `TranscodeError::NonZeroExit` - Process failed
    /// - `TranscodeError::EmptyOutput` - Process succeeded but wrote nothing
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        format: AudioFormat,
    ) -> Result<(), TranscodeError>;
}

/// Extracts the `Duration: HH:MM:SS.ff` token from ffmpeg diagnostics.
///
/// Returns `None` when the token is absent (for example `Duration: N/A`).
pub fn parse_duration(diagnostics: &str) -> Option<Duration> {
    let captures = DURATION_TOKEN.captures(diagnostics)?;
    let hours: u64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes: u64 = captures.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = captures.get(3)?.as_str().parse().ok()?;

    if minutes >= 60 || seconds >= 60.0 {
        return None;
    }

    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Transcoder that shells out to an ffmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    executable: Option<PathBuf>,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Creates a transcoder from configuration, resolving the executable once.
    ///
    /// A missing or non-executable path leaves the transcoder unavailable;
    /// callers then take their fallback paths.
    pub fn from_config(config: &TranscoderConfig) -> Self {
        let executable = config.ffmpeg_path.as_deref().and_then(resolve_executable);

        match (&config.ffmpeg_path, &executable) {
            (Some(configured), None) => tracing::warn!(
                "Transcoder {} is not executable, demos fall back to byte truncation",
                configured.display()
            ),
            (_, Some(resolved)) => tracing::info!("Using transcoder {}", resolved.display()),
            (None, None) => tracing::debug!("No transcoder configured"),
        }

        Self {
            executable,
            timeout: config.timeout,
        }
    }

    /// Transcoder with no executable, for deployments without ffmpeg.
    pub fn unavailable() -> Self {
        Self {
            executable: None,
            timeout: Duration::from_secs(1),
        }
    }

    /// The resolved executable, if any.
    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    fn program(&self) -> Result<&Path, TranscodeError> {
        self.executable
            .as_deref()
            .ok_or_else(|| TranscodeError::Unavailable {
                reason: "no ffmpeg executable configured".to_string(),
            })
    }

    async fn run_to_file(&self, args: Vec<OsString>, output: &Path) -> Result<(), TranscodeError> {
        let program = self.program()?;
        run_process(program, &args, self.timeout)
            .await?
            .into_result()?;

        let written = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if written == 0 {
            return Err(TranscodeError::EmptyOutput {
                path: output.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn is_available(&self) -> bool {
        self.executable.is_some()
    }

    async fn probe_duration(&self, input: &Path) -> Result<Duration, TranscodeError> {
        let program = self.program()?;
        let args = vec![
            OsString::from("-hide_banner"),
            OsString::from("-nostdin"),
            OsString::from("-i"),
            input.as_os_str().to_owned(),
        ];

        // Without an output file ffmpeg exits non-zero after printing stream info.
        let outcome = run_process(program, &args, self.timeout).await?;
        let diagnostics = outcome
            .diagnostics()
            .ok_or_else(|| TranscodeError::ProbeFailed {
                reason: "probe timed out".to_string(),
            })?;

        parse_duration(&diagnostics).ok_or_else(|| TranscodeError::ProbeFailed {
            reason: format!("no duration reported for {}", input.display()),
        })
    }

    async fn render_demo(
        &self,
        input: &Path,
        output: &Path,
        length: Duration,
        watermark: Option<&Path>,
    ) -> Result<(), TranscodeError> {
        let seconds = length.as_secs();
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());

        if let Some(watermark) = watermark {
            args.push("-stream_loop".into());
            args.push("-1".into());
            args.push("-i".into());
            args.push(watermark.as_os_str().to_owned());
            args.push("-filter_complex".into());
            args.push(watermark_filter(seconds).into());
            args.push("-map".into());
            args.push("[out]".into());
        } else {
            args.push("-map".into());
            args.push("0:a".into());
        }

        args.push("-t".into());
        args.push(seconds.to_string().into());
        args.extend(output_codec_args(output));
        args.push(output.as_os_str().to_owned());

        tracing::debug!(
            "Rendering {}s demo of {} into {}",
            seconds,
            input.display(),
            output.display()
        );

        self.run_to_file(args, output).await
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        format: AudioFormat,
    ) -> Result<(), TranscodeError> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());
        args.extend(["-vn", "-map_metadata", "0"].into_iter().map(OsString::from));
        args.extend(format.codec_args().iter().map(OsString::from));
        args.push(output.as_os_str().to_owned());

        tracing::debug!(
            "Converting {} to {} at {}",
            input.display(),
            format,
            output.display()
        );

        self.run_to_file(args, output).await
    }
}

fn watermark_filter(seconds: u64) -> String {
    let fade_start = seconds.saturating_sub(FADE_OUT_SECONDS);
    format!(
        "[1:a]volume={WATERMARK_VOLUME}[wm];\
         [0:a][wm]amix=inputs=2:duration=first:dropout_transition=0,\
         afade=t=out:st={fade_start}:d={FADE_OUT_SECONDS}[out]"
    )
}

fn output_codec_args(output: &Path) -> Vec<OsString> {
    output
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(AudioFormat::from_extension)
        .map(|format| format.codec_args().iter().map(OsString::from).collect())
        .unwrap_or_default()
}

fn resolve_executable(configured: &Path) -> Option<PathBuf> {
    let is_bare_name = configured.components().count() == 1 && !configured.is_absolute();

    if !is_bare_name {
        return is_executable(configured).then(|| configured.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(configured))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_token() {
        let stderr = "Input #0, mp3, from 'a.mp3':\n  Duration: 00:03:25.47, start: 0.025057, bitrate: 320 kb/s\n";
        let duration = parse_duration(stderr).unwrap();
        assert_eq!(duration.as_secs(), 205);
        assert!((duration.as_secs_f64() - 205.47).abs() < 0.001);

        assert_eq!(
            parse_duration("Duration: 01:00:00.00").unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_duration_rejects_missing_token() {
        assert!(parse_duration("Duration: N/A, bitrate: N/A").is_none());
        assert!(parse_duration("no stream information").is_none());
        assert!(parse_duration("Duration: 00:75:00.00").is_none());
    }

    #[test]
    fn test_watermark_filter_fades_tail() {
        let filter = watermark_filter(30);
        assert!(filter.contains("volume=0.3"));
        assert!(filter.contains("amix=inputs=2:duration=first"));
        assert!(filter.contains("afade=t=out:st=28:d=2"));

        assert!(watermark_filter(1).contains("st=0:d=2"));
    }

    #[test]
    fn test_codec_args_follow_output_extension() {
        let args = output_codec_args(Path::new("demo.mp3"));
        assert!(args.contains(&OsString::from("libmp3lame")));
        assert!(output_codec_args(Path::new("demo.xyz")).is_empty());
    }

    #[test]
    fn test_missing_executable_is_unavailable() {
        let transcoder = FfmpegTranscoder::from_config(&TranscoderConfig {
            ffmpeg_path: Some(PathBuf::from("/nonexistent/ffmpeg")),
            timeout: Duration::from_secs(1),
        });
        assert!(!transcoder.is_available());
        assert!(transcoder.executable().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_transcoder_refuses_work() {
        let transcoder = FfmpegTranscoder::unavailable();
        let result = transcoder.probe_duration(Path::new("a.mp3")).await;
        assert!(matches!(result, Err(TranscodeError::Unavailable { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_reads_duration_from_failing_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '  Duration: 00:00:10.00, start: 0.0' 1>&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transcoder = FfmpegTranscoder::from_config(&TranscoderConfig {
            ffmpeg_path: Some(script),
            timeout: Duration::from_secs(5),
        });
        assert!(transcoder.is_available());

        let duration = transcoder
            .probe_duration(Path::new("input.mp3"))
            .await
            .unwrap();
        assert_eq!(duration, Duration::from_secs(10));
    }
}
