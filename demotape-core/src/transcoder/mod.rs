//! External transcoder invocation shared by demo generation and format bundling.

pub mod ffmpeg;
pub mod process;

use std::path::PathBuf;

pub use ffmpeg::{FfmpegTranscoder, Transcoder, parse_duration};
pub use process::{ProcessOutcome, ProcessOutput, run_process};

/// Errors from transcoder discovery and invocation.
///
/// None of these are fatal to a request: demo generation falls back to byte
/// truncation and batch processing skips the affected file.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Transcoder unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcoder timed out after {seconds} seconds")]
    TimedOut { seconds: u64 },

    #[error("Transcoder exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Duration probe failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("Transcoder produced no output at {path}")]
    EmptyOutput { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
