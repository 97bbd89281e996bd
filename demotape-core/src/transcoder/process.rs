//! Bounded subprocess execution.
//!
//! Arguments are passed as an argv vector and never through a shell. Every run
//! has a hard timeout; the child is killed when the timeout elapses.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use super::TranscodeError;

/// Captured output of a process that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Diagnostic output as lossy UTF-8.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How a process run ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Exit status zero.
    Completed(ProcessOutput),
    /// Killed after exceeding the timeout.
    TimedOut { after: Duration },
    /// Exited with a failure status; `code` is `None` when killed by a signal.
    NonZeroExit { code: Option<i32>, stderr: String },
}

impl ProcessOutcome {
    /// Diagnostic output regardless of exit status, if any was captured.
    ///
    /// Probing tools such as ffmpeg report stream information on stderr even
    /// when they exit with a failure status.
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            ProcessOutcome::Completed(output) => Some(output.stderr_text()),
            ProcessOutcome::NonZeroExit { stderr, .. } => Some(stderr.clone()),
            ProcessOutcome::TimedOut { .. } => None,
        }
    }

    /// Converts anything other than a clean exit into a `TranscodeError`.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::TimedOut` - Process exceeded its deadline
    /// - `TranscodeError::NonZeroExit` - Process reported failure
    pub fn into_result(self) -> Result<ProcessOutput, TranscodeError> {
        match self {
            ProcessOutcome::Completed(output) => Ok(output),
            ProcessOutcome::TimedOut { after } => Err(TranscodeError::TimedOut {
                seconds: after.as_secs(),
            }),
            ProcessOutcome::NonZeroExit { code, stderr } => {
                Err(TranscodeError::NonZeroExit { code, stderr })
            }
        }
    }
}

/// Runs `program` with `args`, capturing stdout and stderr.
///
/// Stdin is closed. The child is spawned with `kill_on_drop`, so dropping the
/// wait future on timeout terminates it.
///
/// # Errors
///
/// - `TranscodeError::Spawn` - Program could not be started
pub async fn run_process(
    program: &Path,
    args: &[OsString],
    timeout: Duration,
) -> Result<ProcessOutcome, TranscodeError> {
    let started = Instant::now();

    tracing::debug!("Running {} {:?}", program.display(), args);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TranscodeError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::warn!(
                "{} timed out after {:?}, process killed",
                program.display(),
                timeout
            );
            return Ok(ProcessOutcome::TimedOut { after: timeout });
        }
    };

    let elapsed = started.elapsed();

    if output.status.success() {
        tracing::trace!("{} finished in {:?}", program.display(), elapsed);
        Ok(ProcessOutcome::Completed(ProcessOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
        }))
    } else {
        Ok(ProcessOutcome::NonZeroExit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[tokio::test]
    async fn test_completed_process_captures_output() {
        let outcome = run_process(
            Path::new("/bin/sh"),
            &args(&["-c", "echo out; echo err 1>&2"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        match outcome {
            ProcessOutcome::Completed(output) => {
                assert_eq!(output.stdout, b"out\n");
                assert_eq!(output.stderr_text(), "err\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr() {
        let outcome = run_process(
            Path::new("/bin/sh"),
            &args(&["-c", "echo Duration: 00:00:01.00 1>&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            ProcessOutcome::NonZeroExit { code: Some(3), .. }
        ));
        assert!(outcome.diagnostics().unwrap().contains("Duration"));
        assert!(matches!(
            outcome.into_result(),
            Err(TranscodeError::NonZeroExit { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let outcome = run_process(
            Path::new("/bin/sh"),
            &args(&["-c", "sleep 10"]),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = run_process(
            Path::new("/nonexistent/transcoder"),
            &[],
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }
}
