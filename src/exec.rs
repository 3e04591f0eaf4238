//! Bounded external-process execution.
//!
//! Both the compiled inference provider and the ffmpeg preprocessing stage
//! shell out to executables that must never hang the engine: every run has a
//! deadline, honors cooperative cancellation, and captures stdout/stderr for
//! diagnostics. The child is killed on deadline expiry or cancellation.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

/// Poll interval while waiting for the child to exit.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Captured output of a completed child process.
#[derive(Debug)]
pub(crate) struct ExecOutput {
    /// UTF-8 stdout (lossy).
    pub stdout: String,
    /// UTF-8 stderr (lossy).
    pub stderr: String,
}

/// Failure modes of a bounded run.
#[derive(Debug)]
pub(crate) enum ExecError {
    /// The executable could not be spawned (typically: not found).
    Missing(String),
    /// The child exited with a non-zero status.
    NonZero {
        code: Option<i32>,
        stderr: String,
    },
    /// The deadline elapsed before the child exited; the child was killed.
    TimedOut,
    /// Cancellation was requested; the child was killed.
    Cancelled,
    /// Pipe or wait I/O failure.
    Io(String),
}

/// Runs `command` to completion, enforcing `deadline` and `cancel`.
///
/// Stdout and stderr are drained on dedicated threads so a chatty child can
/// never fill a pipe and deadlock against the wait loop.
pub(crate) fn run_captured(
    command: &mut Command,
    deadline: Duration,
    cancel: Option<&CancelToken>,
) -> Result<ExecOutput, ExecError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExecError::Missing(e.to_string()))?;

    let stdout_reader = child.stdout.take().map(spawn_drain);
    let stderr_reader = child.stderr.take().map(spawn_drain);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(ExecError::Io(e.to_string())),
        }

        if cancel.is_some_and(CancelToken::is_cancelled) {
            kill_quietly(&mut child);
            return Err(ExecError::Cancelled);
        }
        if started.elapsed() >= deadline {
            kill_quietly(&mut child);
            return Err(ExecError::TimedOut);
        }
        std::thread::sleep(WAIT_POLL);
    };

    let stdout = join_drain(stdout_reader);
    let stderr = join_drain(stderr_reader);

    if status.success() {
        Ok(ExecOutput { stdout, stderr })
    } else {
        Err(ExecError::NonZero {
            code: status.code(),
            stderr,
        })
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

fn join_drain(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill_quietly(child: &mut std::process::Child) {
    if let Err(e) = child.kill() {
        tracing::warn!("failed to kill child process: {}", e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_on_success() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_captured(&mut cmd, Duration::from_secs(5), None).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn missing_executable_is_classified() {
        let mut cmd = Command::new("definitely-not-an-executable-4a1b");
        let err = run_captured(&mut cmd, Duration::from_secs(1), None).unwrap_err();
        assert!(matches!(err, ExecError::Missing(_)));
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let err = run_captured(&mut cmd, Duration::from_secs(5), None).unwrap_err();
        match err {
            ExecError::NonZero { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected NonZero, got {other:?}"),
        }
    }

    #[test]
    fn deadline_kills_the_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let started = Instant::now();
        let err = run_captured(&mut cmd, Duration::from_millis(150), None).unwrap_err();
        assert!(matches!(err, ExecError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let err = run_captured(&mut cmd, Duration::from_secs(10), Some(&cancel)).unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }
}
