//! Spawns the built FFmpeg invocation, parses its stderr for progress, and
//! supports cooperative cancellation with a bounded grace period.

use super::invocation::BuiltInvocation;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("encoder exited with status {exit_code}: {stderr_tail}")]
    EncoderFailure { exit_code: i32, stderr_tail: String },

    #[error("encoder was cancelled")]
    EncoderAborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOutcome {
    pub exit_code: i32,
}

/// Handle to a running encode: a progress stream plus a future exit result.
pub struct RunHandle {
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    result_rx: mpsc::UnboundedReceiver<Result<RunOutcome, RunError>>,
    cancel_tx: watch::Sender<bool>,
}

impl RunHandle {
    /// Receives the next progress event, or `None` once the process has
    /// exited and no more events remain.
    pub async fn next_progress(&mut self) -> Option<ProgressEvent> {
        self.progress_rx.recv().await
    }

    /// Signals cancellation. The background task will attempt a graceful
    /// termination first, then force-kill after the configured grace period.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Awaits the final result. Drains any remaining progress events first
    /// so callers that only care about the outcome don't need to poll both.
    pub async fn wait(mut self) -> Result<RunOutcome, RunError> {
        while self.progress_rx.recv().await.is_some() {}
        self.result_rx
            .recv()
            .await
            .unwrap_or(Err(RunError::EncoderAborted))
    }
}

/// Scans one stderr line for FFmpeg's `time=HH:MM:SS.xx` progress marker.
fn parse_time_marker(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + "time=".len()..];
    let token: &str = rest.split_whitespace().next()?;
    let mut parts = token.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn push_tail(tail: &mut Vec<u8>, line: &str) {
    tail.extend_from_slice(line.as_bytes());
    tail.push(b'\n');
    if tail.len() > STDERR_TAIL_BYTES {
        let excess = tail.len() - STDERR_TAIL_BYTES;
        tail.drain(0..excess);
    }
}

/// The signal that terminated `status`, if any. `None` on platforms without
/// signal semantics (e.g. Windows) or when the process exited normally.
#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn spawn_child(invocation: &BuiltInvocation) -> std::io::Result<Child> {
    Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Starts the encoder subprocess. Returns immediately with a [`RunHandle`];
/// the subprocess and its stderr consumption run on a background task.
pub async fn run(
    invocation: &BuiltInvocation,
    cancel_grace: Duration,
) -> Result<RunHandle, RunError> {
    let mut child = spawn_child(invocation)?;
    let stderr = child.stderr.take().expect("stderr was piped");

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: Vec<u8> = Vec::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            push_tail(&mut tail, &line);
                            if let Some(elapsed_secs) = parse_time_marker(&line) {
                                let _ = progress_tx.send(ProgressEvent { elapsed_secs });
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_ok() && *cancel_rx.borrow() {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        let outcome = if cancelled {
            let _ = child.start_kill();
            if timeout(cancel_grace, child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
            Err(RunError::EncoderAborted)
        } else {
            match child.wait().await {
                Ok(status) if status.success() => Ok(RunOutcome {
                    exit_code: status.code().unwrap_or(0),
                }),
                Ok(status) if signal_of(&status).is_some() => Err(RunError::EncoderAborted),
                Ok(status) => Err(RunError::EncoderFailure {
                    exit_code: status.code().unwrap_or(-1),
                    stderr_tail: String::from_utf8_lossy(&tail).into_owned(),
                }),
                Err(e) => Err(RunError::Io(e)),
            }
        };

        let _ = result_tx.send(outcome);
    });

    Ok(RunHandle {
        progress_rx,
        result_rx,
        cancel_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_marker_hms() {
        let line = "frame=  120 fps= 30 q=28.0 size=    1024kB time=00:00:04.00 bitrate= 2048.0kbits/s speed=1.0x";
        let secs = parse_time_marker(line).expect("should parse");
        assert!((secs - 4.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_time_marker_with_hours() {
        let line = "time=01:02:03.50";
        let secs = parse_time_marker(line).expect("should parse");
        assert!((secs - (3600.0 + 120.0 + 3.5)).abs() < 0.001);
    }

    #[test]
    fn test_parse_time_marker_absent_returns_none() {
        assert_eq!(parse_time_marker("frame=1 fps=30"), None);
    }

    #[test]
    fn test_tail_buffer_bounded() {
        let mut tail = Vec::new();
        for i in 0..2000 {
            push_tail(&mut tail, &format!("line {i} of stderr output padding padding"));
        }
        assert!(tail.len() <= STDERR_TAIL_BYTES);
    }

    #[tokio::test]
    async fn test_run_nonexistent_binary_returns_io_error() {
        let invocation = BuiltInvocation {
            program: "definitely-not-a-real-ffmpeg-binary".to_string(),
            args: vec![],
            var_stream_map: String::new(),
        };
        let result = run(&invocation, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RunError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_of_detects_signal_terminated_status() {
        use std::os::unix::process::ExitStatusExt;
        let killed = std::process::ExitStatus::from_raw(9); // SIGKILL, no core dump
        assert_eq!(signal_of(&killed), Some(9));

        let exited = std::process::ExitStatus::from_raw(1 << 8); // exit code 1
        assert_eq!(signal_of(&exited), None);
    }
}
