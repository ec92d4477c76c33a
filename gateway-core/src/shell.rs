//! Shell-command runner (spec §4.14).
//!
//! Grounded on `plugins/shell_command.py::ShellCommand`: spawn, poll every
//! 50ms, SIGTERM on timeout, line-buffered streaming with partial-line
//! carryover. Command strings are split with shell-word semantics and
//! handed to `Command` argv-style, never to a shell, so the runner is not
//! subject to shell injection via the command string. `tokio::process`
//! only exposes SIGKILL (`start_kill`), so SIGTERM is sent directly via
//! `nix::sys::signal::kill`, with `start_kill` kept as the escalation
//! after a 500ms grace period.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::GatewayError;

/// Sends SIGTERM to `child`, matching `shell_command.py`'s `proc.terminate()`.
/// `start_kill` (SIGKILL) is reserved as the fallback below, not the first
/// signal sent, so a well-behaved child gets a chance to clean up.
#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// How often the runner polls for process exit while awaiting a timeout.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default timeout applied when a caller doesn't specify one (spec §5).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// A streaming output callback, invoked once per complete line (trailing
/// partial data is held until the next chunk or process exit).
pub type OutputCallback = Arc<dyn Fn(String) + Send + Sync>;

/// How the command was constructed determines whether it is run with a
/// line-buffered output callback at all; mirrors `output_cb is None`.
#[derive(Clone)]
pub struct ShellCommand {
    name: String,
    argv: Vec<String>,
    output_cb: Option<OutputCallback>,
    cancelled: Arc<AtomicBool>,
}

/// Outcome of [`ShellCommand::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    TimedOut,
}

impl ShellCommand {
    /// `cmd` is split with shell-word semantics (quotes, whitespace) but
    /// never passed to a shell.
    pub fn new(cmd: impl Into<String>, output_cb: Option<OutputCallback>) -> Result<Self, GatewayError> {
        let cmd = cmd.into();
        let expanded = shellexpand::tilde(&cmd).into_owned();
        let argv = shell_words::split(&expanded)
            .map_err(|e| GatewayError::bad_request(format!("invalid shell command ({cmd}): {e}")))?;
        if argv.is_empty() {
            return Err(GatewayError::bad_request("empty shell command"));
        }
        Ok(Self {
            name: cmd,
            argv,
            output_cb,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// External cancellation handle; `run` observes this on its next poll.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Launches the command, polling every 50ms. Returns once the process
    /// exits, is cancelled, or exceeds `timeout` (SIGTERM is sent on
    /// timeout). `timeout = None` means run to completion with no
    /// deadline. A `None` output callback forces non-verbose mode
    /// regardless of `verbose`, matching `not timeout or output_cb is None`.
    pub async fn run(&self, timeout: Option<Duration>, verbose: bool) -> Result<RunOutcome, GatewayError> {
        let verbose = verbose && self.output_cb.is_some() && timeout.is_some();
        if timeout.is_none() && self.output_cb.is_none() {
            // Fire-and-forget: spawn and don't wait.
            Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| GatewayError::internal(format!("shell_command: Command ({}) failed: {e}", self.name)))?;
            return Ok(RunOutcome::Completed);
        }

        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdout(if verbose { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GatewayError::internal(format!("shell_command: Command ({}) failed: {e}", self.name)))?;

        let mut partial = String::new();
        let mut stdout = child.stdout.take().map(BufReader::new);

        let deadline = timeout;
        let started = std::time::Instant::now();
        let outcome = loop {
            if let Some(stdout) = stdout.as_mut() {
                let mut chunk = [0u8; 4096];
                if let Ok(Ok(n)) =
                    tokio::time::timeout(Duration::from_millis(1), stdout.read(&mut chunk)).await
                {
                    if n > 0 {
                        partial.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        self.flush_complete_lines(&mut partial);
                    }
                }
            }

            if let Ok(Some(_status)) = child.try_wait() {
                break RunOutcome::Completed;
            }
            if self.cancelled.load(Ordering::Acquire) {
                terminate(&child);
                break RunOutcome::Cancelled;
            }
            if let Some(deadline) = deadline {
                if started.elapsed() >= deadline {
                    terminate(&child);
                    break RunOutcome::TimedOut;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        // Give the SIGTERM a grace period before escalating to SIGKILL.
        if outcome != RunOutcome::Completed {
            if tokio::time::timeout(Duration::from_millis(500), child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
        }

        if verbose {
            if !partial.is_empty() {
                if let Some(cb) = &self.output_cb {
                    cb(std::mem::take(&mut partial));
                }
            }
            let msg = match outcome {
                RunOutcome::Completed => format!("Command ({}) finished", self.name),
                RunOutcome::Cancelled => format!("Command ({}) cancelled", self.name),
                RunOutcome::TimedOut => format!("Command ({}) timed out", self.name),
            };
            tracing::info!("{msg}");
        }
        let _ = child.wait().await;
        Ok(outcome)
    }

    fn flush_complete_lines(&self, partial: &mut String) {
        let Some(cb) = &self.output_cb else { return };
        if let Some(idx) = partial.rfind('\n') {
            let (complete, rest) = partial.split_at(idx + 1);
            cb(complete.to_string());
            *partial = rest.to_string();
        }
    }

    /// Captures stdout, trims, and returns the decoded string. Used by
    /// the metadata pipeline to invoke the external extractor.
    pub async fn run_with_response(&self, timeout: Duration) -> Result<String, GatewayError> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GatewayError::internal(format!("shell_command: Command ({}) failed: {e}", self.name)))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        let collected = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            }
            out
        });

        let wait = tokio::time::timeout(timeout, child.wait()).await;
        if wait.is_err() {
            terminate(&child);
            if tokio::time::timeout(Duration::from_millis(500), child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
        }
        let lines = collected.await.unwrap_or_default();
        Ok(lines.join("\n"))
    }
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCommand").field("name", &self.name).finish()
    }
}

/// Builds `ShellCommand` instances; mirrors `ShellCommandFactory`, kept as
/// a thin factory so components can be handed a capability rather than
/// reaching for a global.
#[derive(Debug, Default, Clone)]
pub struct ShellCommandFactory;

impl ShellCommandFactory {
    pub fn build(&self, cmd: impl Into<String>, callback: Option<OutputCallback>) -> Result<ShellCommand, GatewayError> {
        ShellCommand::new(cmd, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_to_completion() {
        let cmd = ShellCommand::new("true", None).unwrap();
        let outcome = cmd.run(Some(Duration::from_secs(2)), false).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let cmd = ShellCommand::new("sleep 5", None).unwrap();
        let outcome = cmd.run(Some(Duration::from_millis(100)), false).await.unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let cmd = ShellCommand::new("sleep 5", None).unwrap();
        let cmd2 = cmd.clone();
        let handle = tokio::spawn(async move { cmd2.run(Some(Duration::from_secs(10)), false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cmd.cancel();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn run_with_response_captures_trimmed_stdout() {
        let cmd = ShellCommand::new("echo hello", None).unwrap();
        let out = cmd.run_with_response(Duration::from_secs(2)).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        assert!(ShellCommand::new("   ", None).is_err());
    }
}
