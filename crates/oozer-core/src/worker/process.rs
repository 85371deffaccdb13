//! Child process execution with output capture and a hard timeout.
//!
//! Argv is dispatched directly (no shell). Stdout and stderr are read
//! concurrently with the wait so a chatty child cannot deadlock on a full
//! pipe buffer.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};

/// Exit code written when a child exceeds its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// The captured result of one child process execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub pid: Option<i64>,
    pub timed_out: bool,
}

/// A spawned child whose pid is known before it finishes.
pub struct RunningChild {
    child: tokio::process::Child,
    stdout_pipe: Option<ChildStdout>,
    stderr_pipe: Option<ChildStderr>,
    pid: Option<u32>,
}

/// Spawn an argv vector with piped stdout/stderr.
pub fn spawn_argv(argv: &[String]) -> Result<RunningChild> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {program:?}"))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let pid = child.id();

    Ok(RunningChild {
        child,
        stdout_pipe,
        stderr_pipe,
        pid,
    })
}

impl RunningChild {
    pub fn pid(&self) -> Option<i64> {
        self.pid.map(i64::from)
    }

    /// Wait for the child under `timeout`, capturing output trimmed to the
    /// byte caps.
    ///
    /// On timeout the child is killed and the output carries exit code 124
    /// with a timeout message in stderr.
    pub async fn wait(
        mut self,
        timeout: Duration,
        max_stdout: usize,
        max_stderr: usize,
    ) -> Result<CommandOutput> {
        let mut stdout_pipe = self.stdout_pipe.take();
        let mut stderr_pipe = self.stderr_pipe.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(timeout, async {
            let (wait_result, stdout, stderr) =
                tokio::join!(self.child.wait(), read_stdout, read_stderr);
            (wait_result, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => Ok(CommandOutput {
                // A signal-terminated child has no exit code; report 1.
                exit_code: status.code().map(i64::from).unwrap_or(1),
                stdout: truncate_utf8(&stdout, max_stdout),
                stderr: truncate_utf8(&stderr, max_stderr),
                pid: self.pid.map(i64::from),
                timed_out: false,
            }),
            Ok((Err(e), _, _)) => Err(e).context("failed to wait on child process"),
            Err(_) => {
                let _ = self.child.kill().await;
                Ok(CommandOutput {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!(
                        "task execution timed out after {}s",
                        timeout.as_secs()
                    ),
                    pid: self.pid.map(i64::from),
                    timed_out: true,
                })
            }
        }
    }
}

/// Spawn and wait in one step.
pub async fn run_argv(
    argv: &[String],
    timeout: Duration,
    max_stdout: usize,
    max_stderr: usize,
) -> Result<CommandOutput> {
    spawn_argv(argv)?
        .wait(timeout, max_stdout, max_stderr)
        .await
}

/// Truncate a string to at most `max` bytes without splitting a UTF-8
/// character.
pub fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}
