//! Optional pre-task hook, configured once per worker.
//!
//! The argv form (`PRE_TASK_CMD`) is preferred and runs without a shell.
//! The legacy shell form (`PRE_TASK_SHELL_CMD`) still works but logs a
//! deprecation warning on every run.

use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::process::{self, CommandOutput};

/// The resolved hook configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreTaskHook {
    None,
    Argv(Vec<String>),
    Shell(String),
}

impl PreTaskHook {
    /// Resolve from the two environment-driven settings. The argv form
    /// wins when both are set.
    pub fn resolve(pre_task_cmd: &str, pre_task_shell_cmd: &str) -> Self {
        let cmd = pre_task_cmd.trim();
        if !cmd.is_empty() {
            return Self::Argv(split_argv(cmd));
        }
        let shell_cmd = pre_task_shell_cmd.trim();
        if !shell_cmd.is_empty() {
            return Self::Shell(shell_cmd.to_owned());
        }
        Self::None
    }

    /// Run the hook, if configured, under the task timeout.
    ///
    /// Returns `None` when no hook is configured.
    pub async fn run(
        &self,
        timeout: Duration,
        max_stdout: usize,
        max_stderr: usize,
    ) -> Result<Option<CommandOutput>> {
        match self {
            Self::None => Ok(None),
            Self::Argv(argv) => {
                let out = process::run_argv(argv, timeout, max_stdout, max_stderr).await?;
                Ok(Some(out))
            }
            Self::Shell(cmd) => {
                warn!("PRE_TASK_SHELL_CMD is deprecated and less secure. Prefer PRE_TASK_CMD.");
                let argv = vec!["sh".to_owned(), "-c".to_owned(), cmd.clone()];
                let out = process::run_argv(&argv, timeout, max_stdout, max_stderr).await?;
                Ok(Some(out))
            }
        }
    }
}

/// Split a command line into argv parts, honoring single quotes, double
/// quotes, and backslash escapes outside single quotes.
pub fn split_argv(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    parts.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if next == '"' || next == '\\' {
                                    current.push(next);
                                    chars.next();
                                } else {
                                    current.push('\\');
                                }
                            }
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }

    if in_word {
        parts.push(current);
    }

    parts
}
