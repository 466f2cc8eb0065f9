//! Subprocess execution with timeouts
//!
//! Converters describe what to run as an [`Invocation`]; a [`ProcessRunner`]
//! executes it. The production runner spawns real processes, tests swap in a
//! scripted runner.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use super::ToolKind;

/// Maximum stderr characters kept in error values
const STDERR_EXCERPT: usize = 2000;

/// Errors raised while running external tools
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} is not available on this server")]
    Unavailable(ToolKind),

    #[error("Failed to start {description}: {source}")]
    Spawn {
        description: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{description} timed out after {secs}s")]
    Timeout { description: String, secs: u64 },

    #[error("{description} failed (exit code {code:?})")]
    Failed {
        description: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// A single external command
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Human-readable step name used in logs and errors
    pub description: String,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, description: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            description: description.into(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag` in the argument list
    pub fn value_after(&self, flag: &str) -> Option<&Path> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(Path::new)
    }

    /// Value of a `-sKEY=value` style argument
    pub fn value_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.args
            .iter()
            .filter_map(|a| a.to_str())
            .find_map(|a| a.strip_prefix(prefix))
    }

    /// Last positional argument
    pub fn last_arg(&self) -> Option<&Path> {
        self.args.last().map(Path::new)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy())
            .chain(self.args.iter().map(|a| a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a finished process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes invocations
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion; non-zero exit codes are not errors at this level
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ToolError>;
}

/// Runner spawning real subprocesses
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ToolError> {
        tracing::info!("Running {}: {}", invocation.description, invocation.command_line());

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                description: invocation.description.clone(),
                source,
            })?;

        // Dropping the future on timeout kills the child
        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                description: invocation.description.clone(),
                source,
            })?,
            Err(_) => {
                tracing::error!(
                    "{} exceeded the {}s time limit",
                    invocation.description,
                    invocation.timeout.as_secs()
                );
                return Err(ToolError::Timeout {
                    description: invocation.description.clone(),
                    secs: invocation.timeout.as_secs(),
                });
            }
        };

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run and treat a non-zero exit code as [`ToolError::Failed`]
pub async fn run_checked(
    runner: &dyn ProcessRunner,
    invocation: &Invocation,
) -> Result<ProcessOutput, ToolError> {
    let output = runner.run(invocation).await?;
    if output.success() {
        tracing::info!("{} finished successfully", invocation.description);
        return Ok(output);
    }

    tracing::error!(
        "{} failed (exit code {:?})\nstderr: {}\nstdout: {}",
        invocation.description,
        output.code,
        output.stderr.trim(),
        output.stdout.trim()
    );
    Err(ToolError::Failed {
        description: invocation.description.clone(),
        code: output.code,
        stderr: excerpt(&output.stderr),
    })
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= STDERR_EXCERPT {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(STDERR_EXCERPT)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{}", tail)
}
