//! External command execution seam.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::shell::render_command_line;
use crate::error::{AppError, Result};

/// An argument-vector command. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn command_line(&self) -> String {
        render_command_line(&self.program, &self.args)
    }

    /// Whether the argument list ends with the given arguments.
    pub fn ends_with(&self, tail: &[&str]) -> bool {
        self.args.len() >= tail.len()
            && self.args[self.args.len() - tail.len()..]
                .iter()
                .zip(tail)
                .all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr if it has content, otherwise stdout.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        if detail.is_empty() {
            match self.code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            detail.to_string()
        }
    }
}

/// Runs commands to completion and captures their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// `Err` only when the command could not be run at all; a non-zero exit
    /// is reported through [`CommandOutput::success`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(|e| {
            let err = AppError::process(format!("Failed to run command: {e}"))
                .context("command", spec.command_line());
            match spec.cwd.as_deref() {
                Some(cwd) => err.context("path", display(cwd)),
                None => err,
            }
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            code: Some(1),
            stdout: "out".into(),
            stderr: "  err \n".into(),
        };
        assert_eq!(out.detail(), "err");
        let out = CommandOutput {
            code: Some(2),
            ..CommandOutput::default()
        };
        assert_eq!(out.detail(), "exit code 2");
    }

    #[test]
    fn ends_with_matches_tail() {
        let spec = CommandSpec::new("pm2", ["logs", "api", "--nostream"]);
        assert!(spec.ends_with(&["--nostream"]));
        assert!(spec.ends_with(&["api", "--nostream"]));
        assert!(!spec.ends_with(&["--version"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_output_and_status() {
        let out = SystemRunner
            .run(&CommandSpec::new("sh", ["-c", "echo hi; echo oops >&2; exit 4"]))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(4));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = SystemRunner
            .run(&CommandSpec::new("definitely-not-a-real-binary-4821", ["--version"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Process);
        assert!(err.get("command").unwrap().contains("definitely-not-a-real-binary-4821"));
    }
}
