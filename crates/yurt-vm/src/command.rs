//! Process invocation shared by the tool adapters.
//!
//! Every external tool is driven the same way: argv in, exit code and
//! stdout/stderr out, bounded by a timeout.

use crate::error::{AdapterError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default bound for a single tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A single invocation of an external program.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Space-joined argument list, for logs and error messages.
    pub fn display_args(&self) -> String {
        self.args.join(" ")
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    /// Run to completion and return the raw output regardless of exit code.
    pub async fn output(&self) -> Result<ToolOutput> {
        let program = self.program_name();
        tracing::debug!(program = %program, args = %self.display_args(), "Running tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(program = %program, timeout_secs = self.timeout.as_secs(), "Tool timed out");
                return Err(AdapterError::Timeout(self.timeout));
            }
        };

        let out = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        tracing::trace!(program = %program, code = ?out.code, stdout = %out.stdout, stderr = %out.stderr, "Tool finished");
        Ok(out)
    }

    /// Run to completion, failing on a nonzero exit code.
    pub async fn run(&self) -> Result<String> {
        let out = self.output().await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(self.failure(&out))
        }
    }

    /// Build the `CommandFailed` error for a finished invocation.
    pub fn failure(&self, out: &ToolOutput) -> AdapterError {
        AdapterError::CommandFailed {
            program: self.program_name(),
            args: self.display_args(),
            code: out.code,
            stderr: out.stderr.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_args() {
        let cmd = ToolCommand::new("VBoxManage")
            .arg("-q")
            .args(["showvminfo", "yurt-1", "--machinereadable"]);
        assert_eq!(cmd.display_args(), "-q showvminfo yurt-1 --machinereadable");
        assert_eq!(cmd.program_name(), "VBoxManage");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ToolCommand::new("/nonexistent/yurt-test-binary")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo nope >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            AdapterError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = ToolCommand::new("cat").stdin("preseed: true").run().await.unwrap();
        assert_eq!(out, "preseed: true");
    }
}
