//! Remote command execution inside the guest.

use crate::command::ToolCommand;
use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Exit status the OpenSSH client reserves for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Blocking-style command channel into the guest.
///
/// Fails with [`AdapterError::Unreachable`] when the guest cannot be reached
/// and [`AdapterError::CommandFailed`] when the command ran and failed.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` in the guest reachable on host `port`, returning stdout.
    async fn run(&self, port: u16, command: &str, stdin: Option<&str>) -> Result<String>;
}

/// [`RemoteExec`] over the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshChannel {
    executable: PathBuf,
    host: String,
    user: String,
    key_file: PathBuf,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshChannel {
    pub fn new(user: impl Into<String>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            executable: PathBuf::from("ssh"),
            host: "127.0.0.1".into(),
            user: user.into(),
            key_file: key_file.into(),
            known_hosts: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(900),
        }
    }

    /// Record guest host keys in a dedicated file instead of the user's.
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Bound every remote command, including connection setup, by `timeout`.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn command(&self, port: u16, remote_command: &str) -> ToolCommand {
        let known_hosts = self
            .known_hosts
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/dev/null".into());

        ToolCommand::new(&self.executable)
            .args([
                "-p".to_string(),
                port.to_string(),
                "-i".into(),
                self.key_file.to_string_lossy().to_string(),
                "-o".into(),
                "BatchMode=yes".into(),
                "-o".into(),
                "IdentitiesOnly=yes".into(),
                "-o".into(),
                "StrictHostKeyChecking=no".into(),
                "-o".into(),
                format!("UserKnownHostsFile={known_hosts}"),
                "-o".into(),
                format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
                format!("{}@{}", self.user, self.host),
                remote_command.into(),
            ])
            .timeout(self.command_timeout)
    }
}

#[async_trait]
impl RemoteExec for SshChannel {
    async fn run(&self, port: u16, command: &str, stdin: Option<&str>) -> Result<String> {
        tracing::debug!(port, command = %command, "Running remote command");
        let mut cmd = self.command(port, command);
        if let Some(input) = stdin {
            cmd = cmd.stdin(input);
        }

        let out = cmd.output().await?;
        match out.code {
            Some(0) => Ok(out.stdout),
            Some(SSH_CONNECTION_FAILURE) => Err(AdapterError::Unreachable(format!(
                "ssh to {}:{port} failed: {}",
                self.host, out.stderr
            ))),
            _ => Err(cmd.failure(&out)),
        }
    }
}
