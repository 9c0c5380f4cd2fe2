//! Container runtime client.

use crate::command::ToolCommand;
use crate::error::{AdapterError, Result};
use crate::ssh::RemoteExec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Key/value configuration of a runtime network.
pub type NetworkConfig = BTreeMap<String, String>;

/// Devices of a runtime profile, keyed by device name.
pub type ProfileDevices = BTreeMap<String, BTreeMap<String, String>>;

/// Registered remotes, name to address.
pub type RemoteAddresses = BTreeMap<String, String>;

/// Remote that always exists and is never removed.
pub const LOCAL_REMOTE: &str = "local";

/// Typed wrapper over the container runtime's client.
///
/// Listing calls report what exists; callers decide what to create or
/// update by comparing against it rather than by catching duplicate-create
/// errors.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Install and configure the runtime inside the guest from a preseed
    /// document. Must be safe to re-run.
    async fn initialize(&self, remote: &dyn RemoteExec, ssh_port: u16, preseed: &str)
        -> Result<()>;

    async fn list_remotes(&self) -> Result<RemoteAddresses>;

    /// Register `endpoint` under `name`, trusting its certificate.
    async fn add_remote(&self, name: &str, endpoint: &str, password: &str) -> Result<()>;

    /// Unregister `name`. If it is the default remote, [`LOCAL_REMOTE`]
    /// becomes the default first.
    async fn remove_remote(&self, name: &str) -> Result<()>;

    /// Name of the remote client calls go to when none is given.
    async fn default_remote(&self) -> Result<String>;

    async fn switch_remote(&self, name: &str) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<String>>;

    async fn create_network(&self, name: &str, config: &NetworkConfig) -> Result<()>;

    async fn list_profiles(&self) -> Result<Vec<String>>;

    async fn create_profile(&self, name: &str, devices: &ProfileDevices) -> Result<()>;
}

/// [`RuntimeAdapter`] for LXD, driven through the `lxc` client on the host
/// and SSH inside the guest.
#[derive(Debug, Clone)]
pub struct LxcClient {
    executable: PathBuf,
    config_dir: PathBuf,
}

/// Remote commands that install LXD and apply the preseed on stdin.
const INSTALL_COMMANDS: &[&str] = &["sudo snap install lxd", "sudo lxd.migrate -yes"];
const PRESEED_COMMAND: &str = "sudo lxd init --preseed";
const INITIALIZED_MARKER_COMMAND: &str = "touch lxd-initialized";

#[derive(Debug, Deserialize)]
struct NamedEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct ProfileDocument<'a> {
    name: &'a str,
    description: String,
    config: BTreeMap<String, String>,
    devices: &'a ProfileDevices,
}

impl LxcClient {
    /// `config_dir` holds the client's certificates and remote list.
    pub fn new(executable: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config_dir: config_dir.into(),
        }
    }

    fn command<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand::new(&self.executable)
            .args(args)
            .env("LXD_CONF", self.config_dir.to_string_lossy().to_string())
    }

    async fn list_names(&self, kind: &str) -> Result<Vec<String>> {
        let output = self
            .command([kind, "list", "--format", "json"])
            .run()
            .await?;
        parse_named_list(&output)
    }
}

#[async_trait]
impl RuntimeAdapter for LxcClient {
    async fn initialize(
        &self,
        remote: &dyn RemoteExec,
        ssh_port: u16,
        preseed: &str,
    ) -> Result<()> {
        tracing::info!("Installing container runtime in guest");
        for command in INSTALL_COMMANDS {
            remote.run(ssh_port, command, None).await?;
        }
        tracing::info!("Applying runtime preseed");
        remote.run(ssh_port, PRESEED_COMMAND, Some(preseed)).await?;
        remote
            .run(ssh_port, INITIALIZED_MARKER_COMMAND, None)
            .await?;
        Ok(())
    }

    async fn list_remotes(&self) -> Result<RemoteAddresses> {
        let output = self
            .command(["remote", "list", "--format", "json"])
            .run()
            .await?;
        parse_remote_list(&output)
    }

    async fn add_remote(&self, name: &str, endpoint: &str, password: &str) -> Result<()> {
        self.command([
            "remote",
            "add",
            name,
            endpoint,
            "--password",
            password,
            "--accept-certificate",
        ])
        .run()
        .await?;
        Ok(())
    }

    async fn remove_remote(&self, name: &str) -> Result<()> {
        // The client refuses to remove its default remote
        if self.default_remote().await? == name {
            self.switch_remote(LOCAL_REMOTE).await?;
        }
        self.command(["remote", "remove", name]).run().await?;
        Ok(())
    }

    async fn default_remote(&self) -> Result<String> {
        let output = self.command(["remote", "get-default"]).run().await?;
        let name = output.trim();
        if name.is_empty() {
            return Err(AdapterError::Malformed("remote get-default printed nothing".into()));
        }
        Ok(name.to_string())
    }

    async fn switch_remote(&self, name: &str) -> Result<()> {
        self.command(["remote", "switch", name]).run().await?;
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.list_names("network").await
    }

    async fn create_network(&self, name: &str, config: &NetworkConfig) -> Result<()> {
        let mut args = vec!["network".to_string(), "create".into(), name.into()];
        args.extend(config.iter().map(|(k, v)| format!("{k}={v}")));
        self.command(args).run().await?;
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        self.list_names("profile").await
    }

    async fn create_profile(&self, name: &str, devices: &ProfileDevices) -> Result<()> {
        self.command(["profile", "create", name]).run().await?;
        // JSON is valid YAML, which is what `profile edit` reads on stdin
        let document = serde_json::to_string_pretty(&ProfileDocument {
            name,
            description: format!("{name} default profile"),
            config: BTreeMap::new(),
            devices,
        })?;
        self.command(["profile", "edit", name])
            .stdin(document)
            .run()
            .await?;
        Ok(())
    }
}

/// Parse `network list` / `profile list` JSON arrays into names.
pub fn parse_named_list(output: &str) -> Result<Vec<String>> {
    let entries: Vec<NamedEntry> = serde_json::from_str(output)?;
    Ok(entries.into_iter().map(|e| e.name).collect())
}

/// Parse `remote list` JSON, an object keyed by remote name whose entries
/// carry the address as `Addr`.
pub fn parse_remote_list(output: &str) -> Result<RemoteAddresses> {
    let value: serde_json::Value = serde_json::from_str(output)?;
    let remotes = value
        .as_object()
        .ok_or_else(|| AdapterError::Malformed("remote list is not an object".into()))?;
    remotes
        .iter()
        .map(|(name, entry)| {
            let addr = entry
                .get("Addr")
                .and_then(|a| a.as_str())
                .ok_or_else(|| AdapterError::Malformed(format!("remote {name} has no address")))?;
            Ok((name.clone(), addr.to_string()))
        })
        .collect()
}
