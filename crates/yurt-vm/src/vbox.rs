//! [`HypervisorAdapter`] backed by the `VBoxManage` command-line tool.

use crate::command::{ToolCommand, ToolOutput, DEFAULT_TIMEOUT};
use crate::error::{AdapterError, Result};
use crate::hypervisor::{HypervisorAdapter, InterfaceInfo, NicSettings, PortForwardRule, VmDescription};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage controller every disk is attached to.
const STORAGE_CONTROLLER: &str = "SCSI";

/// What a call looks up by name, and so which failure means "it is gone".
///
/// Stderr is only read as `NotFound` when it names the missing object the
/// call was about. A missing medium or file during `unregistervm` stays a
/// hard failure.
#[derive(Debug, Clone, Copy)]
enum Lookup<'a> {
    Nothing,
    Machine(&'a str),
    Interface(&'a str),
    Rule,
}

impl Lookup<'_> {
    fn is_missing(&self, stderr: &str) -> bool {
        let stderr = stderr.to_lowercase();
        match *self {
            Lookup::Nothing => false,
            Lookup::Machine(name) => stderr.contains(&format!(
                "could not find a registered machine named '{}'",
                name.to_lowercase()
            )),
            Lookup::Interface(name) => {
                stderr.contains(&format!("'{}'", name.to_lowercase()))
                    && (stderr.contains("could not be found") || stderr.contains("could not find"))
            }
            Lookup::Rule => stderr.contains("a nat rule of this name does not exist"),
        }
    }
}

/// Driver for the `VBoxManage` executable.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    executable: PathBuf,
    timeout: Duration,
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self::new("VBoxManage")
    }
}

impl VBoxManage {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound every invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand::new(&self.executable)
            .arg("-q")
            .args(args)
            .timeout(self.timeout)
    }

    async fn run<I, S>(&self, lookup: Lookup<'_>, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = self.command(args);
        let out = cmd.output().await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(classify_failure(&cmd, &out, lookup))
        }
    }
}

#[async_trait]
impl HypervisorAdapter for VBoxManage {
    async fn import(
        &self,
        name: &str,
        image: &Path,
        install_dir: &Path,
        memory_mib: u32,
    ) -> Result<()> {
        let settings_file = install_dir.join(format!("{name}.vbox"));
        tracing::info!(vm_name = %name, image = %image.display(), "Importing appliance");
        self.run(Lookup::Nothing, [
            "import".to_string(),
            path_arg(image),
            "--options".into(),
            "keepnatmacs".into(),
            "--vsys".into(),
            "0".into(),
            "--vmname".into(),
            name.into(),
            "--vsys".into(),
            "0".into(),
            "--settingsfile".into(),
            path_arg(&settings_file),
            "--vsys".into(),
            "0".into(),
            "--basefolder".into(),
            path_arg(install_dir),
            "--vsys".into(),
            "0".into(),
            "--memory".into(),
            memory_mib.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<VmDescription> {
        let output = self.run(Lookup::Machine(name), ["showvminfo", name, "--machinereadable"]).await?;
        describe_from(&parse_machine_readable(&output))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(Lookup::Machine(name), ["startvm", name, "--type", "headless"]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let action = if force { "poweroff" } else { "acpipowerbutton" };
        self.run(Lookup::Machine(name), ["controlvm", name, action]).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.run(Lookup::Machine(name), ["unregistervm", "--delete", name]).await?;
        Ok(())
    }

    async fn create_disk(&self, path: &Path, size_mb: u64) -> Result<()> {
        self.run(Lookup::Nothing, [
            "createmedium".to_string(),
            "disk".into(),
            "--filename".into(),
            path_arg(path),
            "--size".into(),
            size_mb.to_string(),
            "--format".into(),
            "VMDK".into(),
        ])
        .await?;
        Ok(())
    }

    async fn clone_disk(&self, source: &Path, destination: &Path) -> Result<()> {
        self.run(Lookup::Nothing, ["clonemedium".to_string(), path_arg(source), path_arg(destination)])
            .await?;
        Ok(())
    }

    async fn attach_disk(&self, name: &str, path: &Path, port: u32) -> Result<()> {
        self.run(Lookup::Machine(name), [
            "storageattach".to_string(),
            name.into(),
            "--storagectl".into(),
            STORAGE_CONTROLLER.into(),
            "--medium".into(),
            path_arg(path),
            "--port".into(),
            port.to_string(),
            "--type".into(),
            "hdd".into(),
        ])
        .await?;
        Ok(())
    }

    async fn list_host_only_interfaces(&self) -> Result<Vec<String>> {
        let output = self.run(Lookup::Nothing, ["list", "hostonlyifs"]).await?;
        Ok(parse_host_only_interfaces(&output)
            .into_iter()
            .filter_map(|block| block.get("Name").cloned())
            .collect())
    }

    async fn create_host_only_interface(&self) -> Result<()> {
        self.run(Lookup::Nothing, ["hostonlyif", "create"]).await?;
        Ok(())
    }

    async fn interface_info(&self, interface: &str) -> Result<InterfaceInfo> {
        let output = self.run(Lookup::Nothing, ["list", "hostonlyifs"]).await?;
        let block = parse_host_only_interfaces(&output)
            .into_iter()
            .find(|block| block.get("Name").map(String::as_str) == Some(interface))
            .ok_or_else(|| AdapterError::NotFound(format!("host-only interface {interface}")))?;
        interface_from(interface, &block)
    }

    async fn remove_host_only_interface(&self, interface: &str) -> Result<()> {
        self.run(Lookup::Interface(interface), ["hostonlyif", "remove", interface]).await?;
        Ok(())
    }

    async fn modify_nic(&self, name: &str, settings: &NicSettings) -> Result<()> {
        let mut args = vec!["modifyvm".to_string(), name.to_string()];
        for (key, value) in settings {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        self.run(Lookup::Machine(name), args).await?;
        Ok(())
    }

    async fn add_port_forward_rule(&self, name: &str, rule: &PortForwardRule) -> Result<()> {
        self.run(
            Lookup::Machine(name),
            ["controlvm".to_string(), name.into(), "natpf1".into(), rule.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn remove_port_forward_rule(&self, name: &str, rule_name: &str) -> Result<()> {
        self.run(Lookup::Rule, ["controlvm", name, "natpf1", "delete", rule_name])
            .await?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Map a failed invocation to `NotFound` when stderr names the looked-up object.
fn classify_failure(cmd: &ToolCommand, out: &ToolOutput, lookup: Lookup<'_>) -> AdapterError {
    if lookup.is_missing(&out.stderr) {
        AdapterError::NotFound(out.stderr.clone())
    } else {
        cmd.failure(out)
    }
}

/// Parse `showvminfo --machinereadable` output into unquoted key/value pairs.
pub fn parse_machine_readable(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (unquote(key), unquote(value)))
        .collect()
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

fn describe_from(info: &BTreeMap<String, String>) -> Result<VmDescription> {
    let field = |key: &str| {
        info.get(key)
            .ok_or_else(|| AdapterError::Malformed(format!("showvminfo is missing {key}")))
    };
    let number = |key: &str| -> Result<u32> {
        field(key)?
            .parse()
            .map_err(|_| AdapterError::Malformed(format!("showvminfo {key} is not a number")))
    };

    Ok(VmDescription {
        running: field("VMState")? == "running",
        memory_mib: number("memory")?,
        cpus: number("cpus")?,
    })
}

/// Split `list hostonlyifs` output into one key/value map per interface.
///
/// Blocks are separated by blank lines; each line is `Key:   value`.
pub fn parse_host_only_interfaces(output: &str) -> Vec<BTreeMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = BTreeMap::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn interface_from(name: &str, block: &BTreeMap<String, String>) -> Result<InterfaceInfo> {
    let address = |key: &str| -> Result<Ipv4Addr> {
        block
            .get(key)
            .ok_or_else(|| AdapterError::Malformed(format!("interface {name} has no {key}")))?
            .parse()
            .map_err(|_| AdapterError::Malformed(format!("interface {name} has invalid {key}")))
    };
    Ok(InterfaceInfo {
        name: name.to_string(),
        ip: address("IPAddress")?,
        netmask: address("NetworkMask")?,
    })
}
