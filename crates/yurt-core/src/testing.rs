//! In-memory fakes of the external tools, for unit tests.

use crate::error::{Component, CoreError, Result as CoreResult};
use crate::image::ImageSource;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use yurt_vm::{
    AdapterError, HypervisorAdapter, InterfaceInfo, NetworkConfig, NicSettings, PortForwardRule,
    PortProbe, ProfileDevices, RemoteAddresses, RemoteExec, Result, RuntimeAdapter, VmDescription,
    LOCAL_REMOTE,
};

fn failed(program: &str, args: String, stderr: &str) -> AdapterError {
    AdapterError::CommandFailed {
        program: program.into(),
        args,
        code: Some(1),
        stderr: stderr.into(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeVm {
    pub running: bool,
    pub memory_mib: u32,
    pub cpus: u32,
    pub disks: BTreeMap<u32, PathBuf>,
    pub nic: NicSettings,
    pub rules: BTreeMap<String, PortForwardRule>,
}

#[derive(Debug, Default)]
pub struct HypervisorState {
    pub vms: BTreeMap<String, FakeVm>,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
    pub disks: BTreeSet<PathBuf>,
    pub calls: Vec<String>,
    pub next_interface: u8,
    pub import_delay: Option<Duration>,
    pub fail_import: bool,
    pub fail_create_interface: bool,
    /// VMs ignore the ACPI power button.
    pub ignore_acpi: bool,
    /// Host ports the NAT engine refuses to bind.
    pub refused_host_ports: BTreeSet<u16>,
}

/// Hypervisor that keeps its VMs, interfaces and rules in memory.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn with<T>(&self, f: impl FnOnce(&mut HypervisorState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn register(&self, name: &str, running: bool) {
        self.with(|s| {
            s.vms.insert(
                name.to_string(),
                FakeVm {
                    running,
                    memory_mib: 2048,
                    cpus: 2,
                    ..FakeVm::default()
                },
            )
        });
    }

    pub fn set_running(&self, name: &str, running: bool) {
        self.with(|s| {
            if let Some(vm) = s.vms.get_mut(name) {
                vm.running = running;
            }
        });
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.with(|s| s.vms.get(name).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Add a host-only interface that was not created through the adapter.
    pub fn add_interface(&self, name: &str) {
        self.with(|s| {
            let n = s.next_interface;
            s.next_interface += 1;
            s.interfaces.insert(name.to_string(), interface(name, n));
        });
    }

    fn record(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }

    fn vm_mut<T>(&self, name: &str, f: impl FnOnce(&mut FakeVm) -> Result<T>) -> Result<T> {
        self.with(|s| match s.vms.get_mut(name) {
            Some(vm) => f(vm),
            None => Err(AdapterError::NotFound(name.to_string())),
        })
    }
}

fn interface(name: &str, n: u8) -> InterfaceInfo {
    InterfaceInfo {
        name: name.to_string(),
        ip: Ipv4Addr::new(192, 168, 56 + n, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    }
}

#[async_trait]
impl HypervisorAdapter for FakeHypervisor {
    async fn import(&self, name: &str, _image: &Path, _install_dir: &Path, memory_mib: u32) -> Result<()> {
        self.record(format!("import {name}"));
        if let Some(delay) = self.with(|s| s.import_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_import {
                return Err(failed("VBoxManage", format!("import {name}"), "appliance is corrupt"));
            }
            s.vms.insert(
                name.to_string(),
                FakeVm {
                    memory_mib,
                    cpus: 2,
                    ..FakeVm::default()
                },
            );
            Ok(())
        })
    }

    async fn describe(&self, name: &str) -> Result<VmDescription> {
        self.vm_mut(name, |vm| {
            Ok(VmDescription {
                running: vm.running,
                memory_mib: vm.memory_mib,
                cpus: vm.cpus,
            })
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(format!("start {name}"));
        self.vm_mut(name, |vm| {
            vm.running = true;
            Ok(())
        })
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        self.record(format!("stop {name} force={force}"));
        let ignore_acpi = self.with(|s| s.ignore_acpi);
        self.vm_mut(name, |vm| {
            if !vm.running {
                return Err(failed("VBoxManage", format!("controlvm {name}"), "machine is not running"));
            }
            if force || !ignore_acpi {
                vm.running = false;
            }
            Ok(())
        })
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {name}"));
        self.with(|s| match s.vms.remove(name) {
            Some(vm) => {
                for path in vm.disks.values() {
                    s.disks.remove(path);
                }
                Ok(())
            }
            None => Err(AdapterError::NotFound(name.to_string())),
        })
    }

    async fn create_disk(&self, path: &Path, _size_mb: u64) -> Result<()> {
        self.record(format!("create_disk {}", path.display()));
        self.with(|s| s.disks.insert(path.to_path_buf()));
        Ok(())
    }

    async fn clone_disk(&self, _source: &Path, destination: &Path) -> Result<()> {
        self.record(format!("clone_disk {}", destination.display()));
        self.with(|s| s.disks.insert(destination.to_path_buf()));
        Ok(())
    }

    async fn attach_disk(&self, name: &str, path: &Path, port: u32) -> Result<()> {
        self.record(format!("attach_disk {name} {port}"));
        self.vm_mut(name, |vm| {
            vm.disks.insert(port, path.to_path_buf());
            Ok(())
        })
    }

    async fn list_host_only_interfaces(&self) -> Result<Vec<String>> {
        Ok(self.with(|s| s.interfaces.keys().cloned().collect()))
    }

    async fn create_host_only_interface(&self) -> Result<()> {
        self.record("hostonlyif create".into());
        self.with(|s| {
            if s.fail_create_interface {
                return Err(failed("VBoxManage", "hostonlyif create".into(), "no permission"));
            }
            let n = s.next_interface;
            s.next_interface += 1;
            let name = format!("vboxnet{n}");
            s.interfaces.insert(name.clone(), interface(&name, n));
            Ok(())
        })
    }

    async fn interface_info(&self, name: &str) -> Result<InterfaceInfo> {
        self.with(|s| s.interfaces.get(name).cloned())
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    async fn remove_host_only_interface(&self, name: &str) -> Result<()> {
        self.record(format!("hostonlyif remove {name}"));
        self.with(|s| s.interfaces.remove(name))
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    async fn modify_nic(&self, name: &str, settings: &NicSettings) -> Result<()> {
        self.vm_mut(name, |vm| {
            vm.nic.extend(settings.clone());
            Ok(())
        })
    }

    async fn add_port_forward_rule(&self, name: &str, rule: &PortForwardRule) -> Result<()> {
        self.record(format!("natpf add {rule}"));
        let refused = self.with(|s| s.refused_host_ports.contains(&rule.host_port));
        self.vm_mut(name, |vm| {
            let args = format!("controlvm {name} natpf1 {rule}");
            if !vm.running {
                return Err(failed("VBoxManage", args, "machine is not running"));
            }
            if vm.rules.contains_key(&rule.name) {
                return Err(failed("VBoxManage", args, "a NAT rule of this name already exists"));
            }
            if refused {
                return Err(failed("VBoxManage", args, "failed to bind host port"));
            }
            vm.rules.insert(rule.name.clone(), rule.clone());
            Ok(())
        })
    }

    async fn remove_port_forward_rule(&self, name: &str, rule_name: &str) -> Result<()> {
        self.record(format!("natpf delete {rule_name}"));
        self.vm_mut(name, |vm| {
            vm.rules
                .remove(rule_name)
                .map(|_| ())
                .ok_or_else(|| AdapterError::NotFound(rule_name.to_string()))
        })
    }
}

#[derive(Debug, Default)]
pub struct RuntimeState {
    pub remotes: BTreeMap<String, String>,
    pub networks: BTreeMap<String, NetworkConfig>,
    pub profiles: BTreeMap<String, ProfileDevices>,
    pub initializations: u32,
    /// Number of upcoming `initialize` calls that fail.
    pub failing_initializations: u32,
    /// Number of upcoming `list_networks` calls that fail.
    pub failing_network_lists: u32,
    /// Network creation always fails.
    pub broken_networks: bool,
    /// Default remote; `None` is the built-in local one.
    pub default_remote: Option<String>,
    /// Number of upcoming `switch_remote` calls that fail.
    pub failing_switches: u32,
    pub remote_removals: u32,
    pub preseeds: Vec<String>,
}

/// Container runtime that keeps remotes, networks and profiles in memory.
/// Creating something that already exists fails, like the real client.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn with<T>(&self, f: impl FnOnce(&mut RuntimeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn initialize(&self, _remote: &dyn RemoteExec, ssh_port: u16, preseed: &str) -> Result<()> {
        self.with(|s| {
            s.initializations += 1;
            if s.failing_initializations > 0 {
                s.failing_initializations -= 1;
                return Err(AdapterError::Unreachable(format!("127.0.0.1:{ssh_port}")));
            }
            s.preseeds.push(preseed.to_string());
            Ok(())
        })
    }

    async fn list_remotes(&self) -> Result<RemoteAddresses> {
        Ok(self.with(|s| s.remotes.clone()))
    }

    async fn add_remote(&self, name: &str, endpoint: &str, _password: &str) -> Result<()> {
        self.with(|s| {
            if s.remotes.contains_key(name) {
                return Err(failed("lxc", format!("remote add {name}"), "remote already exists"));
            }
            s.remotes.insert(name.to_string(), endpoint.to_string());
            Ok(())
        })
    }

    async fn remove_remote(&self, name: &str) -> Result<()> {
        self.with(|s| {
            if s.remotes.remove(name).is_none() {
                return Err(AdapterError::NotFound(format!("remote {name}")));
            }
            if s.default_remote.as_deref() == Some(name) {
                s.default_remote = None;
            }
            s.remote_removals += 1;
            Ok(())
        })
    }

    async fn default_remote(&self) -> Result<String> {
        Ok(self.with(|s| {
            s.default_remote
                .clone()
                .unwrap_or_else(|| LOCAL_REMOTE.to_string())
        }))
    }

    async fn switch_remote(&self, name: &str) -> Result<()> {
        self.with(|s| {
            if s.failing_switches > 0 {
                s.failing_switches -= 1;
                return Err(failed("lxc", format!("remote switch {name}"), "config file is locked"));
            }
            if name != LOCAL_REMOTE && !s.remotes.contains_key(name) {
                return Err(AdapterError::NotFound(format!("remote {name}")));
            }
            s.default_remote = (name != LOCAL_REMOTE).then(|| name.to_string());
            Ok(())
        })
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.with(|s| {
            if s.failing_network_lists > 0 {
                s.failing_network_lists -= 1;
                return Err(AdapterError::Timeout(Duration::from_secs(30)));
            }
            Ok(s.networks.keys().cloned().collect())
        })
    }

    async fn create_network(&self, name: &str, config: &NetworkConfig) -> Result<()> {
        self.with(|s| {
            if s.broken_networks {
                return Err(failed("lxc", format!("network create {name}"), "bridge setup failed"));
            }
            if s.networks.contains_key(name) {
                return Err(failed("lxc", format!("network create {name}"), "network already exists"));
            }
            s.networks.insert(name.to_string(), config.clone());
            Ok(())
        })
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        Ok(self.with(|s| s.profiles.keys().cloned().collect()))
    }

    async fn create_profile(&self, name: &str, devices: &ProfileDevices) -> Result<()> {
        self.with(|s| {
            if s.profiles.contains_key(name) {
                return Err(failed("lxc", format!("profile create {name}"), "profile already exists"));
            }
            s.profiles.insert(name.to_string(), devices.clone());
            Ok(())
        })
    }
}

/// Remote channel that records commands and answers with empty output.
#[derive(Debug, Default)]
pub struct FakeRemote {
    pub commands: Mutex<Vec<(u16, String)>>,
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn run(&self, port: u16, command: &str, _stdin: Option<&str>) -> Result<String> {
        self.commands.lock().unwrap().push((port, command.to_string()));
        Ok(String::new())
    }
}

/// Port probe answering from a fixed predicate, recording every port checked.
pub struct ScriptedProbe {
    answer: Box<dyn Fn(u16) -> bool + Send + Sync>,
    checked: Mutex<Vec<u16>>,
}

impl ScriptedProbe {
    pub fn new(answer: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        Self {
            answer: Box::new(answer),
            checked: Mutex::new(Vec::new()),
        }
    }

    pub fn always() -> Self {
        Self::new(|_| true)
    }

    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn checked(&self) -> Vec<u16> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortProbe for ScriptedProbe {
    async fn check(&self, port: u16) -> bool {
        self.checked.lock().unwrap().push(port);
        (self.answer)(port)
    }
}

/// Image source with a fixed answer.
#[derive(Debug, Default)]
pub struct FakeImage {
    pub missing: bool,
}

#[async_trait]
impl ImageSource for FakeImage {
    async fn ensure_image(&self) -> CoreResult<PathBuf> {
        if self.missing {
            return Err(CoreError::infra(Component::Image)(AdapterError::NotFound(
                "yurt-base.ova".into(),
            )));
        }
        Ok(PathBuf::from("/images/yurt-base.ova"))
    }
}
