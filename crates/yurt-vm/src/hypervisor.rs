//! Hypervisor control surface.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

/// What the hypervisor reports about a registered VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescription {
    /// Whether the VM is powered on
    pub running: bool,
    /// Configured memory in MiB
    pub memory_mib: u32,
    /// Configured virtual CPUs
    pub cpus: u32,
}

/// Address assignment of a host-only interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Transport protocol of a NAT forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A NAT port forwarding rule from a host port to a guest port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub name: String,
    pub protocol: Protocol,
    pub host_port: u16,
    pub guest_port: u16,
}

impl PortForwardRule {
    pub fn tcp(name: impl Into<String>, host_port: u16, guest_port: u16) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Tcp,
            host_port,
            guest_port,
        }
    }
}

impl fmt::Display for PortForwardRule {
    /// `name,proto,host-ip,host-port,guest-ip,guest-port` with both IPs left empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},,{},,{}",
            self.name, self.protocol, self.host_port, self.guest_port
        )
    }
}

/// NIC settings applied in one modify call, keyed by option name.
pub type NicSettings = BTreeMap<String, String>;

/// Typed wrapper over the hypervisor command-line tool.
///
/// Implementations hold no state between calls. `describe` must report an
/// unregistered VM as [`AdapterError::NotFound`](crate::AdapterError::NotFound),
/// and so must `remove_port_forward_rule` for a rule that does not exist.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    /// Register a VM from an appliance image under `name`.
    async fn import(&self, name: &str, image: &Path, install_dir: &Path, memory_mib: u32)
        -> Result<()>;

    async fn describe(&self, name: &str) -> Result<VmDescription>;

    /// Power on headless.
    async fn start(&self, name: &str) -> Result<()>;

    /// Request an ACPI shutdown, or cut power when `force` is set.
    async fn stop(&self, name: &str, force: bool) -> Result<()>;

    /// Unregister the VM and delete its attached disks.
    async fn destroy(&self, name: &str) -> Result<()>;

    async fn create_disk(&self, path: &Path, size_mb: u64) -> Result<()>;

    async fn clone_disk(&self, source: &Path, destination: &Path) -> Result<()>;

    async fn attach_disk(&self, name: &str, path: &Path, port: u32) -> Result<()>;

    async fn list_host_only_interfaces(&self) -> Result<Vec<String>>;

    /// Create a host-only interface. The tool does not report the new name.
    async fn create_host_only_interface(&self) -> Result<()>;

    async fn interface_info(&self, interface: &str) -> Result<InterfaceInfo>;

    async fn remove_host_only_interface(&self, interface: &str) -> Result<()>;

    async fn modify_nic(&self, name: &str, settings: &NicSettings) -> Result<()>;

    async fn add_port_forward_rule(&self, name: &str, rule: &PortForwardRule) -> Result<()>;

    async fn remove_port_forward_rule(&self, name: &str, rule_name: &str) -> Result<()>;
}
