//! Host-only network setup for the VM's second NIC.

use crate::cleanup::{remove_idempotent, Removal};
use crate::error::{Component, CoreError, Result};
use crate::facts::{FactKey, FactStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use yurt_vm::{HypervisorAdapter, NicSettings};

/// The host-only interface bound to the VM, as recorded in the facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub interface_name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl NetworkBinding {
    /// Load the binding from the facts, if one was recorded.
    pub async fn load(facts: &FactStore) -> Result<Option<Self>> {
        let env = facts.environment().await?;
        let (Some(interface_name), Some(ip), Some(netmask)) = (
            env.interface,
            env.interface_ip_address,
            env.interface_netmask,
        ) else {
            return Ok(None);
        };

        let parse = |raw: &str, key: FactKey| {
            raw.parse::<Ipv4Addr>()
                .map_err(|_| CoreError::ConfigRead {
                    path: facts.path().to_path_buf(),
                    reason: format!("fact {key} is not an IPv4 address: '{raw}'"),
                })
        };

        Ok(Some(Self {
            interface_name,
            ip: parse(&ip, FactKey::InterfaceIpAddress)?,
            netmask: parse(&netmask, FactKey::InterfaceNetmask)?,
        }))
    }

    async fn persist(&self, facts: &FactStore) -> Result<()> {
        facts.set(FactKey::Interface, &self.interface_name).await?;
        facts.set(FactKey::InterfaceIpAddress, self.ip).await?;
        facts.set(FactKey::InterfaceNetmask, self.netmask).await
    }
}

/// Guest NIC layout: NIC1 on NAT, NIC2 bridged onto the host-only interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicLayout {
    pub nat_network: String,
    pub nic_type: String,
}

impl Default for NicLayout {
    fn default() -> Self {
        Self {
            nat_network: "10.0.2.0/24".into(),
            nic_type: "virtio".into(),
        }
    }
}

impl NicLayout {
    /// Settings for one modify call. NIC2 is promiscuous so traffic for the
    /// guest's own container bridge reaches the host.
    pub fn settings(&self, interface_name: &str) -> NicSettings {
        NicSettings::from([
            ("nic1".to_string(), "nat".to_string()),
            ("nictype1".to_string(), self.nic_type.clone()),
            ("natnet1".to_string(), self.nat_network.clone()),
            ("natdnshostresolver1".to_string(), "on".to_string()),
            ("nic2".to_string(), "hostonly".to_string()),
            ("nictype2".to_string(), self.nic_type.clone()),
            ("hostonlyadapter2".to_string(), interface_name.to_string()),
            ("nicpromisc2".to_string(), "allow-all".to_string()),
        ])
    }
}

/// Creates the host-only interface and wires the VM onto it.
#[derive(Clone)]
pub struct NetworkBootstrapper {
    hypervisor: Arc<dyn HypervisorAdapter>,
    facts: Arc<FactStore>,
    layout: NicLayout,
}

impl NetworkBootstrapper {
    pub fn new(hypervisor: Arc<dyn HypervisorAdapter>, facts: Arc<FactStore>, layout: NicLayout) -> Self {
        Self {
            hypervisor,
            facts,
            layout,
        }
    }

    /// Create a host-only interface, record it, and bridge NIC2 onto it.
    ///
    /// # Errors
    /// Any failure is reported as `NetworkInitializationFailed`; the caller
    /// rolls back.
    pub async fn setup(&self, vm_name: &str) -> Result<NetworkBinding> {
        tracing::info!(vm_name = %vm_name, "Installing host network interface");
        self.try_setup(vm_name).await.map_err(|e| {
            tracing::error!(vm_name = %vm_name, error = %e, "Network initialization failed");
            CoreError::NetworkInitializationFailed(Box::new(e))
        })
    }

    async fn try_setup(&self, vm_name: &str) -> Result<NetworkBinding> {
        let before: BTreeSet<String> = self
            .hypervisor
            .list_host_only_interfaces()
            .await
            .map_err(CoreError::infra(Component::Network))?
            .into_iter()
            .collect();
        self.hypervisor
            .create_host_only_interface()
            .await
            .map_err(CoreError::infra(Component::Network))?;
        let after: BTreeSet<String> = self
            .hypervisor
            .list_host_only_interfaces()
            .await
            .map_err(CoreError::infra(Component::Network))?
            .into_iter()
            .collect();

        let interface_name = new_interface(&before, &after)?;
        tracing::debug!(interface = %interface_name, "Host-only interface created");

        let info = self
            .hypervisor
            .interface_info(&interface_name)
            .await
            .map_err(CoreError::infra(Component::Network))?;

        let binding = NetworkBinding {
            interface_name,
            ip: info.ip,
            netmask: info.netmask,
        };
        binding.persist(&self.facts).await?;

        self.hypervisor
            .modify_nic(vm_name, &self.layout.settings(&binding.interface_name))
            .await
            .map_err(CoreError::infra(Component::Network))?;

        tracing::info!(
            vm_name = %vm_name,
            interface = %binding.interface_name,
            ip = %binding.ip,
            netmask = %binding.netmask,
            "Host network configured"
        );
        Ok(binding)
    }

    /// Remove the recorded host-only interface, if any.
    pub async fn teardown(&self) -> Result<Removal> {
        let Some(interface) = self.facts.get(FactKey::Interface).await? else {
            tracing::debug!("No host-only interface recorded");
            return Ok(Removal::AlreadyAbsent);
        };
        tracing::info!(interface = %interface, "Removing host network interface");
        remove_idempotent(
            &format!("host-only interface {interface}"),
            self.hypervisor.remove_host_only_interface(&interface),
        )
        .await
        .map_err(CoreError::infra(Component::Network))
    }
}

/// The single interface present in `after` but not in `before`.
fn new_interface(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Result<String> {
    let mut created = after.difference(before);
    match (created.next(), created.next()) {
        (Some(name), None) => Ok(name.clone()),
        (None, _) => Err(CoreError::InconsistentEnvironment(
            "host-only interface was not created".into(),
        )),
        (Some(_), Some(_)) => Err(CoreError::InconsistentEnvironment(
            "more than one host-only interface appeared; cannot tell which is ours".into(),
        )),
    }
}
