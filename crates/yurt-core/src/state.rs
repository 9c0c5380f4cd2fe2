//! Lifecycle state, derived on demand from facts and the hypervisor.

use crate::error::{Component, CoreError, Result};
use crate::facts::{FactKey, FactStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use yurt_vm::{HypervisorAdapter, VmDescription};

/// Where the environment is in its lifecycle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    NotInitialized,
    Stopped,
    Running,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::NotInitialized => write!(f, "Not Initialized"),
            LifecycleState::Stopped => write!(f, "Stopped"),
            LifecycleState::Running => write!(f, "Running"),
        }
    }
}

/// Read-only diagnostic snapshot of the environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub state: LifecycleState,
    pub vm_name: Option<String>,
    pub memory_mib: Option<u32>,
    pub cpus: Option<u32>,
    pub ssh_port: Option<u16>,
    pub runtime_port: Option<u16>,
    pub interface: Option<String>,
    pub interface_ip_address: Option<String>,
    pub interface_netmask: Option<String>,
    pub runtime_initialized: bool,
    pub probed_at: DateTime<Utc>,
}

/// Derives [`LifecycleState`] by reading the `vm_name` fact and asking the
/// hypervisor about that VM. Nothing is cached between calls.
#[derive(Clone)]
pub struct StateProbe {
    facts: Arc<FactStore>,
    hypervisor: Arc<dyn HypervisorAdapter>,
}

impl StateProbe {
    pub fn new(facts: Arc<FactStore>, hypervisor: Arc<dyn HypervisorAdapter>) -> Self {
        Self { facts, hypervisor }
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    /// `InconsistentEnvironment` when `vm_name` is recorded but the hypervisor
    /// has no such VM; `Infrastructure` when the hypervisor cannot be queried.
    pub async fn state(&self) -> Result<LifecycleState> {
        let vm_name = self.facts.get(FactKey::VmName).await?;
        Ok(match vm_name {
            None => LifecycleState::NotInitialized,
            Some(name) => state_of(&self.describe(&name).await?),
        })
    }

    /// Diagnostic snapshot. Never changes any state.
    pub async fn info(&self) -> Result<EnvironmentInfo> {
        let facts = self.facts.environment().await?;
        let description = match &facts.vm_name {
            Some(name) => Some(self.describe(name).await?),
            None => None,
        };

        Ok(EnvironmentInfo {
            state: description
                .as_ref()
                .map(state_of)
                .unwrap_or(LifecycleState::NotInitialized),
            memory_mib: description.as_ref().map(|d| d.memory_mib),
            cpus: description.as_ref().map(|d| d.cpus),
            vm_name: facts.vm_name,
            ssh_port: facts.ssh_port,
            runtime_port: facts.runtime_port,
            interface: facts.interface,
            interface_ip_address: facts.interface_ip_address,
            interface_netmask: facts.interface_netmask,
            runtime_initialized: facts.runtime_initialized,
            probed_at: Utc::now(),
        })
    }

    async fn describe(&self, vm_name: &str) -> Result<VmDescription> {
        match self.hypervisor.describe(vm_name).await {
            Ok(description) => Ok(description),
            Err(e) if e.is_not_found() => {
                tracing::error!(vm_name = %vm_name, "Recorded VM is not registered with the hypervisor");
                Err(CoreError::InconsistentEnvironment(format!(
                    "VM '{vm_name}' is recorded but not registered with the hypervisor"
                )))
            }
            Err(e) => Err(CoreError::infra(Component::StateProbe)(e)),
        }
    }
}

fn state_of(description: &VmDescription) -> LifecycleState {
    if description.running {
        LifecycleState::Running
    } else {
        LifecycleState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHypervisor;
    use tempfile::TempDir;

    fn probe(dir: &TempDir, hypervisor: Arc<FakeHypervisor>) -> (StateProbe, Arc<FactStore>) {
        let facts = Arc::new(FactStore::new(dir.path().join("config.json")));
        (StateProbe::new(facts.clone(), hypervisor), facts)
    }

    #[tokio::test]
    async fn test_no_vm_name_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let (probe, _) = probe(&dir, Arc::new(FakeHypervisor::default()));
        assert_eq!(probe.state().await.unwrap(), LifecycleState::NotInitialized);

        let info = probe.info().await.unwrap();
        assert_eq!(info.state, LifecycleState::NotInitialized);
        assert!(info.memory_mib.is_none());
    }

    #[tokio::test]
    async fn test_power_flag_maps_to_state() {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(FakeHypervisor::default());
        hypervisor.register("yurt-a", false);
        let (probe, facts) = probe(&dir, hypervisor.clone());
        facts.set(FactKey::VmName, "yurt-a").await.unwrap();

        assert_eq!(probe.state().await.unwrap(), LifecycleState::Stopped);
        hypervisor.set_running("yurt-a", true);
        assert_eq!(probe.state().await.unwrap(), LifecycleState::Running);

        let info = probe.info().await.unwrap();
        assert_eq!(info.state, LifecycleState::Running);
        assert_eq!(info.memory_mib, Some(2048));
        assert_eq!(info.vm_name.as_deref(), Some("yurt-a"));
    }

    #[tokio::test]
    async fn test_missing_vm_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        let (probe, facts) = probe(&dir, Arc::new(FakeHypervisor::default()));
        facts.set(FactKey::VmName, "yurt-gone").await.unwrap();

        let err = probe.state().await.unwrap_err();
        assert!(matches!(err, CoreError::InconsistentEnvironment(_)));
        assert!(matches!(
            probe.info().await.unwrap_err(),
            CoreError::InconsistentEnvironment(_)
        ));
    }

    #[tokio::test]
    async fn test_info_does_not_mutate_facts() {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(FakeHypervisor::default());
        hypervisor.register("yurt-a", true);
        let (probe, facts) = probe(&dir, hypervisor);
        facts.set(FactKey::VmName, "yurt-a").await.unwrap();
        facts.set(FactKey::SshPort, 55010).await.unwrap();
        let before = facts.snapshot().await.unwrap();

        probe.info().await.unwrap();
        probe.state().await.unwrap();

        assert_eq!(facts.snapshot().await.unwrap(), before);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::NotInitialized.to_string(), "Not Initialized");
        assert_eq!(LifecycleState::Running.to_string(), "Running");
    }
}
