//! The provisioning engine: init, start, stop and destroy.

use crate::cleanup::remove_idempotent;
use crate::config::{DiskSource, EnvironmentConfig};
use crate::error::{Component, CoreError, Result};
use crate::facts::{FactKey, FactStore};
use crate::image::{ImageSource, LocalImage};
use crate::network::{NetworkBootstrapper, NicLayout};
use crate::ports::{PortAllocator, PortRequest};
use crate::runtime::RuntimeBootstrapper;
use crate::state::{EnvironmentInfo, LifecycleState, StateProbe};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use yurt_vm::{
    AdapterError, HostPortFree, HypervisorAdapter, LxcClient, PortProbe, RemoteExec,
    RuntimeAdapter, SshBannerProbe, SshChannel, VBoxManage,
};

/// The external collaborators the engine drives.
#[derive(Clone)]
pub struct Adapters {
    pub hypervisor: Arc<dyn HypervisorAdapter>,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub remote: Arc<dyn RemoteExec>,
    pub image: Arc<dyn ImageSource>,
    /// Confirms the guest's SSH server answers on a forwarded port.
    pub ssh_probe: Arc<dyn PortProbe>,
    /// Confirms a host port is free before it is forwarded.
    pub host_port_free: Arc<dyn PortProbe>,
}

impl Adapters {
    /// Adapters backed by the real tools named in `config`.
    pub fn system(config: &EnvironmentConfig) -> Self {
        let ssh = SshChannel::new(config.ssh_user.clone(), config.ssh_key.clone())
            .known_hosts(config.known_hosts_path())
            .command_timeout(config.timings.remote_command_timeout);
        let vbox = VBoxManage::new(config.vboxmanage.clone())
            .with_timeout(config.timings.hypervisor_timeout);
        Self {
            hypervisor: Arc::new(vbox),
            runtime: Arc::new(LxcClient::new(config.lxc.clone(), config.lxc_config_dir())),
            remote: Arc::new(ssh),
            image: Arc::new(LocalImage::new(config.image_path.clone())),
            ssh_probe: Arc::new(SshBannerProbe::default()),
            host_port_free: Arc::new(HostPortFree),
        }
    }
}

/// Drives the environment through its lifecycle.
///
/// Every public operation reads the facts it needs at the start of the
/// call; nothing is cached between operations.
pub struct ProvisionEngine {
    config: EnvironmentConfig,
    facts: Arc<FactStore>,
    hypervisor: Arc<dyn HypervisorAdapter>,
    image: Arc<dyn ImageSource>,
    ssh_probe: Arc<dyn PortProbe>,
    probe: StateProbe,
    network: NetworkBootstrapper,
    ports: PortAllocator,
    runtime: RuntimeBootstrapper,
}

impl ProvisionEngine {
    /// Build an engine. The configuration is validated first.
    pub fn new(config: EnvironmentConfig, adapters: Adapters) -> Result<Self> {
        config.validate()?;
        let facts = Arc::new(FactStore::new(config.facts_path()));
        let timings = &config.timings;

        let probe = StateProbe::new(facts.clone(), adapters.hypervisor.clone());
        let network = NetworkBootstrapper::new(
            adapters.hypervisor.clone(),
            facts.clone(),
            NicLayout::default(),
        );
        let ports = PortAllocator::new(
            adapters.hypervisor.clone(),
            facts.clone(),
            adapters.host_port_free.clone(),
            config.ports,
            timings.port_forwarding,
            timings.nat_apply_delay,
        );
        let runtime = RuntimeBootstrapper::new(
            adapters.runtime.clone(),
            adapters.remote.clone(),
            facts.clone(),
            config.runtime.clone(),
            timings.runtime_init,
            timings.convergence,
        );

        Ok(Self {
            facts,
            hypervisor: adapters.hypervisor,
            image: adapters.image,
            ssh_probe: adapters.ssh_probe,
            probe,
            network,
            ports,
            runtime,
            config,
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        self.probe.state().await
    }

    pub async fn info(&self) -> Result<EnvironmentInfo> {
        self.probe.info().await
    }

    /// Provision a new environment, cleaning up on Ctrl-C.
    pub async fn init(&self) -> Result<()> {
        self.init_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C; init cannot be interrupted");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Provision a new environment unless one already exists.
    ///
    /// This will:
    /// 1. Make sure the base image is available
    /// 2. Import it as a VM with a fresh name and record that name
    /// 3. Attach the config and storage disks
    /// 4. Create the host-only network and bridge the VM onto it
    ///
    /// If any step fails, or `cancel` completes first, everything created so
    /// far is removed and the facts are cleared.
    pub async fn init_until<C>(&self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let state = self.probe.state().await?;
        if state != LifecycleState::NotInitialized {
            tracing::info!(state = %state, "Environment already initialized");
            return Ok(());
        }

        let vm_name = format!("yurt-{}", Uuid::new_v4());
        let start = Instant::now();
        tracing::info!(vm_name = %vm_name, memory_mib = self.config.memory_mib, "Initializing environment");

        let outcome = tokio::select! {
            result = self.provision(&vm_name) => result,
            () = cancel => {
                tracing::warn!(vm_name = %vm_name, "Initialization interrupted");
                Err(CoreError::OperationCancelled)
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    vm_name = %vm_name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Environment initialized"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(vm_name = %vm_name, error = %e, "Initialization failed, cleaning up");
                self.rollback(&vm_name).await;
                Err(CoreError::InitializationFailed(Box::new(e)))
            }
        }
    }

    async fn provision(&self, vm_name: &str) -> Result<()> {
        // 1. Base image
        let image = self.image.ensure_image().await?;

        // 2. Import. Not retried; a failed import is cleaned up by the caller.
        let instance_dir = self.config.instance_dir();
        tokio::fs::create_dir_all(&instance_dir)
            .await
            .map_err(|e| CoreError::infra(Component::Engine)(AdapterError::Io(e)))?;
        tracing::debug!(vm_name = %vm_name, image = %image.display(), "Importing VM");
        self.hypervisor
            .import(vm_name, &image, &instance_dir, self.config.memory_mib)
            .await
            .map_err(CoreError::infra(Component::Hypervisor))?;
        self.facts.set(FactKey::VmName, vm_name).await?;

        // 3. Disks, in controller port order
        for disk in self.config.disks() {
            tracing::debug!(vm_name = %vm_name, port = disk.port, path = %disk.path.display(), "Attaching disk");
            let created = match &disk.source {
                DiskSource::Clone(source) => self.hypervisor.clone_disk(source, &disk.path).await,
                DiskSource::Blank { size_mb } => {
                    self.hypervisor.create_disk(&disk.path, *size_mb).await
                }
            };
            created.map_err(CoreError::infra(Component::Hypervisor))?;
            self.hypervisor
                .attach_disk(vm_name, &disk.path, disk.port)
                .await
                .map_err(CoreError::infra(Component::Hypervisor))?;
        }

        // 4. Host network
        self.network.setup(vm_name).await?;
        Ok(())
    }

    /// Best-effort removal of everything `provision` may have created.
    async fn rollback(&self, vm_name: &str) {
        if let Err(e) = remove_idempotent(&format!("VM {vm_name}"), self.hypervisor.destroy(vm_name)).await {
            tracing::warn!(vm_name = %vm_name, error = %e, "Failed to remove VM during cleanup");
        }
        if let Err(e) = self.network.teardown().await {
            tracing::warn!(error = %e, "Failed to remove host network during cleanup");
        }
        if let Err(e) = self.facts.clear().await {
            tracing::warn!(error = %e, "Failed to clear facts during cleanup");
        }
        if let Err(e) = remove_dir(&self.config.instance_dir()).await {
            tracing::warn!(error = %e, "Failed to delete instance files during cleanup");
        }
    }

    /// Boot the VM and bring the container runtime up.
    ///
    /// A no-op when already running. On failure the VM is left powered on
    /// for inspection.
    pub async fn start(&self) -> Result<()> {
        match self.probe.state().await? {
            LifecycleState::Running => {
                tracing::info!("Environment already running");
                return Ok(());
            }
            LifecycleState::NotInitialized => return Err(CoreError::NotInitialized),
            LifecycleState::Stopped => {}
        }

        let start = Instant::now();
        self.boot().await.map_err(|e| {
            tracing::error!(error = %e, "Start up failed; the VM is left running for inspection");
            CoreError::StartFailed(Box::new(e))
        })?;
        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "Environment running");
        Ok(())
    }

    async fn boot(&self) -> Result<()> {
        let vm_name = self.vm_name().await?;

        tracing::info!(vm_name = %vm_name, "Booting VM");
        self.hypervisor
            .start(&vm_name)
            .await
            .map_err(CoreError::infra(Component::Hypervisor))?;
        tokio::time::sleep(self.config.timings.settle_delay).await;

        let ssh_port = self
            .ports
            .setup_port_forwarding(&vm_name, &PortRequest::ssh(), self.ssh_probe.as_ref())
            .await?;
        let runtime_port = self
            .ports
            .expose_port(&vm_name, &PortRequest::runtime(self.runtime.settings().api_port))
            .await?;
        tracing::debug!(vm_name = %vm_name, ssh_port, runtime_port, "Ports forwarded");

        self.runtime.ensure_is_ready().await
    }

    /// Shut the VM down and wait until it is off.
    ///
    /// Without `force` this only asks the guest to power off; a guest that
    /// ignores the request is never powered off automatically.
    pub async fn stop(&self, force: bool) -> Result<()> {
        if self.probe.state().await? != LifecycleState::Running {
            tracing::info!("Environment is not running");
            return Ok(());
        }
        let vm_name = self.vm_name().await?;

        tracing::info!(vm_name = %vm_name, force, "Shutting down VM");
        self.power_off(&vm_name, force).await.map_err(|e| {
            tracing::error!(vm_name = %vm_name, error = %e, "Shut down failed");
            CoreError::ShutdownFailed(Box::new(e))
        })?;

        tracing::info!(vm_name = %vm_name, "VM stopped");
        Ok(())
    }

    async fn power_off(&self, vm_name: &str, force: bool) -> Result<()> {
        self.hypervisor
            .stop(vm_name, force)
            .await
            .map_err(CoreError::infra(Component::Hypervisor))?;

        let policy = self.config.timings.shutdown;
        policy
            .run_while(
                "shutdown",
                |e| matches!(e, CoreError::StillRunning { .. }),
                |_| async move {
                    match self.probe.state().await? {
                        LifecycleState::Running => Err(CoreError::StillRunning {
                            vm_name: vm_name.to_string(),
                            checks: policy.attempts(),
                        }),
                        _ => Ok(()),
                    }
                },
            )
            .await
    }

    /// Stop if running, then start.
    pub async fn reboot(&self, force: bool) -> Result<()> {
        self.stop(force).await?;
        self.start().await
    }

    /// Remove the VM, its host network and every fact.
    pub async fn destroy(&self) -> Result<()> {
        self.teardown().await.map_err(|e| {
            tracing::error!(error = %e, "Destroy failed");
            CoreError::DestroyFailed(Box::new(e))
        })
    }

    async fn teardown(&self) -> Result<()> {
        match self.facts.get(FactKey::VmName).await? {
            Some(vm_name) => {
                tracing::info!(vm_name = %vm_name, "Destroying VM");
                remove_idempotent(&format!("VM {vm_name}"), self.hypervisor.destroy(&vm_name))
                    .await
                    .map_err(CoreError::infra(Component::Hypervisor))?;
            }
            None => tracing::info!("No VM recorded"),
        }
        self.network.teardown().await?;
        self.facts.clear().await?;
        tracing::info!("Environment destroyed");
        Ok(())
    }

    /// Delete local instance files and facts regardless of hypervisor state.
    /// Recovery for environments `destroy` cannot clean up.
    pub async fn purge_instance_files(&self) -> Result<()> {
        let dir = self.config.instance_dir();
        tracing::warn!(path = %dir.display(), "Deleting instance files");
        remove_dir(&dir)
            .await
            .map_err(|e| CoreError::infra(Component::Engine)(AdapterError::Io(e)))?;
        self.facts.clear().await
    }

    async fn vm_name(&self) -> Result<String> {
        self.facts
            .get(FactKey::VmName)
            .await?
            .ok_or(CoreError::NotInitialized)
    }
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
