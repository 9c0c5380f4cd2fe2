//! Container runtime bootstrap and convergence.
//!
//! Bootstrap has two phases. The runtime is first initialized inside the
//! guest from a preseed document, once, gated by the `is_runtime_initialized`
//! fact. Then three checks converge the host-side view of it: the remote is
//! registered at the current management port and is the default, the bridged
//! network exists, and the profile exists. Each check compares against what
//! exists and changes only what differs, so the whole procedure can be re-run
//! on every boot.

use crate::error::{Component, CoreError, Result};
use crate::facts::{FactKey, FactStore};
use crate::network::NetworkBinding;
use crate::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use yurt_vm::{NetworkConfig, ProfileDevices, RemoteExec, RuntimeAdapter};

/// Names and constants of the runtime setup inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub remote_name: String,
    pub network_name: String,
    pub profile_name: String,
    pub storage_pool: String,
    /// Block device backing the storage pool, as seen by the guest.
    pub storage_device: String,
    /// Guest NIC attached to the host-only network.
    pub bridge_interface: String,
    pub trust_password: String,
    pub dns_domain: String,
    /// Port the runtime's management API listens on inside the guest.
    pub api_port: u16,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            remote_name: "yurt".into(),
            network_name: "yurt-int".into(),
            profile_name: "yurt".into(),
            storage_pool: "yurtpool".into(),
            storage_device: "/dev/sdc".into(),
            bridge_interface: "enp0s8".into(),
            trust_password: "yurtsecret".into(),
            dns_domain: "yurt".into(),
            api_port: 8443,
        }
    }
}

impl RuntimeSettings {
    /// Preseed document applied by `lxd init --preseed`.
    pub fn preseed(&self) -> String {
        format!(
            r#"config:
  core.https_address: '[::]:{port}'
  core.trust_password: {password}
networks: []
storage_pools:
- config:
    source: {device}
  description: ""
  name: {pool}
  driver: zfs
profiles:
- config: {{}}
  description: ""
  devices:
    root:
      path: /
      pool: {pool}
      type: disk
  name: default
cluster: null
"#,
            port = self.api_port,
            password = self.trust_password,
            device = self.storage_device,
            pool = self.storage_pool,
        )
    }

    /// Configuration of the bridged network, derived from the host-only
    /// interface: the bridge takes the address after the host's, and DHCP
    /// hands out host+10 through host+249.
    pub fn network_config(&self, binding: &NetworkBinding) -> Result<NetworkConfig> {
        let prefix = prefix_len(binding.netmask).ok_or_else(|| {
            CoreError::InconsistentEnvironment(format!(
                "interface netmask {} is not a valid mask",
                binding.netmask
            ))
        })?;
        let offset = |n: u32| {
            host_offset(binding.ip, binding.netmask, n).ok_or_else(|| {
                CoreError::InconsistentEnvironment(format!(
                    "host-only network {}/{prefix} is too small for the runtime bridge",
                    binding.ip
                ))
            })
        };
        let bridge = offset(1)?;
        let dhcp_first = offset(10)?;
        let dhcp_last = offset(249)?;

        Ok(NetworkConfig::from([
            (
                "bridge.external_interfaces".to_string(),
                self.bridge_interface.clone(),
            ),
            ("ipv6.address".to_string(), "none".to_string()),
            ("ipv4.nat".to_string(), "true".to_string()),
            ("ipv4.dhcp".to_string(), "true".to_string()),
            ("ipv4.dhcp.expiry".to_string(), "24h".to_string()),
            ("ipv4.address".to_string(), format!("{bridge}/{prefix}")),
            (
                "ipv4.dhcp.ranges".to_string(),
                format!("{dhcp_first}-{dhcp_last}"),
            ),
            ("dns.domain".to_string(), self.dns_domain.clone()),
        ]))
    }

    /// Devices of the profile containers are launched with.
    pub fn profile_devices(&self) -> ProfileDevices {
        let device = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        ProfileDevices::from([
            (
                "eth0".to_string(),
                device(&[
                    ("name", "eth0"),
                    ("nictype", "bridged"),
                    ("parent", self.network_name.as_str()),
                    ("type", "nic"),
                ]),
            ),
            (
                "root".to_string(),
                device(&[("path", "/"), ("pool", self.storage_pool.as_str()), ("type", "disk")]),
            ),
        ])
    }
}

fn prefix_len(netmask: Ipv4Addr) -> Option<u32> {
    let bits = u32::from(netmask);
    (bits.leading_ones() == bits.count_ones()).then(|| bits.count_ones())
}

/// `ip + n`, if it stays inside the subnet and is not its broadcast address.
fn host_offset(ip: Ipv4Addr, netmask: Ipv4Addr, n: u32) -> Option<Ipv4Addr> {
    let mask = u32::from(netmask);
    let base = u32::from(ip);
    let addr = base.checked_add(n)?;
    let broadcast = (base & mask) | !mask;
    (addr & mask == base & mask && addr < broadcast).then(|| Ipv4Addr::from(addr))
}

/// One host-side convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStep {
    RemoteRegistered,
    NetworkConfigured,
    ProfileConfigured,
}

impl ConvergenceStep {
    pub const ALL: [ConvergenceStep; 3] = [
        ConvergenceStep::RemoteRegistered,
        ConvergenceStep::NetworkConfigured,
        ConvergenceStep::ProfileConfigured,
    ];
}

impl fmt::Display for ConvergenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceStep::RemoteRegistered => write!(f, "remote registration"),
            ConvergenceStep::NetworkConfigured => write!(f, "network configuration"),
            ConvergenceStep::ProfileConfigured => write!(f, "profile configuration"),
        }
    }
}

/// Brings the container runtime to its target configuration.
#[derive(Clone)]
pub struct RuntimeBootstrapper {
    runtime: Arc<dyn RuntimeAdapter>,
    remote: Arc<dyn RemoteExec>,
    facts: Arc<FactStore>,
    settings: RuntimeSettings,
    init_policy: RetryPolicy,
    convergence_policy: RetryPolicy,
}

impl RuntimeBootstrapper {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        remote: Arc<dyn RemoteExec>,
        facts: Arc<FactStore>,
        settings: RuntimeSettings,
        init_policy: RetryPolicy,
        convergence_policy: RetryPolicy,
    ) -> Self {
        Self {
            runtime,
            remote,
            facts,
            settings,
            init_policy,
            convergence_policy,
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Initialize the runtime if needed, then converge. Safe to call on
    /// every boot, including while the guest is still coming up.
    pub async fn ensure_is_ready(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.ensure_initialized().await?;
        self.converge().await?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Container runtime ready"
        );
        Ok(())
    }

    /// Apply the preseed inside the guest unless the fact says it was done.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let initialized = self.facts.environment().await?.runtime_initialized;
        if initialized {
            tracing::debug!("Container runtime already initialized");
            return Ok(());
        }

        let ssh_port = self
            .facts
            .get_parsed::<u16>(FactKey::SshPort)
            .await?
            .ok_or(CoreError::NotRunning)?;
        let preseed = self.settings.preseed();

        tracing::info!(ssh_port, "Initializing container runtime");
        self.init_policy
            .run("runtime initialization", |_| {
                let preseed = preseed.as_str();
                async move {
                    self.runtime
                        .initialize(self.remote.as_ref(), ssh_port, preseed)
                        .await
                        .map_err(|e| {
                            let component = if e.is_unreachable() {
                                Component::RemoteExec
                            } else {
                                Component::Runtime
                            };
                            CoreError::infra(component)(e)
                        })
                }
            })
            .await
            .map_err(|e| CoreError::RuntimeBootstrapFailed {
                step: "initialization".into(),
                source: Box::new(e),
            })?;

        self.facts.set(FactKey::IsRuntimeInitialized, true).await
    }

    /// Run every convergence check until all pass or the budget runs out.
    ///
    /// Every attempt runs all three checks, so one failing check does not
    /// hold back the others. The first failing step is reported.
    pub async fn converge(&self) -> Result<()> {
        self.convergence_policy
            .run_while("runtime convergence", CoreError::is_retryable, |attempt| async move {
                let mut first_failure = None;
                for step in ConvergenceStep::ALL {
                    if let Err(e) = self.ensure(step).await {
                        tracing::warn!(step = %step, attempt, error = %e, "Convergence check failed");
                        if first_failure.is_none() {
                            first_failure = Some((step, e));
                        }
                    }
                }
                match first_failure {
                    None => Ok(()),
                    Some((step, e)) => Err(CoreError::RuntimeBootstrapFailed {
                        step: step.to_string(),
                        source: Box::new(e),
                    }),
                }
            })
            .await
    }

    pub async fn ensure(&self, step: ConvergenceStep) -> Result<()> {
        match step {
            ConvergenceStep::RemoteRegistered => self.ensure_remote_registered().await,
            ConvergenceStep::NetworkConfigured => self.ensure_network_configured().await,
            ConvergenceStep::ProfileConfigured => self.ensure_profile_configured().await,
        }
    }

    /// Make the remote point at the current management port and be the
    /// default.
    ///
    /// The forwarded port can change on any boot, so a remote registered
    /// under the right name but at another address is replaced.
    pub async fn ensure_remote_registered(&self) -> Result<()> {
        let name = self.settings.remote_name.as_str();
        let port = self
            .facts
            .get_parsed::<u16>(FactKey::RuntimePort)
            .await?
            .ok_or_else(|| {
                CoreError::InconsistentEnvironment("runtime port has not been recorded".into())
            })?;
        let endpoint = format!("https://127.0.0.1:{port}");

        let remotes = self
            .runtime
            .list_remotes()
            .await
            .map_err(CoreError::infra(Component::Runtime))?;
        match remotes.get(name) {
            Some(addr) if *addr == endpoint => {
                tracing::debug!(remote = %name, endpoint = %endpoint, "Remote already registered");
            }
            Some(addr) => {
                tracing::info!(remote = %name, from = %addr, to = %endpoint, "Re-registering runtime remote");
                self.runtime
                    .remove_remote(name)
                    .await
                    .map_err(CoreError::infra(Component::Runtime))?;
                self.add_remote(name, &endpoint).await?;
            }
            None => {
                tracing::info!(remote = %name, endpoint = %endpoint, "Registering runtime remote");
                self.add_remote(name, &endpoint).await?;
            }
        }

        let current = self
            .runtime
            .default_remote()
            .await
            .map_err(CoreError::infra(Component::Runtime))?;
        if current != name {
            tracing::info!(remote = %name, previous = %current, "Switching default remote");
            self.runtime
                .switch_remote(name)
                .await
                .map_err(CoreError::infra(Component::Runtime))?;
        }
        Ok(())
    }

    async fn add_remote(&self, name: &str, endpoint: &str) -> Result<()> {
        self.runtime
            .add_remote(name, endpoint, &self.settings.trust_password)
            .await
            .map_err(CoreError::infra(Component::Runtime))
    }

    pub async fn ensure_network_configured(&self) -> Result<()> {
        let name = &self.settings.network_name;
        let networks = self
            .runtime
            .list_networks()
            .await
            .map_err(CoreError::infra(Component::Runtime))?;
        if networks.iter().any(|n| n == name) {
            tracing::debug!(network = %name, "Network already configured");
            return Ok(());
        }

        let binding = NetworkBinding::load(&self.facts).await?.ok_or_else(|| {
            CoreError::InconsistentEnvironment("host-only interface has not been recorded".into())
        })?;
        let config = self.settings.network_config(&binding)?;
        tracing::info!(network = %name, address = %config["ipv4.address"], "Creating runtime network");
        self.runtime
            .create_network(name, &config)
            .await
            .map_err(CoreError::infra(Component::Runtime))
    }

    pub async fn ensure_profile_configured(&self) -> Result<()> {
        let name = &self.settings.profile_name;
        let profiles = self
            .runtime
            .list_profiles()
            .await
            .map_err(CoreError::infra(Component::Runtime))?;
        if profiles.iter().any(|p| p == name) {
            tracing::debug!(profile = %name, "Profile already configured");
            return Ok(());
        }

        tracing::info!(profile = %name, "Creating runtime profile");
        self.runtime
            .create_profile(name, &self.settings.profile_devices())
            .await
            .map_err(CoreError::infra(Component::Runtime))
    }
}
