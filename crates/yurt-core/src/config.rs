//! Environment configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::error::CoreError;
use crate::ports::PortRange;
use crate::retry::RetryPolicy;
use crate::runtime::RuntimeSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry budgets and fixed waits used during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Candidate ports tried when forwarding, and the wait between them.
    pub port_forwarding: RetryPolicy,
    /// Wait for the NAT engine to apply a freshly installed rule.
    pub nat_apply_delay: Duration,
    pub runtime_init: RetryPolicy,
    pub convergence: RetryPolicy,
    /// State polls after a shutdown request.
    pub shutdown: RetryPolicy,
    /// Wait after power-on before the first port is forwarded.
    pub settle_delay: Duration,
    /// Upper bound on a single hypervisor CLI call.
    pub hypervisor_timeout: Duration,
    /// Upper bound on a single command inside the guest.
    pub remote_command_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            port_forwarding: RetryPolicy::fixed(5, Duration::from_secs(7)),
            nat_apply_delay: Duration::from_secs(2),
            runtime_init: RetryPolicy::fixed(3, Duration::from_secs(10)),
            convergence: RetryPolicy::fixed(10, Duration::from_secs(6)),
            shutdown: RetryPolicy::fixed(20, Duration::from_secs(3)),
            settle_delay: Duration::from_secs(10),
            hypervisor_timeout: Duration::from_secs(600),
            remote_command_timeout: Duration::from_secs(900),
        }
    }
}

/// Where a virtual disk's contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// Copy of an existing disk image.
    Clone(PathBuf),
    /// Blank disk of the given size.
    Blank { size_mb: u64 },
}

/// A disk attached at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    /// Storage controller port. The guest finds disks by port order.
    pub port: u32,
    pub path: PathBuf,
    pub source: DiskSource,
}

/// Configuration of one yurt environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Root of all local state.
    pub home: PathBuf,

    /// Base appliance image.
    pub image_path: PathBuf,

    /// Provisioning disk cloned into the VM as its config disk.
    pub config_disk_source: PathBuf,

    /// Hypervisor CLI (default: `VBoxManage` from PATH).
    pub vboxmanage: PathBuf,

    /// Container runtime client (default: `lxc` from PATH).
    pub lxc: PathBuf,

    /// Private key for the guest user.
    pub ssh_key: PathBuf,

    /// Guest user (default: yurt).
    pub ssh_user: String,

    /// VM memory in MiB (default: 2048).
    pub memory_mib: u32,

    /// Size of the storage pool disk in MB (default: 64000).
    pub storage_pool_size_mb: u64,

    /// Host ports forwarded ports are picked from.
    pub ports: PortRange,

    pub runtime: RuntimeSettings,

    pub timings: Timings,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self::with_home(default_home())
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".yurt")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl EnvironmentConfig {
    /// Defaults with every local path under `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            image_path: home.join("image").join("yurt.ova"),
            config_disk_source: home.join("provision").join("yurt-config.vmdk"),
            ssh_key: home.join("provision").join("id_rsa"),
            home,
            vboxmanage: PathBuf::from("VBoxManage"),
            lxc: PathBuf::from("lxc"),
            ssh_user: "yurt".into(),
            memory_mib: 2048,
            storage_pool_size_mb: 64000,
            ports: PortRange::default(),
            runtime: RuntimeSettings::default(),
            timings: Timings::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `YURT_HOME` | `$HOME/.yurt` |
    /// | `YURT_IMAGE` | `$YURT_HOME/image/yurt.ova` |
    /// | `YURT_CONFIG_DISK` | `$YURT_HOME/provision/yurt-config.vmdk` |
    /// | `YURT_VBOXMANAGE` | `VBoxManage` |
    /// | `YURT_LXC` | `lxc` |
    /// | `YURT_SSH_KEY` | `$YURT_HOME/provision/id_rsa` |
    /// | `YURT_VM_MEMORY` | `2048` |
    /// | `YURT_PORT_LOW` | `55000` |
    /// | `YURT_PORT_HIGH` | `59999` |
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_env() -> Self {
        let default = Self::with_home(env_path("YURT_HOME").unwrap_or_else(default_home));

        Self {
            image_path: env_path("YURT_IMAGE").unwrap_or(default.image_path),
            config_disk_source: env_path("YURT_CONFIG_DISK").unwrap_or(default.config_disk_source),
            vboxmanage: env_path("YURT_VBOXMANAGE").unwrap_or(default.vboxmanage),
            lxc: env_path("YURT_LXC").unwrap_or(default.lxc),
            ssh_key: env_path("YURT_SSH_KEY").unwrap_or(default.ssh_key),
            memory_mib: env_parse("YURT_VM_MEMORY").unwrap_or(default.memory_mib),
            ports: PortRange::new(
                env_parse("YURT_PORT_LOW").unwrap_or(default.ports.low),
                env_parse("YURT_PORT_HIGH").unwrap_or(default.ports.high),
            ),
            ..default
        }
    }

    /// Create a new config builder.
    pub fn builder() -> EnvironmentConfigBuilder {
        EnvironmentConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.home.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig("home is required".into()));
        }
        if self.memory_mib == 0 {
            return Err(CoreError::InvalidConfig("memory_mib must be > 0".into()));
        }
        if self.ports.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "port range {}-{} is empty",
                self.ports.low, self.ports.high
            )));
        }
        if self.ports.low < 1024 {
            return Err(CoreError::InvalidConfig(
                "port range must not include privileged ports".into(),
            ));
        }
        if self.ssh_user.is_empty() {
            return Err(CoreError::InvalidConfig("ssh_user is required".into()));
        }
        Ok(())
    }

    /// The fact document.
    pub fn facts_path(&self) -> PathBuf {
        self.home.join("config.json")
    }

    /// Directory the VM and its disks live in.
    pub fn instance_dir(&self) -> PathBuf {
        self.home.join("vm")
    }

    /// Client configuration of the container runtime (certificates, remotes).
    pub fn lxc_config_dir(&self) -> PathBuf {
        self.home.join("lxc")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.home.join("known_hosts")
    }

    /// Disks attached at init, in controller port order.
    pub fn disks(&self) -> Vec<DiskSpec> {
        let dir = self.instance_dir();
        vec![
            DiskSpec {
                port: 1,
                path: dir.join("yurt-config.vmdk"),
                source: DiskSource::Clone(self.config_disk_source.clone()),
            },
            DiskSpec {
                port: 2,
                path: dir.join("yurt-storage.vmdk"),
                source: DiskSource::Blank {
                    size_mb: self.storage_pool_size_mb,
                },
            },
        ]
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

/// Builder for EnvironmentConfig.
#[derive(Debug, Default)]
pub struct EnvironmentConfigBuilder {
    config: EnvironmentConfig,
}

impl EnvironmentConfigBuilder {
    /// Set the home directory. Paths derived from the home are moved with it.
    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        let rebased = EnvironmentConfig::with_home(home);
        self.config.home = rebased.home;
        self.config.image_path = rebased.image_path;
        self.config.config_disk_source = rebased.config_disk_source;
        self.config.ssh_key = rebased.ssh_key;
        self
    }

    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image_path = path.into();
        self
    }

    pub fn config_disk(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_disk_source = path.into();
        self
    }

    pub fn vboxmanage(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.vboxmanage = path.into();
        self
    }

    pub fn lxc(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.lxc = path.into();
        self
    }

    pub fn ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ssh_key = path.into();
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    pub fn ports(mut self, low: u16, high: u16) -> Self {
        self.config.ports = PortRange::new(low, high);
        self
    }

    pub fn runtime(mut self, settings: RuntimeSettings) -> Self {
        self.config.runtime = settings;
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.config.timings = timings;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<EnvironmentConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EnvironmentConfig::with_home("/home/dev/.yurt");
        assert_eq!(config.memory_mib, 2048);
        assert_eq!(config.ports, PortRange::new(55000, 59999));
        assert_eq!(config.facts_path(), PathBuf::from("/home/dev/.yurt/config.json"));
        assert_eq!(config.image_path, PathBuf::from("/home/dev/.yurt/image/yurt.ova"));
        assert_eq!(config.timings.port_forwarding.attempts(), 5);
        assert_eq!(config.timings.hypervisor_timeout, Duration::from_secs(600));
        assert_eq!(config.timings.remote_command_timeout, Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disks_in_port_order() {
        let config = EnvironmentConfig::with_home("/y");
        let disks = config.disks();
        let ports: Vec<u32> = disks.iter().map(|d| d.port).collect();
        assert_eq!(ports, vec![1, 2]);
        assert_eq!(
            disks[0].source,
            DiskSource::Clone(PathBuf::from("/y/provision/yurt-config.vmdk"))
        );
        assert_eq!(disks[1].source, DiskSource::Blank { size_mb: 64000 });
    }

    #[test]
    fn test_builder_moves_derived_paths() {
        let config = EnvironmentConfig::builder()
            .home("/srv/yurt")
            .memory_mib(4096)
            .build()
            .expect("should build successfully");
        assert_eq!(config.ssh_key, PathBuf::from("/srv/yurt/provision/id_rsa"));
        assert_eq!(config.memory_mib, 4096);
    }

    #[test]
    fn test_builder_validation() {
        assert!(EnvironmentConfig::builder().memory_mib(0).build().is_err());
        assert!(EnvironmentConfig::builder().ports(6000, 5000).build().is_err());
        assert!(EnvironmentConfig::builder().ports(22, 5000).build().is_err());
        assert!(EnvironmentConfig::builder().ports(4000, 4000).build().is_ok());
    }
}
