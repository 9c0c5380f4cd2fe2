//! Error types for yurt-core.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use yurt_vm::AdapterError;

/// Result type alias for yurt-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The part of the engine an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    FactStore,
    Hypervisor,
    Runtime,
    RemoteExec,
    Image,
    StateProbe,
    Network,
    PortAllocator,
    RuntimeBootstrap,
    Engine,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::FactStore => "fact store",
            Component::Hypervisor => "hypervisor",
            Component::Runtime => "container runtime",
            Component::RemoteExec => "remote shell",
            Component::Image => "base image",
            Component::StateProbe => "state probe",
            Component::Network => "network bootstrap",
            Component::PortAllocator => "port allocator",
            Component::RuntimeBootstrap => "runtime bootstrap",
            Component::Engine => "provision engine",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while provisioning or operating the environment.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The fact document could not be read or parsed
    #[error("failed to read facts from {path}: {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    /// The fact document could not be written
    #[error("failed to write facts to {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid engine configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An external tool failed or printed something unexpected
    #[error("{component} call failed: {source}")]
    Infrastructure {
        component: Component,
        #[source]
        source: AdapterError,
    },

    /// A persisted fact contradicts what the external tools report
    #[error("inconsistent environment: {0}")]
    InconsistentEnvironment(String),

    /// The host-only network could not be set up
    #[error("network initialization failed: {0}")]
    NetworkInitializationFailed(#[source] Box<CoreError>),

    /// No host port could be forwarded and confirmed reachable
    #[error("port forwarding for '{rule}' failed after {attempts} attempts: {last_failure}")]
    PortForwardingFailed {
        rule: String,
        attempts: u32,
        last_failure: String,
    },

    /// The container runtime did not converge
    #[error("runtime bootstrap failed at {step}: {source}")]
    RuntimeBootstrapFailed {
        step: String,
        #[source]
        source: Box<CoreError>,
    },

    /// The environment has not been initialized
    #[error("the environment has not been initialized")]
    NotInitialized,

    /// The VM is not running
    #[error("the VM is not running")]
    NotRunning,

    /// The user interrupted the operation
    #[error("operation cancelled")]
    OperationCancelled,

    #[error("initialization failed: {0}")]
    InitializationFailed(#[source] Box<CoreError>),

    #[error("start up failed: {0}")]
    StartFailed(#[source] Box<CoreError>),

    /// The guest kept running through every state check after a shutdown
    /// request
    #[error("VM '{vm_name}' still running after {checks} state checks; retry with force")]
    StillRunning { vm_name: String, checks: u32 },

    #[error("shut down failed: {0}")]
    ShutdownFailed(#[source] Box<CoreError>),

    #[error("failed to destroy the environment: {0}")]
    DestroyFailed(#[source] Box<CoreError>),
}

impl CoreError {
    /// Wrap an adapter error at a component boundary.
    pub fn infra(component: Component) -> impl FnOnce(AdapterError) -> CoreError {
        move |source| CoreError::Infrastructure { component, source }
    }

    /// The component the failure originated in.
    ///
    /// Coarse engine errors report the component of their cause.
    pub fn component(&self) -> Component {
        match self {
            CoreError::ConfigRead { .. } | CoreError::ConfigWrite { .. } => Component::FactStore,
            CoreError::Infrastructure { component, .. } => *component,
            CoreError::InconsistentEnvironment(_) => Component::StateProbe,
            CoreError::NetworkInitializationFailed(_) => Component::Network,
            CoreError::PortForwardingFailed { .. } => Component::PortAllocator,
            CoreError::RuntimeBootstrapFailed { .. } => Component::RuntimeBootstrap,
            CoreError::InitializationFailed(cause)
            | CoreError::StartFailed(cause)
            | CoreError::ShutdownFailed(cause)
            | CoreError::DestroyFailed(cause) => cause.component(),
            CoreError::InvalidConfig(_)
            | CoreError::NotInitialized
            | CoreError::NotRunning
            | CoreError::OperationCancelled
            | CoreError::StillRunning { .. } => Component::Engine,
        }
    }

    /// Whether repeating the failed step could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Infrastructure { source, .. } => {
                !matches!(source, AdapterError::Spawn { .. })
            }
            CoreError::PortForwardingFailed { .. } | CoreError::StillRunning { .. } => true,
            CoreError::RuntimeBootstrapFailed { source, .. } => source.is_retryable(),
            CoreError::NetworkInitializationFailed(cause)
            | CoreError::InitializationFailed(cause)
            | CoreError::StartFailed(cause)
            | CoreError::ShutdownFailed(cause)
            | CoreError::DestroyFailed(cause) => cause.is_retryable(),
            CoreError::ConfigRead { .. }
            | CoreError::ConfigWrite { .. }
            | CoreError::InvalidConfig(_)
            | CoreError::InconsistentEnvironment(_)
            | CoreError::NotInitialized
            | CoreError::NotRunning
            | CoreError::OperationCancelled => false,
        }
    }
}
