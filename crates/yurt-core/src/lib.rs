//! # yurt-core
//!
//! Provisioning and convergence engine for the yurt development environment:
//! a VirtualBox VM running LXD, reachable from the host through forwarded
//! ports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ProvisionEngine                      │
//! │      init() / start() / stop() / destroy() / info()      │
//! └──────────────────────────────────────────────────────────┘
//!        │               │                 │             │
//!        ▼               ▼                 ▼             ▼
//! ┌─────────────┐ ┌─────────────┐ ┌───────────────┐ ┌──────────┐
//! │ StateProbe  │ │  Network    │ │ PortAllocator │ │ Runtime  │
//! │             │ │Bootstrapper │ │               │ │Bootstrap │
//! └─────────────┘ └─────────────┘ └───────────────┘ └──────────┘
//!        │               │                 │             │
//!        ▼               ▼                 ▼             ▼
//! ┌─────────────┐ ┌──────────────────────────────────────────┐
//! │  FactStore  │ │  yurt-vm adapters (VBoxManage, lxc, ssh)  │
//! │ config.json │ │  driven through RetryPolicy / idempotent  │
//! └─────────────┘ │  removal                                  │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! Lifecycle state is never stored. It is derived on every call from the
//! `vm_name` fact and what the hypervisor reports for that VM.
//!
//! ## Quick Start
//!
//! ```no_run
//! use yurt_core::{Adapters, EnvironmentConfig, LifecycleState, ProvisionEngine};
//!
//! # async fn example() -> yurt_core::Result<()> {
//! let config = EnvironmentConfig::from_env();
//! let adapters = Adapters::system(&config);
//! let engine = ProvisionEngine::new(config, adapters)?;
//!
//! engine.init().await?;
//! engine.start().await?;
//! assert_eq!(engine.state().await?, LifecycleState::Running);
//!
//! engine.stop(false).await?;
//! engine.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod cleanup;
mod config;
mod engine;
mod error;
mod facts;
mod image;
mod network;
mod ports;
mod retry;
mod runtime;
mod state;

#[cfg(test)]
mod testing;

pub use cleanup::{remove_idempotent, Removal};
pub use config::{DiskSource, DiskSpec, EnvironmentConfig, EnvironmentConfigBuilder, Timings};
pub use engine::{Adapters, ProvisionEngine};
pub use error::{Component, CoreError, Result};
pub use facts::{EnvironmentFacts, FactKey, FactStore};
pub use image::{ImageSource, LocalImage};
pub use network::{NetworkBinding, NetworkBootstrapper, NicLayout};
pub use ports::{PortAllocator, PortRange, PortRequest};
pub use retry::RetryPolicy;
pub use runtime::{ConvergenceStep, RuntimeBootstrapper, RuntimeSettings};
pub use state::{EnvironmentInfo, LifecycleState, StateProbe};
