//! # yurt-vm
//!
//! Thin typed adapters over the external tools the yurt environment is built
//! from: the VirtualBox CLI, the LXD client, and an SSH channel into the guest.
//!
//! Adapters are stateless request/response wrappers. Every call spawns the
//! underlying tool, waits for it under a timeout, and maps its exit status and
//! stderr into [`AdapterError`]. Nothing here knows about persisted facts or
//! lifecycle state; that lives in `yurt-core`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use yurt_vm::{HypervisorAdapter, VBoxManage};
//!
//! # async fn example() -> yurt_vm::Result<()> {
//! let vbox = VBoxManage::new("VBoxManage");
//! let desc = vbox.describe("yurt-3f1c").await?;
//! println!("running: {}, memory: {} MiB", desc.running, desc.memory_mib);
//! # Ok(())
//! # }
//! ```
//!
//! ## Adapters
//!
//! - **[`HypervisorAdapter`]**: VM import, power, disks, host-only interfaces, NAT rules
//! - **[`RuntimeAdapter`]**: runtime preseed, remotes, networks, profiles
//! - **[`RemoteExec`]**: commands inside the guest
//! - **[`PortProbe`]**: host-side checks for forwarded ports

mod command;
mod error;
mod hypervisor;
mod probe;
mod runtime;
mod ssh;
mod vbox;

pub use command::{ToolCommand, ToolOutput};
pub use error::{AdapterError, Result};
pub use hypervisor::{
    HypervisorAdapter, InterfaceInfo, NicSettings, PortForwardRule, Protocol, VmDescription,
};
pub use probe::{HostPortFree, PortProbe, SshBannerProbe};
pub use runtime::{
    parse_named_list, parse_remote_list, LxcClient, NetworkConfig, ProfileDevices, RemoteAddresses,
    RuntimeAdapter, LOCAL_REMOTE,
};
pub use ssh::{RemoteExec, SshChannel};
pub use vbox::{parse_host_only_interfaces, parse_machine_readable, VBoxManage};
