//! yurt command-line entry point.
//!
//! Logs go to stderr; command output goes to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use yurt_core::{Adapters, EnvironmentConfig, EnvironmentInfo, LifecycleState, ProvisionEngine};

#[derive(Debug, Parser)]
#[command(name = "yurt", version, about = "Local LXD development environment in a VirtualBox VM")]
struct Cli {
    /// Log external tool calls and retries
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the VM, its disks and its host network
    Init,
    /// Start the VM and bring the container runtime up
    Boot,
    /// Shut the VM down
    Shutdown {
        /// Power off instead of asking the guest to shut down
        #[arg(long)]
        force: bool,
    },
    /// Shut the VM down, then boot it again
    Reboot {
        #[arg(long)]
        force: bool,
    },
    /// Remove the VM, its host network and all recorded state
    Destroy {
        /// Delete local instance files even if the hypervisor cleanup fails
        #[arg(long)]
        force: bool,
    },
    /// Print the lifecycle state
    Status,
    /// Print details about the environment
    Info {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let default = if debug {
        "yurt=debug,yurt_core=debug,yurt_vm=debug"
    } else {
        "yurt=info,yurt_core=info,yurt_vm=warn"
    };
    let filter = match std::env::var("YURT_LOG") {
        Ok(directives) if !debug => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default)?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug)?;

    let config = EnvironmentConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    let adapters = Adapters::system(&config);
    let engine = ProvisionEngine::new(config, adapters)?;

    match cli.command {
        Command::Init => engine.init().await?,
        Command::Boot => engine.start().await?,
        Command::Shutdown { force } => engine.stop(force).await?,
        Command::Reboot { force } => engine.reboot(force).await?,
        Command::Destroy { force } => destroy(&engine, force).await?,
        Command::Status => println!("{}", engine.state().await?),
        Command::Info { json } => {
            let info = engine.info().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
    }
    Ok(())
}

async fn destroy(engine: &ProvisionEngine, force: bool) -> anyhow::Result<()> {
    if let Ok(LifecycleState::Running) = engine.state().await {
        anyhow::bail!("the VM is running; run `yurt shutdown` first");
    }

    match engine.destroy().await {
        Ok(()) => Ok(()),
        Err(e) if force => {
            tracing::warn!(error = %e, "Destroy failed, deleting instance files");
            engine
                .purge_instance_files()
                .await
                .context("failed to delete instance files")
        }
        Err(e) => Err(e).context("run `yurt destroy --force` to delete the instance files anyway"),
    }
}

fn print_info(info: &EnvironmentInfo) {
    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".into());
    println!("State:          {}", info.state);
    println!("VM:             {}", or_dash(info.vm_name.clone()));
    println!("Memory (MiB):   {}", or_dash(info.memory_mib.map(|m| m.to_string())));
    println!("CPUs:           {}", or_dash(info.cpus.map(|c| c.to_string())));
    println!("SSH port:       {}", or_dash(info.ssh_port.map(|p| p.to_string())));
    println!("LXD port:       {}", or_dash(info.runtime_port.map(|p| p.to_string())));
    println!("Interface:      {}", or_dash(info.interface.clone()));
    println!("Host address:   {}", or_dash(info.interface_ip_address.clone()));
    println!("Netmask:        {}", or_dash(info.interface_netmask.clone()));
    println!("LXD ready:      {}", info.runtime_initialized);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_shutdown_force() {
        let cli = Cli::try_parse_from(["yurt", "shutdown", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Shutdown { force: true }));
    }

    #[test]
    fn test_debug_is_global() {
        let cli = Cli::try_parse_from(["yurt", "status", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::Status));
    }
}
