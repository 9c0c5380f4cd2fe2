//! Host-side reachability checks for forwarded ports.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// A yes/no check against a host port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn check(&self, port: u16) -> bool;
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Succeeds when an SSH server answers on the port with its version banner.
///
/// A bare TCP connect is not enough: the NAT engine accepts connections on a
/// forwarded port before anything is listening in the guest.
#[derive(Debug, Clone)]
pub struct SshBannerProbe {
    timeout: Duration,
}

impl Default for SshBannerProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl SshBannerProbe {
    async fn read_banner(&self, port: u16) -> std::io::Result<String> {
        let stream = TcpStream::connect(loopback(port)).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(line)
    }
}

#[async_trait]
impl PortProbe for SshBannerProbe {
    async fn check(&self, port: u16) -> bool {
        match timeout(self.timeout, self.read_banner(port)).await {
            Ok(Ok(banner)) if banner.starts_with("SSH-") => {
                tracing::debug!(port, banner = %banner.trim(), "SSH banner received");
                true
            }
            Ok(Ok(other)) => {
                tracing::debug!(port, response = %other.trim(), "Port answered without an SSH banner");
                false
            }
            Ok(Err(e)) => {
                tracing::debug!(port, error = %e, "SSH not available on port");
                false
            }
            Err(_) => {
                tracing::debug!(port, "SSH probe timed out");
                false
            }
        }
    }
}

/// Succeeds when nothing on the host holds the port, i.e. it can be bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPortFree;

#[async_trait]
impl PortProbe for HostPortFree {
    async fn check(&self, port: u16) -> bool {
        TcpListener::bind(loopback(port)).await.is_ok()
    }
}
