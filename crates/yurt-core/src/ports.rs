//! Host port selection and NAT forwarding.
//!
//! A host port cannot be known to be free ahead of time, and a guest service
//! is not known to be ready until something answers on the forwarded port.
//! Both are retried in one loop: each attempt installs a rule for a candidate
//! port and checks it; a failed attempt moves on to a fresh random candidate.

use crate::cleanup::remove_idempotent;
use crate::error::{Component, CoreError, Result};
use crate::facts::{FactKey, FactStore};
use crate::retry::RetryPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use yurt_vm::{AdapterError, HypervisorAdapter, PortForwardRule, PortProbe};

/// Inclusive range of host ports to pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(55000, 59999)
    }
}

impl PortRange {
    pub const fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u32 {
        if self.high < self.low {
            0
        } else {
            u32::from(self.high - self.low) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One guest service to expose on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub rule_name: String,
    pub guest_port: u16,
    /// Fact holding the host port chosen last time, tried first.
    pub fact: FactKey,
}

impl PortRequest {
    pub fn ssh() -> Self {
        Self {
            rule_name: "ssh".into(),
            guest_port: 22,
            fact: FactKey::SshPort,
        }
    }

    pub fn runtime(guest_port: u16) -> Self {
        Self {
            rule_name: "lxd".into(),
            guest_port,
            fact: FactKey::RuntimePort,
        }
    }
}

/// Picks host ports and installs NAT forwarding rules for them.
#[derive(Clone)]
pub struct PortAllocator {
    hypervisor: Arc<dyn HypervisorAdapter>,
    facts: Arc<FactStore>,
    host_port_free: Arc<dyn PortProbe>,
    range: PortRange,
    policy: RetryPolicy,
    nat_apply_delay: Duration,
}

impl PortAllocator {
    pub fn new(
        hypervisor: Arc<dyn HypervisorAdapter>,
        facts: Arc<FactStore>,
        host_port_free: Arc<dyn PortProbe>,
        range: PortRange,
        policy: RetryPolicy,
        nat_apply_delay: Duration,
    ) -> Self {
        Self {
            hypervisor,
            facts,
            host_port_free,
            range,
            policy,
            nat_apply_delay,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Forward a host port to `request.guest_port` and return it once
    /// `reachable` confirms the guest service answers through it.
    ///
    /// The chosen port is recorded under `request.fact`.
    ///
    /// # Errors
    /// `PortForwardingFailed` when no candidate was confirmed within the
    /// attempt budget. Rules installed by failed attempts are not cleaned up.
    pub async fn setup_port_forwarding(
        &self,
        vm_name: &str,
        request: &PortRequest,
        reachable: &dyn PortProbe,
    ) -> Result<u16> {
        self.forward(vm_name, request, Check::AfterInstall(reachable)).await
    }

    /// Forward a host port for a guest service that does not listen yet.
    ///
    /// Candidates are checked for being free on the host before the rule is
    /// installed instead of being probed afterwards.
    pub async fn expose_port(&self, vm_name: &str, request: &PortRequest) -> Result<u16> {
        self.forward(vm_name, request, Check::FreeBeforeInstall(self.host_port_free.as_ref()))
            .await
    }

    async fn forward(&self, vm_name: &str, request: &PortRequest, check: Check<'_>) -> Result<u16> {
        let recorded = match self.facts.get_parsed::<u16>(request.fact).await {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(fact = %request.fact, error = %e, "Ignoring unreadable recorded port");
                None
            }
        };
        let candidates = {
            let mut rng = rand::thread_rng();
            candidates(self.range, recorded, self.policy.attempts(), &mut rng)
        };

        tracing::info!(
            vm_name = %vm_name,
            rule = %request.rule_name,
            guest_port = request.guest_port,
            first_candidate = candidates.first().copied().unwrap_or(self.range.low),
            "Setting up port forwarding"
        );

        let what = format!("port forwarding for {}", request.rule_name);
        let host_port = self
            .policy
            .run(&what, |attempt| {
                let host_port = candidates
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or(self.range.low);
                self.attempt(vm_name, request, host_port, check)
            })
            .await
            .map_err(|e| {
                tracing::error!(rule = %request.rule_name, error = %e, "Port forwarding failed");
                CoreError::PortForwardingFailed {
                    rule: request.rule_name.clone(),
                    attempts: self.policy.attempts(),
                    last_failure: e.to_string(),
                }
            })?;

        self.facts.set(request.fact, host_port).await?;
        tracing::info!(rule = %request.rule_name, port = host_port, "Port forwarded");
        Ok(host_port)
    }

    async fn attempt(
        &self,
        vm_name: &str,
        request: &PortRequest,
        host_port: u16,
        check: Check<'_>,
    ) -> Result<u16> {
        let infra = || CoreError::infra(Component::PortAllocator);

        remove_idempotent(
            &format!("forwarding rule {}", request.rule_name),
            self.hypervisor.remove_port_forward_rule(vm_name, &request.rule_name),
        )
        .await
        .map_err(infra())?;

        if let Check::FreeBeforeInstall(free) = check {
            if !free.check(host_port).await {
                return Err(infra()(AdapterError::Unreachable(format!(
                    "host port {host_port} is in use"
                ))));
            }
        }

        let rule = PortForwardRule::tcp(&request.rule_name, host_port, request.guest_port);
        tracing::debug!(rule = %rule, "Installing forwarding rule");
        self.hypervisor
            .add_port_forward_rule(vm_name, &rule)
            .await
            .map_err(infra())?;
        tokio::time::sleep(self.nat_apply_delay).await;

        if let Check::AfterInstall(reachable) = check {
            if !reachable.check(host_port).await {
                return Err(infra()(AdapterError::Unreachable(format!(
                    "guest port {} not reachable on host port {host_port}",
                    request.guest_port
                ))));
            }
        }
        Ok(host_port)
    }
}

#[derive(Clone, Copy)]
enum Check<'a> {
    AfterInstall(&'a dyn PortProbe),
    FreeBeforeInstall(&'a dyn PortProbe),
}

/// Host ports to try, in order: the recorded port if it is in range (else
/// the low end), then random picks. Picks are distinct while the range has
/// unused ports left.
fn candidates<R: Rng>(range: PortRange, recorded: Option<u16>, count: u32, rng: &mut R) -> Vec<u16> {
    let first = recorded.filter(|p| range.contains(*p)).unwrap_or(range.low);
    let mut picked = vec![first];
    while (picked.len() as u32) < count {
        let pick = rng.gen_range(range.low..=range.high);
        if !picked.contains(&pick) || picked.len() as u32 >= range.len() {
            picked.push(pick);
        }
    }
    picked
}
