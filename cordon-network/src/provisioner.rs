//! Per-container network provisioning
//!
//! Every container gets its own bridge network named `<container>-net`. The
//! network always carries a user-configured subnet so the DNS sidecar can be
//! pinned to a static address, and is created with inter-container
//! communication disabled when the platform supports it.

use cordon_core::{
    ContainerId, EgressEvent, EngineConfig, Error, LABEL_CONTAINER, LABEL_MANAGED, LABEL_ROLE,
    NetworkId, Result,
};
use cordon_runtime::docker::ICC_OPTION;
use cordon_runtime::{ContainerRuntime, NetworkInfo, NetworkSpec};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// How many pool subnets are tried before giving up
pub const MAX_SUBNET_ATTEMPTS: u64 = 8;

/// Deterministic subnet allocation from a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPlan {
    pool: IpNet,
    prefix: u8,
}

impl SubnetPlan {
    /// Carve `/prefix` subnets out of `pool`
    ///
    /// # Errors
    /// Returns error if the prefix is shorter than the pool's or leaves no room
    /// for a gateway and a sidecar.
    pub fn new(pool: IpNet, prefix: u8) -> Result<Self> {
        if prefix < pool.prefix_len() || prefix > pool.max_prefix_len() - 2 {
            return Err(Error::InvalidConfig {
                message: format!("subnet prefix /{prefix} does not fit pool {pool}"),
            });
        }
        Ok(Self {
            pool: pool.trunc(),
            prefix,
        })
    }

    /// Plan from engine configuration
    ///
    /// # Errors
    /// See [`SubnetPlan::new`].
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.subnet_pool, config.subnet_prefix)
    }

    /// Number of subnets in the pool (saturating)
    #[must_use]
    pub fn capacity(&self) -> u64 {
        let bits = u32::from(self.prefix - self.pool.prefix_len());
        1u64.checked_shl(bits).unwrap_or(u64::MAX)
    }

    /// `index`-th subnet of the pool
    #[must_use]
    pub fn nth(&self, index: u64) -> Option<IpNet> {
        let host_bits = u32::from(self.pool.max_prefix_len() - self.prefix);
        let subnet = match self.pool {
            IpNet::V4(pool) => {
                let offset = u32::try_from(index).ok()?.checked_mul(1u32.checked_shl(host_bits)?)?;
                let base = u32::from(pool.network()).checked_add(offset)?;
                Ipv4Net::new(Ipv4Addr::from(base), self.prefix)
                    .ok()
                    .map(IpNet::V4)
            }
            IpNet::V6(pool) => {
                let offset = u128::from(index).checked_mul(1u128.checked_shl(host_bits)?)?;
                let base = u128::from(pool.network()).checked_add(offset)?;
                Ipv6Net::new(Ipv6Addr::from(base), self.prefix)
                    .ok()
                    .map(IpNet::V6)
            }
        };
        subnet.filter(|subnet| self.pool.contains(subnet))
    }

    /// Subnets to try for a container, preferred first
    pub fn candidates(&self, id: &ContainerId) -> impl Iterator<Item = IpNet> + '_ {
        let capacity = self.capacity();
        let start = fnv1a(id.as_str().as_bytes()) % capacity;
        (0..MAX_SUBNET_ATTEMPTS.min(capacity))
            .filter_map(move |i| self.nth(start.wrapping_add(i) % capacity))
    }

    /// Address reserved for the DNS sidecar in a subnet (the host after the gateway)
    #[must_use]
    pub fn sidecar_address(subnet: &IpNet) -> Option<IpAddr> {
        subnet.hosts().nth(1)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Strength of the isolation a network ended up with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "isolation", rename_all = "lowercase")]
pub enum Isolation {
    /// Inter-container communication disabled
    Full,
    /// Plain bridge; the platform refused the isolation option
    Degraded {
        /// Why isolation is missing
        reason: String,
    },
}

impl Isolation {
    /// Whether inter-container communication is disabled
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    fn of_existing(info: &NetworkInfo) -> Self {
        if info.options.get(ICC_OPTION).is_some_and(|v| v == "false") {
            Self::Full
        } else {
            Self::Degraded {
                reason: "existing network was created without isolation".to_string(),
            }
        }
    }
}

/// A container's network, as created or found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedNetwork {
    /// Runtime identifier
    pub id: NetworkId,
    /// Network name
    pub name: String,
    /// Subnet, when the network has one
    pub subnet: Option<IpNet>,
    /// Isolation strength
    #[serde(flatten)]
    pub isolation: Isolation,
    /// Whether this call created it
    pub created: bool,
}

impl ProvisionedNetwork {
    /// Default static address for the sidecar on this network
    #[must_use]
    pub fn sidecar_address(&self) -> Option<IpAddr> {
        self.subnet.as_ref().and_then(SubnetPlan::sidecar_address)
    }

    fn from_existing(info: NetworkInfo) -> Self {
        Self {
            isolation: Isolation::of_existing(&info),
            subnet: info.subnets.first().copied(),
            id: info.id,
            name: info.name,
            created: false,
        }
    }
}

/// Creates and destroys per-container networks
pub struct NetworkProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    plan: SubnetPlan,
}

impl NetworkProvisioner {
    /// Create a provisioner
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, plan: SubnetPlan) -> Self {
        Self { runtime, plan }
    }

    /// Subnet plan in use
    #[must_use]
    pub const fn plan(&self) -> &SubnetPlan {
        &self.plan
    }

    /// Inspect a container's network
    pub async fn network(&self, id: &ContainerId) -> Result<Option<ProvisionedNetwork>> {
        Ok(self
            .runtime
            .inspect_network(&id.network_name())
            .await?
            .map(ProvisionedNetwork::from_existing))
    }

    /// Create the container's network, or return the existing one
    ///
    /// Isolation is probed per attempt: if the runtime rejects the option for
    /// any reason other than an address conflict, the network is created
    /// without it and the outcome is [`Isolation::Degraded`].
    pub async fn create_network(&self, id: &ContainerId) -> Result<ProvisionedNetwork> {
        let name = id.network_name();

        if let Some(existing) = self.network(id).await? {
            debug!(container_id = %id, network = %name, "Network already exists");
            return Ok(existing);
        }

        let mut isolation_supported = true;
        let mut degraded_reason = None;
        let mut last_conflict = None;

        for subnet in self.plan.candidates(id) {
            let spec = NetworkSpec::new(&name)
                .with_subnet(subnet)
                .with_label(LABEL_MANAGED, "true")
                .with_label(LABEL_CONTAINER, id.as_str())
                .with_label(LABEL_ROLE, "network");

            if isolation_supported {
                match self.runtime.create_network(&spec.clone().with_icc_disabled(true)).await {
                    Ok(network_id) => {
                        return Ok(self.ready(id, network_id, name, subnet, Isolation::Full));
                    }
                    Err(e) if e.is_address_conflict() => {
                        debug!(container_id = %id, %subnet, "Subnet taken, trying next");
                        last_conflict = Some(e.to_string());
                        continue;
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        EgressEvent::IsolationDegraded {
                            id: id.clone(),
                            reason: reason.clone(),
                            timestamp: SystemTime::now(),
                        }
                        .emit_trace();
                        isolation_supported = false;
                        degraded_reason = Some(reason);
                    }
                }
            }

            match self.runtime.create_network(&spec).await {
                Ok(network_id) => {
                    let isolation = Isolation::Degraded {
                        reason: degraded_reason.clone().unwrap_or_default(),
                    };
                    return Ok(self.ready(id, network_id, name, subnet, isolation));
                }
                Err(e) if e.is_address_conflict() => {
                    debug!(container_id = %id, %subnet, "Subnet taken, trying next");
                    last_conflict = Some(e.to_string());
                }
                Err(e) => {
                    return Err(Error::NetworkCreate {
                        network: name,
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(Error::NetworkCreate {
            network: name,
            message: last_conflict.map_or_else(
                || format!("no subnet available in {}", self.plan.pool),
                |conflict| format!("no free subnet in {} ({conflict})", self.plan.pool),
            ),
        })
    }

    fn ready(
        &self,
        id: &ContainerId,
        network_id: NetworkId,
        name: String,
        subnet: IpNet,
        isolation: Isolation,
    ) -> ProvisionedNetwork {
        EgressEvent::NetworkReady {
            id: id.clone(),
            network: name.clone(),
            isolated: isolation.is_full(),
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        info!(
            container_id = %id,
            network_id = %network_id.short(),
            %subnet,
            pool = %self.plan.pool,
            "Created container network"
        );

        ProvisionedNetwork {
            id: network_id,
            name,
            subnet: Some(subnet),
            isolation,
            created: true,
        }
    }

    /// Remove the container's network. Returns `false` if it was already gone.
    pub async fn destroy_network(&self, id: &ContainerId) -> Result<bool> {
        let removed = self.runtime.remove_network(&id.network_name()).await?;
        debug!(container_id = %id, removed, "Destroyed container network");
        Ok(removed)
    }
}

impl std::fmt::Debug for NetworkProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProvisioner")
            .field("runtime", &self.runtime.name())
            .field("plan", &self.plan)
            .finish()
    }
}
