//! Runtime trait and the values exchanged with it

use async_trait::async_trait;
use cordon_core::{NetworkId, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// Request to create a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// User-configured subnet (required for static container addresses)
    pub subnet: Option<IpNet>,
    /// Disable inter-container communication on the bridge
    pub disable_icc: bool,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// Bridge network with no subnet, isolation or labels
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet: None,
            disable_icc: false,
            labels: BTreeMap::new(),
        }
    }

    /// Set the subnet
    #[must_use]
    pub const fn with_subnet(mut self, subnet: IpNet) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Request inter-container isolation
    #[must_use]
    pub const fn with_icc_disabled(mut self, disabled: bool) -> Self {
        self.disable_icc = disabled;
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// What the runtime reports about an existing network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Runtime-assigned identifier
    pub id: NetworkId,
    /// Network name
    pub name: String,
    /// Configured subnets
    pub subnets: Vec<IpNet>,
    /// Driver options
    pub options: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Bind mount into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path
    pub source: PathBuf,
    /// Path inside the container
    pub target: String,
    /// Mount read-only
    pub read_only: bool,
}

/// Request to create a container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Network to attach to (`none` for no networking)
    pub network: Option<String>,
    /// Static address on `network`
    pub ip: Option<IpAddr>,
    /// DNS servers written into the container's resolver configuration
    pub dns: Vec<IpAddr>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// Entrypoint override
    pub entrypoint: Option<String>,
    /// Command and arguments
    pub command: Vec<String>,
    /// Restart policy (`unless-stopped`, ...)
    pub restart: Option<String>,
}

impl ContainerSpec {
    /// Container with only a name and image
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    /// Attach to a network
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Request a static address
    #[must_use]
    pub const fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    /// Add a DNS server
    #[must_use]
    pub fn with_dns(mut self, server: IpAddr) -> Self {
        self.dns.push(server);
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a bind mount
    #[must_use]
    pub fn with_mount(mut self, source: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        self.mounts.push(Mount {
            source: source.into(),
            target: target.into(),
            read_only,
        });
        self
    }

    /// Override the entrypoint
    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Set the command
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Set the restart policy
    #[must_use]
    pub fn with_restart(mut self, policy: impl Into<String>) -> Self {
        self.restart = Some(policy.into());
        self
    }
}

/// What the runtime reports about an existing container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerState {
    /// Runtime-assigned identifier
    pub id: String,
    /// Container name
    pub name: String,
    /// Whether the main process is running
    pub running: bool,
    /// Runtime status string (`running`, `exited`, ...)
    pub status: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Attached networks and the address on each, once assigned
    pub networks: BTreeMap<String, Option<IpAddr>>,
    /// Configured DNS servers
    pub dns: Vec<IpAddr>,
}

impl ContainerState {
    /// Address on a given network
    #[must_use]
    pub fn address_on(&self, network: &str) -> Option<IpAddr> {
        self.networks.get(network).copied().flatten()
    }
}

/// One row of a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Container name
    pub name: String,
    /// Runtime state (`running`, `exited`, ...)
    pub state: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Operations the egress engine needs from a container runtime
///
/// Removal and inspection report absence through their return value rather
/// than an error, so callers can be idempotent without string matching.
///
/// # Thread Safety
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for messages (`docker`, `podman`, `mock`)
    fn name(&self) -> &str;

    /// Inspect a network by name
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>>;

    /// Create a network
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkId>;

    /// Remove a network. Returns `false` if it did not exist.
    async fn remove_network(&self, name: &str) -> Result<bool>;

    /// Create a container without starting it
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Create and start a detached container
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Inspect a container by name
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>>;

    /// Start a stopped container
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop a running container
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Force-remove a container. Returns `false` if it did not exist.
    async fn remove_container(&self, name: &str) -> Result<bool>;

    /// Combined stdout/stderr of a container
    async fn container_logs(&self, name: &str, tail: Option<usize>) -> Result<String>;

    /// Containers carrying a label (`key` or `key=value`)
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;
}

/// Whether `labels` satisfies a `key` or `key=value` filter
#[must_use]
pub fn label_matches(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}
