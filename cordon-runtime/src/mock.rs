//! In-memory runtime for testing (no daemon required)

use async_trait::async_trait;
use cordon_core::{Error, NetworkId, Result};
use ipnet::{IpNet, Ipv4Net};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::docker::ICC_OPTION;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, NetworkInfo, NetworkSpec,
    label_matches,
};

/// Mock runtime that keeps networks and containers in memory
///
/// Behaviour can be scripted to exercise the engine's fallback paths:
/// missing isolation support, slow or never-ready containers, subnets already
/// taken on the host, failing inspections and network creation failures.
///
/// # Example
/// ```
/// use cordon_runtime::{ContainerRuntime, MockRuntime, NetworkSpec};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let runtime = MockRuntime::new();
/// runtime.create_network(&NetworkSpec::new("web-net")).await.unwrap();
/// assert!(runtime.has_network("web-net").await);
/// # });
/// ```
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

struct MockNetwork {
    id: NetworkId,
    subnet: IpNet,
    user_subnet: bool,
    options: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
}

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    address: Option<IpAddr>,
    inspections: u32,
}

struct MockState {
    networks: BTreeMap<String, MockNetwork>,
    containers: BTreeMap<String, MockContainer>,
    logs: BTreeMap<String, String>,
    occupied: Vec<IpNet>,
    icc_supported: bool,
    fail_network_create: bool,
    fail_running_inspect: bool,
    ready_after: Option<u32>,
    next_id: u64,
    call_count: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            networks: BTreeMap::new(),
            containers: BTreeMap::new(),
            logs: BTreeMap::new(),
            occupied: Vec::new(),
            icc_supported: true,
            fail_network_create: false,
            fail_running_inspect: false,
            ready_after: Some(0),
            next_id: 1,
            call_count: 0,
        }
    }
}

fn runtime_error(command: impl Into<String>, stderr: impl Into<String>) -> Error {
    Error::Runtime {
        command: command.into(),
        stderr: stderr.into(),
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

impl MockState {
    fn next_id(&mut self) -> String {
        let id = format!("{:016x}", self.next_id.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        self.next_id += 1;
        id
    }

    fn auto_subnet(&self) -> IpNet {
        (0..=u8::MAX)
            .map(|third| {
                IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(172, 30, third, 0), 24))
            })
            .find(|candidate| !self.networks.values().any(|n| overlaps(&n.subnet, candidate)))
            .unwrap_or_else(|| IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(172, 31, 0, 0), 24)))
    }

    fn used_addresses(&self, network: &str) -> Vec<IpAddr> {
        self.containers
            .values()
            .filter(|c| c.spec.network.as_deref() == Some(network))
            .filter_map(|c| c.address)
            .collect()
    }

    /// Reserve an address for a container being attached to `network`
    fn assign_address(&self, spec: &ContainerSpec, command: &str) -> Result<Option<IpAddr>> {
        let Some(network_name) = spec.network.as_deref() else {
            return Ok(None);
        };
        if network_name == "none" {
            return Ok(None);
        }

        let network = self.networks.get(network_name).ok_or_else(|| {
            runtime_error(command, format!("network {network_name} not found"))
        })?;
        let used = self.used_addresses(network_name);

        if let Some(ip) = spec.ip {
            if !network.user_subnet {
                return Err(runtime_error(
                    command,
                    "user specified IP address is supported only when connecting to networks with user configured subnets",
                ));
            }
            if !network.subnet.contains(&ip) {
                return Err(runtime_error(
                    command,
                    format!("no configured subnet contains IP address {ip}"),
                ));
            }
            if used.contains(&ip) {
                return Err(runtime_error(command, format!("Address {ip} already in use")));
            }
            return Ok(Some(ip));
        }

        // .1 is the gateway
        Ok(network
            .subnet
            .hosts()
            .skip(1)
            .find(|candidate| !used.contains(candidate)))
    }
}

impl MockRuntime {
    /// Create a new mock runtime
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Reject the inter-container isolation option, as some platforms do
    #[must_use]
    pub fn without_icc_support(self) -> Self {
        self.configure(|state| state.icc_supported = false)
    }

    /// Report container addresses only after `inspections` inspect calls
    #[must_use]
    pub fn with_ready_after(self, inspections: u32) -> Self {
        self.configure(|state| state.ready_after = Some(inspections))
    }

    /// Never report container addresses
    #[must_use]
    pub fn never_ready(self) -> Self {
        self.configure(|state| state.ready_after = None)
    }

    /// Fail every network creation
    #[must_use]
    pub fn fail_network_create(self) -> Self {
        self.configure(|state| state.fail_network_create = true)
    }

    /// Fail every inspection of a running container
    #[must_use]
    pub fn fail_running_inspect(self) -> Self {
        self.configure(|state| state.fail_running_inspect = true)
    }

    /// Treat `subnet` as already used on the host
    #[must_use]
    pub fn occupy_subnet(self, subnet: IpNet) -> Self {
        self.configure(|state| state.occupied.push(subnet))
    }

    fn configure(self, apply: impl FnOnce(&mut MockState)) -> Self {
        // Only called before the runtime is cloned.
        if let Ok(mut state) = self.state.try_lock() {
            apply(&mut state);
        }
        self
    }

    /// Get the number of runtime calls made (for testing)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.call_count
    }

    /// Check if a network exists
    pub async fn has_network(&self, name: &str) -> bool {
        self.state.lock().await.networks.contains_key(name)
    }

    /// Check if a container exists
    pub async fn has_container(&self, name: &str) -> bool {
        self.state.lock().await.containers.contains_key(name)
    }

    /// Check if a container is running
    pub async fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .get(name)
            .is_some_and(|c| c.running)
    }

    /// Spec a container was created from (for testing)
    pub async fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .await
            .containers
            .get(name)
            .map(|c| c.spec.clone())
    }

    /// Number of networks (for testing)
    pub async fn network_count(&self) -> usize {
        self.state.lock().await.networks.len()
    }

    /// Number of containers (for testing)
    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    /// Set what `container_logs` returns for a container
    pub async fn set_logs(&self, name: &str, logs: impl Into<String>) {
        self.state
            .lock()
            .await
            .logs
            .insert(name.to_string(), logs.into());
    }

    /// Remove a container behind the engine's back (crash, manual `rm`)
    pub async fn remove_externally(&self, name: &str) {
        self.state.lock().await.containers.remove(name);
    }

    async fn insert_container(&self, spec: &ContainerSpec, running: bool) -> Result<String> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let command = format!("{} --name {}", if running { "run" } else { "create" }, spec.name);
        if state.containers.contains_key(&spec.name) {
            return Err(runtime_error(
                command,
                format!("container name \"/{}\" is already in use", spec.name),
            ));
        }

        let address = state.assign_address(spec, &command)?;
        let id = state.next_id();
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running,
                address,
                inspections: 0,
            },
        );

        tracing::debug!(name = %spec.name, ?address, running, "Mock: Created container");

        Ok(id)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime").finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        Ok(state.networks.get(name).map(|network| NetworkInfo {
            id: network.id.clone(),
            name: name.to_string(),
            subnets: vec![network.subnet],
            options: network.options.clone(),
            labels: network.labels.clone(),
        }))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkId> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let command = format!("network create {}", spec.name);

        if state.fail_network_create {
            return Err(runtime_error(command, "failed to create network: plugin error"));
        }
        if state.networks.contains_key(&spec.name) {
            return Err(runtime_error(
                command,
                format!("network with name {} already exists", spec.name),
            ));
        }
        if spec.disable_icc && !state.icc_supported {
            return Err(runtime_error(
                command,
                format!("unsupported driver option {ICC_OPTION}"),
            ));
        }

        let subnet = match spec.subnet {
            Some(subnet) => {
                let taken = state
                    .occupied
                    .iter()
                    .chain(state.networks.values().map(|n| &n.subnet))
                    .any(|existing| overlaps(existing, &subnet));
                if taken {
                    return Err(runtime_error(
                        command,
                        "Pool overlaps with other one on this address space",
                    ));
                }
                subnet
            }
            None => state.auto_subnet(),
        };

        let mut options = BTreeMap::new();
        if spec.disable_icc {
            options.insert(ICC_OPTION.to_string(), "false".to_string());
        }

        let id = NetworkId::new(state.next_id());
        state.networks.insert(
            spec.name.clone(),
            MockNetwork {
                id: id.clone(),
                subnet,
                user_subnet: spec.subnet.is_some(),
                options,
                labels: spec.labels.clone(),
            },
        );

        tracing::debug!(name = %spec.name, %subnet, isolated = spec.disable_icc, "Mock: Created network");

        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if !state.networks.contains_key(name) {
            return Ok(false);
        }
        if !state.used_addresses(name).is_empty()
            || state
                .containers
                .values()
                .any(|c| c.spec.network.as_deref() == Some(name))
        {
            return Err(runtime_error(
                format!("network rm {name}"),
                format!("error while removing network: network {name} has active endpoints"),
            ));
        }

        state.networks.remove(name);
        Ok(true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.insert_container(spec, false).await
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.insert_container(spec, true).await
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let ready_after = state.ready_after;
        let fail_running = state.fail_running_inspect;
        let Some(container) = state.containers.get_mut(name) else {
            return Ok(None);
        };
        if fail_running && container.running {
            return Err(runtime_error(
                format!("inspect {name}"),
                "error during connect: daemon is restarting",
            ));
        }

        let visible = ready_after.is_some_and(|after| container.inspections >= after);
        container.inspections = container.inspections.saturating_add(1);

        let mut networks = BTreeMap::new();
        if let Some(network) = container.spec.network.clone() {
            let address = if container.running && visible {
                container.address
            } else {
                None
            };
            networks.insert(network, address);
        }

        Ok(Some(ContainerState {
            id: container.id.clone(),
            name: name.to_string(),
            running: container.running,
            status: if container.running { "running" } else { "created" }.to_string(),
            labels: container.spec.labels.clone(),
            networks,
            dns: container.spec.dns.clone(),
        }))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let container = state.containers.get_mut(name).ok_or_else(|| {
            runtime_error(format!("start {name}"), format!("No such container: {name}"))
        })?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let container = state.containers.get_mut(name).ok_or_else(|| {
            runtime_error(format!("stop {name}"), format!("No such container: {name}"))
        })?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        state.logs.remove(name);
        Ok(state.containers.remove(name).is_some())
    }

    async fn container_logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if !state.containers.contains_key(name) {
            return Err(runtime_error(
                format!("logs {name}"),
                format!("No such container: {name}"),
            ));
        }

        let logs = state.logs.get(name).cloned().unwrap_or_default();
        Ok(match tail {
            Some(n) => {
                let lines: Vec<&str> = logs.lines().collect();
                let start = lines.len().saturating_sub(n);
                lines[start..].iter().map(|l| format!("{l}\n")).collect()
            }
            None => logs,
        })
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| label_matches(&c.spec.labels, label))
            .map(|(name, c)| ContainerSummary {
                name: name.clone(),
                state: if c.running { "running" } else { "created" }.to_string(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_mock_network_lifecycle() {
        let runtime = MockRuntime::new();
        let spec = NetworkSpec::new("web-net")
            .with_subnet(subnet("10.213.4.0/24"))
            .with_icc_disabled(true);

        let id = runtime.create_network(&spec).await.unwrap();
        let info = runtime.inspect_network("web-net").await.unwrap().unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.options.get(ICC_OPTION).map(String::as_str), Some("false"));

        assert!(runtime.create_network(&spec).await.is_err());
        assert!(runtime.remove_network("web-net").await.unwrap());
        assert!(!runtime.remove_network("web-net").await.unwrap());
        assert_eq!(runtime.call_count().await, 5);
    }

    #[tokio::test]
    async fn test_mock_icc_unsupported() {
        let runtime = MockRuntime::new().without_icc_support();
        let spec = NetworkSpec::new("web-net").with_icc_disabled(true);

        let err = runtime.create_network(&spec).await.unwrap_err();
        assert!(!err.is_address_conflict());
        assert!(
            runtime
                .create_network(&spec.with_icc_disabled(false))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_mock_occupied_subnet() {
        let runtime = MockRuntime::new().occupy_subnet(subnet("10.213.0.0/20"));
        let err = runtime
            .create_network(&NetworkSpec::new("a").with_subnet(subnet("10.213.4.0/24")))
            .await
            .unwrap_err();
        assert!(err.is_address_conflict());

        runtime
            .create_network(&NetworkSpec::new("b").with_subnet(subnet("10.213.16.0/24")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mock_static_address_rules() {
        let runtime = MockRuntime::new();
        runtime
            .create_network(&NetworkSpec::new("web-net").with_subnet(subnet("10.213.4.0/24")))
            .await
            .unwrap();
        runtime.create_network(&NetworkSpec::new("auto-net")).await.unwrap();

        let ip: IpAddr = "10.213.4.2".parse().unwrap();
        let spec = ContainerSpec::new("web-dns", "dnsmasq")
            .with_network("web-net")
            .with_ip(Some(ip));
        runtime.run_container(&spec).await.unwrap();

        let state = runtime.inspect_container("web-dns").await.unwrap().unwrap();
        assert_eq!(state.address_on("web-net"), Some(ip));

        // Taken address
        let clash = ContainerSpec::new("other", "dnsmasq")
            .with_network("web-net")
            .with_ip(Some(ip));
        assert!(runtime.run_container(&clash).await.is_err());

        // Outside the subnet
        let outside = ContainerSpec::new("other", "dnsmasq")
            .with_network("web-net")
            .with_ip(Some("10.9.9.9".parse().unwrap()));
        assert!(runtime.run_container(&outside).await.is_err());

        // No user-configured subnet
        let auto = ContainerSpec::new("other", "dnsmasq")
            .with_network("auto-net")
            .with_ip(Some("172.30.0.5".parse().unwrap()));
        assert!(runtime.run_container(&auto).await.is_err());

        // Dynamic address skips the gateway and the taken one
        let dynamic = ContainerSpec::new("web", "alpine").with_network("web-net");
        runtime.run_container(&dynamic).await.unwrap();
        let state = runtime.inspect_container("web").await.unwrap().unwrap();
        assert_eq!(state.address_on("web-net"), Some("10.213.4.3".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_mock_readiness_delay() {
        let runtime = MockRuntime::new().with_ready_after(2);
        runtime.create_network(&NetworkSpec::new("net")).await.unwrap();
        runtime
            .run_container(&ContainerSpec::new("c", "img").with_network("net"))
            .await
            .unwrap();

        for _ in 0..2 {
            let state = runtime.inspect_container("c").await.unwrap().unwrap();
            assert_eq!(state.address_on("net"), None);
        }
        let state = runtime.inspect_container("c").await.unwrap().unwrap();
        assert!(state.address_on("net").is_some());
    }

    #[tokio::test]
    async fn test_mock_network_in_use() {
        let runtime = MockRuntime::new();
        runtime.create_network(&NetworkSpec::new("net")).await.unwrap();
        runtime
            .create_container(&ContainerSpec::new("c", "img").with_network("net"))
            .await
            .unwrap();

        assert!(runtime.remove_network("net").await.is_err());
        assert!(runtime.remove_container("c").await.unwrap());
        assert!(!runtime.remove_container("c").await.unwrap());
        assert!(runtime.remove_network("net").await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_logs_and_listing() {
        let runtime = MockRuntime::new();
        runtime
            .create_container(&ContainerSpec::new("web", "img").with_label("cordon.managed", "true"))
            .await
            .unwrap();
        runtime
            .create_container(&ContainerSpec::new("misc", "img"))
            .await
            .unwrap();
        runtime.set_logs("web", "one\ntwo\nthree\n").await;

        assert_eq!(runtime.container_logs("web", Some(2)).await.unwrap(), "two\nthree\n");
        assert!(runtime.container_logs("missing", None).await.is_err());

        let listed = runtime.list_containers("cordon.managed=true").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "web");
    }
}
