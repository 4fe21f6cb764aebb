//! `docker`/`podman` command-line backend
//!
//! Every operation shells out to the runtime binary and parses its JSON
//! output. Argument lists are built by pure functions so they can be checked
//! without a runtime installed.

use async_trait::async_trait;
use cordon_core::{Error, NetworkId, Result};
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, NetworkInfo, NetworkSpec,
};

/// Driver option that disables inter-container communication on a bridge
pub const ICC_OPTION: &str = "com.docker.network.bridge.enable_icc";

/// Runtime backed by the `docker` or `podman` binary
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    /// Use `binary` (a name on `PATH` or an absolute path)
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the binary and return stdout. Non-zero exit becomes [`Error::Runtime`].
    async fn exec(&self, args: &[String]) -> Result<Output> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "Running container runtime");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::RuntimeUnavailable {
                binary: self.binary.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            trace!(command = %command, stderr = %stderr.trim(), "Runtime command failed");
            return Err(Error::Runtime {
                command,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(Output { stdout, stderr })
    }
}

struct Output {
    stdout: String,
    stderr: String,
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<String> {
    fixed.iter().map(ToString::to_string).collect()
}

/// Arguments for `network create`
#[must_use]
pub fn network_create_args(spec: &NetworkSpec) -> Vec<String> {
    let mut out = args(["network", "create", "--driver", "bridge"]);

    if let Some(subnet) = spec.subnet {
        out.push("--subnet".to_string());
        out.push(subnet.to_string());
    }
    if spec.disable_icc {
        out.push("-o".to_string());
        out.push(format!("{ICC_OPTION}=false"));
    }
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }

    out.push(spec.name.clone());
    out
}

/// Arguments for `create` (or `run -d` when `detach` is set)
#[must_use]
pub fn container_create_args(spec: &ContainerSpec, detach: bool) -> Vec<String> {
    let mut out = if detach {
        args(["run", "-d"])
    } else {
        args(["create"])
    };

    out.push("--name".to_string());
    out.push(spec.name.clone());

    if let Some(network) = &spec.network {
        out.push("--network".to_string());
        out.push(network.clone());
    }
    if let Some(ip) = spec.ip {
        out.push(if ip.is_ipv4() { "--ip" } else { "--ip6" }.to_string());
        out.push(ip.to_string());
    }
    for server in &spec.dns {
        out.push("--dns".to_string());
        out.push(server.to_string());
    }
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        out.push("-v".to_string());
        let mut volume = format!("{}:{}", mount.source.display(), mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        out.push(volume);
    }
    if let Some(policy) = &spec.restart {
        out.push("--restart".to_string());
        out.push(policy.clone());
    }
    if let Some(entrypoint) = &spec.entrypoint {
        out.push("--entrypoint".to_string());
        out.push(entrypoint.clone());
    }

    out.push(spec.image.clone());
    out.extend(spec.command.iter().cloned());
    out
}

#[derive(Deserialize)]
struct RawNetwork {
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Id", alias = "ID")]
    id: String,
    #[serde(default, alias = "IPAM")]
    ipam: Option<RawIpam>,
    #[serde(default)]
    subnets: Option<Vec<RawSubnet>>,
    #[serde(default, alias = "Options")]
    options: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct RawIpam {
    #[serde(default, rename = "Config")]
    config: Option<Vec<RawSubnet>>,
}

#[derive(Deserialize)]
struct RawSubnet {
    #[serde(default, alias = "Subnet")]
    subnet: Option<String>,
}

/// Parse `network inspect` output (a JSON array with one object)
pub fn parse_network_inspect(json: &str) -> Result<Option<NetworkInfo>> {
    let mut raw: Vec<RawNetwork> = serde_json::from_str(json)?;
    let Some(network) = raw.pop() else {
        return Ok(None);
    };

    let subnets = network
        .ipam
        .and_then(|ipam| ipam.config)
        .into_iter()
        .flatten()
        .chain(network.subnets.into_iter().flatten())
        .filter_map(|s| s.subnet)
        .filter_map(|s| s.parse::<IpNet>().ok())
        .collect();

    Ok(Some(NetworkInfo {
        id: NetworkId::new(network.id),
        name: network.name,
        subnets,
        options: network.options.unwrap_or_default(),
        labels: network.labels.unwrap_or_default(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    name: String,
    #[serde(default)]
    state: Option<RawState>,
    #[serde(default)]
    config: Option<RawConfig>,
    #[serde(default)]
    host_config: Option<RawHostConfig>,
    #[serde(default)]
    network_settings: Option<RawNetworkSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHostConfig {
    #[serde(default)]
    dns: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, RawEndpoint>>,
}

#[derive(Deserialize)]
struct RawEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
}

/// Parse `container inspect` output (a JSON array with one object)
pub fn parse_container_inspect(json: &str) -> Result<Option<ContainerState>> {
    let mut raw: Vec<RawContainer> = serde_json::from_str(json)?;
    let Some(container) = raw.pop() else {
        return Ok(None);
    };

    let (running, status) = container
        .state
        .map_or((false, String::new()), |s| (s.running, s.status));

    let networks = container
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| {
            let address = endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .and_then(|ip| ip.parse::<IpAddr>().ok());
            (name, address)
        })
        .collect();

    let dns = container
        .host_config
        .and_then(|host| host.dns)
        .unwrap_or_default()
        .iter()
        .filter_map(|server| server.parse::<IpAddr>().ok())
        .collect();

    Ok(Some(ContainerState {
        id: container.id,
        name: container.name.trim_start_matches('/').to_string(),
        running,
        status,
        labels: container
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default(),
        networks,
        dns,
    }))
}

/// Parse one line of `ps --format '{{json .}}'`
///
/// Docker reports `Names` and `Labels` as comma-separated strings, podman as
/// an array and an object.
pub fn parse_ps_line(line: &str) -> Result<Option<ContainerSummary>> {
    let value: Value = serde_json::from_str(line)?;

    let name = match &value["Names"] {
        Value::String(names) => names.split(',').next().map(ToString::to_string),
        Value::Array(names) => names.first().and_then(Value::as_str).map(ToString::to_string),
        _ => None,
    };
    let Some(name) = name else {
        return Ok(None);
    };

    let labels = match &value["Labels"] {
        Value::String(labels) => labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Value::Object(labels) => labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    };

    let state = value["State"].as_str().unwrap_or_default().to_string();

    Ok(Some(ContainerSummary {
        name,
        state,
        labels,
    }))
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        match self.exec(&args(["network", "inspect", name])).await {
            Ok(output) => parse_network_inspect(&output.stdout),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkId> {
        let output = self.exec(&network_create_args(spec)).await?;
        Ok(NetworkId::new(output.stdout))
    }

    async fn remove_network(&self, name: &str) -> Result<bool> {
        match self.exec(&args(["network", "rm", name])).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.exec(&container_create_args(spec, false)).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.exec(&container_create_args(spec, true)).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>> {
        match self.exec(&args(["container", "inspect", name])).await {
            Ok(output) => parse_container_inspect(&output.stdout),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.exec(&args(["start", name])).await.map(drop)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.exec(&args(["stop", name])).await.map(drop)
    }

    async fn remove_container(&self, name: &str) -> Result<bool> {
        match self.exec(&args(["rm", "-f", name])).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn container_logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        let mut cmd = args(["logs"]);
        if let Some(lines) = tail {
            cmd.push("--tail".to_string());
            cmd.push(lines.to_string());
        }
        cmd.push(name.to_string());

        let output = self.exec(&cmd).await?;
        let mut combined = output.stdout;
        combined.push_str(&output.stderr);
        Ok(combined)
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={label}");
        let output = self
            .exec(&args(["ps", "-a", "--filter", filter.as_str(), "--format", "{{json .}}"]))
            .await?;

        let mut rows = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_ps_line(line) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unparseable container listing line"),
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerSpec;

    #[test]
    fn test_network_create_args() {
        let spec = NetworkSpec::new("web-net")
            .with_subnet("10.213.4.0/24".parse().unwrap())
            .with_icc_disabled(true)
            .with_label("cordon.container", "web");

        assert_eq!(
            network_create_args(&spec),
            vec![
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet",
                "10.213.4.0/24",
                "-o",
                "com.docker.network.bridge.enable_icc=false",
                "--label",
                "cordon.container=web",
                "web-net",
            ]
        );

        let plain = network_create_args(&NetworkSpec::new("web-net"));
        assert_eq!(plain, vec!["network", "create", "--driver", "bridge", "web-net"]);
    }

    #[test]
    fn test_container_create_args() {
        let spec = ContainerSpec::new("web-dns", "dnsmasq:latest")
            .with_network("web-net")
            .with_ip(Some("10.213.4.2".parse().unwrap()))
            .with_mount("/state/web/dnsmasq.conf", "/etc/dnsmasq.conf", true)
            .with_restart("unless-stopped")
            .with_command(vec!["--keep-in-foreground".to_string()]);

        let out = container_create_args(&spec, true);
        assert_eq!(&out[..4], &["run", "-d", "--name", "web-dns"]);
        assert!(out.windows(2).any(|w| w == ["--ip", "10.213.4.2"]));
        assert!(
            out.windows(2)
                .any(|w| w == ["-v", "/state/web/dnsmasq.conf:/etc/dnsmasq.conf:ro"])
        );
        assert!(out.windows(2).any(|w| w == ["--restart", "unless-stopped"]));
        assert_eq!(out[out.len() - 2..], ["dnsmasq:latest", "--keep-in-foreground"]);

        let created = container_create_args(&ContainerSpec::new("web", "alpine"), false);
        assert_eq!(created, vec!["create", "--name", "web", "alpine"]);
    }

    #[test]
    fn test_parse_docker_network_inspect() {
        let json = r#"[{
            "Name": "web-net",
            "Id": "4f7c1d0e9a3b2c1d",
            "IPAM": {"Driver": "default", "Config": [{"Subnet": "10.213.4.0/24", "Gateway": "10.213.4.1"}]},
            "Options": {"com.docker.network.bridge.enable_icc": "false"},
            "Labels": {"cordon.container": "web"}
        }]"#;

        let info = parse_network_inspect(json).unwrap().unwrap();
        assert_eq!(info.name, "web-net");
        assert_eq!(info.id.as_str(), "4f7c1d0e9a3b2c1d");
        assert_eq!(info.subnets, vec!["10.213.4.0/24".parse::<IpNet>().unwrap()]);
        assert_eq!(info.options.get(ICC_OPTION).map(String::as_str), Some("false"));
    }

    #[test]
    fn test_parse_podman_network_inspect() {
        let json = r#"[{
            "name": "web-net",
            "id": "a1b2c3",
            "driver": "bridge",
            "subnets": [{"subnet": "10.213.4.0/24", "gateway": "10.213.4.1"}],
            "options": {},
            "labels": null
        }]"#;

        let info = parse_network_inspect(json).unwrap().unwrap();
        assert_eq!(info.subnets.len(), 1);
        assert!(info.labels.is_empty());
        assert_eq!(parse_network_inspect("[]").unwrap(), None);
    }

    #[test]
    fn test_parse_container_inspect() {
        let json = r#"[{
            "Id": "abc123",
            "Name": "/web-dns",
            "State": {"Status": "running", "Running": true},
            "Config": {"Labels": {"cordon.role": "dns"}},
            "HostConfig": {"Dns": ["10.213.4.2"]},
            "NetworkSettings": {"Networks": {
                "web-net": {"IPAddress": "10.213.4.2"},
                "other": {"IPAddress": ""}
            }}
        }]"#;

        let state = parse_container_inspect(json).unwrap().unwrap();
        assert_eq!(state.name, "web-dns");
        assert!(state.running);
        assert_eq!(state.address_on("web-net"), Some("10.213.4.2".parse().unwrap()));
        assert_eq!(state.address_on("other"), None);
        assert_eq!(state.dns, vec!["10.213.4.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(state.labels.get("cordon.role").map(String::as_str), Some("dns"));
    }

    #[test]
    fn test_parse_ps_lines() {
        let docker = r#"{"Names":"web","State":"running","Labels":"cordon.managed=true,cordon.egress=strict+custom"}"#;
        let row = parse_ps_line(docker).unwrap().unwrap();
        assert_eq!(row.name, "web");
        assert_eq!(
            row.labels.get("cordon.egress").map(String::as_str),
            Some("strict+custom")
        );

        let podman = r#"{"Names":["web"],"State":"exited","Labels":{"cordon.managed":"true"}}"#;
        let row = parse_ps_line(podman).unwrap().unwrap();
        assert_eq!(row.state, "exited");
        assert_eq!(row.labels.len(), 1);

        assert!(parse_ps_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runtime = CliRuntime::new("/nonexistent/cordon-test-runtime");
        let err = runtime.inspect_network("web-net").await.unwrap_err();
        assert!(matches!(err, Error::RuntimeUnavailable { .. }));
    }
}
