//! DNS filtering sidecar lifecycle
//!
//! The sidecar is a dnsmasq container attached to the container's network.
//! Its configuration is rendered from the effective policy into the state
//! directory and bind-mounted read-only. Supervision after start is left to
//! the runtime's restart policy.

use cordon_core::{
    ContainerId, EgressEvent, EngineConfig, Error, LABEL_CONTAINER, LABEL_EGRESS, LABEL_ROLE,
    Result,
};
use cordon_policy::{EffectivePolicy, RuleRepository, load, merge};
use cordon_runtime::{ContainerRuntime, ContainerSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::dns::{DnsRuleSet, filter_blocked};
use crate::provisioner::{NetworkProvisioner, SubnetPlan};

/// Rendered resolver configuration inside a sidecar state directory
pub const CONFIG_FILE: &str = "dnsmasq.conf";

/// Applied-rules snapshot inside a sidecar state directory
pub const SNAPSHOT_FILE: &str = "rules.json";

/// Where the configuration is mounted inside the sidecar
const CONFIG_MOUNT: &str = "/etc/dnsmasq.conf";

/// What a running sidecar was last configured with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRules {
    /// Container the sidecar serves
    pub container: ContainerId,
    /// Profile the policy came from
    pub profile: String,
    /// `profile[+custom]`
    pub label: String,
    /// Address the sidecar listens on
    pub address: IpAddr,
    /// Rules in effect
    pub rules: DnsRuleSet,
}

/// Starts, restarts and queries DNS sidecars
pub struct SidecarManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RuleRepository>,
    provisioner: NetworkProvisioner,
    config: EngineConfig,
}

impl SidecarManager {
    /// Create a manager
    ///
    /// # Errors
    /// Returns error if the configuration is inconsistent.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RuleRepository>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let provisioner = NetworkProvisioner::new(Arc::clone(&runtime), SubnetPlan::from_config(&config)?);
        Ok(Self {
            runtime,
            store,
            provisioner,
            config,
        })
    }

    /// Provisioner sharing this manager's runtime and subnet plan
    #[must_use]
    pub const fn provisioner(&self) -> &NetworkProvisioner {
        &self.provisioner
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn state_dir(&self, id: &ContainerId) -> PathBuf {
        self.config.sidecar_dir(id)
    }

    /// Start a sidecar for `policy`, replacing any previous one
    ///
    /// With `static_address` the sidecar must come up on exactly that
    /// address. The sidecar is removed again if it never reports an address or
    /// reports a different one.
    pub async fn start_sidecar(
        &self,
        id: &ContainerId,
        policy: &EffectivePolicy,
        static_address: Option<IpAddr>,
    ) -> Result<IpAddr> {
        if policy.is_airgapped() {
            return Err(Error::InvalidConfig {
                message: format!("profile {} has no network, so no DNS sidecar", policy.profile),
            });
        }

        let name = id.sidecar_name();
        let network = id.network_name();

        if remove_sidecar(self.runtime.as_ref(), id).await? {
            EgressEvent::SidecarReplaced {
                id: id.clone(),
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        }

        let rules = DnsRuleSet::build(
            policy,
            &self.config.upstream_resolvers,
            self.config.block_response,
        );

        let dir = self.state_dir(id);
        fs::create_dir_all(&dir).await?;
        let config_path = dir.join(CONFIG_FILE);
        let header = format!(
            "DNS sidecar for {id}\nPolicy: {} ({})",
            policy.label(),
            policy.default_action
        );
        fs::write(&config_path, rules.render_dnsmasq(&header)).await?;

        let spec = ContainerSpec::new(&name, &self.config.sidecar_image)
            .with_network(&network)
            .with_ip(static_address)
            .with_label(LABEL_ROLE, "dns")
            .with_label(LABEL_CONTAINER, id.as_str())
            .with_label(LABEL_EGRESS, policy.label())
            .with_mount(&config_path, CONFIG_MOUNT, true)
            .with_entrypoint("dnsmasq")
            .with_command(vec![
                "--keep-in-foreground".to_string(),
                format!("--conf-file={CONFIG_MOUNT}"),
            ])
            .with_restart("unless-stopped");

        debug!(
            container_id = %id,
            sidecar = %name,
            requested = ?static_address,
            rules = rules.len(),
            "Starting DNS sidecar"
        );

        if let Err(e) = self.runtime.run_container(&spec).await {
            self.discard(&name).await;
            return Err(e);
        }

        let ready = match self.wait_for_address(&name, &network).await {
            Ok(ready) => ready,
            Err(e) => {
                self.discard(&name).await;
                return Err(e);
            }
        };
        let Some(address) = ready else {
            self.discard(&name).await;
            EgressEvent::SidecarTimedOut {
                id: id.clone(),
                attempts: self.config.readiness_attempts,
                timestamp: SystemTime::now(),
            }
            .emit_trace();
            return Err(Error::SidecarStartTimeout {
                container: id.to_string(),
                attempts: self.config.readiness_attempts,
            });
        };

        if let Some(requested) = static_address
            && requested != address
        {
            self.discard(&name).await;
            return Err(Error::SidecarAddressMismatch {
                container: id.to_string(),
                requested,
                actual: address,
            });
        }

        let applied = AppliedRules {
            container: id.clone(),
            profile: policy.profile.clone(),
            label: policy.label(),
            address,
            rules,
        };
        fs::write(dir.join(SNAPSHOT_FILE), serde_json::to_vec_pretty(&applied)?).await?;

        EgressEvent::SidecarStarted {
            id: id.clone(),
            address,
            rules: applied.rules.len(),
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        Ok(address)
    }

    async fn wait_for_address(&self, name: &str, network: &str) -> Result<Option<IpAddr>> {
        let attempts = self.config.readiness_attempts;

        for attempt in 1..=attempts {
            if let Some(state) = self.runtime.inspect_container(name).await?
                && state.running
                && let Some(address) = state.address_on(network)
            {
                debug!(sidecar = %name, %address, attempt, "DNS sidecar reported address");
                return Ok(Some(address));
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.readiness_interval).await;
            }
        }

        Ok(None)
    }

    async fn discard(&self, name: &str) {
        if let Err(e) = self.runtime.remove_container(name).await {
            warn!(sidecar = %name, error = %e, "Failed to remove partial DNS sidecar");
        }
    }

    /// Address the container's sidecar currently reports
    ///
    /// A container squatting on the sidecar name is not reported.
    pub async fn get_sidecar_address(&self, id: &ContainerId) -> Result<Option<IpAddr>> {
        Ok(self
            .runtime
            .inspect_container(&id.sidecar_name())
            .await?
            .filter(|state| is_sidecar_of(&state.labels, id))
            .and_then(|state| state.address_on(&id.network_name())))
    }

    /// Rebuild the effective policy from `profile` and the stored custom rules
    /// and start a fresh sidecar with it
    ///
    /// With `preserve_address` the new sidecar must bind the address the
    /// container already resolves through: the running sidecar's, else the DNS
    /// server configured on the container, else the last snapshot's. Failing to
    /// bind it is an error. Profiles without a network are skipped and yield
    /// `None`.
    pub async fn restart_sidecar(
        &self,
        id: &ContainerId,
        profile: &str,
        preserve_address: bool,
    ) -> Result<Option<IpAddr>> {
        let profile = load(profile)?;
        if profile.is_airgapped() {
            info!(container_id = %id, profile = %profile.name(), "Profile has no network, skipping DNS sidecar");
            return Ok(None);
        }

        let custom = self.store.load(id).await?;
        let policy = merge(&profile, &custom);
        let network = self.provisioner.create_network(id).await?;

        let previous = if preserve_address {
            self.previous_address(id).await?
        } else {
            None
        };

        if let Some(previous) = previous
            && !network.subnet.is_some_and(|subnet| subnet.contains(&previous))
        {
            warn!(
                container_id = %id,
                %previous,
                subnet = ?network.subnet,
                "Previous sidecar address is outside the container network"
            );
        }
        let address = previous.or_else(|| network.sidecar_address());

        self.start_sidecar(id, &policy, address).await.map(Some)
    }

    async fn previous_address(&self, id: &ContainerId) -> Result<Option<IpAddr>> {
        if let Some(address) = self.get_sidecar_address(id).await? {
            return Ok(Some(address));
        }

        if let Some(state) = self.runtime.inspect_container(id.as_str()).await?
            && let Some(address) = state.dns.first()
        {
            debug!(container_id = %id, %address, "Recovered sidecar address from container DNS");
            return Ok(Some(*address));
        }

        Ok(self.applied_rules(id).await?.map(|applied| applied.address))
    }

    /// Snapshot written by the last successful start
    pub async fn applied_rules(&self, id: &ContainerId) -> Result<Option<AppliedRules>> {
        match fs::read(self.state_dir(id).join(SNAPSHOT_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sidecar query log, optionally restricted to refused answers
    pub async fn query_logs(
        &self,
        id: &ContainerId,
        tail: Option<usize>,
        blocked_only: bool,
    ) -> Result<String> {
        let logs = self
            .runtime
            .container_logs(&id.sidecar_name(), tail)
            .await?;
        Ok(if blocked_only {
            filter_blocked(&logs)
        } else {
            logs
        })
    }
}

/// Whether `labels` mark a container as the DNS sidecar of `id`
#[must_use]
pub fn is_sidecar_of(labels: &BTreeMap<String, String>, id: &ContainerId) -> bool {
    labels.get(LABEL_ROLE).map(String::as_str) == Some("dns")
        && labels.get(LABEL_CONTAINER).map(String::as_str) == Some(id.as_str())
}

/// Remove the DNS sidecar of `id`. Returns `false` if there was none.
///
/// # Errors
/// Returns [`Error::NameConflict`] if a container that is not this sidecar
/// holds the sidecar name; it is left untouched.
pub async fn remove_sidecar(runtime: &dyn ContainerRuntime, id: &ContainerId) -> Result<bool> {
    let name = id.sidecar_name();
    let Some(state) = runtime.inspect_container(&name).await? else {
        return Ok(false);
    };
    if !is_sidecar_of(&state.labels, id) {
        return Err(Error::NameConflict {
            name,
            container: id.to_string(),
        });
    }
    runtime.remove_container(&name).await
}

impl std::fmt::Debug for SidecarManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarManager")
            .field("runtime", &self.runtime.name())
            .field("provisioner", &self.provisioner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_policy::{CustomRuleSet, FileRuleStore};
    use cordon_runtime::MockRuntime;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        runtime: MockRuntime,
        manager: SidecarManager,
    }

    fn fixture(runtime: MockRuntime) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(tmp.path()).with_readiness(3, Duration::from_millis(1));
        let store = Arc::new(FileRuleStore::new(config.rules_dir()));
        let manager = SidecarManager::new(Arc::new(runtime.clone()), store, config).unwrap();
        Fixture {
            _tmp: tmp,
            runtime,
            manager,
        }
    }

    fn policy(name: &str) -> EffectivePolicy {
        merge(&load(name).unwrap(), &CustomRuleSet::new())
    }

    #[tokio::test]
    async fn test_start_writes_config_and_snapshot() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("web").unwrap();
        let network = f.manager.provisioner().create_network(&id).await.unwrap();
        let requested = network.sidecar_address();

        let address = f
            .manager
            .start_sidecar(&id, &policy("strict"), requested)
            .await
            .unwrap();
        assert_eq!(Some(address), requested);

        let dir = f.manager.config().sidecar_dir(&id);
        let conf = std::fs::read_to_string(dir.join(CONFIG_FILE)).unwrap();
        assert!(conf.contains("address=/#/"));

        let applied = f.manager.applied_rules(&id).await.unwrap().unwrap();
        assert_eq!(applied.address, address);
        assert_eq!(applied.label, "strict");

        let spec = f.runtime.container_spec("web-dns").await.unwrap();
        assert_eq!(spec.restart.as_deref(), Some("unless-stopped"));
        assert_eq!(spec.labels.get(LABEL_ROLE).map(String::as_str), Some("dns"));
        assert!(spec.mounts[0].read_only);
    }

    #[tokio::test]
    async fn test_start_replaces_previous_sidecar() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("web").unwrap();
        let network = f.manager.provisioner().create_network(&id).await.unwrap();

        let first = f
            .manager
            .start_sidecar(&id, &policy("standard"), network.sidecar_address())
            .await
            .unwrap();
        let second = f
            .manager
            .start_sidecar(&id, &policy("strict"), Some(first))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.runtime.container_count().await, 1);
        assert_eq!(f.manager.applied_rules(&id).await.unwrap().unwrap().profile, "strict");
    }

    #[tokio::test]
    async fn test_timeout_removes_partial_sidecar() {
        let f = fixture(MockRuntime::new().never_ready());
        let id = ContainerId::new("web").unwrap();
        f.manager.provisioner().create_network(&id).await.unwrap();

        let err = f
            .manager
            .start_sidecar(&id, &policy("standard"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SidecarStartTimeout { attempts: 3, .. }));
        assert!(!f.runtime.has_container("web-dns").await);
        assert!(f.manager.applied_rules(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_sidecar_within_budget() {
        let f = fixture(MockRuntime::new().with_ready_after(2));
        let id = ContainerId::new("web").unwrap();
        f.manager.provisioner().create_network(&id).await.unwrap();

        assert!(f.manager.start_sidecar(&id, &policy("standard"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_static_address_outside_subnet_is_fatal() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("web").unwrap();
        f.manager.provisioner().create_network(&id).await.unwrap();

        let result = f
            .manager
            .start_sidecar(&id, &policy("standard"), Some("192.0.2.53".parse().unwrap()))
            .await;
        assert!(result.is_err());
        assert!(!f.runtime.has_container("web-dns").await);
    }

    #[tokio::test]
    async fn test_airgapped_never_gets_a_sidecar() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("offline").unwrap();

        assert!(f.manager.start_sidecar(&id, &policy("airgapped"), None).await.is_err());
        assert_eq!(f.manager.restart_sidecar(&id, "airgapped", true).await.unwrap(), None);
        assert_eq!(f.runtime.network_count().await, 0);
        assert_eq!(f.runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_blocked_only_logs() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("web").unwrap();
        f.manager.restart_sidecar(&id, "standard", false).await.unwrap();
        f.runtime
            .set_logs(
                "web-dns",
                "dnsmasq[1]: query[A] pastebin.com from 10.213.4.3\ndnsmasq[1]: config pastebin.com is NXDOMAIN\n",
            )
            .await;

        let blocked = f.manager.query_logs(&id, None, true).await.unwrap();
        assert_eq!(blocked, "dnsmasq[1]: config pastebin.com is NXDOMAIN\n");
        let all = f.manager.query_logs(&id, None, false).await.unwrap();
        assert_eq!(all.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_foreign_container_with_sidecar_name_is_kept() {
        let f = fixture(MockRuntime::new());
        f.runtime
            .create_container(
                &ContainerSpec::new("web-dns", "alpine").with_label("cordon.managed", "true"),
            )
            .await
            .unwrap();
        let id = ContainerId::new("web").unwrap();

        let err = f.manager.restart_sidecar(&id, "standard", false).await.unwrap_err();

        assert!(matches!(err, Error::NameConflict { .. }));
        let spec = f.runtime.container_spec("web-dns").await.unwrap();
        assert_eq!(spec.image, "alpine");
        assert!(!spec.labels.contains_key(LABEL_ROLE));
        assert_eq!(f.manager.get_sidecar_address(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_preserved_address_is_never_substituted() {
        let f = fixture(MockRuntime::new());
        let id = ContainerId::new("web").unwrap();
        let before = f
            .manager
            .restart_sidecar(&id, "standard", false)
            .await
            .unwrap()
            .unwrap();
        let network = f.manager.provisioner().network(&id).await.unwrap().unwrap();
        let old_subnet = network.subnet.unwrap();

        // Sidecar and network vanish, and the old subnet is taken meanwhile.
        f.runtime.remove_externally("web-dns").await;
        f.runtime.remove_network("web-net").await.unwrap();
        f.runtime
            .create_network(&cordon_runtime::NetworkSpec::new("squatter").with_subnet(old_subnet))
            .await
            .unwrap();

        let result = f.manager.restart_sidecar(&id, "standard", true).await;

        assert!(result.is_err(), "expected failure, sidecar moved from {before} to {result:?}");
        assert!(!f.runtime.has_container("web-dns").await);
    }

    #[tokio::test]
    async fn test_inspect_failure_removes_partial_sidecar() {
        let f = fixture(MockRuntime::new().fail_running_inspect());
        let id = ContainerId::new("web").unwrap();
        let network = f.manager.provisioner().create_network(&id).await.unwrap();

        let err = f
            .manager
            .start_sidecar(&id, &policy("standard"), network.sidecar_address())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Runtime { .. }));
        assert!(!f.runtime.has_container("web-dns").await);
        assert!(f.manager.applied_rules(&id).await.unwrap().is_none());
    }
}
