//! Teardown of everything the engine provisioned for a container

use cordon_core::{ContainerId, EgressEvent, EngineConfig, Result};
use cordon_policy::RuleRepository;
use cordon_runtime::ContainerRuntime;
use serde::Serialize;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

use crate::sidecar::remove_sidecar;

/// Outcome of removing a container's networking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// A sidecar existed and was removed
    pub sidecar_removed: bool,
    /// A network existed and was removed
    pub network_removed: bool,
    /// A rule store existed and was removed
    pub rules_removed: bool,
    /// Steps that failed for reasons other than absence
    pub failures: Vec<String>,
}

impl CleanupReport {
    /// Whether every step succeeded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, outcome: Result<bool>) -> bool {
        match outcome {
            Ok(removed) => removed,
            Err(e) => {
                warn!(step, error = %e, "Cleanup step failed");
                self.failures.push(format!("{step}: {e}"));
                false
            }
        }
    }
}

/// Removes sidecar, network and rule store together
pub struct CleanupCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RuleRepository>,
    config: EngineConfig,
}

impl CleanupCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RuleRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
        }
    }

    /// Remove the sidecar, then the network, then the rule store
    ///
    /// Every step runs even if an earlier one failed; absent resources count
    /// as success. Failures are collected in the report.
    pub async fn remove_container_networking(&self, id: &ContainerId) -> CleanupReport {
        let mut report = CleanupReport::default();

        let sidecar = remove_sidecar(self.runtime.as_ref(), id).await;
        report.sidecar_removed = report.record("sidecar", sidecar);

        let state = match fs::remove_dir_all(self.config.sidecar_dir(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        report.record("sidecar state", state);

        let network = self.runtime.remove_network(&id.network_name()).await;
        report.network_removed = report.record("network", network);

        let rules = self.store.clear(id).await;
        report.rules_removed = report.record("rules", rules);

        debug!(container_id = %id, ?report, "Cleanup finished");

        if report.is_complete() {
            EgressEvent::NetworkingRemoved {
                id: id.clone(),
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        }

        report
    }
}

impl std::fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_policy::FileRuleStore;
    use cordon_runtime::{ContainerSpec, MockRuntime, NetworkSpec};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_of_nothing_succeeds() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(tmp.path());
        let store = Arc::new(FileRuleStore::new(config.rules_dir()));
        let coordinator = CleanupCoordinator::new(Arc::new(MockRuntime::new()), store, config);

        let report = coordinator
            .remove_container_networking(&ContainerId::new("ghost").unwrap())
            .await;

        assert!(report.is_complete());
        assert!(!report.sidecar_removed);
        assert!(!report.network_removed);
        assert!(!report.rules_removed);
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(tmp.path());
        let store = Arc::new(FileRuleStore::new(config.rules_dir()));
        let runtime = MockRuntime::new();
        let id = ContainerId::new("web").unwrap();

        store.init(&id).await.unwrap();
        runtime.create_network(&NetworkSpec::new("web-net")).await.unwrap();
        // Dev container still attached: network removal fails.
        runtime
            .create_container(&ContainerSpec::new("web", "alpine").with_network("web-net"))
            .await
            .unwrap();

        let coordinator = CleanupCoordinator::new(Arc::new(runtime.clone()), store.clone(), config);
        let report = coordinator.remove_container_networking(&id).await;

        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("network:"));
        assert!(report.rules_removed);
        assert!(runtime.has_network("web-net").await);
    }

    #[tokio::test]
    async fn test_cleanup_leaves_foreign_container_with_sidecar_name() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(tmp.path());
        let store = Arc::new(FileRuleStore::new(config.rules_dir()));
        let runtime = MockRuntime::new();
        runtime
            .create_container(
                &ContainerSpec::new("web-dns", "alpine").with_label("cordon.managed", "true"),
            )
            .await
            .unwrap();

        let coordinator = CleanupCoordinator::new(Arc::new(runtime.clone()), store, config);
        let report = coordinator
            .remove_container_networking(&ContainerId::new("web").unwrap())
            .await;

        assert!(!report.sidecar_removed);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("sidecar:"));
        assert!(runtime.has_container("web-dns").await);
    }
}
