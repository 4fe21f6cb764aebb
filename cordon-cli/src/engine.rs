//! Wiring of configuration, runtime, rule store and network components

use anyhow::{Context, Result, bail};
use cordon_core::{ContainerId, CustomRule, EgressEvent, EngineConfig, LABEL_EGRESS, LABEL_ROLE};
use cordon_network::{CleanupCoordinator, SidecarManager};
use cordon_policy::{DEFAULT_PROFILE, FileRuleStore, RuleRepository};
use cordon_runtime::{CliRuntime, ContainerRuntime, ContainerState};
use std::sync::Arc;
use std::time::SystemTime;

use crate::cli::GlobalArgs;

/// Everything a command needs
pub struct Engine {
    pub config: EngineConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<FileRuleStore>,
    pub sidecars: SidecarManager,
    pub cleanup: CleanupCoordinator,
}

impl Engine {
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let state_dir = args
            .state_dir
            .clone()
            .unwrap_or_else(EngineConfig::default_state_dir);
        // Bind mounts need an absolute source path.
        let state_dir = std::path::absolute(&state_dir)
            .with_context(|| format!("Invalid state directory {}", state_dir.display()))?;

        let mut config = EngineConfig::new(state_dir).with_runtime(&args.runtime);
        if let Some(image) = &args.sidecar_image {
            config = config.with_sidecar_image(image);
        }
        if !args.upstream_dns.is_empty() {
            config = config.with_upstream_resolvers(args.upstream_dns.clone());
        }
        if let Some(response) = args.block_response {
            config = config.with_block_response(response);
        }
        config.validate().context("Invalid configuration")?;

        tracing::debug!(?config, "Engine configuration");

        let runtime = Arc::new(CliRuntime::new(&config.runtime));
        Self::from_parts(config, runtime)
    }

    /// Wire an engine around an already constructed runtime
    pub fn from_parts(config: EngineConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let store = Arc::new(FileRuleStore::new(config.rules_dir()));
        let sidecars = SidecarManager::new(Arc::clone(&runtime), store.clone(), config.clone())?;
        let cleanup = CleanupCoordinator::new(Arc::clone(&runtime), store.clone(), config.clone());

        Ok(Self {
            config,
            runtime,
            store,
            sidecars,
            cleanup,
        })
    }

    /// Inspect a dev container, failing if it does not exist
    pub async fn container(&self, id: &ContainerId) -> Result<ContainerState> {
        let state = self
            .runtime
            .inspect_container(id.as_str())
            .await
            .with_context(|| format!("Failed to inspect container '{id}'"))?
            .with_context(|| format!("No such container: {id}"))?;
        ensure_dev_container(id, &state)?;
        Ok(state)
    }

    /// Profile the container was created with
    ///
    /// The rule store records the selection; containers created before that
    /// fall back to the egress label, then to the default profile.
    pub async fn current_profile(&self, id: &ContainerId) -> Result<String> {
        if let Some(profile) = self.store.selected_profile(id).await? {
            return Ok(profile);
        }

        let from_label = match self.runtime.inspect_container(id.as_str()).await {
            Ok(state) => state
                .and_then(|s| s.labels.get(LABEL_EGRESS).cloned())
                .map(|label| label.trim_end_matches("+custom").to_string()),
            Err(e) => {
                tracing::debug!(container_id = %id, error = %e, "Could not read egress label");
                None
            }
        };

        Ok(from_label.unwrap_or_else(|| {
            tracing::warn!(container_id = %id, "No profile recorded, assuming {DEFAULT_PROFILE}");
            DEFAULT_PROFILE.to_string()
        }))
    }

    /// Persist a custom rule. Returns `false` if it was already present.
    pub async fn add_rule(&self, id: &ContainerId, rule: &CustomRule) -> Result<bool> {
        let added = self
            .store
            .append(id, rule)
            .await
            .with_context(|| format!("Failed to save rule '{rule}'"))?;

        if added {
            EgressEvent::RuleAdded {
                id: id.clone(),
                rule: rule.to_string(),
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        }

        Ok(added)
    }
}

/// Refuse to treat cordon's own sidecars as dev containers
pub fn ensure_dev_container(id: &ContainerId, state: &ContainerState) -> Result<()> {
    if let Some(role) = state.labels.get(LABEL_ROLE) {
        bail!("'{id}' is a cordon {role} container, not a dev container");
    }
    Ok(())
}
