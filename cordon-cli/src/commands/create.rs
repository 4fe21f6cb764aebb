//! Create command implementation

use anyhow::{Context, Result, bail};
use cordon_core::{ContainerId, CustomRule, LABEL_EGRESS, LABEL_MANAGED, RuleKind};
use cordon_policy::{EgressProfile, RuleRepository, load, merge};
use cordon_runtime::ContainerSpec;
use std::net::IpAddr;

use crate::cli::{CreateArgs, EgressArgs};
use crate::engine::Engine;

pub async fn execute(engine: &Engine, args: &CreateArgs) -> Result<()> {
    let id = ContainerId::new(&args.name).context("Invalid container name")?;

    // Everything the user typed is validated before the runtime is touched.
    let profile = load(&args.egress.profile)?;
    let rules = custom_rules(&args.egress)?;

    tracing::info!(container_id = %id, profile = %profile.name(), rules = rules.len(), "Creating container");

    if engine
        .runtime
        .inspect_container(id.as_str())
        .await
        .context("Failed to query container runtime")?
        .is_some()
    {
        bail!("Container '{id}' already exists");
    }

    match provision(engine, &id, &profile, &rules, args).await {
        Ok((label, dns)) => {
            match dns {
                Some(address) => println!("✅ Created '{id}' with egress {label} (DNS {address})"),
                None => println!("✅ Created '{id}' with egress {label} (no network)"),
            }
            Ok(())
        }
        Err(e) => {
            tracing::warn!(container_id = %id, error = %e, "Create failed, rolling back");
            if let Err(rm) = engine.runtime.remove_container(id.as_str()).await {
                tracing::warn!(container_id = %id, error = %rm, "Failed to remove container");
            }
            let report = engine.cleanup.remove_container_networking(&id).await;
            for failure in &report.failures {
                tracing::warn!(container_id = %id, failure = %failure, "Rollback incomplete");
            }
            Err(e)
        }
    }
}

async fn provision(
    engine: &Engine,
    id: &ContainerId,
    profile: &EgressProfile,
    rules: &[CustomRule],
    args: &CreateArgs,
) -> Result<(String, Option<IpAddr>)> {
    engine.store.init(id).await.context("Failed to initialize rule store")?;
    engine.store.select_profile(id, profile.name()).await?;
    for rule in rules {
        engine.add_rule(id, rule).await?;
    }

    let policy = merge(profile, &engine.store.load(id).await?);

    let dns = engine
        .sidecars
        .restart_sidecar(id, profile.name(), false)
        .await
        .context("Failed to start DNS sidecar")?;

    let spec = ContainerSpec::new(id.as_str(), &args.image)
        .with_label(LABEL_MANAGED, "true")
        .with_label(LABEL_EGRESS, policy.label());
    let spec = match dns {
        Some(address) => spec.with_network(id.network_name()).with_dns(address),
        None => spec.with_network("none"),
    };
    let spec = if args.command.is_empty() {
        spec
    } else {
        spec.with_command(args.command.clone())
    };

    engine
        .runtime
        .create_container(&spec)
        .await
        .context("Failed to create container")?;

    Ok((policy.label(), dns))
}

/// Create-time rule flags, validated
pub fn custom_rules(args: &EgressArgs) -> Result<Vec<CustomRule>> {
    let groups = [
        (RuleKind::AllowDomain, &args.allow_domains),
        (RuleKind::BlockDomain, &args.block_domains),
        (RuleKind::AllowIp, &args.allow_ips),
        (RuleKind::BlockIp, &args.block_ips),
        (RuleKind::AllowPort, &args.allow_ports),
    ];

    let mut rules = Vec::new();
    for (kind, values) in groups {
        for value in values {
            rules.push(CustomRule::new(kind, value)?);
        }
    }
    Ok(rules)
}
