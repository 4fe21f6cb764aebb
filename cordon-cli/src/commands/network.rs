//! Network subcommands: show, allow, block, reset, logs

use anyhow::{Context, Result, bail};
use cordon_core::{ContainerId, CustomRule, LABEL_EGRESS, RuleKind};
use cordon_network::AppliedRules;
use cordon_policy::{EffectivePolicy, RuleRepository, load, merge};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::net::IpAddr;

use crate::cli::{AllowTarget, BlockTarget};
use crate::engine::{Engine, ensure_dev_container};

#[derive(Serialize)]
struct ShowOutput {
    container: ContainerId,
    label: Option<String>,
    description: String,
    policy: EffectivePolicy,
    custom_rules: Vec<String>,
    sidecar: Option<IpAddr>,
    applied: Option<AppliedRules>,
}

pub async fn show(engine: &Engine, id: &ContainerId, json: bool) -> Result<()> {
    let profile = load(&engine.current_profile(id).await?)?;
    let custom = engine.store.load(id).await?;
    let policy = merge(&profile, &custom);

    let (label, sidecar) = match engine.runtime.inspect_container(id.as_str()).await {
        Ok(state) => (
            state.and_then(|s| s.labels.get(LABEL_EGRESS).cloned()),
            engine.sidecars.get_sidecar_address(id).await?,
        ),
        Err(e) => {
            tracing::warn!(container_id = %id, error = %e, "Container runtime unavailable");
            (None, None)
        }
    };

    let output = ShowOutput {
        container: id.clone(),
        label,
        description: profile.description().to_string(),
        policy,
        custom_rules: custom.entries().iter().map(ToString::to_string).collect(),
        sidecar,
        applied: engine.sidecars.applied_rules(id).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let policy = &output.policy;
    let label = output.label.clone().unwrap_or_else(|| policy.label());
    println!("Container:  {}", output.container);
    println!("Egress:     {label} ({})", output.description);
    println!("Network:    {}", policy.network_mode);
    if policy.is_airgapped() {
        return Ok(());
    }
    println!(
        "Mode:       {} (unmatched names {})",
        if policy.is_allowlist() { "allowlist" } else { "blocklist" },
        if policy.is_allowlist() { "refused" } else { "resolve" }
    );
    match output.sidecar {
        Some(address) => println!("DNS:        {address}"),
        None => println!("DNS:        not running"),
    }

    print_set("Allowed domains", &policy.allowed_domains);
    print_set("Blocked domains", &policy.blocked_domains);
    print_set("Allowed IPs", &policy.allowed_ips);
    print_set("Blocked IPs", &policy.blocked_ips);
    print_set("Allowed ports", &policy.allowed_ports);

    if !output.custom_rules.is_empty() {
        println!("\nCustom rules:");
        for rule in &output.custom_rules {
            println!("  {rule}");
        }
    }

    if let Some(applied) = &output.applied
        && applied.label != policy.label()
    {
        println!(
            "\n⚠️  Sidecar still runs {}; restart the container or run `cordon network reset {id}`",
            applied.label
        );
    }

    Ok(())
}

fn print_set<T: Display>(title: &str, values: &BTreeSet<T>) {
    if values.is_empty() {
        return;
    }
    println!("\n{title} ({}):", values.len());
    for value in values {
        println!("  {value}");
    }
}

pub async fn allow(engine: &Engine, id: &ContainerId, target: &AllowTarget) -> Result<()> {
    let rule = match (&target.domain, &target.ip, &target.port) {
        (Some(domain), _, _) => CustomRule::new(RuleKind::AllowDomain, domain)?,
        (_, Some(ip), _) => CustomRule::new(RuleKind::AllowIp, ip)?,
        (_, _, Some(port)) => CustomRule::new(RuleKind::AllowPort, port)?,
        _ => bail!("One of --domain, --ip or --port is required"),
    };
    apply_rule(engine, id, &rule).await
}

pub async fn block(engine: &Engine, id: &ContainerId, target: &BlockTarget) -> Result<()> {
    let rule = match (&target.domain, &target.ip) {
        (Some(domain), _) => CustomRule::new(RuleKind::BlockDomain, domain)?,
        (_, Some(ip)) => CustomRule::new(RuleKind::BlockIp, ip)?,
        _ => bail!("One of --domain or --ip is required"),
    };
    apply_rule(engine, id, &rule).await
}

/// Persist `rule`, then re-apply it to a running sidecar
async fn apply_rule(engine: &Engine, id: &ContainerId, rule: &CustomRule) -> Result<()> {
    match engine.runtime.inspect_container(id.as_str()).await {
        Ok(Some(state)) => ensure_dev_container(id, &state)?,
        Ok(None) if !engine.store.exists(id).await? => bail!("No such container: {id}"),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(container_id = %id, error = %e, "Could not check container, storing rule anyway");
        }
    }

    if !engine.add_rule(id, rule).await? {
        println!("Rule '{rule}' already present for '{id}'");
        return Ok(());
    }
    println!("✅ Added '{rule}' for '{id}'");

    let profile = load(&engine.current_profile(id).await?)?;
    if profile.is_airgapped() {
        tracing::warn!(container_id = %id, "Container has no network; rule is stored but has no effect");
        return Ok(());
    }

    match engine.runtime.inspect_container(&id.sidecar_name()).await {
        Ok(Some(_)) => {
            let address = engine
                .sidecars
                .restart_sidecar(id, profile.name(), true)
                .await
                .context("Rule saved, but re-applying it failed")?;
            if let Some(address) = address {
                println!("   Applied (DNS {address})");
            }
        }
        Ok(None) => println!("   Takes effect when '{id}' starts"),
        Err(e) => {
            tracing::warn!(container_id = %id, error = %e, "Could not reach container runtime");
            println!("   Takes effect when '{id}' starts");
        }
    }

    Ok(())
}

pub async fn reset(
    engine: &Engine,
    id: &ContainerId,
    requested: Option<&str>,
    force: bool,
) -> Result<()> {
    let current = engine.current_profile(id).await?;
    let target = requested.unwrap_or(&current);
    let profile = load(target)?;

    let switching = profile.name() != current;
    if switching {
        if !force {
            bail!(
                "Container '{id}' uses profile '{current}'; pass --force to switch to '{}'",
                profile.name()
            );
        }
        let previous = load(&current)?;
        if previous.network_mode() != profile.network_mode() {
            bail!(
                "Cannot switch '{id}' from network mode {} to {}; recreate the container instead",
                previous.network_mode(),
                profile.network_mode()
            );
        }
    }

    engine.container(id).await?;

    if switching {
        engine.store.select_profile(id, profile.name()).await?;
        tracing::info!(container_id = %id, from = %current, to = %profile.name(), "Switched profile");
    }

    match engine
        .sidecars
        .restart_sidecar(id, profile.name(), true)
        .await
        .context("Failed to recreate DNS sidecar")?
    {
        Some(address) => println!("✅ Reset '{id}' to {} (DNS {address})", profile.name()),
        None => println!("✅ Reset '{id}' to {} (no network)", profile.name()),
    }

    Ok(())
}

pub async fn logs(
    engine: &Engine,
    id: &ContainerId,
    blocked_only: bool,
    tail: Option<usize>,
) -> Result<()> {
    let logs = engine
        .sidecars
        .query_logs(id, tail, blocked_only)
        .await
        .with_context(|| format!("Failed to read DNS logs for '{id}'"))?;

    if logs.is_empty() && blocked_only {
        println!("No blocked queries");
    } else {
        print!("{logs}");
    }

    Ok(())
}
