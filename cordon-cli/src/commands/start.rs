//! Start command implementation

use anyhow::{Context, Result};
use cordon_core::ContainerId;

use crate::engine::Engine;

pub async fn execute(engine: &Engine, id: &ContainerId) -> Result<()> {
    tracing::info!(container_id = %id, "Starting container");

    let state = engine.container(id).await?;
    if state.running {
        println!("Container '{id}' is already running");
        return Ok(());
    }

    let profile = engine.current_profile(id).await?;
    let dns = engine
        .sidecars
        .restart_sidecar(id, &profile, true)
        .await
        .context("Failed to re-apply egress rules")?;

    engine
        .runtime
        .start_container(id.as_str())
        .await
        .context("Failed to start container")?;

    match dns {
        Some(address) => println!("✅ Container '{id}' started (egress {profile}, DNS {address})"),
        None => println!("✅ Container '{id}' started (egress {profile})"),
    }

    Ok(())
}
