//! Rm command implementation

use anyhow::{Context, Result, bail};
use cordon_core::ContainerId;

use crate::engine::{Engine, ensure_dev_container};

pub async fn execute(engine: &Engine, id: &ContainerId) -> Result<()> {
    tracing::info!(container_id = %id, "Removing container");

    if let Some(state) = engine
        .runtime
        .inspect_container(id.as_str())
        .await
        .context("Failed to query container runtime")?
    {
        ensure_dev_container(id, &state)?;
        if state.running {
            engine
                .runtime
                .stop_container(id.as_str())
                .await
                .context("Failed to stop container")?;
        }
        engine
            .runtime
            .remove_container(id.as_str())
            .await
            .context("Failed to remove container")?;
    }

    let report = engine.cleanup.remove_container_networking(id).await;
    if !report.is_complete() {
        bail!(
            "Container '{id}' removed, but cleanup failed:\n  {}",
            report.failures.join("\n  ")
        );
    }

    println!("✅ Container '{id}' removed");

    Ok(())
}
