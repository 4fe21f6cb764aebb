//! Stop command implementation

use anyhow::{Context, Result};
use cordon_core::ContainerId;

use crate::engine::Engine;

pub async fn execute(engine: &Engine, id: &ContainerId) -> Result<()> {
    tracing::info!(container_id = %id, "Stopping container");

    engine.container(id).await?;
    engine
        .runtime
        .stop_container(id.as_str())
        .await
        .context("Failed to stop container")?;

    println!("✅ Container '{id}' stopped");

    Ok(())
}
