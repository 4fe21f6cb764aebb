//! List command implementation

use anyhow::{Context, Result};
use cordon_core::{LABEL_EGRESS, LABEL_MANAGED};

use crate::engine::Engine;

pub async fn execute(engine: &Engine) -> Result<()> {
    tracing::debug!("Listing containers");

    let containers = engine
        .runtime
        .list_containers(&format!("{LABEL_MANAGED}=true"))
        .await
        .context("Failed to list containers")?;

    if containers.is_empty() {
        println!("No containers");
        return Ok(());
    }

    println!("{:<24} {:<12} EGRESS", "NAME", "STATE");
    for container in &containers {
        let egress = container
            .labels
            .get(LABEL_EGRESS)
            .map_or("-", String::as_str);
        println!("{:<24} {:<12} {egress}", container.name, container.state);
    }

    Ok(())
}
