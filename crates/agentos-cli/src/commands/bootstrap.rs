use anyhow::Result;
use console::style;

use super::start_registry;
use crate::configuration::Settings;

pub async fn execute(settings: &Settings) -> Result<()> {
    let registry = start_registry(settings).await?;

    for engine in registry.snapshot().await {
        println!("{}", style(&engine.endpoint_url).bold());
        println!("  models:      {}", engine.models.join(", "));
        println!(
            "  completions: {}",
            if engine.supports_completions() {
                style("ok").green()
            } else {
                style("unavailable").red()
            }
        );
        match engine.embeddings_dims {
            Some(dims) if engine.supports_embeddings() => {
                println!("  embeddings:  {} ({} dims)", style("ok").green(), dims)
            }
            _ => println!("  embeddings:  {}", style("unavailable").red()),
        }
    }
    Ok(())
}
