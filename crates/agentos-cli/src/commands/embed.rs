use agentos::engines::base::{GenerationSettings, JobTask};
use agentos::engines::embeddings::run_embeddings_request;
use agentos::engines::registry::Capability;
use anyhow::{Context, Result};
use serde_json::json;

use super::start_registry;
use crate::configuration::Settings;

pub async fn execute(settings: &Settings, texts: Vec<String>) -> Result<()> {
    let registry = start_registry(settings).await?;
    let engine = registry.lease_when_idle(Capability::Embeddings).await?;

    let (tasks, returns): (Vec<_>, Vec<_>) = texts
        .iter()
        .map(|text| JobTask::with_embeddings_return(GenerationSettings::new(text.as_str())))
        .unzip();
    run_embeddings_request(&engine, tasks).await?;
    drop(engine);

    for (text, result) in texts.iter().zip(returns) {
        let embedding = result.await.context("embedding was not delivered")?;
        let line = json!({
            "input": text,
            "model": embedding.model,
            "embedding": embedding.vector,
        });
        println!("{}", line);
    }
    Ok(())
}
