pub mod bootstrap;
pub mod embed;
pub mod run;
pub mod vote;

use std::sync::Arc;

use agentos::engines::registry::EngineRegistry;
use anyhow::{bail, Result};

use crate::configuration::Settings;

/// Register every configured engine and probe them all before use
pub async fn start_registry(settings: &Settings) -> Result<Arc<EngineRegistry>> {
    if settings.engines.is_empty() {
        bail!("no inference engines configured, add [[engines]] entries to the configuration file");
    }

    let registry = Arc::new(EngineRegistry::new());
    for engine in settings.engines() {
        registry.register(engine).await;
    }
    registry.bootstrap_all().await;
    Ok(registry)
}
