use std::sync::Arc;

use agentos::engines::direct::DirectTransport;
use agentos::voting::{ActionVoter, VoteCache};
use anyhow::{Context, Result};
use console::style;

use super::start_registry;
use crate::configuration::Settings;

pub async fn execute(settings: &Settings, goal: &str, action: &str) -> Result<()> {
    let registry = start_registry(settings).await?;
    let voter = ActionVoter::new(
        Arc::new(DirectTransport::new(registry)),
        Arc::new(VoteCache::new()),
        settings.voting.clone().into_config(),
    );

    let rating = voter
        .vote_for_action(goal, action)
        .await
        .context("voting failed")?;
    println!("{} {:.2}", style("rating:").bold(), rating);
    Ok(())
}
