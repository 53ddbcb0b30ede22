use std::path::Path;
use std::sync::Arc;

use agentos::agent::GeneralAgent;
use agentos::engines::direct::DirectTransport;
use agentos::models::request::{ClientRequest, Priority};
use agentos::prompt_template::chat_to_raw_prompt;
use agentos::settings::{parse_agency, AgentSettings};
use anyhow::{anyhow, Context, Result};
use console::style;

use super::start_registry;
use crate::configuration::Settings;

pub struct RunOptions<'a> {
    pub agency: &'a Path,
    pub agent: Option<&'a str>,
    pub variables: Vec<(String, String)>,
    pub samples: usize,
}

/// Run one round of an agent: render its system prompt, sample replies and drain the pipeline
pub async fn execute(settings: &Settings, options: RunOptions<'_>) -> Result<()> {
    let agent_settings = select_agent(options.agency, options.agent)?;
    let registry = start_registry(settings).await?;

    let pipeline = settings.pipeline.clone().into_config();
    let agent = GeneralAgent::start(
        agent_settings,
        Arc::new(DirectTransport::new(registry)),
        pipeline,
    );
    for (key, value) in &options.variables {
        agent.set_input_variable(key, value).await?;
    }

    let system = agent.system_message().await?;
    agent.append_message(system.clone()).await;
    let mut reports = agent
        .take_final_reports()
        .await
        .ok_or_else(|| anyhow!("final reports already taken"))?;

    let request = ClientRequest::new(agent.name(), Priority::User)
        .with_completion(chat_to_raw_prompt(&[system]), options.samples.max(1));
    agent.submit(request).await?;
    agent
        .wait_settled(pipeline.drain_timeout())
        .await
        .context("no replies from the inference engines")?;
    agent.stop().await?;

    for message in agent.history().await.iter().skip(1) {
        println!("{} {}", style(&message.id[..12]).dim(), message.content);
    }
    while let Ok(report) = reports.try_recv() {
        println!("{}\n{}", style("final report:").bold(), report);
    }

    let stats = agent.stats();
    println!(
        "{}",
        style(format!(
            "submitted {} received {} failed {} replies {} historized {}",
            stats.submitted, stats.received, stats.failed, stats.fanned_out, stats.historized
        ))
        .dim()
    );
    Ok(())
}

fn select_agent(agency: &Path, name: Option<&str>) -> Result<AgentSettings> {
    let yaml = std::fs::read_to_string(agency)
        .with_context(|| format!("failed to read agency file {}", agency.display()))?;
    let mut agents = parse_agency(&yaml)?;

    match name {
        Some(name) => agents
            .into_iter()
            .find(|agent| agent.name() == name)
            .ok_or_else(|| anyhow!("no agent named {} in {}", name, agency.display())),
        None if agents.is_empty() => Err(anyhow!("{} defines no agents", agency.display())),
        None => Ok(agents.remove(0)),
    }
}
