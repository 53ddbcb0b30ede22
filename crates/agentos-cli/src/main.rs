mod commands;
mod configuration;
mod error;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::run::RunOptions;
use crate::configuration::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to agentos.toml in the working directory, if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every configured engine and show what it serves
    Bootstrap,

    /// Embed texts with the first idle embeddings engine
    Embed {
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// Rate an action against a goal with a panel of voters
    Vote {
        #[arg(long)]
        goal: String,

        #[arg(long)]
        action: String,
    },

    /// Run one round of an agent from an agency file
    Run {
        /// YAML file with agent definitions
        #[arg(long)]
        agency: PathBuf,

        /// Agent to run (defaults to the first one)
        #[arg(long)]
        agent: Option<String>,

        /// Prompt variable, as key=value
        #[arg(long = "var", value_parser = parse_key_val)]
        variables: Vec<(String, String)>,

        /// Number of replies to sample
        #[arg(short = 'n', long, default_value_t = 1)]
        samples: usize,
    },
}

fn parse_key_val(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", arg))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Bootstrap => commands::bootstrap::execute(&settings).await,
        Command::Embed { texts } => commands::embed::execute(&settings, texts).await,
        Command::Vote { goal, action } => commands::vote::execute(&settings, &goal, &action).await,
        Command::Run {
            agency,
            agent,
            variables,
            samples,
        } => {
            let options = RunOptions {
                agency: &agency,
                agent: agent.as_deref(),
                variables,
                samples,
            };
            commands::run::execute(&settings, options).await
        }
    }
}
