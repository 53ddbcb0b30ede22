use std::time::Duration;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Quorum not met: {valid} valid votes, {required} required")]
    QuorumNotMet { valid: usize, required: usize },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Agent runtime is stopped")]
    Shutdown,

    #[error("Pipeline did not drain within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Replies did not arrive within {0:?}")]
    ReplyTimeout(Duration),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for AgentError {
    fn from(err: serde_yaml::Error) -> Self {
        AgentError::Parse(err.to_string())
    }
}

impl From<tera::Error> for AgentError {
    fn from(err: tera::Error) -> Self {
        AgentError::Template(err.to_string())
    }
}
