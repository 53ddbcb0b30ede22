use std::path::Path;
use std::time::Duration;

use agentos::agent::PipelineConfig;
use agentos::engines::base::InferenceEngine;
use agentos::models::request::RoutingMode;
use agentos::voting::VotingConfig;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{to_env_var, ConfigError};

const DEFAULT_CONFIG_FILE: &str = "agentos";
const MISSING_FIELD: &str = "missing field `";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub embeddings_url: String,
    #[serde(default = "default_engine_limit")]
    pub max_batch_size: u32,
    #[serde(default = "default_engine_limit")]
    pub max_requests: u32,
    #[serde(default)]
    pub models: Vec<String>,
}

impl EngineSettings {
    pub fn into_engine(self) -> InferenceEngine {
        InferenceEngine::new(self.url)
            .with_embeddings_endpoint(self.embeddings_url)
            .with_max_batch_size(self.max_batch_size as usize)
            .with_max_requests(self.max_requests as usize)
            .with_models(self.models)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: u32,
    #[serde(default = "default_queue_capacity")]
    pub results_capacity: u32,
    #[serde(default = "default_queue_capacity")]
    pub processing_capacity: u32,
    #[serde(default = "default_queue_capacity")]
    pub history_capacity: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dispatch_capacity: default_dispatch_capacity(),
            results_capacity: default_queue_capacity(),
            processing_capacity: default_queue_capacity(),
            history_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl PipelineSettings {
    pub fn into_config(self) -> PipelineConfig {
        PipelineConfig {
            dispatch_capacity: self.dispatch_capacity as usize,
            results_capacity: self.results_capacity as usize,
            processing_capacity: self.processing_capacity as usize,
            history_capacity: self.history_capacity as usize,
            max_in_flight: self.max_in_flight as usize,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            routing_mode: RoutingMode::Io,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VotingSettings {
    #[serde(default = "default_voting_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_voters")]
    pub min_results: u32,
    #[serde(default = "default_voters")]
    pub quorum: u32,
}

impl Default for VotingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_voting_timeout_secs(),
            min_results: default_voters(),
            quorum: default_voters(),
        }
    }
}

impl VotingSettings {
    pub fn into_config(self) -> VotingConfig {
        VotingConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            min_results: self.min_results as usize,
            quorum: self.quorum as usize,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engines: Vec<EngineSettings>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub voting: VotingSettings,
}

impl Settings {
    /// Layer defaults, the configuration file and the environment
    ///
    /// Without an explicit path, `agentos.toml` in the working directory is used if present.
    /// An explicit file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = Config::builder()
            // Pipeline defaults
            .set_default("pipeline.dispatch_capacity", default_dispatch_capacity())?
            .set_default("pipeline.results_capacity", default_queue_capacity())?
            .set_default("pipeline.processing_capacity", default_queue_capacity())?
            .set_default("pipeline.history_capacity", default_queue_capacity())?
            .set_default("pipeline.max_in_flight", default_max_in_flight())?
            .set_default("pipeline.request_timeout_secs", default_request_timeout_secs())?
            .set_default("pipeline.shutdown_timeout_secs", default_shutdown_timeout_secs())?
            // Voting defaults
            .set_default("voting.timeout_secs", default_voting_timeout_secs())?
            .set_default("voting.min_results", default_voters())?
            .set_default("voting.quorum", default_voters())?
            .add_source(file)
            .add_source(
                Environment::with_prefix("AGENTOS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        match result {
            Ok(settings) => settings.validate(),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if let Some(position) = error_str.find(MISSING_FIELD) {
                    // "missing field `url`", possibly prefixed with the key it belongs to
                    let field = error_str[position + MISSING_FIELD.len()..]
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    /// Engine entries only come from the file, so a missing key is named by its file path
    fn validate(self) -> Result<Self, ConfigError> {
        if let Some(index) = self.engines.iter().position(|engine| engine.url.is_empty()) {
            return Err(ConfigError::MissingKey {
                key: format!("engines[{}].url", index),
            });
        }
        Ok(self)
    }

    pub fn engines(&self) -> impl Iterator<Item = InferenceEngine> + '_ {
        self.engines.iter().cloned().map(EngineSettings::into_engine)
    }
}

fn default_engine_limit() -> u32 {
    1
}

fn default_dispatch_capacity() -> u32 {
    1
}

fn default_queue_capacity() -> u32 {
    100
}

fn default_max_in_flight() -> u32 {
    16
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_voting_timeout_secs() -> u64 {
    120
}

fn default_voters() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("AGENTOS_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();

        let settings = Settings::load(None).unwrap();
        assert!(settings.engines.is_empty());

        let pipeline = settings.pipeline.into_config();
        assert_eq!(pipeline, PipelineConfig::default());

        let voting = settings.voting.into_config();
        assert_eq!(voting, VotingConfig::default());
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("AGENTOS_PIPELINE__RESULTS_CAPACITY", "250");
        env::set_var("AGENTOS_VOTING__QUORUM", "3");

        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.pipeline.results_capacity, 250);
        assert_eq!(settings.pipeline.dispatch_capacity, 1);
        assert_eq!(settings.voting.quorum, 3);
        assert_eq!(settings.voting.min_results, 5);

        env::remove_var("AGENTOS_PIPELINE__RESULTS_CAPACITY");
        env::remove_var("AGENTOS_VOTING__QUORUM");
    }

    #[test]
    #[serial]
    fn test_engines_from_file() {
        clean_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[engines]]
url = "http://127.0.0.1:8000/v1/completions"
embeddings_url = "http://127.0.0.1:8000/v1/embeddings"
max_batch_size = 8
models = ["mistral-7b"]

[[engines]]
url = "http://127.0.0.1:8001/v1/completions"

[pipeline]
shutdown_timeout_secs = 5
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        let engines: Vec<_> = settings.engines().collect();
        assert_eq!(engines.len(), 2);
        assert_eq!(engines[0].max_batch_size, 8);
        assert_eq!(engines[0].max_requests, 1);
        assert_eq!(engines[0].models, vec!["mistral-7b".to_string()]);
        assert!(engines[0].supports_embeddings());
        assert!(!engines[1].supports_embeddings());
        assert_eq!(
            settings.pipeline.into_config().shutdown_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    #[serial]
    fn test_engine_without_url() {
        clean_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[[engines]]\nurl = \"http://127.0.0.1:8000/v1/completions\"\n\n[[engines]]\nmax_batch_size = 4"
        )
        .unwrap();

        match Settings::load(Some(file.path())) {
            Err(ConfigError::MissingKey { key }) => assert_eq!(key, "engines[1].url"),
            other => panic!("expected a missing setting, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_missing_config_file() {
        clean_env();
        let result = Settings::load(Some(Path::new("/nonexistent/agentos.toml")));
        assert!(matches!(result, Err(ConfigError::Other(_))));
    }
}
