use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting, set {env_var} or add it to the configuration file")]
    MissingEnvVar { env_var: String },

    #[error("Missing required setting {key} in the configuration file")]
    MissingKey { key: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// The environment variable that feeds a dotted configuration path
pub fn to_env_var(field_path: &str) -> String {
    let path = field_path
        .split('.')
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join("__");
    format!("AGENTOS_{}", path)
}
