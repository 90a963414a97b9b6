use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse strategy parameters: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}
