use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "configuration file not found. Checked:\n\
        - --config / FLOWCPI_CONFIG\n\
        - current directory: cpi.yml, cpi.yaml, cpi.json\n\
        - ~/.config/flowcpi/cpi.yml"
    )]
    ConfigNotFound,

    #[error("missing configuration key: {0}")]
    MissingKey(String),

    #[error("invalid configuration value at {path}: {message}")]
    InvalidValue { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
