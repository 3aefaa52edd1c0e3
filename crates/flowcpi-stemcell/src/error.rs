use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StemcellError {
    #[error("stemcell {0} must not be empty")]
    EmptyField(&'static str),

    #[error("stemcell {field} contains an invalid character: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("failed to render stemcell manifest: {0}")]
    Template(#[from] tera::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StemcellError>;
