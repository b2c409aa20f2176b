use stowage_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for StorageError {
    fn from(err: ModelError) -> Self {
        StorageError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
