use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INVALID_STRUCTURE: {0}")]
    InvalidStructure(String),
    #[error("STORAGE_FAILURE: {0}")]
    Storage(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {} does not exist", what, id))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
