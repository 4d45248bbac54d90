use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TagError>;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tag context not found: {0}")]
    TagContextNotFound(String),
    #[error("invalid aggregation strategy: {0}")]
    InvalidStrategy(String),
    #[error("duplicate aggregation rule name: {0}")]
    DuplicateRuleName(String),
    #[error("tag context '{0}' cannot be declared after a rule that applies to all contexts")]
    ContextAfterGlobalRule(String),
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),
    #[error("invalid tag input: {0}")]
    InvalidTagInput(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("unknown aggregation rule or context: {0}")]
    UnknownRule(String),
    #[error("no entity source registered for '{0}'")]
    SourceNotRegistered(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for TagError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for TagError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for TagError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
