use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Backend reported error: {0}")]
    Backend(String),

    #[error("No active metrics collection - call start_collection first")]
    NoActiveCollection,

    #[error("Engine not found: {0}")]
    EngineNotFound(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Connection(_) => ErrorKind::Connection,
            EngineError::Authentication(_) => ErrorKind::Authentication,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Parse(_) | EngineError::Json(_) => ErrorKind::Parse,
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Http { .. } => ErrorKind::Http,
            EngineError::Backend(_) => ErrorKind::Backend,
            EngineError::NoActiveCollection
            | EngineError::EngineNotFound(_)
            | EngineError::Export(_)
            | EngineError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Connection failures and timeouts may resolve on their own; nothing else does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Connection(_) | EngineError::Timeout(_))
    }
}

/// Coarse failure category recorded on failed metrics and counted in aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    Parse,
    Configuration,
    Http,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parse => "parse",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Http => "http",
            ErrorKind::Backend => "backend",
            ErrorKind::Internal => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
