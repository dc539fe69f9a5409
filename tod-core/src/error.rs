//! Error types for the REST layer

use thiserror::Error;

/// Error returned by the backend collaborator
#[derive(Error, Debug)]
pub enum TodError {
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TodError {
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        TodError::Api {
            status,
            body: body.into(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        TodError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        TodError::Parse(msg.into())
    }

    pub fn invalid_url(msg: impl Into<String>) -> Self {
        TodError::InvalidUrl(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TodError::Config(msg.into())
    }

    /// HTTP status of an API error, if this is one
    pub fn status(&self) -> Option<u16> {
        match self {
            TodError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for backend operations
pub type TodResult<T> = Result<T, TodError>;
