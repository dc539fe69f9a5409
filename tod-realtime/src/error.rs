//! Error types for the realtime client

use thiserror::Error;

/// Failures of the handshake and the live connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// Backend unreachable or returned incomplete credentials
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(String),

    /// Backend explicitly refused access to the channel
    #[error("Channel authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Backend or network failure during the authorization exchange
    #[error("Channel authorization unavailable: {0}")]
    AuthorizationUnavailable(String),

    /// The transport connection dropped or never opened
    #[error("Transport disconnected: {0}")]
    TransportDisconnect(String),

    /// Required settings are absent or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The connection manager task is no longer running
    #[error("Connection manager is closed")]
    Closed,
}

impl RealtimeError {
    /// Whether the reconnect policy should try again after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Closed)
    }

    /// Whether the next attempt must fetch new credentials first
    pub fn requires_fresh_credentials(&self) -> bool {
        matches!(self, Self::AuthorizationDenied(_))
    }
}

/// Error returned by an event handler
///
/// Handler failures are isolated by the router and never reach the
/// connection.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("Failed to decode payload: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RealtimeError::CredentialFetch("x".into()).is_retryable());
        assert!(RealtimeError::AuthorizationUnavailable("x".into()).is_retryable());
        assert!(RealtimeError::TransportDisconnect("x".into()).is_retryable());
        assert!(!RealtimeError::Configuration("x".into()).is_retryable());

        assert!(RealtimeError::AuthorizationDenied("x".into()).requires_fresh_credentials());
        assert!(!RealtimeError::AuthorizationUnavailable("x".into()).requires_fresh_credentials());
    }
}
