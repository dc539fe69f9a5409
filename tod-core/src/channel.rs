//! Private channel naming and authorization types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix the transport requires on channels that need authorization
pub const PRIVATE_CHANNEL_PREFIX: &str = "private-";

/// Wire name of the private channel for a channel key
pub fn private_channel_name(channel_key: &str) -> String {
    format!("{}{}", PRIVATE_CHANNEL_PREFIX, channel_key)
}

/// Authorization state of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    #[default]
    Pending,
    Authorized,
    Rejected,
}

/// Token issued by the backend that lets this socket join a private channel
///
/// Opaque to the client: it is forwarded verbatim in the subscribe request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl AuthToken {
    pub fn new(auth: impl Into<String>) -> Self {
        Self {
            auth: auth.into(),
            channel_data: None,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("auth", &"[REDACTED]")
            .field("channel_data", &self.channel_data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_channel_name() {
        assert_eq!(private_channel_name("abc123"), "private-abc123");
    }

    #[test]
    fn test_auth_token_parse_and_redact() {
        let token: AuthToken =
            serde_json::from_str(r#"{"auth":"pk:deadbeef","channel_data":"{\"user_id\":1}"}"#)
                .unwrap();
        assert_eq!(token.auth, "pk:deadbeef");
        assert_eq!(token.channel_data.as_deref(), Some("{\"user_id\":1}"));

        let debug = format!("{:?}", token);
        assert!(!debug.contains("deadbeef"));
    }
}
