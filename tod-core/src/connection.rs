//! Connection lifecycle states

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the realtime connection
///
/// There is exactly one of these per connection manager and it only ever
/// changes from inside the manager's task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,
    /// Fetching credentials and opening the transport
    Connecting,
    /// Transport open, authorizing the private channel
    Authenticating,
    /// Channel authorized and confirmed, events are flowing
    Subscribed,
    /// Explicitly disconnected, stays here until the next `connect()`
    Disconnected,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
}

impl ConnectionState {
    /// Whether a connection attempt is in progress or established
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribed => "subscribed",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Authenticating.is_active());
        assert!(ConnectionState::Subscribed.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }
}
