//! Realtime connection settings

use std::env;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::RealtimeError;

/// Pusher's default inactivity window before the client should ping
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// How long to wait for a pong before treating the connection as dead
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect delay base
const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the socket handshake and the subscription confirmation
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for the connection manager and transport
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Inactivity window after which we ping; the server may shorten it
    pub activity_timeout: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    /// Longest reconnect delay, defaults to the activity timeout
    pub reconnect_max: Duration,
    pub reconnect_jitter: bool,
    /// `None` keeps reconnecting forever
    pub max_reconnect_attempts: Option<u32>,
    pub handshake_timeout: Duration,
    /// Connect to the credential's transport host instead of the cluster host
    pub use_transport_host: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_ACTIVITY_TIMEOUT,
            reconnect_jitter: true,
            max_reconnect_attempts: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            use_transport_host: false,
        }
    }
}

impl RealtimeConfig {
    /// Defaults overridden by environment variables
    ///
    /// Reads:
    /// - TOD_WS_ACTIVITY_TIMEOUT_SECS
    /// - TOD_WS_PONG_TIMEOUT_SECS
    /// - TOD_WS_RECONNECT_BASE_MS
    /// - TOD_WS_MAX_RECONNECT_ATTEMPTS
    /// - TOD_WS_USE_PUSHER_HOST
    pub fn from_env() -> Result<Self, RealtimeError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RealtimeError> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "TOD_WS_ACTIVITY_TIMEOUT_SECS")? {
            config.activity_timeout = Duration::from_secs(secs);
            config.reconnect_max = config.activity_timeout;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TOD_WS_PONG_TIMEOUT_SECS")? {
            config.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TOD_WS_RECONNECT_BASE_MS")? {
            config.reconnect_base = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "TOD_WS_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = Some(max);
        }
        if let Some(flag) = parse_var::<bool>(&lookup, "TOD_WS_USE_PUSHER_HOST")? {
            config.use_transport_host = flag;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.activity_timeout.is_zero() {
            return Err(RealtimeError::Configuration(
                "activity timeout must be greater than zero".to_string(),
            ));
        }
        if self.pong_timeout.is_zero() {
            return Err(RealtimeError::Configuration(
                "pong timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Reconnect schedule seeded from these settings
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_base, self.reconnect_max).with_jitter(self.reconnect_jitter)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, RealtimeError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RealtimeError::Configuration(format!("Invalid {}: '{}'", name, raw))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = RealtimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.activity_timeout, Duration::from_secs(120));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_max, config.activity_timeout);
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(!config.use_transport_host);
    }

    #[test]
    fn test_overrides() {
        let config = RealtimeConfig::from_lookup(|name| match name {
            "TOD_WS_ACTIVITY_TIMEOUT_SECS" => Some("60".to_string()),
            "TOD_WS_RECONNECT_BASE_MS" => Some("250".to_string()),
            "TOD_WS_MAX_RECONNECT_ATTEMPTS" => Some("5".to_string()),
            "TOD_WS_USE_PUSHER_HOST" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.activity_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert_eq!(config.reconnect_base, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, Some(5));
        assert!(config.use_transport_host);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = RealtimeConfig::from_lookup(|name| {
            (name == "TOD_WS_PONG_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RealtimeError::Configuration(_)));

        let err = RealtimeConfig::from_lookup(|name| {
            (name == "TOD_WS_ACTIVITY_TIMEOUT_SECS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RealtimeError::Configuration(_)));
    }
}
