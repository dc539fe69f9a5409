//! Realtime transport abstraction
//!
//! The connection manager only talks to a [`Transport`]; the Pusher
//! protocol lives in [`pusher`]. Channel names at this layer are wire
//! names (`private-{channel_key}`).

mod pusher;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tod_core::{AuthToken, Credentials};
use url::Url;

use crate::error::RealtimeError;

pub use pusher::PusherTransport;

/// Pusher protocol revision spoken by this client
pub const PROTOCOL_VERSION: u8 = 7;

/// Client name reported in the connect URL
pub const CLIENT_NAME: &str = "tod-rust";

/// Where to connect, derived from the credential set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEndpoint {
    pub host: String,
    pub key: String,
    pub cluster: String,
    /// Use `host` directly instead of the cluster host
    pub use_host: bool,
}

impl TransportEndpoint {
    pub fn from_credentials(credentials: &Credentials, use_host: bool) -> Self {
        Self {
            host: credentials.transport_host.clone(),
            key: credentials.transport_key.clone(),
            cluster: credentials.transport_cluster.clone(),
            use_host,
        }
    }

    /// Host name the socket connects to
    pub fn socket_host(&self) -> String {
        if self.use_host && !self.host.trim().is_empty() {
            let host = self.host.trim();
            let host = host
                .strip_prefix("wss://")
                .or_else(|| host.strip_prefix("https://"))
                .or_else(|| host.strip_prefix("ws://"))
                .or_else(|| host.strip_prefix("http://"))
                .unwrap_or(host);
            return host.trim_end_matches('/').to_string();
        }

        let cluster = self.cluster.trim();
        if cluster.is_empty() {
            "ws.pusher.com".to_string()
        } else {
            format!("ws-{}.pusher.com", cluster)
        }
    }

    /// `ws` only when an explicit host asks for plain text
    pub fn scheme(&self) -> &'static str {
        let host = self.host.trim();
        if self.use_host && (host.starts_with("ws://") || host.starts_with("http://")) {
            "ws"
        } else {
            "wss"
        }
    }

    /// Full connect URL with the protocol query parameters
    pub fn url(&self) -> Result<Url, RealtimeError> {
        let raw = format!(
            "{}://{}/app/{}",
            self.scheme(),
            self.socket_host(),
            self.key.trim()
        );
        let mut url = Url::parse(&raw).map_err(|e| {
            RealtimeError::Configuration(format!("Invalid transport URL '{}': {}", raw, e))
        })?;

        url.query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");

        Ok(url)
    }
}

/// Established transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSession {
    /// Server-assigned socket id, required for channel authorization
    pub socket_id: String,
    /// Inactivity window announced by the server
    pub activity_timeout: Option<Duration>,
}

/// Frames surfaced to the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    SubscriptionSucceeded {
        channel: String,
    },
    SubscriptionError {
        channel: String,
        status: Option<u16>,
        message: String,
    },
    /// Application event, payload already decoded
    Event {
        channel: String,
        event: String,
        payload: Value,
    },
    Pong,
}

/// A realtime connection to the push service
#[async_trait]
pub trait Transport: Send {
    /// Connect and wait for the server to assign a socket id
    async fn open(&mut self, endpoint: &TransportEndpoint)
        -> Result<TransportSession, RealtimeError>;

    async fn subscribe(&mut self, channel: &str, token: &AuthToken) -> Result<(), RealtimeError>;

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), RealtimeError>;

    /// Application-level ping; answered by a `TransportFrame::Pong`
    async fn ping(&mut self) -> Result<(), RealtimeError>;

    /// Wait for the next frame; protocol housekeeping is handled internally
    async fn next_frame(&mut self) -> Result<TransportFrame, RealtimeError>;

    async fn close(&mut self);
}
