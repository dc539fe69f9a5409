//! Private channel authorization
//!
//! The transport never trusts client-asserted identity: every private
//! channel join must carry a token signed by the backend for this socket.

use async_trait::async_trait;
use reqwest::StatusCode;
use tod_core::{AuthToken, Credentials};
use tod_rest::TodClient;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::RealtimeError;

/// Performs the channel authorization exchange
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Obtain a token letting `socket_id` join `channel_name`
    ///
    /// Fails with `AuthorizationDenied` when the backend refuses and with
    /// `AuthorizationUnavailable` on network or backend failure.
    async fn authorize(
        &self,
        channel_name: &str,
        socket_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthToken, RealtimeError>;
}

/// Authorizes through the backend's `/broadcasting/auth` endpoint
#[derive(Debug, Clone)]
pub struct BroadcastingAuthorizer {
    client: TodClient,
    endpoints: Vec<Url>,
}

impl BroadcastingAuthorizer {
    pub fn new(client: TodClient) -> Result<Self, RealtimeError> {
        let base = client.config().broadcasting_base();
        let endpoints = ["broadcasting/auth", "api/broadcasting/auth"]
            .iter()
            .map(|path| {
                Url::parse(&format!("{}/{}", base, path)).map_err(|e| {
                    RealtimeError::Configuration(format!("Invalid broadcasting auth URL: {}", e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { client, endpoints })
    }

    /// Auth URLs in the order they are tried
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }
}

#[async_trait]
impl ChannelAuthorizer for BroadcastingAuthorizer {
    #[instrument(skip(self, credentials), fields(connection = %credentials.connection_id))]
    async fn authorize(
        &self,
        channel_name: &str,
        socket_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthToken, RealtimeError> {
        if channel_name.is_empty() || socket_id.is_empty() {
            return Err(RealtimeError::AuthorizationUnavailable(
                "channel name and socket id are required".to_string(),
            ));
        }

        info!("[TOD Auth] Authenticating channel: {}", channel_name);

        let last = self.endpoints.len().saturating_sub(1);
        for (i, url) in self.endpoints.iter().enumerate() {
            let (status, body) = self
                .client
                .post_broadcasting_auth(url, socket_id, channel_name)
                .await
                .map_err(|e| RealtimeError::AuthorizationUnavailable(e.to_string()))?;

            if status == StatusCode::FORBIDDEN && i < last {
                debug!("[TOD Auth] {} returned 403, trying next endpoint", url);
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!("[TOD Auth] Access to {} denied ({})", channel_name, status);
                return Err(RealtimeError::AuthorizationDenied(format!(
                    "{} for {} (connection {})",
                    status, channel_name, credentials.connection_id
                )));
            }

            if !status.is_success() {
                return Err(RealtimeError::AuthorizationUnavailable(format!(
                    "{} from {}: {}",
                    status, url, body
                )));
            }

            let token: AuthToken = serde_json::from_str(&body).map_err(|e| {
                RealtimeError::AuthorizationUnavailable(format!("Invalid auth response: {}", e))
            })?;

            if token.auth.is_empty() {
                return Err(RealtimeError::AuthorizationUnavailable(
                    "auth response contained an empty token".to_string(),
                ));
            }

            return Ok(token);
        }

        Err(RealtimeError::AuthorizationUnavailable(
            "no broadcasting auth endpoint configured".to_string(),
        ))
    }
}
