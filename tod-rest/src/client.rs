//! TOD Markets API client
//!
//! Thin authenticated wrapper around the backend's REST endpoints. Every
//! request carries the bearer API key; non-2xx responses become
//! `TodError::Api` with the status and response body.

use std::fmt;
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tod_core::{CompanyDetails, TodError, TodResult};
use tracing::{debug, instrument};
use url::Url;

use crate::config::TodConfig;

/// Endpoint returning the company's realtime connection details
pub const COMPANY_ENDPOINT: &str = "/api/company";

/// Request timeout for regular API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout for the broadcasting auth exchange
const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// TOD Markets API client
#[derive(Clone)]
pub struct TodClient {
    client: Client,
    config: TodConfig,
}

impl TodClient {
    pub fn new(config: TodConfig) -> TodResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TodError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TodConfig {
        &self.config
    }

    /// Resolve an endpoint against the domain URL and append query parameters
    ///
    /// Repeated keys are kept, so `[("markets", "N"), ("markets", "Q")]`
    /// becomes `?markets=N&markets=Q`.
    pub fn build_url(&self, endpoint: &str, params: &[(&str, &str)]) -> TodResult<Url> {
        let mut url = self
            .config
            .domain_url
            .join(endpoint)
            .map_err(|e| TodError::invalid_url(format!("{}: {}", endpoint, e)))?;

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        Ok(url)
    }

    /// GET an endpoint and return the response body as text
    #[instrument(skip(self))]
    pub async fn get_json(&self, endpoint: &str, params: &[(&str, &str)]) -> TodResult<String> {
        let url = self.build_url(endpoint, params)?;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(|e| TodError::network(format!("GET {} failed: {}", endpoint, e)))?;

        Self::read_body(response).await
    }

    /// POST a JSON payload (`{}` when absent) and return the response body as text
    #[instrument(skip(self, payload))]
    pub async fn post_json(&self, endpoint: &str, payload: Option<&Value>) -> TodResult<String> {
        let url = self.build_url(endpoint, &[])?;
        debug!("POST {}", url);

        let empty = json!({});
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(payload.unwrap_or(&empty))
            .send()
            .await
            .map_err(|e| TodError::network(format!("POST {} failed: {}", endpoint, e)))?;

        Self::read_body(response).await
    }

    /// Fetch the company's realtime connection details
    #[instrument(skip(self))]
    pub async fn company_details(&self) -> TodResult<CompanyDetails> {
        let body = self.get_json(COMPANY_ENDPOINT, &[]).await?;
        CompanyDetails::from_response(&body)
            .map_err(|e| TodError::parse(format!("Failed to parse company details: {}", e)))
    }

    /// POST the private channel authorization request to a broadcasting auth URL
    ///
    /// Returns the status and body without treating non-2xx as an error, so
    /// callers can decide between falling back, denying and retrying.
    #[instrument(skip(self))]
    pub async fn post_broadcasting_auth(
        &self,
        url: &Url,
        socket_id: &str,
        channel_name: &str,
    ) -> TodResult<(StatusCode, String)> {
        let response = self
            .client
            .post(url.clone())
            .timeout(AUTH_TIMEOUT)
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"))
            .json(&json!({
                "socket_id": socket_id,
                "channel_name": channel_name,
            }))
            .send()
            .await
            .map_err(|e| TodError::network(format!("Broadcasting auth failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("Broadcasting auth {} -> {}", url, status);
        Ok((status, body))
    }

    async fn read_body(response: Response) -> TodResult<String> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TodError::api(status.as_u16(), body));
        }

        response
            .text()
            .await
            .map_err(|e| TodError::network(format!("Failed to read response body: {}", e)))
    }
}

impl fmt::Debug for TodClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TodClient")
            .field("config", &self.config)
            .finish()
    }
}
